//! The server capability set.

use std::collections::hash_set::Iter;
use std::collections::HashSet;

const IMAP4REV1_CAPABILITY: &str = "IMAP4rev1";
const AUTH_CAPABILITY_PREFIX: &str = "AUTH=";

/// List of available Capabilities.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Capability {
    /// The crucial imap capability.
    Imap4rev1,
    /// Auth type capability.
    Auth(String),
    /// Any other atoms.
    Atom(String),
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case(IMAP4REV1_CAPABILITY) {
            return Capability::Imap4rev1;
        }
        if s.len() > AUTH_CAPABILITY_PREFIX.len() {
            let (pre, mech) = s.split_at(AUTH_CAPABILITY_PREFIX.len());
            if pre.eq_ignore_ascii_case(AUTH_CAPABILITY_PREFIX) {
                return Capability::Auth(mech.to_string());
            }
        }
        Capability::Atom(s.to_string())
    }
}

/// From [section 7.2.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-7.2.1).
///
/// A list of capabilities that the server supports.
/// The capability list will include the atom "IMAP4rev1".
///
/// A capability name which begins with `AUTH=` indicates that the server supports that particular
/// authentication mechanism.
///
/// Client implementations SHOULD NOT require any capability name other than `IMAP4rev1`, and MUST
/// ignore any unknown capability names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    set: HashSet<Capability>,
    /// Advertised AUTH mechanisms, in announcement order.
    auth: Vec<String>,
}

impl Capabilities {
    /// Build the set from the atoms of a CAPABILITY response.
    pub fn from_atoms<'a>(atoms: impl IntoIterator<Item = &'a str>) -> Self {
        let mut caps = Capabilities::default();
        for atom in atoms {
            let cap = Capability::from(atom);
            if let Capability::Auth(mech) = &cap {
                if !caps.auth.iter().any(|m| m.eq_ignore_ascii_case(mech)) {
                    caps.auth.push(mech.clone());
                }
            }
            caps.set.insert(cap);
        }
        caps
    }

    /// Check if the server has the given capability.
    pub fn has(&self, cap: &Capability) -> bool {
        self.set.contains(cap)
    }

    /// Check if the server has the given capability via str.
    pub fn has_str<S: AsRef<str>>(&self, cap: S) -> bool {
        self.has(&Capability::from(cap.as_ref()))
    }

    /// Whether the mandatory `IMAP4rev1` revision is advertised.
    pub fn has_imap4rev1(&self) -> bool {
        self.has(&Capability::Imap4rev1)
    }

    /// The advertised SASL mechanisms, in announcement order.
    pub fn auth_mechanisms(&self) -> &[String] {
        &self.auth
    }

    /// Iterate over all the server's capabilities.
    pub fn iter(&self) -> Iter<'_, Capability> {
        self.set.iter()
    }

    /// Returns how many capabilities the server has.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Returns true if the server purports to have no capabilities.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
