//! Mailbox names matched by LIST and LSUB.

/// An attribute set on a name returned by
/// [`LIST`](https://tools.ietf.org/html/rfc3501#section-7.2.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameAttribute {
    /// It is not possible for any child levels of hierarchy to exist under this name.
    NoInferiors,
    /// It is not possible to use this name as a selectable mailbox.
    NoSelect,
    /// The mailbox has been marked "interesting" by the server.
    Marked,
    /// The mailbox does not have any messages added since the mailbox was last selected.
    Unmarked,
    /// Any other attribute the server sent.
    Custom(String),
}

impl From<&str> for NameAttribute {
    fn from(s: &str) -> Self {
        match () {
            _ if s.eq_ignore_ascii_case("\\Noinferiors") => NameAttribute::NoInferiors,
            _ if s.eq_ignore_ascii_case("\\Noselect") => NameAttribute::NoSelect,
            _ if s.eq_ignore_ascii_case("\\Marked") => NameAttribute::Marked,
            _ if s.eq_ignore_ascii_case("\\Unmarked") => NameAttribute::Unmarked,
            _ => NameAttribute::Custom(s.to_string()),
        }
    }
}

/// A name that matches a `LIST` or `LSUB` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    /// Attributes of this name.
    pub attributes: Vec<NameAttribute>,
    /// The hierarchy delimiter is a character used to delimit levels of hierarchy in a mailbox
    /// name. `None` means that no hierarchy exists; the name is a "flat" name.
    pub delimiter: Option<String>,
    /// The mailbox name, decoded from its modified UTF-7 wire form.
    pub name: String,
}
