//! The per-message result of a FETCH or STORE command.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use log::warn;

use crate::error::ParseError;
use crate::fetch_parser::FetchAttr;
use crate::types::value::{unexpected, Payload, Value};
use crate::types::{BodyStructure, Envelope, Flag, Seq, Uid};

/// Format of Date and Time as defined RFC3501.
/// See `date-time` element in [Formal Syntax](https://tools.ietf.org/html/rfc3501#section-9)
/// chapter of this RFC.
const DATE_TIME_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// An IMAP [`FETCH` response](https://tools.ietf.org/html/rfc3501#section-7.4.2) that contains
/// data about a particular message. This response occurs as the result of a `FETCH` or `STORE`
/// command, as well as by unilateral server decision (e.g., flag updates).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetch {
    /// The ordinal number of this message in its containing mailbox.
    pub message: Seq,

    /// A number expressing the unique identifier of the message.
    /// Only present if `UID` was specified in the query argument to `FETCH` and the server
    /// supports UIDs.
    pub uid: Option<Uid>,

    /// A number expressing the [RFC-2822](https://tools.ietf.org/html/rfc2822) size of the
    /// message. Only present if `RFC822.SIZE` was specified in the query argument to `FETCH`.
    pub size: Option<u64>,

    flags: Vec<Flag>,
    internal_date: Option<String>,
    envelope: Option<Envelope>,
    body_structure: Option<BodyStructure>,
    sections: HashMap<String, Payload>,
}

impl Fetch {
    /// Build the tree from the parsed attribute pairs of one response.
    pub(crate) fn from_attrs(message: Seq, attrs: Vec<FetchAttr>) -> Result<Fetch, ParseError> {
        let mut fetch = Fetch {
            message,
            ..Fetch::default()
        };
        for (key, value) in attrs {
            match key.as_str() {
                "FLAGS" => {
                    let items = value
                        .as_list()
                        .ok_or_else(|| unexpected("flag list", &value))?;
                    for flag in items {
                        match flag {
                            Value::Atom(s) => fetch.flags.push(Flag::from(s.as_str())),
                            other => return Err(unexpected("flag", other)),
                        }
                    }
                }
                "UID" => {
                    let n = value.as_number().ok_or_else(|| unexpected("uid", &value))?;
                    fetch.uid = Some(Uid::try_from(n).map_err(|_| ParseError::Overflow)?);
                }
                "RFC822.SIZE" => {
                    fetch.size = Some(
                        value
                            .as_number()
                            .ok_or_else(|| unexpected("message size", &value))?,
                    );
                }
                "INTERNALDATE" => {
                    fetch.internal_date = value.to_nstring()?;
                }
                "ENVELOPE" => {
                    fetch.envelope = Some(Envelope::decode(&value)?);
                }
                "BODY" | "BODYSTRUCTURE" => {
                    fetch.body_structure = Some(BodyStructure::decode(&value)?);
                }
                _ => match value {
                    // a NIL section is absent, not empty
                    Value::Nil => {}
                    Value::Str(payload) => {
                        fetch.sections.insert(key, payload);
                    }
                    other => return Err(unexpected("section payload", &other)),
                },
            }
        }
        Ok(fetch)
    }

    /// A list of flags that are set for this message.
    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    /// Extract the `INTERNALDATE` of a `FETCH` response.
    ///
    /// See [section 2.3.3 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.3) for
    /// details.
    pub fn internal_date(&self) -> Option<DateTime<FixedOffset>> {
        let raw = self.internal_date.as_deref()?;
        match DateTime::parse_from_str(raw, DATE_TIME_FORMAT) {
            Ok(date_time) => Some(date_time),
            Err(err) => {
                warn!("undecodable INTERNALDATE {raw:?}: {err}");
                None
            }
        }
    }

    /// The server-supplied `INTERNALDATE` text, unparsed.
    pub fn internal_date_raw(&self) -> Option<&str> {
        self.internal_date.as_deref()
    }

    /// The envelope of this message, if `ENVELOPE` was included in the `query` argument to
    /// `FETCH`.
    ///
    /// The full description of the format of the envelope is given in [RFC 3501 section
    /// 7.4.2](https://tools.ietf.org/html/rfc3501#section-7.4.2).
    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    /// Extract the `BODYSTRUCTURE` of a `FETCH` response.
    ///
    /// See [section 2.3.6 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.6) for
    /// details.
    pub fn bodystructure(&self) -> Option<&BodyStructure> {
        self.body_structure.as_ref()
    }

    /// The payload delivered for the given section key, spelled the way
    /// the server echoed it (`BODY[]`, `BODY[HEADER]<0>`, `RFC822.TEXT`,
    /// ...). Sections the server answered with `NIL` are absent.
    pub fn section(&self, key: &str) -> Option<&Payload> {
        self.sections.get(&key.to_ascii_uppercase())
    }

    /// The bytes that make up the header of this message, if `BODY[HEADER]`, `BODY.PEEK[HEADER]`,
    /// or `RFC822.HEADER` was included in the `query` argument to `FETCH`.
    pub fn header(&self) -> Option<&Payload> {
        self.section("BODY[HEADER]").or_else(|| self.section("RFC822.HEADER"))
    }

    /// The bytes that make up this message, included if `BODY[]` or `RFC822` was included in the
    /// `query` argument to `FETCH`. The bytes SHOULD be interpreted by the client according to
    /// the content transfer encoding, body type, and subtype.
    pub fn body(&self) -> Option<&Payload> {
        self.section("BODY[]").or_else(|| self.section("RFC822"))
    }

    /// The bytes that make up the text of this message, included if `BODY[TEXT]`, `RFC822.TEXT`,
    /// or `BODY.PEEK[TEXT]` was included in the `query` argument to `FETCH`.
    pub fn text(&self) -> Option<&Payload> {
        self.section("BODY[TEXT]").or_else(|| self.section("RFC822.TEXT"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch_parser::parse_fetch_body;

    fn fetch(text: &[u8]) -> Fetch {
        Fetch::from_attrs(1, parse_fetch_body(text, &[]).unwrap()).unwrap()
    }

    #[test]
    fn flags_only() {
        let fetch = fetch(b"(FLAGS (\\Seen))");
        assert_eq!(fetch.flags(), &[Flag::Seen]);
        assert_eq!(fetch.uid, None);
        assert_eq!(fetch.size, None);
    }

    #[test]
    fn flags_date_and_size() {
        let fetch =
            fetch(b"(FLAGS (\\Seen) INTERNALDATE \"17-Jul-1996 02:44:25 -0700\" RFC822.SIZE 4286)");
        assert_eq!(fetch.flags(), &[Flag::Seen]);
        assert_eq!(
            fetch.internal_date_raw(),
            Some("17-Jul-1996 02:44:25 -0700")
        );
        assert_eq!(fetch.size, Some(4286));
        let parsed = fetch.internal_date().unwrap();
        assert_eq!(parsed.timestamp(), 837596665);
    }

    #[test]
    fn sections_keep_empty_but_drop_nil() {
        let fetch = fetch(b"(BODY[HEADER] \"\" BODY[TEXT] NIL)");
        assert_eq!(fetch.header().unwrap().len(), 0);
        assert_eq!(fetch.text(), None);
    }

    #[test]
    fn body_falls_back_to_rfc822() {
        let fetch = fetch(b"(RFC822 \"full message\")");
        assert_eq!(
            fetch.body().unwrap().as_bytes().unwrap(),
            b"full message"
        );
    }

    #[test]
    fn uid_larger_than_u32_is_rejected() {
        let attrs = parse_fetch_body(b"(UID 4294967296)", &[]).unwrap();
        assert_eq!(
            Fetch::from_attrs(1, attrs).unwrap_err(),
            ParseError::Overflow
        );
    }
}
