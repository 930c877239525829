//! Domain types produced while driving an IMAP session.

use std::fmt;

mod body;
mod capabilities;
mod envelope;
mod fetch;
mod id_generator;
mod mailbox;
mod name;
mod request;
mod response;
pub(crate) mod value;

pub use self::body::{BodyStructure, Multipart, Part};
pub use self::capabilities::{Capabilities, Capability};
pub use self::envelope::{Address, Envelope};
pub use self::fetch::Fetch;
pub use self::id_generator::IdGenerator;
pub use self::mailbox::Mailbox;
pub use self::name::{Name, NameAttribute};
pub(crate) use self::request::{Request, RequestBuilder};
pub use self::response::{
    ResponseCode, ResponseEvent, Status, StatusItem, Unsolicited, UntaggedResponse,
};
pub use self::value::{Payload, StreamHandle, Value};

/// A message's ordinal position within its mailbox.
pub type Seq = u32;

/// A message's unique identifier, stable across sessions for a given
/// [`Mailbox::uid_validity`].
pub type Uid = u32;

/// A message or mailbox flag.
///
/// System flags carry the leading backslash on the wire; anything else
/// is a server- or client-defined keyword.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// `\Seen`: read.
    Seen,
    /// `\Answered`: replied to.
    Answered,
    /// `\Flagged`: marked for urgent attention.
    Flagged,
    /// `\Deleted`: marked for removal by EXPUNGE.
    Deleted,
    /// `\Draft`: composition in progress.
    Draft,
    /// `\Recent`: first session to see this message.
    Recent,
    /// `\*`: the mailbox accepts new keywords (PERMANENTFLAGS only).
    MayCreate,
    /// Any other flag or keyword.
    Custom(String),
}

impl Flag {
    /// The wire spelling of this flag.
    pub fn as_wire(&self) -> &str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Answered => "\\Answered",
            Flag::Flagged => "\\Flagged",
            Flag::Deleted => "\\Deleted",
            Flag::Draft => "\\Draft",
            Flag::Recent => "\\Recent",
            Flag::MayCreate => "\\*",
            Flag::Custom(s) => s,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl From<&str> for Flag {
    fn from(s: &str) -> Self {
        match () {
            _ if s.eq_ignore_ascii_case("\\Seen") => Flag::Seen,
            _ if s.eq_ignore_ascii_case("\\Answered") => Flag::Answered,
            _ if s.eq_ignore_ascii_case("\\Flagged") => Flag::Flagged,
            _ if s.eq_ignore_ascii_case("\\Deleted") => Flag::Deleted,
            _ if s.eq_ignore_ascii_case("\\Draft") => Flag::Draft,
            _ if s.eq_ignore_ascii_case("\\Recent") => Flag::Recent,
            _ if s == "\\*" => Flag::MayCreate,
            _ => Flag::Custom(s.to_string()),
        }
    }
}

impl From<String> for Flag {
    fn from(s: String) -> Self {
        Flag::from(s.as_str())
    }
}
