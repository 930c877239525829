//! Classified server responses.

use crate::fetch_parser::FetchAttr;
use crate::types::{Fetch, Flag, Name, Seq, Uid};

/// The condition a status line reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success.
    Ok,
    /// Operational failure.
    No,
    /// Protocol-level rejection; usually a client bug.
    Bad,
    /// Greeting form placing the session directly in the authenticated
    /// state.
    PreAuth,
    /// The server is closing the connection.
    Bye,
}

/// The bracketed code some status lines carry before their text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// `[ALERT]`: the text must be shown to the user.
    Alert,
    /// `[CAPABILITY ...]`: capability atoms delivered inline.
    Capability(Vec<String>),
    /// `[PERMANENTFLAGS (...)]`.
    PermanentFlags(Vec<Flag>),
    /// `[READ-ONLY]`.
    ReadOnly,
    /// `[READ-WRITE]`.
    ReadWrite,
    /// `[TRYCREATE]`: the target mailbox does not exist yet.
    TryCreate,
    /// `[UIDNEXT <n>]`.
    UidNext(Uid),
    /// `[UIDVALIDITY <n>]`.
    UidValidity(u32),
    /// `[UNSEEN <n>]`.
    Unseen(u32),
    /// Any code this client does not interpret.
    Other(String),
}

/// One `STATUS` response attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // the variants mirror the STATUS attribute names
pub enum StatusItem {
    Messages(u32),
    Recent(u32),
    UidNext(Uid),
    UidValidity(u32),
    Unseen(u32),
}

/// An untagged (`*`) server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedResponse {
    /// `* OK/NO/BAD/PREAUTH/BYE [code] text`.
    Condition {
        /// The reported condition.
        status: Status,
        /// Bracketed response code, when present.
        code: Option<ResponseCode>,
        /// Human-readable text.
        info: String,
    },
    /// `* CAPABILITY ...` atoms.
    Capabilities(Vec<String>),
    /// `* LIST ...`.
    List(Name),
    /// `* LSUB ...`.
    Lsub(Name),
    /// `* STATUS <mailbox> (...)`.
    MailboxStatus {
        /// The mailbox the snapshot describes.
        mailbox: String,
        /// The requested attributes.
        items: Vec<StatusItem>,
    },
    /// `* FLAGS (...)`.
    Flags(Vec<Flag>),
    /// `* SEARCH ...` ids.
    Search(Vec<Seq>),
    /// `* <n> EXISTS`.
    Exists(u32),
    /// `* <n> RECENT`.
    Recent(u32),
    /// `* <n> EXPUNGE`.
    Expunge(Seq),
    /// `* <n> FETCH (...)`, attributes parsed but not yet typed.
    Fetch(Seq, Vec<FetchAttr>),
    /// An untagged atom this client does not know; logged and skipped.
    Unknown(String),
}

/// A framed response unit after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// `+ text`: the server invites more command data.
    Continue {
        /// Text or base64 challenge after the marker, if any.
        info: Option<String>,
    },
    /// `<tag> OK/NO/BAD ...`: completion of a pending command.
    Tagged {
        /// The echoed command tag.
        tag: String,
        /// How the command fared.
        status: Status,
        /// Bracketed response code, when present.
        code: Option<ResponseCode>,
        /// Human-readable status text.
        info: String,
    },
    /// `* ...`.
    Untagged(UntaggedResponse),
}

/// Server state the engine surfaces to the caller outside any command
/// completion. See the note on [unilateral server responses in RFC
/// 3501](https://tools.ietf.org/html/rfc3501#section-7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    /// The selected mailbox grew to this many messages.
    Exists(u32),
    /// The count of recent messages changed.
    Recent(u32),
    /// The message with this sequence number was removed.
    Expunge(Seq),
    /// Flag or attribute changes for a message.
    Fetch(Box<Fetch>),
    /// A STATUS snapshot for a mailbox this session did not ask about.
    MailboxStatus {
        /// The mailbox the snapshot describes.
        mailbox: String,
        /// The delivered attributes.
        items: Vec<StatusItem>,
    },
    /// The applicable flags of the selected mailbox changed.
    Flags(Vec<Flag>),
    /// `[ALERT]` text that must reach the user.
    Alert(String),
    /// The server said BYE.
    Bye(String),
    /// STARTTLS was accepted; the caller must upgrade the transport
    /// before feeding further bytes.
    TlsRequired,
}
