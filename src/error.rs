//! IMAP error types.

use std::result;

use thiserror::Error;

use crate::state::ConnectionState;

/// A convenience wrapper around `Result` for `imap_engine::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while driving an IMAP session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A BAD response from the IMAP server.
    #[error("Bad Response: {0}")]
    Bad(String),
    /// A NO response from the IMAP server.
    #[error("No Response: {0}")]
    No(String),
    /// The server ended the session with an unsolicited BYE.
    #[error("Bye: {0}")]
    Bye(String),
    /// The connection was terminated unexpectedly.
    #[error("Connection lost")]
    ConnectionLost,
    /// A command was issued in a connection state that does not allow it.
    #[error("{command} is not valid in the {state:?} state")]
    BadState {
        /// The offending command.
        command: &'static str,
        /// The state the connection was in.
        state: ConnectionState,
    },
    /// A tagged response arrived whose tag is not in the pending table.
    #[error("unexpected response tag {0:?}")]
    UnexpectedTag(String),
    /// The server does not advertise `IMAP4rev1`.
    #[error("server does not support IMAP4rev1")]
    NotImap4Rev1,
    /// STARTTLS is not advertised, or TLS is already active.
    #[error("TLS upgrade is not available")]
    TlsUnavailable,
    /// Error parsing a server response.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// Command inputs were not valid [IMAP
    /// strings](https://tools.ietf.org/html/rfc3501#section-4.3).
    #[error("validate error: {0}")]
    Validate(#[from] ValidateError),
}

/// An error occurred while trying to decode a server response.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// A literal announced more bytes than the configured ceiling allows
    /// and no streaming sink is registered to take them.
    #[error("literal of {0} bytes exceeds the in-memory ceiling")]
    LiteralTooLarge(usize),
    /// A `{N}` prefix whose byte count is not a valid number.
    #[error("invalid literal prefix {0:?}")]
    BadLiteralSyntax(String),
    /// The parser met a token other than the grammar allows here.
    #[error("expected {expected}, got {got:?}")]
    UnexpectedToken {
        /// What the grammar called for.
        expected: &'static str,
        /// The bytes actually seen, trimmed for display.
        got: String,
    },
    /// A FETCH response named an item this client does not know.
    #[error("unknown FETCH item {0:?}")]
    UnknownFetchItem(String),
    /// A FETCH response carried the same item twice.
    #[error("duplicate FETCH item {0:?}")]
    DuplicateFetchItem(String),
    /// A number on the wire does not fit in 63 bits.
    #[error("numeric field overflows")]
    Overflow,
    /// The response cannot be decoded and line framing is lost.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The client could not decode the server's authentication challenge.
    #[error("invalid authentication challenge {0:?}")]
    Authentication(String),
    /// A mailbox name is not valid modified UTF-7.
    #[error("invalid modified UTF-7 mailbox name {0:?}")]
    BadUtf7(String),
    /// Text that must be UTF-8 was not.
    #[error("response data is not valid UTF-8")]
    DataNotUtf8,
}

/// An [invalid character](https://tools.ietf.org/html/rfc3501#section-4.3) was found in an input
/// string.
#[derive(Debug, Error, PartialEq, Eq)]
// print character in debug form because invalid ones are often whitespaces
#[error("invalid character in input: {0:?}")]
pub struct ValidateError(pub char);
