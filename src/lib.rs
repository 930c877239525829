//! # imap-engine
//!
//! A sans-I/O client-side engine for the IMAP protocol
//! ([RFC 3501](https://tools.ietf.org/html/rfc3501)). The engine owns no
//! socket: the transport hands it inbound bytes, the engine hands back
//! the bytes to write, and everything in between is plain synchronous
//! state: framing (including `{N}` literals that suspend the line on a
//! byte boundary), FETCH response parsing, tag correlation, IDLE
//! suspension, and the connection state machine.
//!
//! ## Driving the engine
//!
//! ```no_run
//! use imap_engine::{Config, Engine};
//!
//! # fn main() -> imap_engine::error::Result<()> {
//! let mut engine = Engine::new(Config::default());
//! engine.connection_established();
//!
//! // transport read loop, however the caller does I/O:
//! let bytes_from_server: &[u8] = b"* OK ready\r\n";
//! engine.feed(bytes_from_server)?;
//! if let Some(out) = engine.take_output() {
//!     // write `out` to the socket
//!     let _ = out;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Once the greeting and capability exchange settle (the engine runs it
//! by itself), issue commands with completion callbacks:
//!
//! ```no_run
//! # fn main() -> imap_engine::error::Result<()> {
//! # let mut engine = imap_engine::Engine::new(imap_engine::Config::default());
//! engine.login("alice", "secret", Box::new(|done| {
//!     assert!(done.is_ok());
//! }))?;
//! engine.select("INBOX", Box::new(|_| {}))?;
//! engine.fetch(
//!     "1:4",
//!     "(FLAGS ENVELOPE BODY[])",
//!     Some(Box::new(|fetch| {
//!         println!("seq {} flags {:?}", fetch.message, fetch.flags());
//!     })),
//!     Box::new(|_| {}),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! Large message bodies are not buffered: literals past
//! [`Config::literal_ceiling`] stream chunk by chunk to the sink
//! registered with [`Engine::set_literal_sink`], and the fetch tree
//! records a [`types::Payload::Stream`] handle in their place.
//!
//! The documentation within this crate borrows heavily from the RFCs,
//! but should not be considered a complete reference. If anything is
//! unclear, follow the links to the RFCs embedded in the documentation
//! for the various types and methods and read the raw text there!
#![warn(missing_docs)]
#![deny(rust_2018_idioms, unsafe_code)]

mod authenticator;
mod buffer;
mod engine;
pub mod error;
mod fetch_parser;
mod framer;
mod parse;
mod state;
pub mod types;
pub mod utf7;

pub use crate::authenticator::{Authenticator, PlainAuthenticator};
pub use crate::engine::{
    Completion, Config, Credentials, Engine, OnDone, OnIdleUpdate, OnItem, Outcome, ResponseData,
};
pub use crate::error::{Error, Result};
pub use crate::fetch_parser::{FetchAttr, FetchParser, Step};
pub use crate::framer::{Framer, LiteralSink, ResponseUnit, DEFAULT_LITERAL_CEILING};
pub use crate::state::{CommandKind, ConnectionState};
