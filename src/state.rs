//! Connection states and the command legality table.

use crate::error::{Error, Result};

/// The lifecycle state of an IMAP connection, as laid out in
/// [RFC 3501 section 3](https://tools.ietf.org/html/rfc3501#section-3).
///
/// Every command defines the set of states it may be issued from; the
/// engine checks that table before a single byte is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport attached.
    ConnectionClosed,
    /// Transport attached, greeting not yet seen.
    ConnectionEstablished,
    /// Greeting received, capabilities being requested.
    ServerGreeting,
    /// Greeting done, no credentials presented yet.
    NotAuthenticated,
    /// Login or SASL exchange accepted.
    Authenticated,
    /// A mailbox is selected.
    Selected,
    /// Logout in progress or forced by the server.
    Logout,
}

/// Commands the dispatcher knows how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // the variants are the wire commands themselves
pub enum CommandKind {
    Capability,
    StartTls,
    Login,
    Authenticate,
    Select,
    Examine,
    Status,
    List,
    Lsub,
    Create,
    Delete,
    Rename,
    Subscribe,
    Unsubscribe,
    Search,
    Fetch,
    Store,
    Expunge,
    Close,
    Idle,
    Noop,
    Logout,
}

impl CommandKind {
    /// The command name as it appears on the wire.
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Capability => "CAPABILITY",
            CommandKind::StartTls => "STARTTLS",
            CommandKind::Login => "LOGIN",
            CommandKind::Authenticate => "AUTHENTICATE",
            CommandKind::Select => "SELECT",
            CommandKind::Examine => "EXAMINE",
            CommandKind::Status => "STATUS",
            CommandKind::List => "LIST",
            CommandKind::Lsub => "LSUB",
            CommandKind::Create => "CREATE",
            CommandKind::Delete => "DELETE",
            CommandKind::Rename => "RENAME",
            CommandKind::Subscribe => "SUBSCRIBE",
            CommandKind::Unsubscribe => "UNSUBSCRIBE",
            CommandKind::Search => "SEARCH",
            CommandKind::Fetch => "FETCH",
            CommandKind::Store => "STORE",
            CommandKind::Expunge => "EXPUNGE",
            CommandKind::Close => "CLOSE",
            CommandKind::Idle => "IDLE",
            CommandKind::Noop => "NOOP",
            CommandKind::Logout => "LOGOUT",
        }
    }

    /// The states this command may be issued from.
    pub fn allowed_states(self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            CommandKind::Capability | CommandKind::Noop | CommandKind::Logout => {
                &[ServerGreeting, NotAuthenticated, Authenticated, Selected]
            }
            CommandKind::StartTls | CommandKind::Login | CommandKind::Authenticate => {
                &[NotAuthenticated]
            }
            CommandKind::Select
            | CommandKind::Examine
            | CommandKind::Status
            | CommandKind::List
            | CommandKind::Lsub
            | CommandKind::Create
            | CommandKind::Delete
            | CommandKind::Rename
            | CommandKind::Subscribe
            | CommandKind::Unsubscribe => &[Authenticated, Selected],
            CommandKind::Search
            | CommandKind::Fetch
            | CommandKind::Store
            | CommandKind::Expunge
            | CommandKind::Close
            | CommandKind::Idle => &[Selected],
        }
    }

    /// Table-driven legality check used by every `Engine` entry point.
    pub fn check_state(self, state: ConnectionState) -> Result<()> {
        if self.allowed_states().contains(&state) {
            Ok(())
        } else {
            Err(Error::BadState {
                command: self.name(),
                state,
            })
        }
    }
}
