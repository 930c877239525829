//! The connection engine: command dispatch, tag correlation, and the
//! connection state machine.
//!
//! The engine is sans-I/O. The transport feeds inbound bytes through
//! [`Engine::feed`] and drains [`Engine::take_output`]; everything in
//! between (framing, routing, pending-command bookkeeping, IDLE
//! suspension, state transitions) happens synchronously on the caller's
//! thread. Completion callbacks run inside `feed` and must not call back
//! into the engine.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::authenticator::Authenticator;
use crate::buffer::Buffer;
use crate::error::{Error, ParseError, Result};
use crate::framer::{Framer, LiteralSink, DEFAULT_LITERAL_CEILING};
use crate::parse;
use crate::state::{CommandKind, ConnectionState};
use crate::types::{
    Capabilities, Fetch, Mailbox, Name, Request, RequestBuilder, ResponseCode, ResponseEvent, Seq,
    Status, StatusItem, Unsolicited, UntaggedResponse,
};

/// Username and password for automatic LOGIN.
#[derive(Clone)]
pub struct Credentials {
    /// The login name.
    pub username: String,
    /// The password, kept out of `Debug` output.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Literals up to this size are buffered; larger ones stream to the
    /// registered sink.
    pub literal_ceiling: usize,
    /// Upgrade to TLS automatically when the server advertises STARTTLS.
    pub starttls: bool,
    /// Log in automatically once the connection reaches the
    /// not-authenticated state.
    pub credentials: Option<Credentials>,
    /// Restart IDLE after this long to stay inside server inactivity
    /// timeouts.
    pub idle_keepalive: Duration,
    /// Deadline applied to every command, enforced by [`Engine::tick`].
    pub command_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            literal_ceiling: DEFAULT_LITERAL_CEILING,
            starttls: false,
            credentials: None,
            idle_keepalive: Duration::from_secs(25 * 60),
            command_timeout: None,
        }
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Tagged OK; carries the status text.
    Ok(String),
    /// Tagged NO; the operation failed.
    No(String),
    /// Tagged BAD; the server rejected the syntax, usually a client bug.
    Bad(String),
    /// The caller cancelled before the server answered.
    Cancelled,
    /// The connection went away first.
    ConnectionLost,
    /// The deadline passed first.
    TimedOut,
}

/// Typed payload assembled from the untagged data a command produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[allow(missing_docs)] // each variant names the command family it serves
pub enum ResponseData {
    #[default]
    None,
    Capabilities(Capabilities),
    Mailbox(Box<Mailbox>),
    Names(Vec<Name>),
    Search(Vec<Seq>),
    Expunged(Vec<Seq>),
    Fetches(Vec<Fetch>),
}

/// Delivered to a command's completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// How the command ended.
    pub outcome: Outcome,
    /// What its untagged responses carried.
    pub data: ResponseData,
}

impl Completion {
    /// Whether the server reported success.
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }
}

/// Completion callback of one command.
pub type OnDone = Box<dyn FnOnce(Completion)>;
/// Per-message callback for FETCH/STORE results.
pub type OnItem = Box<dyn FnMut(Fetch)>;
/// Callback for unsolicited updates while IDLE is active, called with
/// the update name (`EXISTS`, `RECENT`, `EXPUNGE`, `FETCH`) and its
/// message number.
pub type OnIdleUpdate = Box<dyn FnMut(&str, u32)>;

type AuthResponder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// Untagged data accumulated for the command that asked for it.
#[derive(Debug)]
enum Collector {
    None,
    Capabilities(Option<Capabilities>),
    Mailbox(Box<Mailbox>),
    Names(Vec<Name>),
    Search(Vec<Seq>),
    Expunged(Vec<Seq>),
    Fetches(Vec<Fetch>),
}

impl Collector {
    fn into_data(self, session_caps: Option<&Capabilities>) -> ResponseData {
        match self {
            Collector::None => ResponseData::None,
            Collector::Capabilities(caps) => ResponseData::Capabilities(
                caps.or_else(|| session_caps.cloned()).unwrap_or_default(),
            ),
            Collector::Mailbox(mb) => ResponseData::Mailbox(mb),
            Collector::Names(names) => ResponseData::Names(names),
            Collector::Search(ids) => ResponseData::Search(ids),
            Collector::Expunged(ids) => ResponseData::Expunged(ids),
            Collector::Fetches(fetches) => ResponseData::Fetches(fetches),
        }
    }
}

/// One command between send and its tagged response.
struct PendingCommand {
    tag: String,
    kind: CommandKind,
    #[allow(dead_code)]
    sent_at: Instant,
    deadline: Option<Instant>,
    /// Cancelled or timed out: the tagged response is consumed silently.
    abandoned: bool,
    /// The mailbox argument, for routing STATUS and SELECT data.
    mailbox: Option<String>,
    collector: Collector,
    on_done: Option<OnDone>,
    on_item: Option<OnItem>,
    /// Command line segments still waiting for `+` invitations.
    continuations: VecDeque<Vec<u8>>,
    authenticate: Option<AuthResponder>,
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("abandoned", &self.abandoned)
            .field("continuations", &self.continuations.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdlePhase {
    Inactive,
    /// IDLE sent, waiting for the server's `+`.
    Requested,
    Active,
    /// DONE sent, waiting for the IDLE tag.
    Terminating,
}

#[derive(Debug)]
struct IdleStatus {
    phase: IdlePhase,
    tag: Option<String>,
    since: Option<Instant>,
    /// DONE requested before the server's `+` arrived.
    done_wanted: bool,
    /// Re-enter IDLE once the current cycle finishes (keepalive).
    reissue: bool,
}

impl IdleStatus {
    fn reset(&mut self) {
        self.phase = IdlePhase::Inactive;
        self.tag = None;
        self.since = None;
        self.done_wanted = false;
    }
}

struct QueuedCommand {
    request: Request,
    pending: PendingCommand,
}

/// A sans-I/O IMAP4rev1 client session.
pub struct Engine {
    config: Config,
    state: ConnectionState,
    buffer: Buffer,
    framer: Framer,
    tags: crate::types::IdGenerator,
    pending: VecDeque<PendingCommand>,
    queued: VecDeque<QueuedCommand>,
    outbound: BytesMut,
    unsolicited: Vec<Unsolicited>,
    capabilities: Option<Capabilities>,
    statuses: HashMap<String, Mailbox>,
    selected: Option<(String, Mailbox)>,
    idle: IdleStatus,
    on_idle: Option<OnIdleUpdate>,
    tls_active: bool,
    /// The greeting was PREAUTH: skip authentication entirely.
    preauth: bool,
    /// A STARTTLS cycle is refreshing capabilities; resume the
    /// authentication entry action once they arrive.
    resume_auth_after_caps: bool,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("queued", &self.queued.len())
            .field("idle", &self.idle)
            .finish()
    }
}

impl Engine {
    /// An engine for one connection, in the closed state until the
    /// transport reports itself with
    /// [`connection_established`](Self::connection_established).
    pub fn new(config: Config) -> Self {
        let framer = Framer::new(config.literal_ceiling);
        Engine {
            config,
            state: ConnectionState::ConnectionClosed,
            buffer: Buffer::new(),
            framer,
            tags: crate::types::IdGenerator::new(),
            pending: VecDeque::new(),
            queued: VecDeque::new(),
            outbound: BytesMut::new(),
            unsolicited: Vec::new(),
            capabilities: None,
            statuses: HashMap::new(),
            selected: None,
            idle: IdleStatus {
                phase: IdlePhase::Inactive,
                tag: None,
                since: None,
                done_wanted: false,
                reissue: false,
            },
            on_idle: None,
            tls_active: false,
            preauth: false,
            resume_auth_after_caps: false,
        }
    }

    /// Register the sink that receives oversized literals chunk by
    /// chunk.
    pub fn set_literal_sink(&mut self, sink: LiteralSink) {
        self.framer.set_sink(sink);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The capability set, once a CAPABILITY response has been seen.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Status snapshot of the selected mailbox.
    pub fn selected(&self) -> Option<&Mailbox> {
        self.selected.as_ref().map(|(_, mb)| mb)
    }

    /// The last status snapshot seen for a mailbox.
    pub fn mailbox_status(&self, name: &str) -> Option<&Mailbox> {
        self.statuses.get(name)
    }

    /// Number of commands awaiting their tagged response.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// The transport has connected.
    pub fn connection_established(&mut self) {
        debug!("transport connected");
        self.state = ConnectionState::ConnectionEstablished;
    }

    /// The transport has gone away.
    pub fn connection_closed(&mut self) {
        debug!("transport closed");
        self.state = ConnectionState::ConnectionClosed;
        self.idle.reset();
        self.idle.reissue = false;
        self.fail_all_pending();
    }

    /// Inbound edge: bytes arrived from the transport.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.append(bytes);
        loop {
            let unit = match self.framer.pull(&mut self.buffer) {
                Ok(Some(unit)) => unit,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.teardown();
                    return Err(err.into());
                }
            };
            match parse::parse_unit(&unit) {
                Ok(event) => {
                    if let Err(err) = self.handle_event(event) {
                        self.teardown();
                        return Err(err);
                    }
                }
                // a FETCH item this client does not know spoils only
                // that one response
                Err(Error::Parse(ParseError::UnknownFetchItem(name))) => {
                    warn!("skipping FETCH response with unknown item {name:?}");
                }
                Err(err) => {
                    self.teardown();
                    return Err(err);
                }
            }
        }
    }

    /// Outbound edge: bytes the transport should write, if any.
    pub fn take_output(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Drain session-level updates not owned by any command.
    pub fn take_unsolicited(&mut self) -> Vec<Unsolicited> {
        std::mem::take(&mut self.unsolicited)
    }

    /// Deadline sweep; also drives the IDLE keepalive cycle.
    pub fn tick(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for p in self.pending.iter_mut() {
            if p.abandoned {
                continue;
            }
            if matches!(p.deadline, Some(deadline) if deadline <= now) {
                p.abandoned = true;
                if let Some(cb) = p.on_done.take() {
                    expired.push(cb);
                }
            }
        }
        for cb in expired {
            cb(Completion {
                outcome: Outcome::TimedOut,
                data: ResponseData::None,
            });
        }
        if self.idle.phase == IdlePhase::Active {
            if let Some(since) = self.idle.since {
                if now.duration_since(since) >= self.config.idle_keepalive {
                    debug!("restarting IDLE to stay alive");
                    self.idle.reissue = true;
                    self.request_done();
                }
            }
        }
    }

    /// Detach a pending command's callbacks. The tag stays in the
    /// table so the eventual tagged response is consumed silently.
    pub fn cancel(&mut self, tag: &str) -> bool {
        let Some(p) = self
            .pending
            .iter_mut()
            .find(|p| p.tag == tag && !p.abandoned)
        else {
            return false;
        };
        p.abandoned = true;
        p.on_item = None;
        let cb = p.on_done.take();
        if let Some(cb) = cb {
            cb(Completion {
                outcome: Outcome::Cancelled,
                data: ResponseData::None,
            });
        }
        true
    }

    // ----- command surface -----

    /// Ask the server for its capability set.
    ///
    /// The engine refreshes its own view from the response as well, so
    /// callers rarely need this: a CAPABILITY cycle runs automatically
    /// after the greeting and after STARTTLS.
    pub fn capability(&mut self, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Capability,
            RequestBuilder::new("CAPABILITY"),
            Collector::Capabilities(None),
            Some(on_done),
            None,
            None,
        )
    }

    /// Ask to upgrade the connection to TLS.
    ///
    /// On OK the engine emits [`Unsolicited::TlsRequired`]; the caller
    /// must upgrade the transport before feeding further bytes.
    pub fn starttls(&mut self, on_done: OnDone) -> Result<String> {
        if self.tls_active {
            return Err(Error::TlsUnavailable);
        }
        if let Some(caps) = &self.capabilities {
            if !caps.has_str("STARTTLS") {
                return Err(Error::TlsUnavailable);
            }
        }
        self.enqueue(
            CommandKind::StartTls,
            RequestBuilder::new("STARTTLS"),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// Log in with a username and password.
    ///
    /// Credentials that quoting cannot carry are sent as literals, each
    /// waiting for the server's continuation.
    pub fn login(&mut self, username: &str, password: &str, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Login,
            RequestBuilder::new("LOGIN")
                .astring(username)
                .astring(password),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// Authenticate with a SASL mechanism; `auth` answers each decoded
    /// server challenge.
    pub fn authenticate<A>(&mut self, mechanism: &str, mut auth: A, on_done: OnDone) -> Result<String>
    where
        A: Authenticator + 'static,
    {
        let responder: AuthResponder = Box::new(move |challenge| {
            auth.process(challenge).as_ref().to_vec()
        });
        self.enqueue(
            CommandKind::Authenticate,
            RequestBuilder::new("AUTHENTICATE").raw(mechanism)?,
            Collector::None,
            Some(on_done),
            None,
            Some(responder),
        )
    }

    /// Select a mailbox for read-write access. Completion data is the
    /// assembled [`Mailbox`] snapshot.
    pub fn select(&mut self, mailbox: &str, on_done: OnDone) -> Result<String> {
        self.select_like(CommandKind::Select, mailbox, on_done)
    }

    /// Like [`select`](Self::select), but read-only.
    pub fn examine(&mut self, mailbox: &str, on_done: OnDone) -> Result<String> {
        self.select_like(CommandKind::Examine, mailbox, on_done)
    }

    fn select_like(&mut self, kind: CommandKind, mailbox: &str, on_done: OnDone) -> Result<String> {
        let snapshot = Mailbox {
            read_only: kind == CommandKind::Examine,
            ..Mailbox::default()
        };
        let tag = self.enqueue(
            kind,
            RequestBuilder::new(kind.name()).mailbox(mailbox),
            Collector::Mailbox(Box::new(snapshot)),
            Some(on_done),
            None,
            None,
        )?;
        self.set_pending_mailbox(&tag, mailbox);
        Ok(tag)
    }

    /// `items` is the parenthesized attribute list, e.g.
    /// `"(MESSAGES UNSEEN UIDNEXT)"`.
    pub fn status(&mut self, mailbox: &str, items: &str, on_done: OnDone) -> Result<String> {
        let tag = self.enqueue(
            CommandKind::Status,
            RequestBuilder::new("STATUS").mailbox(mailbox).raw(items)?,
            Collector::Mailbox(Box::default()),
            Some(on_done),
            None,
            None,
        )?;
        self.set_pending_mailbox(&tag, mailbox);
        Ok(tag)
    }

    /// List mailbox names matching `pattern` under `reference`.
    /// Completion data is the collected [`Name`]s.
    pub fn list(&mut self, reference: &str, pattern: &str, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::List,
            RequestBuilder::new("LIST").mailbox(reference).mailbox(pattern),
            Collector::Names(Vec::new()),
            Some(on_done),
            None,
            None,
        )
    }

    /// Like [`list`](Self::list), restricted to subscribed names.
    pub fn lsub(&mut self, reference: &str, pattern: &str, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Lsub,
            RequestBuilder::new("LSUB").mailbox(reference).mailbox(pattern),
            Collector::Names(Vec::new()),
            Some(on_done),
            None,
            None,
        )
    }

    /// Create a mailbox.
    pub fn create(&mut self, mailbox: &str, on_done: OnDone) -> Result<String> {
        self.simple_mailbox_command(CommandKind::Create, mailbox, on_done)
    }

    /// Delete a mailbox.
    pub fn delete(&mut self, mailbox: &str, on_done: OnDone) -> Result<String> {
        self.simple_mailbox_command(CommandKind::Delete, mailbox, on_done)
    }

    /// Add a mailbox to the subscription list.
    pub fn subscribe(&mut self, mailbox: &str, on_done: OnDone) -> Result<String> {
        self.simple_mailbox_command(CommandKind::Subscribe, mailbox, on_done)
    }

    /// Remove a mailbox from the subscription list.
    pub fn unsubscribe(&mut self, mailbox: &str, on_done: OnDone) -> Result<String> {
        self.simple_mailbox_command(CommandKind::Unsubscribe, mailbox, on_done)
    }

    fn simple_mailbox_command(
        &mut self,
        kind: CommandKind,
        mailbox: &str,
        on_done: OnDone,
    ) -> Result<String> {
        self.enqueue(
            kind,
            RequestBuilder::new(kind.name()).mailbox(mailbox),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// Rename a mailbox.
    pub fn rename(&mut self, from: &str, to: &str, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Rename,
            RequestBuilder::new("RENAME").mailbox(from).mailbox(to),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// `query` is preformatted search syntax, e.g. `"UNSEEN SINCE 1-Feb-1994"`.
    pub fn search(&mut self, query: &str, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Search,
            RequestBuilder::new("SEARCH").raw(query)?,
            Collector::Search(Vec::new()),
            Some(on_done),
            None,
            None,
        )
    }

    /// Fetch `items` (e.g. `"(FLAGS ENVELOPE BODY[])"`) for `sequence_set`.
    ///
    /// With an `on_item` callback each message is delivered as soon as
    /// its response parses; otherwise the items are collected and handed
    /// to `on_done`.
    pub fn fetch(
        &mut self,
        sequence_set: &str,
        items: &str,
        on_item: Option<OnItem>,
        on_done: OnDone,
    ) -> Result<String> {
        let collector = if on_item.is_some() {
            Collector::None
        } else {
            Collector::Fetches(Vec::new())
        };
        self.enqueue(
            CommandKind::Fetch,
            RequestBuilder::new("FETCH").raw(sequence_set)?.raw(items)?,
            collector,
            Some(on_done),
            on_item,
            None,
        )
    }

    /// Change flags, e.g. `store("2:4", "+FLAGS (\\Deleted)", ...)`.
    pub fn store(
        &mut self,
        sequence_set: &str,
        changes: &str,
        on_item: Option<OnItem>,
        on_done: OnDone,
    ) -> Result<String> {
        let collector = if on_item.is_some() {
            Collector::None
        } else {
            Collector::Fetches(Vec::new())
        };
        self.enqueue(
            CommandKind::Store,
            RequestBuilder::new("STORE").raw(sequence_set)?.raw(changes)?,
            collector,
            Some(on_done),
            on_item,
            None,
        )
    }

    /// Permanently remove messages flagged `\Deleted`. Completion data
    /// is the expunged sequence numbers, in server order.
    pub fn expunge(&mut self, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Expunge,
            RequestBuilder::new("EXPUNGE"),
            Collector::Expunged(Vec::new()),
            Some(on_done),
            None,
            None,
        )
    }

    /// Close the selected mailbox, expunging silently.
    pub fn close(&mut self, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Close,
            RequestBuilder::new("CLOSE"),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// Do nothing, giving the server a window for untagged updates.
    pub fn noop(&mut self, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Noop,
            RequestBuilder::new("NOOP"),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// End the session. The server answers with BYE and the tagged OK.
    pub fn logout(&mut self, on_done: OnDone) -> Result<String> {
        self.enqueue(
            CommandKind::Logout,
            RequestBuilder::new("LOGOUT"),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// Enter IDLE. `on_update` receives unsolicited updates while the
    /// mode is active; `on_done` fires when the IDLE command itself
    /// completes (after [`Engine::done`] or an interrupting command).
    pub fn idle(&mut self, on_update: OnIdleUpdate, on_done: OnDone) -> Result<String> {
        CommandKind::Idle.check_state(self.state)?;
        if self.idle.phase != IdlePhase::Inactive {
            return Err(Error::BadState {
                command: "IDLE",
                state: self.state,
            });
        }
        if let Some(caps) = &self.capabilities {
            if !caps.has_str("IDLE") {
                warn!("server does not advertise IDLE, sending it anyway");
            }
        }
        self.on_idle = Some(on_update);
        self.enqueue(
            CommandKind::Idle,
            RequestBuilder::new("IDLE"),
            Collector::None,
            Some(on_done),
            None,
            None,
        )
    }

    /// Leave IDLE by sending the untagged `DONE`.
    pub fn done(&mut self) -> Result<()> {
        match self.idle.phase {
            IdlePhase::Active => {
                self.request_done();
                Ok(())
            }
            IdlePhase::Requested => {
                self.idle.done_wanted = true;
                Ok(())
            }
            _ => Err(Error::BadState {
                command: "DONE",
                state: self.state,
            }),
        }
    }

    // ----- dispatch internals -----

    fn enqueue(
        &mut self,
        kind: CommandKind,
        builder: RequestBuilder,
        collector: Collector,
        on_done: Option<OnDone>,
        on_item: Option<OnItem>,
        authenticate: Option<AuthResponder>,
    ) -> Result<String> {
        kind.check_state(self.state)?;
        let tag = self.tags.next_tag();
        let request = builder.finish(Some(tag.clone()));
        let now = Instant::now();
        let pending = PendingCommand {
            tag: tag.clone(),
            kind,
            sent_at: now,
            deadline: self.config.command_timeout.map(|t| now + t),
            abandoned: false,
            mailbox: None,
            collector,
            on_done,
            on_item,
            continuations: VecDeque::new(),
            authenticate,
        };
        if self.idle.phase != IdlePhase::Inactive {
            // IDLE owns the wire; park the command and wind IDLE down
            debug!("{} queued behind IDLE", kind.name());
            self.queued.push_back(QueuedCommand { request, pending });
            self.request_done();
            return Ok(tag);
        }
        self.transmit(request, pending);
        Ok(tag)
    }

    fn transmit(&mut self, request: Request, mut pending: PendingCommand) {
        let mut segments = request.segments;
        let first = segments.pop_front().unwrap_or_default();
        pending.continuations = segments;
        if let Some(tag) = &request.tag {
            self.outbound.extend_from_slice(tag.as_bytes());
            self.outbound.extend_from_slice(b" ");
        }
        self.outbound.extend_from_slice(&first);
        self.outbound.extend_from_slice(b"\r\n");
        trace!(
            "C: {} {}",
            request.tag.as_deref().unwrap_or("*"),
            String::from_utf8_lossy(&first)
        );
        if pending.kind == CommandKind::Idle {
            self.idle.phase = IdlePhase::Requested;
            self.idle.tag = Some(pending.tag.clone());
        }
        self.pending.push_back(pending);
    }

    fn request_done(&mut self) {
        if self.idle.phase == IdlePhase::Active {
            trace!("C: DONE");
            self.outbound.extend_from_slice(b"DONE\r\n");
            self.idle.phase = IdlePhase::Terminating;
        } else if self.idle.phase == IdlePhase::Requested {
            self.idle.done_wanted = true;
        }
    }

    fn set_pending_mailbox(&mut self, tag: &str, mailbox: &str) {
        if let Some(p) = self.pending.iter_mut().find(|p| p.tag == tag) {
            p.mailbox = Some(mailbox.to_string());
        } else if let Some(q) = self.queued.iter_mut().find(|q| q.pending.tag == tag) {
            q.pending.mailbox = Some(mailbox.to_string());
        }
    }

    fn flush_queued(&mut self) {
        while self.idle.phase == IdlePhase::Inactive {
            match self.queued.pop_front() {
                Some(q) => self.transmit(q.request, q.pending),
                None => break,
            }
        }
    }

    // ----- inbound handling -----

    fn handle_event(&mut self, event: ResponseEvent) -> Result<()> {
        match event {
            ResponseEvent::Continue { info } => self.handle_continue(info),
            ResponseEvent::Tagged {
                tag,
                status,
                code,
                info,
            } => self.handle_tagged(tag, status, code, info),
            ResponseEvent::Untagged(resp) => self.handle_untagged(resp),
        }
    }

    fn handle_continue(&mut self, info: Option<String>) -> Result<()> {
        if self.idle.phase == IdlePhase::Requested {
            debug!("IDLE accepted");
            self.idle.phase = IdlePhase::Active;
            self.idle.since = Some(Instant::now());
            if self.idle.done_wanted {
                self.idle.done_wanted = false;
                self.request_done();
            }
            return Ok(());
        }
        // an outbound literal waiting for its invitation
        if let Some(p) = self
            .pending
            .iter_mut()
            .find(|p| !p.continuations.is_empty())
        {
            if let Some(segment) = p.continuations.pop_front() {
                self.outbound.extend_from_slice(&segment);
                self.outbound.extend_from_slice(b"\r\n");
            }
            return Ok(());
        }
        // a SASL exchange waiting for its challenge
        if let Some(p) = self.pending.iter_mut().find(|p| p.authenticate.is_some()) {
            let challenge = match &info {
                Some(text) => BASE64
                    .decode(text.trim_end())
                    .map_err(|_| ParseError::Authentication(text.clone()))?,
                None => Vec::new(),
            };
            let response = match p.authenticate.as_mut() {
                Some(responder) => responder(&challenge),
                None => Vec::new(),
            };
            let line = BASE64.encode(response);
            self.outbound.extend_from_slice(line.as_bytes());
            self.outbound.extend_from_slice(b"\r\n");
            return Ok(());
        }
        warn!("continuation request with nothing to continue");
        Ok(())
    }

    fn handle_tagged(
        &mut self,
        tag: String,
        status: Status,
        code: Option<ResponseCode>,
        info: String,
    ) -> Result<()> {
        let index = self
            .pending
            .iter()
            .position(|p| p.tag == tag)
            .ok_or_else(|| Error::UnexpectedTag(tag.clone()))?;
        let mut p = self.pending.remove(index).unwrap_or_else(|| unreachable!());
        if let Some(code) = &code {
            self.apply_code(Some(&mut p), code, &info);
        }
        let ok = status == Status::Ok;
        if p.kind == CommandKind::Idle {
            self.idle.reset();
        }
        // state transitions keyed by command on success
        if ok {
            match p.kind {
                CommandKind::Login | CommandKind::Authenticate => {
                    self.state = ConnectionState::Authenticated;
                }
                CommandKind::Select | CommandKind::Examine => {
                    self.state = ConnectionState::Selected;
                    if let (Some(name), Collector::Mailbox(mb)) = (&p.mailbox, &p.collector) {
                        self.selected = Some((name.clone(), (**mb).clone()));
                        self.statuses.insert(name.clone(), (**mb).clone());
                    }
                }
                CommandKind::Close => {
                    self.state = ConnectionState::Authenticated;
                    self.selected = None;
                }
                CommandKind::Logout => {
                    self.state = ConnectionState::Logout;
                }
                CommandKind::StartTls => {
                    self.tls_active = true;
                    self.unsolicited.push(Unsolicited::TlsRequired);
                    // capabilities are void after the upgrade
                    self.capabilities = None;
                    self.resume_auth_after_caps = true;
                    self.issue_internal_capability();
                }
                CommandKind::Status => {
                    if let (Some(name), Collector::Mailbox(mb)) = (&p.mailbox, &p.collector) {
                        self.statuses.insert(name.clone(), (**mb).clone());
                    }
                }
                _ => {}
            }
        } else if matches!(p.kind, CommandKind::Select | CommandKind::Examine) {
            // a failed SELECT leaves no mailbox selected
            if self.state == ConnectionState::Selected {
                self.state = ConnectionState::Authenticated;
            }
            self.selected = None;
        }
        if status == Status::Bad {
            warn!("server answered BAD to {}: {}", p.kind.name(), info);
        }
        let outcome = match status {
            Status::Ok => Outcome::Ok(info),
            Status::No => Outcome::No(info),
            _ => Outcome::Bad(info),
        };
        let capability_completed = p.kind == CommandKind::Capability && ok;
        if p.abandoned {
            debug!("discarding response for abandoned command {tag}");
        } else if let Some(cb) = p.on_done.take() {
            let data = p.collector.into_data(self.capabilities.as_ref());
            cb(Completion { outcome, data });
        }
        if capability_completed {
            self.after_capability()?;
        }
        self.flush_queued();
        if self.idle.reissue
            && self.idle.phase == IdlePhase::Inactive
            && self.state == ConnectionState::Selected
        {
            self.idle.reissue = false;
            let result = self.enqueue(
                CommandKind::Idle,
                RequestBuilder::new("IDLE"),
                Collector::None,
                None,
                None,
                None,
            );
            if let Err(err) = result {
                warn!("could not restart IDLE: {err}");
            }
        }
        Ok(())
    }

    /// Entry actions that depend on a fresh capability set.
    fn after_capability(&mut self) -> Result<()> {
        let caps_ok = self
            .capabilities
            .as_ref()
            .map(Capabilities::has_imap4rev1)
            .unwrap_or(false);
        if !caps_ok {
            self.teardown();
            return Err(Error::NotImap4Rev1);
        }
        if self.state == ConnectionState::ServerGreeting {
            self.state = if self.preauth {
                ConnectionState::Authenticated
            } else {
                ConnectionState::NotAuthenticated
            };
            debug!("entering {:?}", self.state);
            if self.state == ConnectionState::NotAuthenticated {
                self.authentication_entry_action();
            }
        } else if self.resume_auth_after_caps {
            self.resume_auth_after_caps = false;
            if self.state == ConnectionState::NotAuthenticated {
                self.authentication_entry_action();
            }
        }
        Ok(())
    }

    fn authentication_entry_action(&mut self) {
        let advertises_tls = self
            .capabilities
            .as_ref()
            .map(|c| c.has_str("STARTTLS"))
            .unwrap_or(false);
        if self.config.starttls && !self.tls_active && advertises_tls {
            debug!("upgrading to TLS before authenticating");
            let result = self.starttls(Box::new(|done| {
                if !done.is_ok() {
                    warn!("automatic STARTTLS failed: {:?}", done.outcome);
                }
            }));
            if let Err(err) = result {
                warn!("could not issue STARTTLS: {err}");
            }
            return;
        }
        if let Some(creds) = self.config.credentials.clone() {
            debug!("logging in as {}", creds.username);
            let result = self.login(
                &creds.username,
                &creds.password,
                Box::new(|done| {
                    if !done.is_ok() {
                        warn!("automatic LOGIN failed: {:?}", done.outcome);
                    }
                }),
            );
            if let Err(err) = result {
                warn!("could not issue LOGIN: {err}");
            }
        }
    }

    fn issue_internal_capability(&mut self) {
        let result = self.enqueue(
            CommandKind::Capability,
            RequestBuilder::new("CAPABILITY"),
            Collector::Capabilities(None),
            None,
            None,
            None,
        );
        if let Err(err) = result {
            warn!("could not issue CAPABILITY: {err}");
        }
    }

    fn handle_untagged(&mut self, resp: UntaggedResponse) -> Result<()> {
        match resp {
            UntaggedResponse::Condition { status, code, info } => {
                self.handle_condition(status, code, info)
            }
            UntaggedResponse::Capabilities(atoms) => {
                let caps = Capabilities::from_atoms(atoms.iter().map(String::as_str));
                self.capabilities = Some(caps.clone());
                if let Some(p) = self
                    .pending
                    .iter_mut()
                    .find(|p| matches!(p.collector, Collector::Capabilities(_)))
                {
                    p.collector = Collector::Capabilities(Some(caps));
                }
                Ok(())
            }
            UntaggedResponse::List(name) => {
                self.push_name(CommandKind::List, name);
                Ok(())
            }
            UntaggedResponse::Lsub(name) => {
                self.push_name(CommandKind::Lsub, name);
                Ok(())
            }
            UntaggedResponse::MailboxStatus { mailbox, items } => {
                let snapshot = self.statuses.entry(mailbox.clone()).or_default();
                apply_status_items(snapshot, &items);
                let routed = match self.pending.iter_mut().find(|p| {
                    p.kind == CommandKind::Status && p.mailbox.as_deref() == Some(mailbox.as_str())
                }) {
                    Some(p) => {
                        if let Collector::Mailbox(mb) = &mut p.collector {
                            apply_status_items(mb, &items);
                        }
                        true
                    }
                    None => false,
                };
                if !routed {
                    self.unsolicited
                        .push(Unsolicited::MailboxStatus { mailbox, items });
                }
                Ok(())
            }
            UntaggedResponse::Flags(flags) => {
                if let Some(mb) = self.selecting_mailbox() {
                    mb.flags = flags;
                    return Ok(());
                }
                if let Some((_, mb)) = &mut self.selected {
                    mb.flags = flags.clone();
                    self.unsolicited.push(Unsolicited::Flags(flags));
                }
                Ok(())
            }
            UntaggedResponse::Search(ids) => {
                match self
                    .pending
                    .iter_mut()
                    .find(|p| matches!(p.collector, Collector::Search(_)))
                {
                    Some(p) => {
                        if let Collector::Search(acc) = &mut p.collector {
                            acc.extend(ids);
                        }
                    }
                    None => warn!("SEARCH results with no search pending"),
                }
                Ok(())
            }
            UntaggedResponse::Exists(n) => {
                if let Some(mb) = self.selecting_mailbox() {
                    mb.exists = n;
                    return Ok(());
                }
                if let Some((_, mb)) = &mut self.selected {
                    mb.exists = n;
                }
                self.unsolicited.push(Unsolicited::Exists(n));
                self.notify_idle("EXISTS", n);
                Ok(())
            }
            UntaggedResponse::Recent(n) => {
                if let Some(mb) = self.selecting_mailbox() {
                    mb.recent = n;
                    return Ok(());
                }
                if let Some((_, mb)) = &mut self.selected {
                    mb.recent = n;
                }
                self.unsolicited.push(Unsolicited::Recent(n));
                self.notify_idle("RECENT", n);
                Ok(())
            }
            UntaggedResponse::Expunge(n) => {
                let routed = match self
                    .pending
                    .iter_mut()
                    .find(|p| matches!(p.collector, Collector::Expunged(_)))
                {
                    Some(p) => {
                        if let Collector::Expunged(acc) = &mut p.collector {
                            acc.push(n);
                        }
                        true
                    }
                    None => false,
                };
                if let Some((_, mb)) = &mut self.selected {
                    mb.exists = mb.exists.saturating_sub(1);
                }
                if !routed {
                    self.unsolicited.push(Unsolicited::Expunge(n));
                    self.notify_idle("EXPUNGE", n);
                }
                Ok(())
            }
            UntaggedResponse::Fetch(seq, attrs) => {
                let fetch = Fetch::from_attrs(seq, attrs)?;
                match self.pending.iter_mut().find(|p| {
                    matches!(p.kind, CommandKind::Fetch | CommandKind::Store) && !p.abandoned
                }) {
                    Some(p) => {
                        if let Some(on_item) = p.on_item.as_mut() {
                            on_item(fetch);
                        } else if let Collector::Fetches(acc) = &mut p.collector {
                            acc.push(fetch);
                        }
                    }
                    None => {
                        self.notify_idle("FETCH", seq);
                        self.unsolicited.push(Unsolicited::Fetch(Box::new(fetch)));
                    }
                }
                Ok(())
            }
            UntaggedResponse::Unknown(_) => Ok(()),
        }
    }

    fn handle_condition(
        &mut self,
        status: Status,
        code: Option<ResponseCode>,
        info: String,
    ) -> Result<()> {
        if self.state == ConnectionState::ConnectionEstablished {
            return self.handle_greeting(status, code, info);
        }
        match status {
            Status::Bye => {
                self.handle_bye(info);
                Ok(())
            }
            Status::Ok => {
                if let Some(code) = &code {
                    self.apply_code(None, code, &info);
                }
                Ok(())
            }
            Status::No | Status::Bad => {
                warn!("untagged {status:?}: {info}");
                if let Some(code) = &code {
                    self.apply_code(None, code, &info);
                }
                Ok(())
            }
            Status::PreAuth => {
                warn!("PREAUTH outside the greeting, ignoring");
                Ok(())
            }
        }
    }

    fn handle_greeting(
        &mut self,
        status: Status,
        code: Option<ResponseCode>,
        info: String,
    ) -> Result<()> {
        match status {
            Status::Ok | Status::PreAuth => {
                debug!("greeting: {info}");
                self.state = ConnectionState::ServerGreeting;
                self.preauth = status == Status::PreAuth;
                if let Some(ResponseCode::Capability(atoms)) = &code {
                    self.capabilities =
                        Some(Capabilities::from_atoms(atoms.iter().map(String::as_str)));
                    // the greeting already told us everything
                    return self.after_capability();
                }
                self.issue_internal_capability();
                Ok(())
            }
            Status::Bye => {
                self.handle_bye(info);
                Ok(())
            }
            _ => {
                warn!("connection refused by greeting: {info}");
                self.state = ConnectionState::Logout;
                Ok(())
            }
        }
    }

    fn handle_bye(&mut self, info: String) {
        let logging_out = self
            .pending
            .iter()
            .any(|p| p.kind == CommandKind::Logout && !p.abandoned);
        self.unsolicited.push(Unsolicited::Bye(info.clone()));
        self.state = ConnectionState::Logout;
        if !logging_out {
            warn!("unexpected BYE: {info}");
            self.fail_all_pending();
        }
    }

    /// Interpret a bracketed response code, against the given pending
    /// command when the response was tagged, else against session state.
    fn apply_code(&mut self, target: Option<&mut PendingCommand>, code: &ResponseCode, info: &str) {
        match code {
            ResponseCode::Capability(atoms) => {
                self.capabilities =
                    Some(Capabilities::from_atoms(atoms.iter().map(String::as_str)));
            }
            ResponseCode::Alert => {
                self.unsolicited.push(Unsolicited::Alert(info.to_string()));
            }
            ResponseCode::PermanentFlags(flags) => {
                if let Some(mb) = self.code_mailbox(target) {
                    mb.permanent_flags = flags.clone();
                }
            }
            ResponseCode::ReadOnly => {
                if let Some(mb) = self.code_mailbox(target) {
                    mb.read_only = true;
                }
            }
            ResponseCode::ReadWrite => {
                if let Some(mb) = self.code_mailbox(target) {
                    mb.read_only = false;
                }
            }
            ResponseCode::UidNext(n) => {
                if let Some(mb) = self.code_mailbox(target) {
                    mb.uid_next = Some(*n);
                }
            }
            ResponseCode::UidValidity(n) => {
                if let Some(mb) = self.code_mailbox(target) {
                    mb.uid_validity = Some(*n);
                }
            }
            ResponseCode::Unseen(n) => {
                if let Some(mb) = self.code_mailbox(target) {
                    mb.unseen = Some(*n);
                }
            }
            ResponseCode::TryCreate | ResponseCode::Other(_) => {}
        }
    }

    /// The mailbox a response code should land in: the tagged command's
    /// collector, a SELECT in flight, or the selected mailbox.
    fn code_mailbox<'a>(
        &'a mut self,
        target: Option<&'a mut PendingCommand>,
    ) -> Option<&'a mut Mailbox> {
        if let Some(p) = target {
            if let Collector::Mailbox(mb) = &mut p.collector {
                return Some(mb);
            }
        }
        let selecting = self
            .pending
            .iter()
            .any(|p| matches!(p.kind, CommandKind::Select | CommandKind::Examine));
        if selecting {
            return self.selecting_mailbox();
        }
        self.selected.as_mut().map(|(_, mb)| mb)
    }

    /// The collector of a SELECT/EXAMINE still in flight.
    fn selecting_mailbox(&mut self) -> Option<&mut Mailbox> {
        self.pending
            .iter_mut()
            .find(|p| matches!(p.kind, CommandKind::Select | CommandKind::Examine))
            .and_then(|p| match &mut p.collector {
                Collector::Mailbox(mb) => Some(&mut **mb),
                _ => None,
            })
    }

    fn push_name(&mut self, kind: CommandKind, name: Name) {
        match self
            .pending
            .iter_mut()
            .find(|p| p.kind == kind && matches!(p.collector, Collector::Names(_)))
        {
            Some(p) => {
                if let Collector::Names(acc) = &mut p.collector {
                    acc.push(name);
                }
            }
            None => warn!("{} name with no matching command pending", kind.name()),
        }
    }

    fn notify_idle(&mut self, what: &str, n: u32) {
        if self.idle.phase == IdlePhase::Active || self.idle.phase == IdlePhase::Terminating {
            if let Some(cb) = self.on_idle.as_mut() {
                cb(what, n);
            }
        }
    }

    /// Unrecoverable wire state: fail everything and head for logout.
    fn teardown(&mut self) {
        self.state = ConnectionState::Logout;
        self.idle.reset();
        self.idle.reissue = false;
        self.fail_all_pending();
    }

    fn fail_all_pending(&mut self) {
        let callbacks: Vec<OnDone> = self
            .pending
            .drain(..)
            .chain(self.queued.drain(..).map(|q| q.pending))
            .filter(|p| !p.abandoned)
            .filter_map(|mut p| p.on_done.take())
            .collect();
        for cb in callbacks {
            cb(Completion {
                outcome: Outcome::ConnectionLost,
                data: ResponseData::None,
            });
        }
    }
}

fn apply_status_items(mailbox: &mut Mailbox, items: &[StatusItem]) {
    for item in items {
        match item {
            StatusItem::Messages(n) => mailbox.exists = *n,
            StatusItem::Recent(n) => mailbox.recent = *n,
            StatusItem::UidNext(n) => mailbox.uid_next = Some(*n),
            StatusItem::UidValidity(n) => mailbox.uid_validity = Some(*n),
            StatusItem::Unseen(n) => mailbox.unseen = Some(*n),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::authenticator::PlainAuthenticator;
    use crate::types::Flag;

    fn output_string(engine: &mut Engine) -> String {
        engine
            .take_output()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    fn capture() -> (Rc<RefCell<Option<Completion>>>, OnDone) {
        let slot: Rc<RefCell<Option<Completion>>> = Rc::default();
        let sink = slot.clone();
        let cb: OnDone = Box::new(move |done| {
            *sink.borrow_mut() = Some(done);
        });
        (slot, cb)
    }

    /// An engine that has read its greeting and capability exchange.
    fn ready_engine() -> Engine {
        let mut engine = Engine::new(Config::default());
        engine.connection_established();
        engine.feed(b"* OK server ready\r\n").unwrap();
        assert_eq!(output_string(&mut engine), "A0001 CAPABILITY\r\n");
        engine
            .feed(b"* CAPABILITY IMAP4rev1 IDLE STARTTLS AUTH=PLAIN\r\nA0001 OK done\r\n")
            .unwrap();
        assert_eq!(engine.state(), ConnectionState::NotAuthenticated);
        engine
    }

    fn authed_engine() -> Engine {
        let mut engine = ready_engine();
        let tag = engine.login("alice", "secret", Box::new(|_| {})).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(format!("{tag} OK LOGIN completed\r\n").as_bytes())
            .unwrap();
        assert_eq!(engine.state(), ConnectionState::Authenticated);
        engine
    }

    fn selected_engine() -> Engine {
        let mut engine = authed_engine();
        let tag = engine.select("INBOX", Box::new(|_| {})).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(
                format!("* 3 EXISTS\r\n* 0 RECENT\r\n{tag} OK [READ-WRITE] SELECT completed\r\n")
                    .as_bytes(),
            )
            .unwrap();
        assert_eq!(engine.state(), ConnectionState::Selected);
        engine
    }

    #[test]
    fn greeting_triggers_capability_request() {
        let engine = ready_engine();
        let caps = engine.capabilities().unwrap();
        assert!(caps.has_imap4rev1());
        assert_eq!(caps.auth_mechanisms(), ["PLAIN"]);
    }

    #[test]
    fn missing_imap4rev1_fails_the_session() {
        let mut engine = Engine::new(Config::default());
        engine.connection_established();
        engine.feed(b"* OK hello\r\n").unwrap();
        let _ = output_string(&mut engine);
        let err = engine
            .feed(b"* CAPABILITY IMAP2\r\nA0001 OK done\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::NotImap4Rev1));
        assert_eq!(engine.state(), ConnectionState::Logout);
    }

    #[test]
    fn preauth_greeting_skips_authentication() {
        let mut engine = Engine::new(Config::default());
        engine.connection_established();
        engine.feed(b"* PREAUTH ready to roll\r\n").unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(b"* CAPABILITY IMAP4rev1\r\nA0001 OK done\r\n")
            .unwrap();
        assert_eq!(engine.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn greeting_capability_code_short_circuits_the_query() {
        let mut engine = Engine::new(Config::default());
        engine.connection_established();
        engine
            .feed(b"* OK [CAPABILITY IMAP4rev1 IDLE] ready\r\n")
            .unwrap();
        // nothing needs asking
        assert_eq!(output_string(&mut engine), "");
        assert_eq!(engine.state(), ConnectionState::NotAuthenticated);
        assert!(engine.capabilities().unwrap().has_str("IDLE"));
    }

    #[test]
    fn capability_callback_gets_the_set_and_the_table_empties() {
        let mut engine = ready_engine();
        let (slot, cb) = capture();
        let tag = engine.capability(cb).unwrap();
        assert_eq!(output_string(&mut engine), format!("{tag} CAPABILITY\r\n"));
        engine
            .feed(format!("* CAPABILITY IMAP4rev1 IDLE AUTH=PLAIN\r\n{tag} OK done\r\n").as_bytes())
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        assert!(done.is_ok());
        let ResponseData::Capabilities(caps) = done.data else {
            panic!("expected capabilities, got {:?}", done.data);
        };
        assert!(caps.has_str("IDLE"));
        assert_eq!(caps.auth_mechanisms(), ["PLAIN"]);
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn login_is_quoted_on_the_wire() {
        let mut engine = ready_engine();
        let (slot, cb) = capture();
        let tag = engine.login("alice", "secret", cb).unwrap();
        assert_eq!(
            output_string(&mut engine),
            format!("{tag} LOGIN \"alice\" \"secret\"\r\n")
        );
        engine
            .feed(format!("{tag} OK LOGIN completed\r\n").as_bytes())
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
        assert_eq!(engine.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn login_failure_stays_unauthenticated() {
        let mut engine = ready_engine();
        let (slot, cb) = capture();
        let tag = engine.login("alice", "wrong", cb).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(format!("{tag} NO [AUTHENTICATIONFAILED] bad credentials\r\n").as_bytes())
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        assert_eq!(done.outcome, Outcome::No("bad credentials".into()));
        assert_eq!(engine.state(), ConnectionState::NotAuthenticated);
    }

    #[test]
    fn literal_password_waits_for_the_continuation() {
        let mut engine = ready_engine();
        let (slot, cb) = capture();
        let tag = engine.login("alice", "pa\nss", cb).unwrap();
        assert_eq!(
            output_string(&mut engine),
            format!("{tag} LOGIN \"alice\" {{5}}\r\n")
        );
        engine.feed(b"+ Ready for literal data\r\n").unwrap();
        assert_eq!(output_string(&mut engine), "pa\nss\r\n");
        engine
            .feed(format!("{tag} OK LOGIN completed\r\n").as_bytes())
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
        assert_eq!(engine.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn authenticate_answers_the_challenge() {
        let mut engine = ready_engine();
        let (slot, cb) = capture();
        let auth = PlainAuthenticator::new("alice", "hunter2");
        let tag = engine.authenticate("PLAIN", auth, cb).unwrap();
        assert_eq!(
            output_string(&mut engine),
            format!("{tag} AUTHENTICATE PLAIN\r\n")
        );
        engine.feed(b"+ \r\n").unwrap();
        let expected = BASE64.encode(b"\0alice\0hunter2");
        assert_eq!(output_string(&mut engine), format!("{expected}\r\n"));
        engine
            .feed(format!("{tag} OK authenticated\r\n").as_bytes())
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
        assert_eq!(engine.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn select_builds_the_mailbox_snapshot() {
        let mut engine = authed_engine();
        let (slot, cb) = capture();
        let tag = engine.select("INBOX", cb).unwrap();
        assert_eq!(output_string(&mut engine), format!("{tag} SELECT \"INBOX\"\r\n"));
        engine
            .feed(
                format!(
                    "* 172 EXISTS\r\n* 1 RECENT\r\n* OK [UNSEEN 12] first unseen\r\n\
* OK [UIDVALIDITY 3857529045] UIDs valid\r\n* OK [UIDNEXT 4392] next UID\r\n\
* FLAGS (\\Answered \\Seen)\r\n{tag} OK [READ-WRITE] SELECT completed\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        assert!(done.is_ok());
        let ResponseData::Mailbox(mb) = done.data else {
            panic!("expected a mailbox, got {:?}", done.data);
        };
        assert_eq!(mb.exists, 172);
        assert_eq!(mb.recent, 1);
        assert_eq!(mb.unseen, Some(12));
        assert_eq!(mb.uid_validity, Some(3857529045));
        assert_eq!(mb.uid_next, Some(4392));
        assert_eq!(mb.flags, vec![Flag::Answered, Flag::Seen]);
        assert!(!mb.read_only);
        assert_eq!(engine.state(), ConnectionState::Selected);
        assert_eq!(engine.selected().unwrap().exists, 172);
    }

    #[test]
    fn failed_select_leaves_nothing_selected() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.select("missing", cb).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(format!("{tag} NO no such mailbox\r\n").as_bytes())
            .unwrap();
        assert!(matches!(
            slot.borrow_mut().take().unwrap().outcome,
            Outcome::No(_)
        ));
        assert_eq!(engine.state(), ConnectionState::Authenticated);
        assert!(engine.selected().is_none());
    }

    #[test]
    fn commands_are_rejected_in_the_wrong_state() {
        let mut engine = ready_engine();
        let err = engine
            .fetch("1", "(FLAGS)", None, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, Error::BadState { command: "FETCH", .. }));
        // nothing was sent and nothing is pending
        assert!(engine.take_output().is_none());
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn fetch_streams_items_to_the_callback() {
        let mut engine = selected_engine();
        let items: Rc<RefCell<Vec<Fetch>>> = Rc::default();
        let sink = items.clone();
        let (slot, cb) = capture();
        let tag = engine
            .fetch(
                "1:2",
                "(FLAGS)",
                Some(Box::new(move |fetch| sink.borrow_mut().push(fetch))),
                cb,
            )
            .unwrap();
        assert_eq!(output_string(&mut engine), format!("{tag} FETCH 1:2 (FLAGS)\r\n"));
        engine
            .feed(
                format!(
                    "* 1 FETCH (FLAGS (\\Seen) UID 4827943)\r\n* 2 FETCH (FLAGS ())\r\n\
{tag} OK FETCH completed\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
        let items = items.borrow();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].message, 1);
        assert_eq!(items[0].flags(), &[Flag::Seen]);
        assert_eq!(items[0].uid, Some(4827943));
        assert_eq!(items[1].message, 2);
        assert!(items[1].flags().is_empty());
    }

    #[test]
    fn fetch_without_callback_collects_items() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.fetch("1", "(UID)", None, cb).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(format!("* 1 FETCH (UID 99)\r\n{tag} OK done\r\n").as_bytes())
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        let ResponseData::Fetches(fetches) = done.data else {
            panic!("expected fetches, got {:?}", done.data);
        };
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].uid, Some(99));
    }

    #[test]
    fn unknown_fetch_items_spoil_only_their_response() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.fetch("1:2", "(UID)", None, cb).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(
                format!(
                    "* 1 FETCH (X-GM-MSGID 1278455344230334865)\r\n* 2 FETCH (UID 7)\r\n\
{tag} OK done\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        assert!(done.is_ok());
        let ResponseData::Fetches(fetches) = done.data else {
            panic!();
        };
        // the unknown response was dropped, the session survived
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].uid, Some(7));
    }

    #[test]
    fn store_reports_the_updated_flags() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.store("2:4", "+FLAGS (\\Deleted)", None, cb).unwrap();
        assert_eq!(
            output_string(&mut engine),
            format!("{tag} STORE 2:4 +FLAGS (\\Deleted)\r\n")
        );
        engine
            .feed(
                format!(
                    "* 2 FETCH (FLAGS (\\Deleted \\Seen))\r\n* 3 FETCH (FLAGS (\\Deleted))\r\n\
* 4 FETCH (FLAGS (\\Deleted \\Flagged \\Seen))\r\n{tag} OK STORE completed\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        let ResponseData::Fetches(fetches) = done.data else {
            panic!();
        };
        assert_eq!(fetches.len(), 3);
        assert_eq!(fetches[1].message, 3);
        assert_eq!(fetches[1].flags(), &[Flag::Deleted]);
    }

    #[test]
    fn create_quotes_the_mailbox_name() {
        let mut engine = authed_engine();
        let (slot, cb) = capture();
        let tag = engine.create("INBOX.Archive", cb).unwrap();
        assert_eq!(
            output_string(&mut engine),
            format!("{tag} CREATE \"INBOX.Archive\"\r\n")
        );
        engine
            .feed(format!("{tag} OK CREATE completed\r\n").as_bytes())
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
    }

    #[test]
    fn search_ids_accumulate_across_lines() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.search("UNSEEN", cb).unwrap();
        assert_eq!(output_string(&mut engine), format!("{tag} SEARCH UNSEEN\r\n"));
        engine
            .feed(format!("* SEARCH 2 84\r\n* SEARCH 882\r\n{tag} OK done\r\n").as_bytes())
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        assert_eq!(done.data, ResponseData::Search(vec![2, 84, 882]));
    }

    #[test]
    fn expunge_collects_the_removed_sequence_numbers() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.expunge(cb).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(format!("* 3 EXPUNGE\r\n* 3 EXPUNGE\r\n* 5 EXPUNGE\r\n{tag} OK done\r\n").as_bytes())
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        assert_eq!(done.data, ResponseData::Expunged(vec![3, 3, 5]));
    }

    #[test]
    fn status_snapshot_is_returned_and_cached() {
        let mut engine = authed_engine();
        let (slot, cb) = capture();
        let tag = engine
            .status("blurdybloop", "(MESSAGES UNSEEN UIDNEXT)", cb)
            .unwrap();
        assert_eq!(
            output_string(&mut engine),
            format!("{tag} STATUS \"blurdybloop\" (MESSAGES UNSEEN UIDNEXT)\r\n")
        );
        engine
            .feed(
                format!(
                    "* STATUS \"blurdybloop\" (MESSAGES 231 UNSEEN 12 UIDNEXT 44292)\r\n\
{tag} OK STATUS completed\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        let ResponseData::Mailbox(mb) = done.data else {
            panic!();
        };
        assert_eq!(mb.exists, 231);
        assert_eq!(mb.unseen, Some(12));
        assert_eq!(mb.uid_next, Some(44292));
        assert_eq!(engine.mailbox_status("blurdybloop").unwrap().exists, 231);
    }

    #[test]
    fn list_names_collect() {
        let mut engine = authed_engine();
        let (slot, cb) = capture();
        let tag = engine.list("", "*", cb).unwrap();
        assert_eq!(output_string(&mut engine), format!("{tag} LIST \"\" \"*\"\r\n"));
        engine
            .feed(
                format!(
                    "* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n\
* LIST () \"/\" \"Entw&APw-rfe\"\r\n{tag} OK done\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
        let done = slot.borrow_mut().take().unwrap();
        let ResponseData::Names(names) = done.data else {
            panic!();
        };
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].name, "INBOX");
        assert_eq!(names[1].name, "Entwürfe");
    }

    #[test]
    fn idle_interruption_preserves_order() {
        let mut engine = selected_engine();
        let (idle_slot, idle_cb) = capture();
        let idle_tag = engine.idle(Box::new(|_, _| {}), idle_cb).unwrap();
        assert_eq!(output_string(&mut engine), format!("{idle_tag} IDLE\r\n"));
        engine.feed(b"+ idling\r\n").unwrap();
        // a command shows up while IDLE owns the wire
        let (noop_slot, noop_cb) = capture();
        let noop_tag = engine.noop(noop_cb).unwrap();
        assert_eq!(output_string(&mut engine), "DONE\r\n");
        engine
            .feed(format!("{idle_tag} OK IDLE terminated\r\n").as_bytes())
            .unwrap();
        assert!(idle_slot.borrow_mut().take().unwrap().is_ok());
        assert_eq!(output_string(&mut engine), format!("{noop_tag} NOOP\r\n"));
        engine
            .feed(format!("{noop_tag} OK NOOP completed\r\n").as_bytes())
            .unwrap();
        assert!(noop_slot.borrow_mut().take().unwrap().is_ok());
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn idle_updates_reach_the_callback() {
        let mut engine = selected_engine();
        let updates: Rc<RefCell<Vec<(String, u32)>>> = Rc::default();
        let sink = updates.clone();
        let (_, idle_cb) = capture();
        engine
            .idle(
                Box::new(move |what, n| sink.borrow_mut().push((what.to_string(), n))),
                idle_cb,
            )
            .unwrap();
        let _ = output_string(&mut engine);
        engine.feed(b"+ idling\r\n").unwrap();
        engine.feed(b"* 4 EXISTS\r\n* 1 RECENT\r\n* 2 EXPUNGE\r\n").unwrap();
        assert_eq!(
            updates.borrow().as_slice(),
            &[
                ("EXISTS".to_string(), 4),
                ("RECENT".to_string(), 1),
                ("EXPUNGE".to_string(), 2)
            ]
        );
        // the selected snapshot tracked the updates too
        assert_eq!(engine.selected().unwrap().exists, 3);
        assert_eq!(engine.selected().unwrap().recent, 1);
    }

    #[test]
    fn done_before_the_continuation_is_deferred() {
        let mut engine = selected_engine();
        let (_, idle_cb) = capture();
        let idle_tag = engine.idle(Box::new(|_, _| {}), idle_cb).unwrap();
        let _ = output_string(&mut engine);
        engine.done().unwrap();
        // DONE must not race ahead of the server's '+'
        assert!(engine.take_output().is_none());
        engine.feed(b"+ idling\r\n").unwrap();
        assert_eq!(output_string(&mut engine), "DONE\r\n");
        engine
            .feed(format!("{idle_tag} OK IDLE done\r\n").as_bytes())
            .unwrap();
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn cancel_detaches_and_the_late_response_is_discarded() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        let tag = engine.noop(cb).unwrap();
        let _ = output_string(&mut engine);
        assert!(engine.cancel(&tag));
        assert_eq!(
            slot.borrow_mut().take().unwrap().outcome,
            Outcome::Cancelled
        );
        // the tag still resolves when the server answers, silently
        engine
            .feed(format!("{tag} OK NOOP completed\r\n").as_bytes())
            .unwrap();
        assert_eq!(engine.pending_commands(), 0);
        assert!(slot.borrow().is_none());
    }

    #[test]
    fn deadlines_time_commands_out() {
        let mut engine = Engine::new(Config {
            command_timeout: Some(Duration::from_millis(10)),
            ..Config::default()
        });
        engine.connection_established();
        engine
            .feed(b"* OK [CAPABILITY IMAP4rev1] ready\r\n")
            .unwrap();
        let _ = output_string(&mut engine);
        let (slot, cb) = capture();
        let tag = engine.login("alice", "secret", cb).unwrap();
        let _ = output_string(&mut engine);
        engine.tick(Instant::now() + Duration::from_secs(1));
        assert_eq!(slot.borrow_mut().take().unwrap().outcome, Outcome::TimedOut);
        // the eventual response is consumed without complaint
        engine
            .feed(format!("{tag} OK LOGIN completed\r\n").as_bytes())
            .unwrap();
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn unexpected_bye_fails_everything_pending() {
        let mut engine = selected_engine();
        let (slot, cb) = capture();
        engine.noop(cb).unwrap();
        let _ = output_string(&mut engine);
        engine.feed(b"* BYE server shutting down\r\n").unwrap();
        assert_eq!(
            slot.borrow_mut().take().unwrap().outcome,
            Outcome::ConnectionLost
        );
        assert_eq!(engine.state(), ConnectionState::Logout);
        assert!(engine
            .take_unsolicited()
            .iter()
            .any(|u| matches!(u, Unsolicited::Bye(_))));
    }

    #[test]
    fn logout_rides_through_its_bye() {
        let mut engine = authed_engine();
        let (slot, cb) = capture();
        let tag = engine.logout(cb).unwrap();
        let _ = output_string(&mut engine);
        engine
            .feed(format!("* BYE see you\r\n{tag} OK LOGOUT completed\r\n").as_bytes())
            .unwrap();
        assert!(slot.borrow_mut().take().unwrap().is_ok());
        assert_eq!(engine.state(), ConnectionState::Logout);
        engine.connection_closed();
        assert_eq!(engine.state(), ConnectionState::ConnectionClosed);
    }

    #[test]
    fn starttls_flow_reissues_capability_then_logs_in() {
        let mut engine = Engine::new(Config {
            starttls: true,
            credentials: Some(Credentials {
                username: "alice".into(),
                password: "secret".into(),
            }),
            ..Config::default()
        });
        engine.connection_established();
        engine.feed(b"* OK ready\r\n").unwrap();
        assert_eq!(output_string(&mut engine), "A0001 CAPABILITY\r\n");
        engine
            .feed(b"* CAPABILITY IMAP4rev1 STARTTLS\r\nA0001 OK done\r\n")
            .unwrap();
        assert_eq!(output_string(&mut engine), "A0002 STARTTLS\r\n");
        engine.feed(b"A0002 OK begin TLS now\r\n").unwrap();
        assert!(engine
            .take_unsolicited()
            .iter()
            .any(|u| matches!(u, Unsolicited::TlsRequired)));
        // capabilities are refreshed over the secured stream
        assert_eq!(output_string(&mut engine), "A0003 CAPABILITY\r\n");
        engine
            .feed(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nA0003 OK done\r\n")
            .unwrap();
        assert_eq!(
            output_string(&mut engine),
            "A0004 LOGIN \"alice\" \"secret\"\r\n"
        );
        engine.feed(b"A0004 OK welcome\r\n").unwrap();
        assert_eq!(engine.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn duplicate_tags_are_never_emitted() {
        let mut engine = selected_engine();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let tag = engine.noop(Box::new(|_| {})).unwrap();
            assert!(seen.insert(tag.clone()));
            engine.feed(format!("{tag} OK done\r\n").as_bytes()).unwrap();
        }
    }

    #[test]
    fn unexpected_tags_tear_the_session_down() {
        let mut engine = selected_engine();
        let err = engine.feed(b"A9999 OK who asked\r\n").unwrap_err();
        assert!(matches!(err, Error::UnexpectedTag(tag) if tag == "A9999"));
        assert_eq!(engine.state(), ConnectionState::Logout);
    }
}
