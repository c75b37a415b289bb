//! The protocol automaton contract.
//!
//! An automaton is the per-connection state machine that turns framed input
//! into an [`Action`]. Handlers never touch the socket: all I/O is expressed
//! through the returned value and performed by the node's reactor. This is
//! what makes automata testable in isolation - feed `(label, chunk)`
//! sequences, assert the returned actions, no socket needed.

use std::fmt;

/// End-of-unit marker for inbound framing.
///
/// Either a literal byte sequence searched for in the accumulation buffer,
/// or a fixed byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// Match the first occurrence of this byte sequence.
    Bytes(Vec<u8>),
    /// Deliver exactly this many bytes.
    Length(usize),
}

impl Terminator {
    /// CRLF line terminator used by the SMTP family.
    pub fn crlf() -> Self {
        Terminator::Bytes(b"\r\n".to_vec())
    }

    /// Bare LF terminator used by the echo protocol.
    pub fn line() -> Self {
        Terminator::Bytes(b"\n".to_vec())
    }
}

/// Dispatch label for an automaton transition.
///
/// `Initial` is delivered once at connection creation with an empty chunk;
/// `Connect` is delivered to outbound automata once the socket is connected,
/// before any data has arrived; `Operative` carries each framed chunk;
/// `Error` is the synthesized terminal transition on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Initial,
    Connect,
    Operative,
    Error,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Label::Initial => "INITIAL",
            Label::Connect => "CONNECT",
            Label::Operative => "OPERATIVE",
            Label::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// The value an automaton returns from a transition.
///
/// Field order of application by the framed connection: `terminator`
/// replaces the current framing first, then `push` is queued for writing,
/// `close` schedules shutdown after the write queue drains, and `done`
/// tells the registry to destroy the connection record. `done` and a last
/// `push`/`close` are not mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Action {
    pub push: Option<Vec<u8>>,
    pub terminator: Option<Terminator>,
    pub close: bool,
    pub done: bool,
}

impl Action {
    /// An action that sends bytes and nothing else.
    pub fn send(data: impl Into<Vec<u8>>) -> Self {
        Action {
            push: Some(data.into()),
            ..Action::default()
        }
    }

    /// An action that neither sends nor terminates - wait for more input.
    pub fn idle() -> Self {
        Action::default()
    }

    /// An action that ends the automaton's life.
    pub fn finish() -> Self {
        Action {
            done: true,
            ..Action::default()
        }
    }

    /// Replace the connection's terminator before any push is sent.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Attach outbound bytes.
    pub fn with_push(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.push = Some(data.into());
        self
    }

    /// Request socket shutdown once the write queue drains.
    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Errors an automaton transition can fail with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomatonError {
    /// The automaton has no handler for this label. A programming error,
    /// never triggered by network input.
    UnknownState(Label),
    /// An outbound session received a reply that does not match the
    /// expected code prefix for the step just completed. Fatal to the
    /// session: multi-step dialogs are not resumable from the middle.
    UnexpectedReply {
        expected: &'static str,
        got: String,
    },
}

impl fmt::Display for AutomatonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomatonError::UnknownState(label) => {
                write!(f, "no handler for state {label}")
            }
            AutomatonError::UnexpectedReply { expected, got } => {
                write!(f, "expected reply {expected}, got {got:?}")
            }
        }
    }
}

impl std::error::Error for AutomatonError {}

/// Per-connection protocol state machine.
///
/// `next` routes a labeled transition to the matching handler. Automata
/// implement `initial` and `operative`; outbound automata that speak first
/// also implement `connect`. The default `error` handler tears the session
/// down, which is what most protocols want on transport failure.
///
/// Automata are `Send` so a whole node can be moved onto a worker thread.
pub trait Automaton: Send {
    fn next(&mut self, label: Label, chunk: &[u8]) -> Result<Action, AutomatonError> {
        match label {
            Label::Initial => self.initial(),
            Label::Connect => self.connect(),
            Label::Operative => self.operative(chunk),
            Label::Error => Ok(self.error(chunk)),
        }
    }

    /// First transition after connection creation, always with an empty
    /// chunk. The returned terminator establishes the initial framing;
    /// without one, no chunk will ever be delivered.
    fn initial(&mut self) -> Result<Action, AutomatonError>;

    /// Delivered to outbound automata once the socket reaches the
    /// connected state. Inbound automata never see it.
    fn connect(&mut self) -> Result<Action, AutomatonError> {
        Err(AutomatonError::UnknownState(Label::Connect))
    }

    /// One framed chunk: the concatenation of everything received since
    /// the previous terminator match, terminator excluded. An empty chunk
    /// is a bare terminator and is dispatched, not short-circuited.
    fn operative(&mut self, chunk: &[u8]) -> Result<Action, AutomatonError>;

    /// Transport failure. The record is reclaimed regardless of the
    /// returned action.
    fn error(&mut self, _chunk: &[u8]) -> Action {
        Action::finish().with_close()
    }
}
