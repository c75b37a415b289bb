//! protonode: a framework for terminator-delimited text protocol nodes.
//!
//! Many simultaneous connections are multiplexed inside one non-blocking
//! event loop. Each connection pairs a [`node::FramedConnection`] (byte
//! framing and socket mechanics) with an [`Automaton`] (protocol state
//! machine); the [`Node`] routes readiness events between them through a
//! registry keyed by connection identity.
//!
//! Reference automata for SMTP, LMTP, HTTP and a line echo protocol live
//! in [`protocols`].

pub mod automaton;
pub mod config;
pub mod node;
pub mod protocols;

pub use automaton::{Action, Automaton, AutomatonError, Label, Terminator};
pub use node::{ConnectionId, Node, NodeError, NodeOptions, StopHandle};
