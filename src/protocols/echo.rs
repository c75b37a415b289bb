//! Echo protocol automata.
//!
//! Line-framed: the server echoes each received line back with a trailing
//! newline; an empty line ends the session. The client sends a fixed
//! sequence of lines, one per echo received, then an empty line.

use crate::automaton::{Action, Automaton, AutomatonError, Terminator};
use std::collections::VecDeque;

/// Inbound echo automaton.
#[derive(Debug, Default)]
pub struct EchoServer;

impl EchoServer {
    pub fn new() -> Self {
        EchoServer
    }
}

impl Automaton for EchoServer {
    fn initial(&mut self) -> Result<Action, AutomatonError> {
        Ok(Action::idle().with_terminator(Terminator::line()))
    }

    fn operative(&mut self, chunk: &[u8]) -> Result<Action, AutomatonError> {
        if chunk.is_empty() {
            return Ok(Action::finish().with_close());
        }
        let mut out = chunk.to_vec();
        out.push(b'\n');
        Ok(Action::send(out))
    }
}

/// Outbound echo automaton: sends a caller-supplied line sequence, one per
/// reply, then an empty line to end the session.
#[derive(Debug)]
pub struct EchoClient {
    lines: VecDeque<String>,
}

impl EchoClient {
    pub fn new(lines: impl IntoIterator<Item = String>) -> Self {
        EchoClient {
            lines: lines.into_iter().collect(),
        }
    }

    fn step(&mut self) -> Action {
        match self.lines.pop_front() {
            Some(line) => Action::send(format!("{line}\n")),
            None => Action::finish().with_push(*b"\n").with_close(),
        }
    }
}

impl Automaton for EchoClient {
    fn initial(&mut self) -> Result<Action, AutomatonError> {
        Ok(Action::idle().with_terminator(Terminator::line()))
    }

    fn connect(&mut self) -> Result<Action, AutomatonError> {
        Ok(self.step())
    }

    fn operative(&mut self, _chunk: &[u8]) -> Result<Action, AutomatonError> {
        Ok(self.step())
    }
}
