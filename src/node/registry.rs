//! Connection registry: identity allocation and automaton dispatch.
//!
//! The registry owns the canonical identity-to-automaton map. Framed
//! connections hold only their own identity and reach their automaton
//! through [`Registry::dispatch`], never through captured references.

use crate::automaton::{Action, Automaton, AutomatonError, Label};
use std::collections::HashMap;
use std::fmt;

/// Opaque connection identity. Monotonically increasing, unique for the
/// process lifetime, never reused: reuse would risk misattributing a
/// straggling in-flight action to a new, unrelated connection.
pub type ConnectionId = u64;

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One live connection's registry entry.
pub struct Record {
    pub automaton: Box<dyn Automaton>,
    pub direction: Direction,
}

/// Identity allocator plus the identity-to-record map.
///
/// Listener identities are drawn from the same counter as connection
/// identities, so reactor tokens never collide across the two tables.
#[derive(Default)]
pub struct Registry {
    records: HashMap<ConnectionId, Record>,
    next_id: ConnectionId,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Allocate a fresh identity.
    pub fn allocate(&mut self) -> ConnectionId {
        self.next_id += 1;
        self.next_id
    }

    /// Store a record under an identity obtained from [`Registry::allocate`].
    pub fn insert(&mut self, id: ConnectionId, automaton: Box<dyn Automaton>, direction: Direction) {
        self.records.insert(id, Record { automaton, direction });
    }

    /// Route one transition to the keyed automaton.
    ///
    /// If the returned action is `done`, the record is removed before the
    /// action is handed back, so a reentrant dispatch in the same turn can
    /// never see a stale automaton. A missing record is a contract
    /// violation: a framed connection must never outlive its entry.
    pub fn dispatch(
        &mut self,
        id: ConnectionId,
        label: Label,
        chunk: &[u8],
    ) -> Result<Action, NodeError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(NodeError::UnknownConnection(id))?;

        let action = record
            .automaton
            .next(label, chunk)
            .map_err(|e| NodeError::Automaton(id, e))?;

        if action.done {
            self.records.remove(&id);
        }
        Ok(action)
    }

    pub fn direction(&self, id: ConnectionId) -> Option<Direction> {
        self.records.get(&id).map(|r| r.direction)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Record> {
        self.records.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Errors surfaced by the node core.
#[derive(Debug)]
pub enum NodeError {
    /// Dispatch to an identity with no live record. A defect, not a
    /// recoverable runtime condition.
    UnknownConnection(ConnectionId),
    /// The automaton for this connection failed its transition.
    Automaton(ConnectionId, AutomatonError),
    /// Reactor or socket failure.
    Io(std::io::Error),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::UnknownConnection(id) => {
                write!(f, "dispatch to unknown connection {id}")
            }
            NodeError::Automaton(id, e) => write!(f, "automaton error on connection {id}: {e}"),
            NodeError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Automaton(_, e) => Some(e),
            NodeError::Io(e) => Some(e),
            NodeError::UnknownConnection(_) => None,
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::Action;

    struct OneShot;

    impl Automaton for OneShot {
        fn initial(&mut self) -> Result<Action, AutomatonError> {
            Ok(Action::idle())
        }

        fn operative(&mut self, _chunk: &[u8]) -> Result<Action, AutomatonError> {
            Ok(Action::finish().with_push(*b"bye").with_close())
        }
    }

    #[test]
    fn test_identities_are_monotonic_and_never_reused() {
        let mut registry = Registry::new();
        let a = registry.allocate();
        let b = registry.allocate();
        assert!(b > a);

        registry.insert(a, Box::new(OneShot), Direction::Inbound);
        registry.remove(a);
        let c = registry.allocate();
        assert!(c > b);
    }

    #[test]
    fn test_done_removes_record_before_relay() {
        let mut registry = Registry::new();
        let id = registry.allocate();
        registry.insert(id, Box::new(OneShot), Direction::Inbound);

        let action = registry.dispatch(id, Label::Operative, b"QUIT").unwrap();
        assert!(action.done);
        assert_eq!(action.push.as_deref(), Some(&b"bye"[..]));
        // The record is already gone when the action is relayed.
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_dispatch_unknown_connection_fails() {
        let mut registry = Registry::new();
        match registry.dispatch(99, Label::Operative, b"") {
            Err(NodeError::UnknownConnection(99)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_automaton_error_carries_identity() {
        struct Broken;
        impl Automaton for Broken {
            fn initial(&mut self) -> Result<Action, AutomatonError> {
                Ok(Action::idle())
            }
            fn operative(&mut self, _chunk: &[u8]) -> Result<Action, AutomatonError> {
                Err(AutomatonError::UnexpectedReply {
                    expected: "250",
                    got: "451 busy".to_string(),
                })
            }
        }

        let mut registry = Registry::new();
        let id = registry.allocate();
        registry.insert(id, Box::new(Broken), Direction::Outbound);

        match registry.dispatch(id, Label::Operative, b"451 busy") {
            Err(NodeError::Automaton(got_id, AutomatonError::UnexpectedReply { .. })) => {
                assert_eq!(got_id, id);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        // The record survives an automaton error; the node decides teardown.
        assert!(registry.contains(id));
    }
}
