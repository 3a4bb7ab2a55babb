//! Registry of active sessions.
//!
//! Owned by one event loop (readiness backend) or shared behind a single
//! mutex (completion backend); it does no locking of its own. Double add
//! and double remove are no-ops, never errors.

use crate::runtime::session::{Session, SessionId};
use std::collections::HashMap;

pub struct SessionRegistry<S> {
    sessions: HashMap<SessionId, Session<S>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Insert an active session.
    ///
    /// Returns `false` and leaves the registry untouched if the id is
    /// already present; the rejected session is dropped.
    pub fn add(&mut self, session: Session<S>) -> bool {
        debug_assert!(session.is_active(), "only active sessions are registered");
        if self.sessions.contains_key(&session.id) {
            return false;
        }
        self.sessions.insert(session.id, session);
        true
    }

    /// Remove a session and move it to the closing state.
    ///
    /// Only the first call for an id returns the session; the caller
    /// releases its handle. Later calls return `None`.
    pub fn remove(&mut self, id: SessionId) -> Option<Session<S>> {
        let mut session = self.sessions.remove(&id)?;
        session.begin_close();
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session<S>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<S>> {
        self.sessions.get_mut(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of every registered session, in no particular order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session::SessionState;

    fn active(id: u64) -> Session<()> {
        let mut s = Session::new(SessionId(id), "127.0.0.1:40000".parse().unwrap(), ());
        s.activate();
        s
    }

    #[test]
    fn test_add_and_remove() {
        let mut registry = SessionRegistry::new();
        assert!(registry.add(active(1)));
        assert!(registry.add(active(2)));
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(SessionId(1)).unwrap();
        assert_eq!(removed.state(), SessionState::Closing);
        assert!(!registry.contains(SessionId(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_add_is_noop() {
        let mut registry = SessionRegistry::new();
        assert!(registry.add(active(1)));
        assert!(!registry.add(active(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_remove_is_noop() {
        let mut registry = SessionRegistry::new();
        registry.add(active(1));
        assert!(registry.remove(SessionId(1)).is_some());
        assert!(registry.remove(SessionId(1)).is_none());
        assert!(registry.remove(SessionId(99)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids() {
        let mut registry = SessionRegistry::new();
        registry.add(active(3));
        registry.add(active(5));
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![SessionId(3), SessionId(5)]);
    }
}
