//! Single-slot session registry.
//!
//! At most one operator session is bound at a time. What happens when a
//! second operator connects is decided by the [`ConflictPolicy`].

use std::sync::{Arc, PoisonError, RwLock};

use psych_timer_core::ConflictPolicy;

use crate::session::{Session, SessionId};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Another operator session is already active: {0}")]
    Busy(SessionId),
    #[error("Session registry lock poisoned")]
    Poisoned,
}

/// Holds the current session.
pub struct SessionRegistry {
    slot: RwLock<Option<Arc<Session>>>,
    policy: ConflictPolicy,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub const fn new(policy: ConflictPolicy) -> Self {
        Self {
            slot: RwLock::new(None),
            policy,
        }
    }

    /// Conflict policy applied by [`bind`](Self::bind).
    #[must_use]
    pub const fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Make `session` the current session.
    ///
    /// Under [`ConflictPolicy::Replace`] the displaced session is
    /// terminated and returned.
    ///
    /// # Errors
    /// Returns [`RegistryError::Busy`] under [`ConflictPolicy::Reject`] when a
    /// session is already bound.
    pub fn bind(&self, session: Arc<Session>) -> Result<Option<Arc<Session>>, RegistryError> {
        let mut slot = self.slot.write().map_err(|_| RegistryError::Poisoned)?;

        if let Some(current) = slot.as_ref() {
            if self.policy == ConflictPolicy::Reject {
                tracing::warn!(
                    current = %current.id(),
                    rejected = %session.id(),
                    "Operator session already active, rejecting connection"
                );
                return Err(RegistryError::Busy(current.id()));
            }
        }

        let id = session.id();
        let displaced = slot.replace(session);
        drop(slot);

        if let Some(old) = &displaced {
            tracing::info!(session_id = %id, displaced = %old.id(), "Replacing operator session");
            old.terminate();
        } else {
            tracing::info!(session_id = %id, "Operator session bound");
        }
        Ok(displaced)
    }

    /// Clear the slot if it still holds session `id`.
    ///
    /// Returns whether the slot was cleared.
    pub fn release(&self, id: SessionId) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|s| s.id() == id) {
            *slot = None;
            tracing::info!(session_id = %id, "Operator session released");
            true
        } else {
            false
        }
    }

    /// The current session, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Session>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Session `id`, only while it is the bound session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.current().filter(|s| s.id() == id)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use psych_timer_core::testing::{RecordingEngine, StartBehavior};
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn session() -> Arc<Session> {
        let (engine, _calls) = RecordingEngine::new(StartBehavior::Complete);
        Session::open(&engine.factory()).0
    }

    #[test]
    fn test_bind_and_release() {
        let registry = SessionRegistry::default();
        assert!(registry.current().is_none());

        let first = session();
        assert!(assert_ok!(registry.bind(Arc::clone(&first))).is_none());
        assert_eq!(registry.current().unwrap().id(), first.id());
        assert!(registry.get(first.id()).is_some());

        assert!(registry.release(first.id()));
        assert!(registry.current().is_none());
        assert!(!registry.release(first.id()));
    }

    #[test]
    fn test_reject_keeps_current_session() {
        let registry = SessionRegistry::new(ConflictPolicy::Reject);
        let first = session();
        let second = session();
        registry.bind(Arc::clone(&first)).unwrap();

        let err = assert_err!(registry.bind(Arc::clone(&second)));
        assert!(matches!(err, RegistryError::Busy(id) if id == first.id()));
        assert_eq!(registry.current().unwrap().id(), first.id());
        assert!(!first.is_terminated());
    }

    #[test]
    fn test_replace_terminates_displaced_session() {
        let registry = SessionRegistry::new(ConflictPolicy::Replace);
        let first = session();
        let second = session();
        registry.bind(Arc::clone(&first)).unwrap();

        let displaced = registry.bind(Arc::clone(&second)).unwrap().unwrap();
        assert_eq!(displaced.id(), first.id());
        assert!(first.is_terminated());
        assert_eq!(registry.current().unwrap().id(), second.id());
    }

    #[test]
    fn test_stale_release_leaves_new_session_bound() {
        let registry = SessionRegistry::new(ConflictPolicy::Replace);
        let first = session();
        let second = session();
        registry.bind(Arc::clone(&first)).unwrap();
        registry.bind(Arc::clone(&second)).unwrap();

        assert!(!registry.release(first.id()));
        assert!(registry.get(first.id()).is_none());
        assert_eq!(registry.current().unwrap().id(), second.id());
    }
}
