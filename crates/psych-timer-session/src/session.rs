//! One operator session.

use std::sync::Arc;

use psych_timer_core::{EngineFactory, SessionEngine, StatusMessage, StatusReceiver, StatusSender};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// An operator connection's view of its engine.
///
/// Owns the sending half of the status channel the engine reports on and a
/// termination flag the registry raises when the session is displaced.
pub struct Session {
    id: SessionId,
    engine: Arc<dyn SessionEngine>,
    status: StatusSender,
    terminate: watch::Sender<bool>,
}

impl Session {
    /// Create a session with a fresh engine from `factory`.
    ///
    /// Returns the receiving half of the status channel; whoever writes to
    /// the operator connection should drain it.
    #[must_use]
    pub fn open(factory: &dyn EngineFactory) -> (Arc<Self>, StatusReceiver) {
        let (status, status_rx) = mpsc::unbounded_channel();
        let engine = factory.create(status.clone());
        let (terminate, _) = watch::channel(false);

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            engine,
            status,
            terminate,
        });
        (session, status_rx)
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Engine executing this session's runs.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn SessionEngine> {
        &self.engine
    }

    /// Queue a notice for the operator. Returns `false` if nobody is
    /// draining the status channel any more.
    pub fn notify(&self, msg: StatusMessage) -> bool {
        self.status.send(msg).is_ok()
    }

    /// Ask the connection serving this session to shut down.
    pub fn terminate(&self) {
        self.terminate.send_replace(true);
    }

    /// Whether the session has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.terminate.borrow()
    }

    /// Resolves once [`terminate`](Self::terminate) has been called.
    pub async fn terminated(&self) {
        let mut rx = self.terminate.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}
