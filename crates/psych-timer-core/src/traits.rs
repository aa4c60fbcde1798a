//! Core traits for session engines.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{EventLogError, StatusSender};

/// Engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A run is already active for subject {0}")]
    AlreadyRunning(String),
    #[error("Invalid subject ID: {0:?}")]
    InvalidSubject(String),
    #[error("Event log error: {0}")]
    Log(#[from] EventLogError),
    #[error("Run for subject {0} stopped after an event log failure")]
    RunStopped(String),
    #[error("Engine error: {0}")]
    Internal(String),
}

/// Engine that executes trial runs for one operator session.
///
/// The control plane treats a run as opaque: it starts it, cancels it,
/// feeds key presses into it and releases it when paused. Engines report
/// progress through the status channel they were created with and write
/// their own event log.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Execute one complete run for `subject_id`.
    ///
    /// Resolves only once the run is over, which may take an unbounded,
    /// operator-paced amount of time. Callers that must stay responsive
    /// should spawn it.
    async fn start(&self, subject_id: &str) -> Result<(), EngineError>;

    /// Ask the in-flight run for `subject_id` to stop.
    ///
    /// Cancellation is cooperative: this returns once the request has been
    /// accepted, not when the run has finished. A no-op when idle.
    async fn cancel(&self, subject_id: &str) -> Result<(), EngineError>;

    /// Record a timestamped key press into the running trial.
    async fn add_key(&self, content: &str, key_code: u8) -> Result<(), EngineError>;

    /// Release a run paused awaiting operator confirmation.
    async fn resume(&self) -> Result<(), EngineError>;

    /// Called once when the operator connection that owns this engine goes
    /// away.
    async fn detach(&self) {}
}

/// Builds one engine per operator session.
pub trait EngineFactory: Send + Sync {
    /// Create an engine that reports to `status`.
    fn create(&self, status: StatusSender) -> Arc<dyn SessionEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(StatusSender) -> Arc<dyn SessionEngine> + Send + Sync,
{
    fn create(&self, status: StatusSender) -> Arc<dyn SessionEngine> {
        self(status)
    }
}
