//! Test doubles for code that drives a [`SessionEngine`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{EngineError, EngineFactory, SessionEngine, StatusSender};

/// One call observed by a [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Start(String),
    Cancel(String),
    AddKey(String, u8),
    Resume,
    Detach,
}

/// What [`RecordingEngine::start`] does after recording the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    /// Never finish, like a run waiting on a distracted operator.
    Hang,
    /// Finish immediately.
    Complete,
    /// Fail immediately.
    Fail,
}

/// Engine that records every call in order.
///
/// Calls are also pushed to an observer channel so async tests can wait
/// for them instead of sleeping.
pub struct RecordingEngine {
    behavior: StartBehavior,
    calls: Mutex<Vec<EngineCall>>,
    observer: mpsc::UnboundedSender<EngineCall>,
}

impl RecordingEngine {
    /// Create an engine and the receiver that observes its calls.
    #[must_use]
    pub fn new(behavior: StartBehavior) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineCall>) {
        let (observer, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            behavior,
            calls: Mutex::new(Vec::new()),
            observer,
        });
        (engine, rx)
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Factory that hands out this engine for every session.
    #[must_use]
    pub fn factory(self: &Arc<Self>) -> impl EngineFactory + use<> {
        let engine = Arc::clone(self);
        move |_status: StatusSender| Arc::clone(&engine) as Arc<dyn SessionEngine>
    }

    fn record(&self, call: EngineCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());
        let _ = self.observer.send(call);
    }
}

#[async_trait]
impl SessionEngine for RecordingEngine {
    async fn start(&self, subject_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Start(subject_id.to_string()));
        match self.behavior {
            StartBehavior::Hang => std::future::pending().await,
            StartBehavior::Complete => Ok(()),
            StartBehavior::Fail => Err(EngineError::AlreadyRunning(subject_id.to_string())),
        }
    }

    async fn cancel(&self, subject_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Cancel(subject_id.to_string()));
        Ok(())
    }

    async fn add_key(&self, content: &str, key_code: u8) -> Result<(), EngineError> {
        self.record(EngineCall::AddKey(content.to_string(), key_code));
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Resume);
        Ok(())
    }

    async fn detach(&self) {
        self.record(EngineCall::Detach);
    }
}
