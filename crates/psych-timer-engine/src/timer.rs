//! Timed run engine.
//!
//! Runs one subject at a time across every engine built by the same
//! factory. A run opens `<log_dir>/<subject>.txt`,
//! optionally waits for the operator to press Continue, then lasts for a
//! fixed duration unless cancelled. Key presses received while a run is
//! active are appended to its event log.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use psych_timer_core::{
    EngineError, EngineFactory, EventLog, EventLogError, SessionEngine, StatusMessage,
    StatusSender, config::RunConfig,
};
use tokio::sync::{Notify, watch};

/// Logged once the operator releases the run.
pub const RUN_BEGIN: &str = "Run Begin";
/// Logged when the run reaches its full duration.
pub const RUN_END: &str = "Run End";
/// Logged for every key press.
pub const KEY_EVENT: &str = "KEY";
/// Logged when the run observes a cancellation request.
pub const CANCEL_EVENT: &str = "CANCEL";

/// Per-run settings shared by every engine the factory builds.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Directory that receives `<subject>.txt`.
    pub log_dir: PathBuf,
    /// How long a released run lasts.
    pub duration: Duration,
    /// Hold each run until CONTINUE.
    pub await_continue: bool,
}

impl RunSettings {
    fn log_path(&self, subject_id: &str) -> PathBuf {
        let file_stem: String = subject_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.log_dir.join(format!("{file_stem}.txt"))
    }
}

impl From<&RunConfig> for RunSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            duration: Duration::from_millis(config.run_duration_ms),
            await_continue: config.await_continue,
        }
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Stop and release signals for one run.
struct RunControl {
    cancel: watch::Sender<bool>,
    resume: Notify,
    failure: Mutex<Option<EventLogError>>,
}

impl RunControl {
    fn new() -> (Arc<Self>, watch::Receiver<bool>) {
        let (cancel, cancelled) = watch::channel(false);
        let control = Arc::new(Self {
            cancel,
            resume: Notify::new(),
            failure: Mutex::new(None),
        });
        (control, cancelled)
    }

    /// Stop the run and make it end with `error`.
    fn fail(&self, error: EventLogError) {
        if let Ok(mut failure) = self.failure.lock() {
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.cancel.send_replace(true);
    }

    fn take_failure(&self) -> Option<EventLogError> {
        self.failure.lock().ok().and_then(|mut failure| failure.take())
    }
}

struct ActiveRun {
    owner: u64,
    subject_id: String,
    log: EventLog,
    control: Arc<RunControl>,
}

/// The single run slot shared by every engine one factory builds.
///
/// At most one run exists per slot no matter how many sessions have come
/// and gone, so an orphaned run keeps its subject's log to itself until it
/// ends.
#[derive(Default)]
pub struct RunSlot {
    active: Mutex<Option<ActiveRun>>,
}

impl RunSlot {
    fn lock(&self) -> Result<MutexGuard<'_, Option<ActiveRun>>, EngineError> {
        self.active
            .lock()
            .map_err(|_| EngineError::Internal("run slot lock poisoned".to_string()))
    }

    /// Subject of the run occupying the slot, if any.
    #[must_use]
    pub fn active_subject(&self) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|active| active.as_ref().map(|run| run.subject_id.clone()))
    }
}

impl std::fmt::Debug for RunSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSlot")
            .field("active_subject", &self.active_subject())
            .finish()
    }
}

/// Engine that executes one timed run at a time.
///
/// Commands only reach the run this engine started. A run started by
/// another engine on the same slot is visible only as a refused START.
pub struct TimerEngine {
    id: u64,
    settings: RunSettings,
    status: StatusSender,
    slot: Arc<RunSlot>,
}

impl TimerEngine {
    /// Create an engine with a run slot of its own.
    #[must_use]
    pub fn new(settings: RunSettings, status: StatusSender) -> Self {
        Self::with_slot(settings, status, Arc::default())
    }

    /// Create an engine reporting to `status` that runs in `slot`.
    #[must_use]
    pub fn with_slot(settings: RunSettings, status: StatusSender, slot: Arc<RunSlot>) -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            status,
            slot,
        }
    }

    /// Subject of the in-flight run in this engine's slot, if any.
    #[must_use]
    pub fn active_subject(&self) -> Option<String> {
        self.slot.active_subject()
    }

    fn own<'a>(&self, active: Option<&'a ActiveRun>) -> Option<&'a ActiveRun> {
        active.filter(|run| run.owner == self.id)
    }

    fn notify(&self, msg: StatusMessage) {
        if self.status.send(msg).is_err() {
            tracing::debug!("Status channel closed, dropping notice");
        }
    }

    fn begin(
        &self,
        subject_id: &str,
    ) -> Result<(EventLog, Arc<RunControl>, watch::Receiver<bool>), EngineError> {
        if subject_id.trim().is_empty() {
            return Err(EngineError::InvalidSubject(subject_id.to_string()));
        }

        let mut active = self.slot.lock()?;
        if let Some(run) = active.as_ref() {
            return Err(EngineError::AlreadyRunning(run.subject_id.clone()));
        }

        let path = self.settings.log_path(subject_id);
        let log = match EventLog::open(&path) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(subject_id, path = %path.display(), "Failed to open event log: {e}");
                return Err(e.into());
            }
        };

        let (control, cancelled) = RunControl::new();
        *active = Some(ActiveRun {
            owner: self.id,
            subject_id: subject_id.to_string(),
            log: log.clone(),
            control: Arc::clone(&control),
        });

        tracing::info!(subject_id, path = %path.display(), "Run started");
        Ok((log, control, cancelled))
    }

    async fn drive(
        &self,
        subject_id: &str,
        log: &EventLog,
        control: &RunControl,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<Outcome, EngineError> {
        if self.settings.await_continue {
            self.notify(StatusMessage::status(format!(
                "Ready: {subject_id}. Press Continue to begin."
            )));
            tokio::select! {
                () = control.resume.notified() => {}
                () = wait_cancelled(cancelled) => return stopped(control),
            }
        }

        log.append(RUN_BEGIN, subject_id)?;
        self.notify(StatusMessage::status(format!("Running: {subject_id}")));

        tokio::select! {
            () = tokio::time::sleep(self.settings.duration) => Ok(Outcome::Completed),
            () = wait_cancelled(cancelled) => stopped(control),
        }
    }

    fn finish(
        &self,
        subject_id: &str,
        log: &EventLog,
        outcome: Result<Outcome, EngineError>,
    ) -> Result<(), EngineError> {
        let summary = outcome.and_then(|outcome| {
            let summary = match outcome {
                Outcome::Completed => {
                    log.append(RUN_END, subject_id)?;
                    format!("Run complete: {subject_id}")
                }
                Outcome::Cancelled => {
                    log.append(CANCEL_EVENT, "")?;
                    format!("Run cancelled: {subject_id}")
                }
            };
            Ok(summary)
        });

        // Key presses append under this lock, so none can land after close.
        if let Ok(mut active) = self.slot.active.lock() {
            if self.own(active.as_ref()).is_some() {
                *active = None;
            }
        }
        let closed = log.close().map_err(EngineError::from);

        match summary.and_then(|summary| closed.map(|()| summary)) {
            Ok(summary) => {
                tracing::info!(subject_id, "{summary}");
                self.notify(StatusMessage::status(summary));
                Ok(())
            }
            Err(e) => {
                tracing::error!(subject_id, path = %log.path().display(), "Run failed: {e}");
                Err(e)
            }
        }
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    if cancelled.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn stopped(control: &RunControl) -> Result<Outcome, EngineError> {
    control
        .take_failure()
        .map_or(Ok(Outcome::Cancelled), |e| Err(e.into()))
}

#[async_trait]
impl SessionEngine for TimerEngine {
    async fn start(&self, subject_id: &str) -> Result<(), EngineError> {
        let (log, control, mut cancelled) = self.begin(subject_id)?;
        let outcome = self.drive(subject_id, &log, &control, &mut cancelled).await;
        self.finish(subject_id, &log, outcome)
    }

    async fn cancel(&self, subject_id: &str) -> Result<(), EngineError> {
        let active = self.slot.lock()?;
        match self.own(active.as_ref()) {
            Some(run) if subject_id.is_empty() || run.subject_id == subject_id => {
                tracing::info!(subject_id = %run.subject_id, "Cancellation requested");
                run.control.cancel.send_replace(true);
            }
            Some(run) => {
                tracing::debug!(
                    subject_id,
                    active = %run.subject_id,
                    "Cancel for a subject that is not running"
                );
            }
            None => tracing::debug!(subject_id, "Cancel with no active run"),
        }
        Ok(())
    }

    async fn add_key(&self, content: &str, key_code: u8) -> Result<(), EngineError> {
        let active = self.slot.lock()?;
        let Some(run) = self.own(active.as_ref()) else {
            tracing::debug!(content, key_code, "Key with no active run");
            return Ok(());
        };

        match run.log.append(KEY_EVENT, content) {
            Ok(_) => {
                tracing::debug!(subject_id = %run.subject_id, content, key_code, "Key recorded");
                Ok(())
            }
            Err(e) => {
                tracing::error!(subject_id = %run.subject_id, "Failed to record key, stopping run: {e}");
                run.control.fail(e);
                Err(EngineError::RunStopped(run.subject_id.clone()))
            }
        }
    }

    async fn resume(&self) -> Result<(), EngineError> {
        let active = self.slot.lock()?;
        if let Some(run) = self.own(active.as_ref()) {
            run.control.resume.notify_one();
        } else {
            tracing::debug!("Continue with no active run");
        }
        Ok(())
    }

    async fn detach(&self) {
        if let Err(e) = self.cancel("").await {
            tracing::warn!("Failed to cancel run on detach: {e}");
        }
    }
}

/// Builds a [`TimerEngine`] per operator session.
///
/// Every engine it builds shares one [`RunSlot`], so the whole process runs
/// at most one subject at a time.
#[derive(Debug, Clone)]
pub struct TimerEngineFactory {
    settings: RunSettings,
    slot: Arc<RunSlot>,
}

impl TimerEngineFactory {
    /// Create a factory with a fresh run slot.
    #[must_use]
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            slot: Arc::default(),
        }
    }

    /// The run slot shared by this factory's engines.
    #[must_use]
    pub const fn slot(&self) -> &Arc<RunSlot> {
        &self.slot
    }
}

impl EngineFactory for TimerEngineFactory {
    fn create(&self, status: StatusSender) -> Arc<dyn SessionEngine> {
        Arc::new(TimerEngine::with_slot(
            self.settings.clone(),
            status,
            Arc::clone(&self.slot),
        ))
    }
}
