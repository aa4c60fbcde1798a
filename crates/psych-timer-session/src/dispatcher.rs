//! Action dispatcher.
//!
//! The only consumer of operator commands. Commands are handled one at a
//! time in the order they were queued. START is spawned so a long run never
//! holds up CANCEL, KEY or CONTINUE; the other actions are awaited in place.

use std::sync::Arc;

use psych_timer_core::{Action, CommandMessage, StatusMessage};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{SessionRegistry, session::SessionId};

/// Dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatcher is no longer running")]
    Closed,
}

/// A command tagged with the session whose connection received it.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session whose connection received the command.
    pub session_id: SessionId,
    pub command: CommandMessage,
}

/// Producer handle for the command channel.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl CommandSender {
    /// Queue `command` on behalf of session `session_id`.
    ///
    /// # Errors
    /// Returns error if the dispatcher has stopped.
    pub fn send(&self, session_id: SessionId, command: CommandMessage) -> Result<(), DispatchError> {
        self.tx
            .send(Envelope {
                session_id,
                command,
            })
            .map_err(|_| DispatchError::Closed)
    }
}

/// Drains the command channel against the registry's current session.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Dispatcher {
    /// Create the command channel and its dispatcher.
    #[must_use]
    pub fn channel(registry: Arc<SessionRegistry>) -> (CommandSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CommandSender { tx }, Self { registry, rx })
    }

    /// Run on a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Handle commands until every [`CommandSender`] is dropped.
    pub async fn run(mut self) {
        tracing::debug!("Dispatcher starting");
        while let Some(envelope) = self.rx.recv().await {
            self.dispatch(envelope).await;
        }
        tracing::debug!("Dispatcher stopped");
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope {
            session_id,
            command,
        } = envelope;
        tracing::debug!(%session_id, ?command, "Handling command");

        // Commands from a connection that has since gone away are dropped.
        let Some(session) = self.registry.get(session_id) else {
            tracing::warn!(%session_id, action = %command.action, "No bound session, dropping command");
            return;
        };
        let engine = Arc::clone(session.engine());

        let result = match command.action {
            Action::Start => {
                let subject_id = command.subject_id;
                tracing::info!(%session_id, %subject_id, "Starting run");
                tokio::spawn(async move {
                    if let Err(e) = engine.start(&subject_id).await {
                        tracing::warn!(%session_id, %subject_id, "Run failed: {e}");
                        session.notify(StatusMessage::error(format!(
                            "Run for {subject_id} failed: {e}"
                        )));
                    }
                });
                return;
            }
            Action::Cancel => {
                tracing::info!(%session_id, subject_id = %command.subject_id, "Cancelling run");
                engine.cancel(&command.subject_id).await
            }
            Action::Key => {
                tracing::debug!(
                    %session_id,
                    subject_id = %command.subject_id,
                    content = %command.content,
                    key_code = command.key_code,
                    "Received key"
                );
                engine.add_key(&command.content, command.key_code).await
            }
            Action::Continue => engine.resume().await,
            Action::Unknown(raw) => {
                tracing::debug!(%session_id, "Unknown action from operator: {raw:?}");
                return;
            }
        };

        if let Err(e) = result {
            tracing::warn!(%session_id, "Command failed: {e}");
            session.notify(StatusMessage::error(e.to_string()));
        }
    }
}
