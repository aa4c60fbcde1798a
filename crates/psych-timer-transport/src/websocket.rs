//! WebSocket gateway for the operator connection.

use std::{fmt::Display, sync::Arc};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{Sink, Stream, StreamExt};
use psych_timer_core::{EngineFactory, StatusMessage, StatusReceiver};
use psych_timer_session::{CommandSender, RegistryError, Session, SessionRegistry};

use crate::{protocol, relay::run_relay};

/// Gateway error, returned to the HTTP layer instead of upgrading.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Registry(RegistryError::Busy(_)) => StatusCode::CONFLICT,
            Self::Registry(RegistryError::Poisoned) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// WebSocket handler state.
#[derive(Clone)]
pub struct GatewayState {
    registry: Arc<SessionRegistry>,
    commands: CommandSender,
    factory: Arc<dyn EngineFactory>,
    instructions: Arc<str>,
    cancel_on_disconnect: bool,
}

impl GatewayState {
    /// Create gateway state.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        commands: CommandSender,
        factory: Arc<dyn EngineFactory>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            commands,
            factory,
            instructions: Arc::from(instructions.into()),
            cancel_on_disconnect: true,
        }
    }

    /// Whether a dropped connection detaches (and so cancels) its engine.
    #[must_use]
    pub const fn with_cancel_on_disconnect(mut self, cancel: bool) -> Self {
        self.cancel_on_disconnect = cancel;
        self
    }

    /// Session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create a session, bind it and queue the run instructions.
    ///
    /// # Errors
    /// Returns error if the registry refuses the session.
    pub fn open_session(&self) -> Result<(Arc<Session>, StatusReceiver), GatewayError> {
        let (session, status) = Session::open(self.factory.as_ref());
        self.registry.bind(Arc::clone(&session))?;
        session.notify(StatusMessage::instructions(self.instructions.as_ref()));
        Ok((session, status))
    }

    async fn disconnect(&self, session: &Session) {
        self.registry.release(session.id());
        if self.cancel_on_disconnect {
            session.engine().detach().await;
        }
    }
}

/// WebSocket upgrade handler.
///
/// The session is bound before upgrading so a refused connection gets a
/// plain HTTP error. A failed upgrade only releases that session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> Result<Response, GatewayError> {
    let (session, status) = state.open_session()?;

    let registry = Arc::clone(&state.registry);
    let session_id = session.id();
    Ok(ws
        .on_failed_upgrade(move |e| {
            tracing::error!(%session_id, "WebSocket upgrade failed: {e}");
            registry.release(session_id);
        })
        .on_upgrade(move |socket| handle_socket(socket, state, session, status)))
}

async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    session: Arc<Session>,
    status: StatusReceiver,
) {
    let (sender, receiver) = socket.split();
    run_connection(receiver, sender, state, session, status).await;
}

/// Serve one operator connection until it ends.
///
/// The relay task writes status messages; this task reads commands. When
/// reading stops for any reason the session is released and the relay is
/// stopped.
pub async fn run_connection<R, E, W>(
    receiver: R,
    sender: W,
    state: GatewayState,
    session: Arc<Session>,
    status: StatusReceiver,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    let session_id = session.id();
    tracing::info!(%session_id, "Operator connected");

    let send_task = tokio::spawn(run_relay(status, sender));

    read_commands(receiver, &session, &state.commands).await;

    state.disconnect(&session).await;
    send_task.abort();

    tracing::info!(%session_id, "Operator disconnected");
}

/// Decode commands from `receiver` and queue them in arrival order.
///
/// Stops on close, read error, malformed command or session termination.
async fn read_commands<R, E>(mut receiver: R, session: &Session, commands: &CommandSender)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let session_id = session.id();
    loop {
        let frame = tokio::select! {
            biased;
            () = session.terminated() => {
                tracing::info!(%session_id, "Session terminated, dropping connection");
                break;
            }
            frame = receiver.next() => frame,
        };

        let decoded = match frame {
            Some(Ok(Message::Text(text))) => protocol::decode_command(text.as_str()),
            Some(Ok(Message::Binary(data))) => protocol::decode_command_bytes(&data),
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(%session_id, "Connection closed by operator");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::error!(%session_id, "WebSocket error: {e}");
                break;
            }
        };

        let command = match decoded {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(%session_id, "Invalid operator message, dropping connection: {e}");
                break;
            }
        };

        tracing::debug!(%session_id, ?command, "Received command");
        if commands.send(session_id, command).is_err() {
            tracing::error!(%session_id, "Dispatcher is gone, dropping connection");
            break;
        }
    }
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(gateway_state));
/// ```
#[must_use]
pub fn create_ws_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use axum::body::Body;
    use axum::http::Request;
    use futures::channel::mpsc as fmpsc;
    use psych_timer_core::{
        ConflictPolicy,
        testing::{EngineCall, RecordingEngine, StartBehavior},
    };
    use psych_timer_engine::{RunSettings, TimerEngineFactory};
    use psych_timer_session::Dispatcher;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;

    type Inbound = Result<Message, Infallible>;

    struct Harness {
        engine: Arc<RecordingEngine>,
        calls: mpsc::UnboundedReceiver<EngineCall>,
        state: GatewayState,
    }

    fn harness(policy: ConflictPolicy) -> Harness {
        let (engine, calls) = RecordingEngine::new(StartBehavior::Hang);
        let registry = Arc::new(SessionRegistry::new(policy));
        let (commands, dispatcher) = Dispatcher::channel(Arc::clone(&registry));
        let _dispatcher = dispatcher.spawn();
        let state = GatewayState::new(registry, commands, Arc::new(engine.factory()), "Press start");
        Harness {
            engine,
            calls,
            state,
        }
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    fn frame_text(msg: Message) -> String {
        match msg {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn next_call(calls: &mut mpsc::UnboundedReceiver<EngineCall>) -> EngineCall {
        tokio::time::timeout(Duration::from_secs(1), calls.recv())
            .await
            .expect("engine call within a second")
            .expect("engine still alive")
    }

    #[tokio::test]
    async fn test_instructions_sent_first_then_status_in_order() {
        let h = harness(ConflictPolicy::Reject);
        let (session, status) = h.state.open_session().unwrap();
        let (inbound_tx, inbound) = fmpsc::unbounded::<Inbound>();
        let (outbound, mut wire) = fmpsc::unbounded::<Message>();

        let conn = tokio::spawn(run_connection(
            inbound,
            outbound,
            h.state.clone(),
            Arc::clone(&session),
            status,
        ));
        session.notify(StatusMessage::status("one"));
        session.notify(StatusMessage::status("two"));

        let mut frames = Vec::new();
        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), wire.next())
                .await
                .unwrap()
                .unwrap();
            frames.push(frame_text(frame));
        }
        assert_eq!(
            frames,
            [
                r#"{"kind":"INSTRUCTIONS","message":"Press start"}"#,
                r#"{"kind":"STATUS","message":"one"}"#,
                r#"{"kind":"STATUS","message":"two"}"#,
            ]
        );

        inbound_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), conn)
            .await
            .unwrap()
            .unwrap();
        assert!(h.state.registry().current().is_none());
    }

    #[tokio::test]
    async fn test_commands_reach_engine_in_order() {
        let mut h = harness(ConflictPolicy::Reject);
        let (session, status) = h.state.open_session().unwrap();
        let (inbound_tx, inbound) = fmpsc::unbounded::<Inbound>();
        let (outbound, _wire) = fmpsc::unbounded::<Message>();
        let conn = tokio::spawn(run_connection(inbound, outbound, h.state.clone(), session, status));

        // The run is spawned, so wait for it before queueing the rest.
        inbound_tx
            .unbounded_send(Ok(text(r#"{"subjectID":"P01","action":"START"}"#)))
            .unwrap();
        assert_eq!(next_call(&mut h.calls).await, EngineCall::Start("P01".into()));

        for frame in [
            r#"{"action":"KEY","content":"a","keyCode":65}"#,
            r#"{"action":"CONTINUE"}"#,
            r#"{"subjectID":"P01","action":"CANCEL"}"#,
        ] {
            inbound_tx.unbounded_send(Ok(text(frame))).unwrap();
        }

        assert_eq!(next_call(&mut h.calls).await, EngineCall::AddKey("a".into(), 65));
        assert_eq!(next_call(&mut h.calls).await, EngineCall::Resume);
        assert_eq!(next_call(&mut h.calls).await, EngineCall::Cancel("P01".into()));

        drop(inbound_tx);
        tokio::time::timeout(Duration::from_secs(1), conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next_call(&mut h.calls).await, EngineCall::Detach);
    }

    #[tokio::test]
    async fn test_malformed_message_drops_session() {
        let mut h = harness(ConflictPolicy::Reject);
        h.state = h.state.with_cancel_on_disconnect(false);
        let (session, status) = h.state.open_session().unwrap();
        let inbound = futures::stream::iter(vec![
            Ok::<_, Infallible>(text(r#"{"action":"KEY","content":"a","keyCode":65}"#)),
            Ok(text("{not json")),
            Ok(text(r#"{"action":"KEY","content":"b","keyCode":66}"#)),
        ]);
        let (outbound, _wire) = fmpsc::unbounded::<Message>();

        run_connection(inbound, outbound, h.state.clone(), session, status).await;
        assert!(h.state.registry().current().is_none());

        assert_eq!(next_call(&mut h.calls).await, EngineCall::AddKey("a".into(), 65));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.calls.try_recv().is_err());
        assert_eq!(h.engine.calls(), vec![EngineCall::AddKey("a".into(), 65)]);
    }

    #[tokio::test]
    async fn test_second_connection_rejected() {
        let h = harness(ConflictPolicy::Reject);
        let (first, _status) = h.state.open_session().unwrap();

        let err = h.state.open_session().unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
        assert_eq!(h.state.registry().current().unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let h = harness(ConflictPolicy::Replace);
        let (first, status) = h.state.open_session().unwrap();
        let (_inbound_tx, inbound) = fmpsc::unbounded::<Inbound>();
        let (outbound, _wire) = fmpsc::unbounded::<Message>();
        let conn = tokio::spawn(run_connection(
            inbound,
            outbound,
            h.state.clone(),
            Arc::clone(&first),
            status,
        ));

        let (second, _status) = h.state.open_session().unwrap();
        tokio::time::timeout(Duration::from_secs(1), conn)
            .await
            .unwrap()
            .unwrap();

        assert!(first.is_terminated());
        assert_eq!(h.state.registry().current().unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_replacing_session_cannot_restart_a_running_subject() {
        let dir = TempDir::new().unwrap();
        let factory = TimerEngineFactory::new(RunSettings {
            log_dir: dir.path().to_path_buf(),
            duration: Duration::from_secs(60),
            await_continue: true,
        });
        let slot = Arc::clone(factory.slot());
        let registry = Arc::new(SessionRegistry::new(ConflictPolicy::Replace));
        let (commands, dispatcher) = Dispatcher::channel(Arc::clone(&registry));
        let _dispatcher = dispatcher.spawn();
        let state = GatewayState::new(registry, commands, Arc::new(factory), "Press start")
            .with_cancel_on_disconnect(false);

        let (first, status) = state.open_session().unwrap();
        let (first_tx, inbound) = fmpsc::unbounded::<Inbound>();
        let (outbound, _first_wire) = fmpsc::unbounded::<Message>();
        let first_conn = tokio::spawn(run_connection(inbound, outbound, state.clone(), first, status));
        first_tx
            .unbounded_send(Ok(text(r#"{"subjectID":"s1","action":"START"}"#)))
            .unwrap();
        for _ in 0..200 {
            if slot.active_subject().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(slot.active_subject().as_deref(), Some("s1"));

        let (second, status) = state.open_session().unwrap();
        tokio::time::timeout(Duration::from_secs(1), first_conn)
            .await
            .unwrap()
            .unwrap();

        let (second_tx, inbound) = fmpsc::unbounded::<Inbound>();
        let (outbound, mut wire) = fmpsc::unbounded::<Message>();
        let _second_conn = tokio::spawn(run_connection(inbound, outbound, state.clone(), second, status));
        second_tx
            .unbounded_send(Ok(text(r#"{"subjectID":"s1","action":"START"}"#)))
            .unwrap();
        second_tx
            .unbounded_send(Ok(text(r#"{"action":"KEY","content":"b","keyCode":66}"#)))
            .unwrap();

        let mut frames = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(1), wire.next())
                .await
                .unwrap()
                .unwrap();
            frames.push(frame_text(frame));
        }
        assert_eq!(frames[0], r#"{"kind":"INSTRUCTIONS","message":"Press start"}"#);
        assert!(frames[1].starts_with(r#"{"kind":"ERROR""#), "{}", frames[1]);
        assert!(frames[1].contains("already active"), "{}", frames[1]);

        // The orphaned run still owns the log and nothing else has touched it.
        assert_eq!(slot.active_subject().as_deref(), Some("s1"));
        let content = std::fs::read_to_string(dir.path().join("s1.txt")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("Start Event\t"));
        assert!(!content.contains('\0'));
    }

    #[tokio::test]
    async fn test_plain_request_is_not_upgraded() {
        let h = harness(ConflictPolicy::Reject);
        let app = create_ws_router(h.state.clone());

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert!(h.state.registry().current().is_none());
    }
}
