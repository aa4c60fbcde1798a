//! Status relay.
//!
//! The single writer to an operator connection. WebSocket sinks are not
//! safe for concurrent writers, so everything the session wants to tell the
//! operator goes through one status channel drained here in order.

use std::fmt::Display;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use psych_timer_core::StatusReceiver;

use crate::protocol;

/// Forward status messages to `sink` until the channel closes or a write
/// fails.
///
/// A failed write closes the sink and ends the relay; nothing is retried.
pub async fn run_relay<W>(mut status: StatusReceiver, mut sink: W)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(msg) = status.recv().await {
        tracing::debug!(?msg, "Relaying status message");
        let json = match protocol::encode_status(&msg) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize status message: {e}");
                continue;
            }
        };

        let written = sink.send(Message::Text(json.into())).await;
        if let Err(e) = written {
            tracing::error!("Failed to write status message, closing connection: {e}");
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!("Failed to close connection: {e}");
    }
}
