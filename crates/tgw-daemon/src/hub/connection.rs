//! Drives one [`Session`] over an axum WebSocket.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use tgw_schemas::ServerMessage;

use super::{EventFanoutHub, Flow, Outbound, Scope};

pub async fn serve_socket(socket: WebSocket, hub: EventFanoutHub, scope: Scope) {
    let (mut session, mut out_rx) = hub.session(scope);
    let Some(mut events) = session.take_events() else {
        return;
    };
    let (mut sink, mut stream) = socket.split();

    let mut flow = session.open();
    while flow == Flow::Continue {
        tokio::select! {
            Some(out) = out_rx.recv() => match out {
                Outbound::Message(message) => {
                    if write_message(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                Outbound::Ping => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        warn!(scope = ?session.scope(), "liveness probe failed; closing");
                        break;
                    }
                }
            },
            Some(event) = events.recv() => {
                flow = session.handle_event(event);
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => flow = session.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "socket read failed");
                    break;
                }
            },
        }
    }

    session.teardown();

    // Whatever the session queued before closing (a 404, a thingRemoved).
    while let Ok(out) = out_rx.try_recv() {
        if let Outbound::Message(message) = out {
            if write_message(&mut sink, &message).await.is_err() {
                return;
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn write_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(message_type = message.message_type(), error = %err, "dropping unserializable message");
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await
}
