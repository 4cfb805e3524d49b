use crate::hub::Hub;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::wire::{decode_frame, encode_frame, Frame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drives one WebSocket from upgrade to close.
pub async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, remote: Option<String>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Frame>(hub.config.queue_capacity.max(1));
    let registration = hub.connections.register(tx, remote).await;
    let conn_id = registration.conn_id.clone();
    let max_frame_bytes = hub.config.max_frame_bytes;

    let write_task = tokio::spawn(writer_loop(
        ws_sender,
        rx,
        conn_id.clone(),
        hub.config.write_timeout,
        hub.config.ping_interval,
        // Fan-out wraps inbound payloads, so outbound frames get headroom.
        max_frame_bytes.saturating_mul(4),
    ));

    let reason = loop {
        let message = tokio::select! {
            _ = registration.closed.notified() => break "dropped",
            message = ws_receiver.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break "read_error";
            }
            None => break "eof",
        };
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break "client_close";
            }
            Message::Ping(_) | Message::Pong(_) => {
                hub.connections.touch(&conn_id).await;
                continue;
            }
        };
        hub.connections.touch(&conn_id).await;
        if data.len() > max_frame_bytes {
            warn!(event = "message_too_large", conn_id = %conn_id, size = data.len());
            continue;
        }
        if hub.config.debug {
            debug!(
                event = "message_received",
                conn_id = %conn_id,
                raw = %String::from_utf8_lossy(&data)
            );
        }
        match decode_frame(&data, max_frame_bytes) {
            Ok(frame) => hub.handle_frame(&conn_id, frame).await,
            Err(err) => warn!(event = "message_invalid", conn_id = %conn_id, error = %err),
        }
    };

    hub.handle_disconnect(&conn_id, reason).await;
    let _ = write_task.await;
}

/// Drains the connection queue into the socket and keeps the link alive with
/// pings. Ends when the queue closes or a write fails.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    conn_id: String,
    write_timeout: Duration,
    ping_interval: Duration,
    max_frame_bytes: usize,
) {
    let pinging = !ping_interval.is_zero();
    let mut ticker = tokio::time::interval(if pinging {
        ping_interval
    } else {
        Duration::from_secs(3600)
    });
    ticker.tick().await;

    loop {
        let message = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => match encode_frame(&frame, max_frame_bytes) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(event = "encode_failed", conn_id = %conn_id, kind = %frame.event, error = %err);
                        continue;
                    }
                },
                None => break,
            },
            _ = ticker.tick(), if pinging => Message::Ping(Vec::new()),
        };
        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
}
