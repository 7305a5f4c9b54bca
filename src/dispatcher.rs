//! Notification listener: the single reader of the device socket.
//!
//! Every inbound message updates the feature cache first. Results are then
//! handed to the command waiting on their id, and notifications go to the
//! registered callbacks followed by broadcast subscribers.

use crate::codec::FrameDecoder;
use crate::connection::{lock, write, Shared};
use crate::protocol::{Message, MessageKind};
use crate::subscription::{self, Notification};
use serde_json::Value;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 1024;

pub(crate) async fn run(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    backoff: Duration,
) {
    tracing::info!("Starting notification listener");

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    while shared.connected.load(Ordering::SeqCst) {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::info!("Device closed the connection");
                shared.mark_closed();
                break;
            }
            Ok(n) => {
                tracing::trace!("Received: {}", String::from_utf8_lossy(&buf[..n]));
                for value in decoder.decode(&buf[..n]) {
                    process(&shared, value).await;
                }
            }
            Err(e) if is_closed(&e) => {
                tracing::warn!("Connection closed: {}", e);
                shared.mark_closed();
                break;
            }
            Err(e) => {
                tracing::error!("Error in notification listener: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
            }
        }
    }

    shared.listening.store(false, Ordering::SeqCst);
    tracing::info!("Notification listener stopped");
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Route one decoded value
async fn process(shared: &Shared, value: Value) {
    let message: Message = match serde_json::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Ignoring unrecognized message: {}", e);
            return;
        }
    };

    tracing::debug!(
        "Received {:?} id={:?} feature={:?} value={:?}",
        message.kind,
        message.id,
        message.feature,
        message.value
    );

    if let (Some(feature), Some(value)) = (&message.feature, &message.value) {
        write(&shared.state).update(feature, value);
    }

    match message.kind {
        MessageKind::Result => {
            let Some(id) = message.id else {
                tracing::debug!("Result without id ignored");
                return;
            };
            if !shared.resolve(id, message) {
                tracing::debug!("No command waiting for result id {}", id);
            }
        }
        MessageKind::Notify => {
            let Some(feature) = message.feature else {
                return;
            };
            let value = message.value.unwrap_or(Value::Null);

            let callbacks = lock(&shared.callbacks).callbacks_for(&feature);
            subscription::dispatch(callbacks, &feature, &value).await;

            // No receivers is not an error
            let _ = shared.notify_tx.send(Notification { feature, value });
        }
        MessageKind::Unknown => {}
    }
}
