use crate::error::{QuadError, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Unsolicited feature change pushed by the device
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub feature: String,
    pub value: Value,
}

/// Failure reported by a notification callback
///
/// Logged by the listener; never stops delivery to other callbacks.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("unexpected value type: {0}")]
    InvalidType(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("{0}")]
    Other(String),
}

/// Handle identifying one registration, used to unregister it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type CallbackResult = std::result::Result<(), CallbackError>;
type CallbackFuture = BoxFuture<'static, CallbackResult>;
type CallbackFn = dyn Fn(Value) -> CallbackFuture + Send + Sync;

/// Asynchronous handler for one feature's notifications
///
/// Callbacks run on the listener task. A callback that needs to send a
/// command to the same client must spawn it; awaiting a response from
/// inside the callback would stall the only reader of the socket.
#[derive(Clone)]
pub struct NotificationCallback(Arc<CallbackFn>);

impl NotificationCallback {
    /// Wrap an async handler
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        Self(Arc::new(move |value| -> CallbackFuture { Box::pin(handler(value)) }))
    }

    /// Wrap a synchronous handler; it runs to completion when invoked
    pub fn from_sync<F>(handler: F) -> Self
    where
        F: Fn(Value) -> CallbackResult + Send + Sync + 'static,
    {
        Self(Arc::new(move |value| -> CallbackFuture {
            let result = handler(value);
            Box::pin(async move { result })
        }))
    }

    pub(crate) fn call(&self, value: Value) -> CallbackFuture {
        (self.0)(value)
    }
}

impl std::fmt::Debug for NotificationCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NotificationCallback")
    }
}

/// Per-feature callback lists, in registration order
#[derive(Debug, Default)]
pub(crate) struct CallbackRegistry {
    next_id: u64,
    callbacks: HashMap<String, Vec<(CallbackId, NotificationCallback)>>,
}

impl CallbackRegistry {
    pub(crate) fn register(&mut self, feature: &str, callback: NotificationCallback) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        self.callbacks
            .entry(feature.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub(crate) fn unregister(&mut self, feature: &str, id: CallbackId) -> bool {
        let Some(list) = self.callbacks.get_mut(feature) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.callbacks.remove(feature);
        }
        removed
    }

    /// Snapshot of the callbacks for a feature, so they can be awaited
    /// without holding the registry lock
    pub(crate) fn callbacks_for(&self, feature: &str) -> Vec<NotificationCallback> {
        self.callbacks
            .get(feature)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self, feature: &str) -> usize {
        self.callbacks.get(feature).map_or(0, Vec::len)
    }
}

/// Invoke every callback for a feature in registration order.
///
/// Failures are logged and do not stop the remaining callbacks.
pub(crate) async fn dispatch(callbacks: Vec<NotificationCallback>, feature: &str, value: &Value) {
    for callback in callbacks {
        if let Err(e) = callback.call(value.clone()).await {
            tracing::error!("Error in notification callback for {}: {}", feature, e);
        }
    }
}

/// Receiver for every notification the device pushes
pub struct NotificationReceiver {
    rx: broadcast::Receiver<Notification>,
}

impl NotificationReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<Notification>) -> Self {
        Self { rx }
    }

    /// Receive the next notification
    ///
    /// Fails with [`QuadError::Disconnected`] once the client is dropped.
    /// Falling behind skips the missed notifications with a warning.
    pub async fn recv(&mut self) -> Result<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Ok(notification),
                Err(broadcast::error::RecvError::Closed) => return Err(QuadError::Disconnected),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Notification receiver lagged by {} messages", n);
                }
            }
        }
    }

    /// Try to receive a notification without blocking
    ///
    /// Returns `None` if no notification is waiting.
    pub fn try_recv(&mut self) -> Result<Option<Notification>> {
        loop {
            match self.rx.try_recv() {
                Ok(notification) => return Ok(Some(notification)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(QuadError::Disconnected),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Notification receiver lagged by {} messages", n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> NotificationCallback {
        let log = log.clone();
        NotificationCallback::from_sync(move |value| {
            log.lock().unwrap().push(format!("{tag}:{value}"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        registry.register("main.power", recorder(&log, "first"));
        registry.register("main.power", recorder(&log, "second"));
        registry.register("main.input", recorder(&log, "other"));

        dispatch(registry.callbacks_for("main.power"), "main.power", &json!("on")).await;

        assert_eq!(*log.lock().unwrap(), vec!["first:\"on\"", "second:\"on\""]);
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        registry.register(
            "main.volumestep",
            NotificationCallback::new(|_| async { Err(CallbackError::InvalidValue("nope".into())) }),
        );
        registry.register("main.volumestep", recorder(&log, "after"));

        dispatch(registry.callbacks_for("main.volumestep"), "main.volumestep", &json!(10)).await;
        dispatch(registry.callbacks_for("main.volumestep"), "main.volumestep", &json!(11)).await;

        assert_eq!(*log.lock().unwrap(), vec!["after:10", "after:11"]);
    }

    #[test]
    fn unregister_removes_only_the_exact_handle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::default();
        let first = registry.register("hdmi.cec", recorder(&log, "a"));
        let second = registry.register("hdmi.cec", recorder(&log, "b"));

        assert!(registry.unregister("hdmi.cec", first));
        assert!(!registry.unregister("hdmi.cec", first));
        assert!(!registry.unregister("main.power", second));
        assert_eq!(registry.len("hdmi.cec"), 1);

        assert!(registry.unregister("hdmi.cec", second));
        assert_eq!(registry.len("hdmi.cec"), 0);
    }
}
