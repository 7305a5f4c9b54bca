//! Stepped volume changes.
//!
//! Large volume jumps sound abrupt on the device, so a transition walks one
//! step at a time with a pause in between. The target is shown right away
//! while the steps run in the background.

use crate::client::QuadClient;
use crate::connection::lock;
use crate::error::{QuadError, Result};
use crate::state;
use crate::subscription::{CallbackError, CallbackId, NotificationCallback};
use crate::types::{FEATURE_VOLUME, VOLUME_RANGE};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Control {
    generation: u64,
    in_progress: bool,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

struct Inner {
    control: Mutex<Control>,
    // Serializes starting transitions
    start: tokio::sync::Mutex<()>,
    display: watch::Sender<Option<u8>>,
}

/// Volume controller that steps towards a target
///
/// Several controllers may wrap the same client; each runs at most one
/// transition at a time. While a transition runs, volume notifications from
/// the device are not shown, since they only report the intermediate steps.
pub struct VolumeTransition {
    client: QuadClient,
    inner: Arc<Inner>,
    callback_id: CallbackId,
}

impl VolumeTransition {
    pub fn new(client: QuadClient) -> Self {
        let (display, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            control: Mutex::new(Control::default()),
            start: tokio::sync::Mutex::new(()),
            display,
        });

        let callback_id = client.register_notification_callback(
            FEATURE_VOLUME,
            display_callback(Arc::downgrade(&inner)),
        );

        Self {
            client,
            inner,
            callback_id,
        }
    }

    /// Volume currently shown: the target of the running transition, or the
    /// last volume the device reported
    pub fn displayed_volume(&self) -> Option<u8> {
        *self.inner.display.borrow()
    }

    /// Watch the displayed volume
    pub fn subscribe_display(&self) -> watch::Receiver<Option<u8>> {
        self.inner.display.subscribe()
    }

    pub fn is_transitioning(&self) -> bool {
        lock(&self.inner.control).in_progress
    }

    /// Move to `target` using the client's step interval
    ///
    /// Starts from the displayed volume, falling back to the cached one.
    pub async fn set_volume(&self, target: u8) -> Result<bool> {
        let current = self
            .displayed_volume()
            .unwrap_or_else(|| self.client.state().volume);
        self.set_volume_with_transition(current, target, self.client.volume_step_interval())
            .await
    }

    /// Move from `current` to `target`, one step every `interval`
    ///
    /// Any running transition is cancelled first. With a zero interval, or
    /// nothing to do, the target is sent directly and the result is whether
    /// the device acknowledged it. Otherwise the steps run in the background
    /// and this returns `true` once they are started.
    pub async fn set_volume_with_transition(
        &self,
        current: u8,
        target: u8,
        interval: Duration,
    ) -> Result<bool> {
        check_volume(current)?;
        check_volume(target)?;

        let _start = self.inner.start.lock().await;
        self.cancel_running().await;

        if interval.is_zero() || current == target {
            let acked = self.client.set_volume(target).await?;
            if acked {
                self.inner.display.send_replace(Some(target));
            }
            return Ok(acked);
        }

        self.inner.display.send_replace(Some(target));

        let mut control = lock(&self.inner.control);
        control.generation += 1;
        control.in_progress = true;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_steps(
            self.client.clone(),
            self.inner.clone(),
            control.generation,
            cancel.clone(),
            current,
            target,
            interval,
        ));
        control.task = Some((cancel, handle));

        tracing::debug!(
            "Volume transition {} -> {} started (generation {})",
            current,
            target,
            control.generation
        );
        Ok(true)
    }

    /// Stop the running transition, if any, and wait for it to end
    pub async fn cancel(&self) {
        let _start = self.inner.start.lock().await;
        self.cancel_running().await;
    }

    async fn cancel_running(&self) {
        let task = lock(&self.inner.control).task.take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Volume transition ended abnormally: {}", e);
            }
        }
        lock(&self.inner.control).in_progress = false;
    }

    /// Cancel the running transition and stop following volume notifications
    pub async fn shutdown(self) {
        self.cancel().await;
    }
}

impl Drop for VolumeTransition {
    fn drop(&mut self) {
        if let Some((cancel, _)) = lock(&self.inner.control).task.take() {
            cancel.cancel();
        }
        self.client
            .unregister_notification_callback(FEATURE_VOLUME, self.callback_id);
    }
}

fn check_volume(volume: u8) -> Result<()> {
    let value = i64::from(volume);
    if VOLUME_RANGE.contains(&value) {
        return Ok(());
    }
    Err(QuadError::OutOfRange {
        feature: FEATURE_VOLUME,
        value,
        min: *VOLUME_RANGE.start(),
        max: *VOLUME_RANGE.end(),
    })
}

fn display_callback(inner: Weak<Inner>) -> NotificationCallback {
    NotificationCallback::from_sync(move |value| {
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };
        if lock(&inner.control).in_progress {
            tracing::trace!("Ignoring volume notification {} during transition", value);
            return Ok(());
        }

        let volume = state::parse_level(&value)
            .filter(|v| VOLUME_RANGE.contains(v))
            .ok_or_else(|| CallbackError::InvalidValue(value.to_string()))?;
        inner.display.send_replace(Some(volume as u8));
        Ok(())
    })
}

async fn run_steps(
    client: QuadClient,
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
    current: u8,
    target: u8,
    interval: Duration,
) {
    let mut level = current;

    while level != target {
        if lock(&inner.control).generation != generation {
            break;
        }
        level = if target > level { level + 1 } else { level - 1 };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = client.set_volume(level) => sent,
        };
        match sent {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Volume step to {} not acknowledged, stopping transition", level);
                break;
            }
            Err(e) => {
                tracing::warn!("Volume step to {} failed, stopping transition: {}", level, e);
                break;
            }
        }
    }

    let mut control = lock(&inner.control);
    if control.generation == generation {
        control.in_progress = false;
        control.task = None;
    }
}
