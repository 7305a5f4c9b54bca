use crate::codec;
use crate::config::ClientConfig;
use crate::dispatcher;
use crate::error::{QuadError, Result};
use crate::protocol::{Command, CommandIds, Message};
use crate::state::FeatureState;
use crate::subscription::{CallbackId, CallbackRegistry, Notification, NotificationCallback};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Commands queued for the writer task before senders wait
const OUTBOUND_QUEUE: usize = 32;

/// State shared between callers and the connection's background tasks
pub(crate) struct Shared {
    pub(crate) connected: AtomicBool,
    pub(crate) listening: AtomicBool,
    /// Commands waiting for their result, keyed by command id
    pub(crate) pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    pub(crate) state: RwLock<FeatureState>,
    pub(crate) callbacks: Mutex<CallbackRegistry>,
    pub(crate) notify_tx: broadcast::Sender<Notification>,
}

impl Shared {
    fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(100);
        Self {
            connected: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            state: RwLock::new(FeatureState::default()),
            callbacks: Mutex::new(CallbackRegistry::default()),
            notify_tx,
        }
    }

    /// Hand a result to the command waiting for it
    pub(crate) fn resolve(&self, id: u32, message: Message) -> bool {
        match lock(&self.pending).remove(&id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Fail every pending command. Dropping the senders wakes each waiter
    /// with a disconnection error.
    pub(crate) fn fail_pending(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.len();
        pending.clear();
        count
    }

    /// Register a command waiting for its result. Refused once the
    /// connection is closed, since nothing would ever fail the entry.
    fn register(&self, id: u32, tx: oneshot::Sender<Message>) -> bool {
        let mut pending = lock(&self.pending);
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        pending.insert(id, tx);
        true
    }

    /// Record that the socket is gone; the next command reconnects
    pub(crate) fn mark_closed(&self) {
        let failed = {
            // Cleared under the pending lock so `register` cannot slip in between
            let mut pending = lock(&self.pending);
            self.connected.store(false, Ordering::SeqCst);
            let count = pending.len();
            pending.clear();
            count
        };
        if failed > 0 {
            tracing::warn!("Connection lost with {} commands pending", failed);
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A serialized command on its way to the writer task
struct Outgoing {
    line: Vec<u8>,
    written: oneshot::Sender<io::Result<()>>,
}

/// Send-side state; its lock is the critical section of `send_command`
struct Outbound {
    ids: CommandIds,
    tx: Option<mpsc::Sender<Outgoing>>,
}

/// Background tasks and socket halves of the current TCP session
#[derive(Default)]
struct Session {
    reader: Option<OwnedReadHalf>,
    writer_task: Option<JoinHandle<()>>,
    listener: Option<Listener>,
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Removes a pending entry however the command ends
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

/// Low-level TCP connection handler
///
/// Owns one socket at a time. A writer task serializes outbound lines and a
/// single listener task is the only reader of the socket; results reach the
/// waiting caller through the pending table.
pub struct Connection {
    host: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Session>,
    outbound: tokio::sync::Mutex<Outbound>,
}

impl Connection {
    /// Create a disconnected handler for `host`
    pub fn new(host: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            host: host.into(),
            config,
            shared: Arc::new(Shared::new()),
            session: tokio::sync::Mutex::new(Session::default()),
            outbound: tokio::sync::Mutex::new(Outbound {
                ids: CommandIds::new(),
                tx: None,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    /// Number of commands still waiting for a result
    pub fn pending_commands(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Open the socket unless already connected
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.connect_locked(&mut session).await
    }

    async fn connect_locked(&self, session: &mut Session) -> Result<()> {
        if self.is_connected() && session.writer_task.is_some() {
            return Ok(());
        }

        // Anything left from a session that dropped on its own
        self.teardown(session).await;

        let addr = format!("{}:{}", self.host, self.config.port);
        tracing::debug!("Connecting to {}", addr);

        let stream = match timeout(
            self.config.connect_timeout(),
            TcpStream::connect((self.host.as_str(), self.config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                tracing::error!("Failed to connect to {}: {}", addr, source);
                return Err(QuadError::Connect { addr, source });
            }
            Err(_) => {
                tracing::error!("Timed out connecting to {}", addr);
                return Err(QuadError::ConnectTimeout {
                    addr,
                    timeout: self.config.connect_timeout(),
                });
            }
        };

        // The device accepts at once but ignores commands for a moment
        sleep(self.config.stabilize_delay()).await;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        session.writer_task = Some(tokio::spawn(write_loop(
            write_half,
            rx,
            self.shared.clone(),
        )));
        session.reader = Some(read_half);
        self.outbound.lock().await.tx = Some(tx);
        self.shared.connected.store(true, Ordering::SeqCst);

        tracing::info!("Connected to Bravia Quad at {}", addr);
        Ok(())
    }

    /// Close the socket and fail every pending command
    ///
    /// Returns once the listener and writer tasks have stopped. Safe to call
    /// when not connected.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.teardown(&mut session).await;
        tracing::info!("Disconnected from Bravia Quad");
    }

    async fn teardown(&self, session: &mut Session) {
        if let Some(listener) = session.listener.take() {
            listener.cancel.cancel();
            if let Err(e) = listener.handle.await {
                tracing::warn!("Notification listener ended abnormally: {}", e);
            }
        }
        session.reader = None;

        // Dropping the sender lets the writer drain and close its half
        drop(self.outbound.lock().await.tx.take());
        if let Some(writer) = session.writer_task.take() {
            if let Err(e) = writer.await {
                tracing::warn!("Writer task ended abnormally: {}", e);
            }
        }

        self.shared.listening.store(false, Ordering::SeqCst);
        self.shared.fail_pending();
    }

    /// Start the notification listener if it is not already running
    pub async fn listen(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        if let Some(listener) = &session.listener {
            if !listener.handle.is_finished() {
                return Ok(());
            }
        }

        if !self.is_connected() || session.reader.is_none() {
            // The previous listener consumed the socket; start over
            self.shared.connected.store(false, Ordering::SeqCst);
            self.connect_locked(&mut session).await?;
        }

        let reader = session.reader.take().ok_or(QuadError::NotConnected)?;
        let cancel = CancellationToken::new();
        // The task clears this when it exits
        self.shared.listening.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(dispatcher::run(
            reader,
            self.shared.clone(),
            cancel.clone(),
            self.config.read_error_backoff(),
        ));
        session.listener = Some(Listener { cancel, handle });
        Ok(())
    }

    /// Send a command and wait for its result
    ///
    /// Connects and starts the listener when needed. The command id is
    /// always replaced with a fresh one. Returns `Ok(None)` when the device
    /// does not answer within the response timeout.
    pub async fn send_command(&self, mut command: Command) -> Result<Option<Message>> {
        self.connect().await?;
        self.listen().await?;

        let (response_rx, _guard) = {
            let mut outbound = self.outbound.lock().await;
            let tx = outbound.tx.clone().ok_or(QuadError::NotConnected)?;

            command.id = outbound.ids.next_id();
            let line = codec::encode_command(&command)?;

            let (response_tx, response_rx) = oneshot::channel();
            if !self.shared.register(command.id, response_tx) {
                return Err(QuadError::Disconnected);
            }
            let guard = PendingGuard {
                shared: &self.shared,
                id: command.id,
            };

            tracing::debug!(
                "Sending command: {}",
                String::from_utf8_lossy(&line).trim_end()
            );

            let (written_tx, written_rx) = oneshot::channel();
            let outgoing = Outgoing {
                line,
                written: written_tx,
            };
            if tx.send(outgoing).await.is_err() {
                return Err(QuadError::Write(writer_gone()));
            }
            match written_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(QuadError::Write(e)),
                Err(_) => return Err(QuadError::Write(writer_gone())),
            }

            (response_rx, guard)
        };

        match timeout(self.config.response_timeout(), response_rx).await {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(_)) => Err(QuadError::Disconnected),
            Err(_) => {
                tracing::warn!(
                    "Timeout waiting for response to command: {:?} {} (id {})",
                    command.kind,
                    command.feature,
                    command.id
                );
                Ok(None)
            }
        }
    }

    /// Snapshot of the feature cache
    pub fn state(&self) -> FeatureState {
        read(&self.shared.state).clone()
    }

    /// Apply a confirmed value to the feature cache
    pub(crate) fn update_state(&self, feature: &str, value: &serde_json::Value) -> bool {
        write(&self.shared.state).update(feature, value)
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut FeatureState) -> R) -> R {
        f(&mut write(&self.shared.state))
    }

    pub fn register_callback(&self, feature: &str, callback: NotificationCallback) -> CallbackId {
        lock(&self.shared.callbacks).register(feature, callback)
    }

    pub fn unregister_callback(&self, feature: &str, id: CallbackId) -> bool {
        lock(&self.shared.callbacks).unregister(feature, id)
    }

    pub fn callback_count(&self, feature: &str) -> usize {
        lock(&self.shared.callbacks).len(feature)
    }

    /// Subscribe to every notification
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.notify_tx.subscribe()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Tasks cannot be awaited here; stop the listener and let the writer
        // finish once its channel closes.
        if let Some(listener) = &self.session.get_mut().listener {
            listener.cancel.cancel();
        }
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection writer stopped")
}

/// Write queued lines in order until the channel closes or a write fails
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
) {
    while let Some(outgoing) = rx.recv().await {
        let result = write_line(&mut writer, &outgoing.line).await;
        let failed = match &result {
            Ok(()) => false,
            Err(e) => {
                tracing::error!("Error sending command: {}", e);
                true
            }
        };
        let _ = outgoing.written.send(result);
        if failed {
            shared.mark_closed();
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Error closing socket: {}", e);
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &[u8]) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}
