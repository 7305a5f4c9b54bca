#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]
//! Mock Bravia Quad for integration testing
//!
//! Speaks the JSON-over-TCP control protocol on a random local port, records
//! every command it receives and can push notifications or drop connections
//! on request.

use bravia_quad::{ClientConfig, QuadClient};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// A command as the device received it
#[derive(Debug, Clone)]
pub struct Received {
    pub command: Value,
    pub at: Instant,
}

impl Received {
    pub fn kind(&self) -> &str {
        self.command["type"].as_str().unwrap_or_default()
    }

    pub fn feature(&self) -> &str {
        self.command["feature"].as_str().unwrap_or_default()
    }
}

/// Mock device state and behavior switches
#[derive(Debug, Clone)]
pub struct MockQuadState {
    pub features: HashMap<String, Value>,
    /// `set` requests answered with an error instead of ACK
    pub rejected: Vec<(String, Value)>,
    /// Read commands but never answer
    pub silent: bool,
    /// Terminate each frame with a newline; otherwise frames are concatenated
    pub newline: bool,
    /// Deliver each reply in two writes, cutting a frame in half
    pub split_writes: bool,
    /// Push a notify after every accepted `set`, like the real device
    pub notify_on_set: bool,
}

impl Default for MockQuadState {
    fn default() -> Self {
        let features = [
            ("main.power", json!("off")),
            ("main.volumestep", json!(50)),
            ("main.input", json!("tv")),
            ("main.rearvolumestep", json!(0)),
            ("main.bassstep", json!(1)),
            ("audio.voiceenhancer", json!("upoff")),
            ("audio.soundfield", json!("off")),
            ("audio.nightmode", json!("off")),
            ("hdmi.cec", json!("on")),
            ("system.autostandby", json!("on")),
            ("audio.drangecomp", json!("auto")),
            ("audio.aav", json!("off")),
            ("bluetooth.mode", json!("Off")),
        ]
        .into_iter()
        .map(|(feature, value)| (feature.to_string(), value))
        .collect();

        Self {
            features,
            rejected: Vec::new(),
            silent: false,
            newline: true,
            split_writes: false,
            notify_on_set: true,
        }
    }
}

#[derive(Debug, Clone)]
enum Control {
    Push(Value),
    Close,
}

struct Shared {
    state: RwLock<MockQuadState>,
    received: RwLock<Vec<Received>>,
    connections: AtomicUsize,
    accepted: AtomicUsize,
    control: broadcast::Sender<Control>,
}

/// Mock Bravia Quad server
pub struct MockQuad {
    port: u16,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockQuad {
    /// Start a mock device on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (control, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            state: RwLock::new(MockQuadState::default()),
            received: RwLock::new(Vec::new()),
            connections: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            control,
        });

        let shared_clone = shared.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                // Subscribe before spawning so no push is missed
                let control = shared_clone.control.subscribe();
                shared_clone.connections.fetch_add(1, Ordering::SeqCst);
                shared_clone.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = shared_clone.clone();
                tokio::spawn(async move {
                    handle_connection(stream, shared.clone(), control).await;
                    shared.connections.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            port,
            shared,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client configuration pointing at this device, with short timeouts
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            port: self.port,
            connect_timeout_ms: 1_000,
            response_timeout_ms: 1_000,
            stabilize_delay_ms: 10,
            read_error_backoff_ms: 50,
            ..ClientConfig::default()
        }
    }

    pub fn client(&self) -> QuadClient {
        QuadClient::with_config("127.0.0.1", "Test Quad", self.config()).unwrap()
    }

    pub fn client_with(&self, configure: impl FnOnce(&mut ClientConfig)) -> QuadClient {
        let mut config = self.config();
        configure(&mut config);
        QuadClient::with_config("127.0.0.1", "Test Quad", config).unwrap()
    }

    pub async fn set_feature(&self, feature: &str, value: Value) {
        self.shared
            .state
            .write()
            .await
            .features
            .insert(feature.to_string(), value);
    }

    pub async fn feature(&self, feature: &str) -> Option<Value> {
        self.shared.state.read().await.features.get(feature).cloned()
    }

    pub async fn set_silent(&self, silent: bool) {
        self.shared.state.write().await.silent = silent;
    }

    pub async fn set_newline(&self, newline: bool) {
        self.shared.state.write().await.newline = newline;
    }

    pub async fn set_split_writes(&self, split: bool) {
        self.shared.state.write().await.split_writes = split;
    }

    pub async fn set_notify_on_set(&self, notify: bool) {
        self.shared.state.write().await.notify_on_set = notify;
    }

    /// Answer `set feature=value` with an error
    pub async fn reject(&self, feature: &str, value: Value) {
        self.shared
            .state
            .write()
            .await
            .rejected
            .push((feature.to_string(), value));
    }

    /// Send a notification to every connected client
    pub async fn push_notify(&self, feature: &str, value: Value) {
        self.wait_for_connection().await;
        let frame = json!({"type": "notify", "feature": feature, "value": value});
        self.shared.control.send(Control::Push(frame)).unwrap();
    }

    /// Close every open connection from the device side
    pub async fn drop_connections(&self) {
        let _ = self.shared.control.send(Control::Close);
    }

    /// Open connections right now
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Connections accepted since start
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub async fn received(&self) -> Vec<Received> {
        self.shared.received.read().await.clone()
    }

    /// Values of every `set` received for a feature, in arrival order
    pub async fn sets_for(&self, feature: &str) -> Vec<(Value, Instant)> {
        self.received()
            .await
            .into_iter()
            .filter(|r| r.kind() == "set" && r.feature() == feature)
            .map(|r| (r.command["value"].clone(), r.at))
            .collect()
    }

    /// Wait until at least `count` commands have arrived
    pub async fn wait_for_commands(&self, count: usize) -> Vec<Received> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let received = self.received().await;
            if received.len() >= count {
                return received;
            }
            assert!(
                Instant::now() < deadline,
                "expected {} commands, got {}",
                count,
                received.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_connection(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.connections() == 0 {
            assert!(Instant::now() < deadline, "no client connected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the mock server
    pub async fn stop(self) {
        self.drop_connections().await;
        self.handle.abort();
    }
}

/// Handle a single TCP connection
async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut control: broadcast::Receiver<Control>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let frames = process_command(&line, &shared).await;
                    if !frames.is_empty() && write_frames(&mut writer, &frames, &shared).await.is_err() {
                        break;
                    }
                }
                _ => break, // Connection closed
            },
            control = control.recv() => match control {
                Ok(Control::Push(frame)) => {
                    if write_frames(&mut writer, &[frame], &shared).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Close) | Err(_) => break,
            },
        }
    }
}

async fn write_frames(
    writer: &mut OwnedWriteHalf,
    frames: &[Value],
    shared: &Shared,
) -> std::io::Result<()> {
    let (newline, split) = {
        let state = shared.state.read().await;
        (state.newline, state.split_writes)
    };

    let mut bytes = Vec::new();
    for frame in frames {
        bytes.extend_from_slice(frame.to_string().as_bytes());
        if newline {
            bytes.push(b'\n');
        }
    }

    if split && bytes.len() > 1 {
        let (first, second) = bytes.split_at(bytes.len() / 2);
        writer.write_all(first).await?;
        writer.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(second).await?;
    } else {
        writer.write_all(&bytes).await?;
    }
    writer.flush().await
}

/// Process one command line and return the frames to send back
async fn process_command(line: &str, shared: &Shared) -> Vec<Value> {
    let Ok(command) = serde_json::from_str::<Value>(line.trim()) else {
        return Vec::new();
    };
    shared.received.write().await.push(Received {
        command: command.clone(),
        at: Instant::now(),
    });

    let mut state = shared.state.write().await;
    if state.silent {
        return Vec::new();
    }

    let id = command["id"].clone();
    let feature = command["feature"].as_str().unwrap_or_default().to_string();

    match command["type"].as_str() {
        Some("get") => match state.features.get(&feature) {
            Some(value) => vec![json!({
                "id": id,
                "type": "result",
                "feature": feature,
                "value": value,
            })],
            None => vec![json!({"id": id, "type": "result", "value": "ERROR"})],
        },
        Some("set") => {
            let value = command["value"].clone();
            if state
                .rejected
                .iter()
                .any(|(f, v)| *f == feature && *v == value)
            {
                return vec![json!({"id": id, "type": "result", "value": "ERROR"})];
            }

            state.features.insert(feature.clone(), value.clone());
            let mut frames = vec![json!({"id": id, "type": "result", "value": "ACK"})];
            if state.notify_on_set {
                frames.push(json!({"type": "notify", "feature": feature, "value": value}));
            }
            frames
        }
        _ => Vec::new(),
    }
}
