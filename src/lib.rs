//! Rust library for controlling Sony Bravia Theatre Quad home theater systems
//!
//! This library provides an async API for the device's local TCP control
//! protocol (port 33336). It supports:
//!
//! - Power, volume, input, rear and bass level control
//! - Sound settings: voice enhancer, sound field, night mode, DRC, auto volume
//! - System settings: HDMI CEC, auto standby
//! - Subwoofer detection and Bluetooth pairing
//! - A cache of the last known value of every feature
//! - Real-time notifications through callbacks or a broadcast receiver
//! - Stepped volume transitions
//!
//! # Quick Start
//!
//! ```no_run
//! use bravia_quad::{NotificationCallback, QuadClient, FEATURE_VOLUME};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = QuadClient::new("192.168.1.50", "Living Room");
//!
//!     if !client.test_connection().await? {
//!         eprintln!("Device did not answer");
//!         return Ok(());
//!     }
//!
//!     let state = client.fetch_all_states().await;
//!     println!("power={} volume={}", state.power, state.volume);
//!
//!     client.register_notification_callback(
//!         FEATURE_VOLUME,
//!         NotificationCallback::from_sync(|value| {
//!             println!("Volume changed: {}", value);
//!             Ok(())
//!         }),
//!     );
//!     client.listen_for_notifications().await?;
//!
//!     client.set_volume(20).await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Volume Transitions
//!
//! ```no_run
//! use bravia_quad::{QuadClient, VolumeTransition};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = QuadClient::new("192.168.1.50", "Living Room");
//!     let volume = VolumeTransition::new(client.clone());
//!
//!     // Steps 20, 21, ... 30 with 150ms between steps
//!     volume
//!         .set_volume_with_transition(20, 30, Duration::from_millis(150))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: Typed feature API on top of one connection
//! - **Connection**: Socket lifecycle and command/response correlation
//! - **Dispatcher**: The listener task that reads the socket and routes messages
//! - **Codec**: Framing of the device's JSON stream
//! - **State**: Feature cache
//! - **Transition**: Stepped volume changes

mod client;
mod codec;
mod config;
mod connection;
mod dispatcher;
mod error;
mod protocol;
mod state;
mod subscription;
mod transition;
mod types;

// Public exports
pub use client::QuadClient;
pub use codec::{decode_stream, encode_command, FrameDecoder};
pub use config::{ClientConfig, MAX_VOLUME_STEP_INTERVAL_MS};
pub use connection::Connection;
pub use error::{QuadError, Result};
pub use protocol::{Command, CommandKind, Message, MessageKind, COMMAND_ID_INITIAL, COMMAND_ID_MAX};
pub use state::FeatureState;
pub use subscription::{
    CallbackError, CallbackId, Notification, NotificationCallback, NotificationReceiver,
};
pub use transition::VolumeTransition;
pub use types::*;
