use crate::config::{self, ClientConfig};
use crate::connection::Connection;
use crate::error::{QuadError, Result};
use crate::protocol::{Command, Message};
use crate::state::{self, FeatureState};
use crate::subscription::{CallbackId, NotificationCallback, NotificationReceiver};
use crate::types::{
    self, Feature, ToggleFeature, BASS_LEVEL_RANGE, BASS_LEVEL_RANGE_NO_SUB, BLUETOOTH_MODE_OFF,
    BLUETOOTH_MODE_RX, DRC_MODES, FEATURE_AAV, FEATURE_AUTO_STANDBY, FEATURE_BASS_LEVEL,
    FEATURE_BLUETOOTH_MODE, FEATURE_DRC, FEATURE_HDMI_CEC, FEATURE_INPUT, FEATURE_NIGHT_MODE,
    FEATURE_POWER, FEATURE_REAR_LEVEL, FEATURE_SOUND_FIELD, FEATURE_VOICE_ENHANCER, FEATURE_VOLUME,
    INPUT_BLUETOOTH, REAR_LEVEL_RANGE, VOLUME_RANGE,
};
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Features refreshed by [`QuadClient::fetch_all_states`], in request order
const FETCHED_FEATURES: [Feature; 12] = [
    FEATURE_POWER,
    FEATURE_VOLUME,
    FEATURE_INPUT,
    FEATURE_REAR_LEVEL,
    FEATURE_BASS_LEVEL,
    FEATURE_VOICE_ENHANCER,
    FEATURE_SOUND_FIELD,
    FEATURE_NIGHT_MODE,
    FEATURE_HDMI_CEC,
    FEATURE_AUTO_STANDBY,
    FEATURE_DRC,
    FEATURE_AAV,
];

/// Bass level sent to find out whether a subwoofer is attached. Only the
/// subwoofer range accepts it.
const SUBWOOFER_PROBE_LEVEL: i64 = -1;

/// Pause between the two `bluetooth.mode` writes that start pairing
const PAIRING_MODE_DELAY: Duration = Duration::from_millis(500);

/// Client for a Sony Bravia Theatre Quad
///
/// Cheap to clone; clones share one connection, one feature cache and one
/// callback registry. The connection opens lazily on the first command.
///
/// # Example
///
/// ```no_run
/// use bravia_quad::QuadClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = QuadClient::new("192.168.1.50", "Living Room");
///     client.set_power(true).await?;
///     client.set_volume(25).await?;
///     println!("input: {}", client.get_input().await?);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct QuadClient {
    name: Arc<str>,
    connection: Arc<Connection>,
    step_interval_ms: Arc<AtomicU64>,
}

impl std::fmt::Debug for QuadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadClient")
            .field("name", &self.name)
            .field("host", &self.connection.host())
            .field("connected", &self.connection.is_connected())
            .finish()
    }
}

impl QuadClient {
    /// Create a client with the default configuration
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self::build(host.into(), name.into(), ClientConfig::default())
    }

    /// Create a client with a custom configuration
    pub fn with_config(
        host: impl Into<String>,
        name: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(host.into(), name.into(), config))
    }

    fn build(host: String, name: String, config: ClientConfig) -> Self {
        let step_interval_ms = Arc::new(AtomicU64::new(config.volume_step_interval_ms));
        Self {
            name: name.into(),
            connection: Arc::new(Connection::new(host, config)),
            step_interval_ms,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        self.connection.host()
    }

    /// Open the connection if it is not open yet
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Close the connection; pending commands fail with [`QuadError::Disconnected`]
    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    /// Check that the device answers a power query
    ///
    /// Fails only if the connection cannot be opened. A device that is
    /// reachable but answers badly, or not at all, yields `false`.
    pub async fn test_connection(&self) -> Result<bool> {
        self.connection.connect().await?;

        match self.connection.send_command(Command::get(FEATURE_POWER)).await {
            Ok(response) => Ok(response.is_some_and(|r| r.is_result_for(FEATURE_POWER))),
            Err(e) if e.is_connection_error() => {
                tracing::error!("Connection test failed: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a raw command and wait for its result
    ///
    /// Any id on `command` is replaced. `Ok(None)` means the device did not
    /// answer in time.
    pub async fn send_command(&self, command: Command) -> Result<Option<Message>> {
        self.connection.send_command(command).await
    }

    /// Start the notification listener; does nothing if it is running
    pub async fn listen_for_notifications(&self) -> Result<()> {
        self.connection.listen().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_listening(&self) -> bool {
        self.connection.is_listening()
    }

    /// Commands still waiting for a result
    pub fn pending_commands(&self) -> usize {
        self.connection.pending_commands()
    }

    /// Snapshot of every cached feature value
    pub fn state(&self) -> FeatureState {
        self.connection.state()
    }

    // Generic feature access

    /// Query any feature and return the value the device reported
    ///
    /// Returns `None` if the device did not answer in time or answered
    /// without a value.
    pub async fn get_feature(&self, feature: &str) -> Result<Option<Value>> {
        let response = self.connection.send_command(Command::get(feature)).await?;
        Ok(response
            .filter(|r| r.is_result_for(feature))
            .and_then(|r| r.value))
    }

    /// Set any feature; returns whether the device acknowledged it
    ///
    /// An acknowledged value is written to the cache straight away.
    pub async fn set_feature(&self, feature: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        let response = self
            .connection
            .send_command(Command::set(feature, value.clone()))
            .await?;

        let acked = response.as_ref().is_some_and(Message::is_ack);
        if acked {
            self.connection.update_state(feature, &value);
        } else {
            tracing::debug!("{} = {} not acknowledged: {:?}", feature, value, response);
        }
        Ok(acked)
    }

    async fn refresh(&self, feature: &str) -> Result<FeatureState> {
        self.connection.send_command(Command::get(feature)).await?;
        Ok(self.connection.state())
    }

    async fn set_toggle(&self, toggle: ToggleFeature, enabled: bool) -> Result<bool> {
        self.set_feature(toggle.feature, toggle.value(enabled)).await
    }

    async fn get_toggle(&self, toggle: ToggleFeature) -> Result<bool> {
        Ok(self.refresh(toggle.feature).await?.is_on(toggle))
    }

    async fn set_level(
        &self,
        feature: Feature,
        range: RangeInclusive<i64>,
        level: i64,
    ) -> Result<bool> {
        check_range(feature, &range, level)?;
        self.set_feature(feature, level).await
    }

    // Power

    pub async fn set_power(&self, on: bool) -> Result<bool> {
        self.set_toggle(types::POWER, on).await
    }

    /// Power state as the device reports it (`on` or `off`)
    pub async fn get_power(&self) -> Result<String> {
        Ok(self.refresh(FEATURE_POWER).await?.power)
    }

    // Volume

    /// Set the volume, 0 to 100
    pub async fn set_volume(&self, volume: u8) -> Result<bool> {
        self.set_level(FEATURE_VOLUME, VOLUME_RANGE, volume.into()).await
    }

    pub async fn get_volume(&self) -> Result<u8> {
        Ok(self.refresh(FEATURE_VOLUME).await?.volume)
    }

    // Input

    /// Select the input, e.g. `tv`, `hdmi1`, `spotify` or `bluetooth`
    pub async fn set_input(&self, input: &str) -> Result<bool> {
        self.set_feature(FEATURE_INPUT, input).await
    }

    pub async fn get_input(&self) -> Result<String> {
        Ok(self.refresh(FEATURE_INPUT).await?.input)
    }

    // Levels

    /// Set the rear speaker level, -10 to 10
    pub async fn set_rear_level(&self, level: i8) -> Result<bool> {
        self.set_level(FEATURE_REAR_LEVEL, REAR_LEVEL_RANGE, level.into())
            .await
    }

    pub async fn get_rear_level(&self) -> Result<i8> {
        Ok(self.refresh(FEATURE_REAR_LEVEL).await?.rear_level)
    }

    /// Set the bass level
    ///
    /// -10 to 10 with a subwoofer. Once detection has found no subwoofer the
    /// device only takes 0 (MIN), 1 (MID) or 2 (MAX).
    pub async fn set_bass_level(&self, level: i8) -> Result<bool> {
        let range = self.connection.state().bass_level_range();
        self.set_level(FEATURE_BASS_LEVEL, range, level.into()).await
    }

    pub async fn get_bass_level(&self) -> Result<i8> {
        Ok(self.refresh(FEATURE_BASS_LEVEL).await?.bass_level)
    }

    // Sound settings

    pub async fn set_voice_enhancer(&self, enabled: bool) -> Result<bool> {
        self.set_toggle(types::VOICE_ENHANCER, enabled).await
    }

    pub async fn get_voice_enhancer(&self) -> Result<bool> {
        self.get_toggle(types::VOICE_ENHANCER).await
    }

    pub async fn set_sound_field(&self, enabled: bool) -> Result<bool> {
        self.set_toggle(types::SOUND_FIELD, enabled).await
    }

    pub async fn get_sound_field(&self) -> Result<bool> {
        self.get_toggle(types::SOUND_FIELD).await
    }

    pub async fn set_night_mode(&self, enabled: bool) -> Result<bool> {
        self.set_toggle(types::NIGHT_MODE, enabled).await
    }

    pub async fn get_night_mode(&self) -> Result<bool> {
        self.get_toggle(types::NIGHT_MODE).await
    }

    pub async fn set_advanced_auto_volume(&self, enabled: bool) -> Result<bool> {
        self.set_toggle(types::ADVANCED_AUTO_VOLUME, enabled).await
    }

    pub async fn get_advanced_auto_volume(&self) -> Result<bool> {
        self.get_toggle(types::ADVANCED_AUTO_VOLUME).await
    }

    /// Set dynamic range compression: `on`, `off` or `auto`
    pub async fn set_drc(&self, mode: &str) -> Result<bool> {
        if !DRC_MODES.contains(&mode) {
            return Err(QuadError::InvalidValue {
                feature: FEATURE_DRC.to_string(),
                value: mode.to_string(),
            });
        }
        self.set_feature(FEATURE_DRC, mode).await
    }

    pub async fn get_drc(&self) -> Result<String> {
        Ok(self.refresh(FEATURE_DRC).await?.drc)
    }

    // System

    pub async fn set_hdmi_cec(&self, enabled: bool) -> Result<bool> {
        self.set_toggle(types::HDMI_CEC, enabled).await
    }

    pub async fn get_hdmi_cec(&self) -> Result<bool> {
        self.get_toggle(types::HDMI_CEC).await
    }

    pub async fn set_auto_standby(&self, enabled: bool) -> Result<bool> {
        self.set_toggle(types::AUTO_STANDBY, enabled).await
    }

    pub async fn get_auto_standby(&self) -> Result<bool> {
        self.get_toggle(types::AUTO_STANDBY).await
    }

    /// Refresh every known feature from the device
    ///
    /// Failed queries are logged and skipped. Returns the cache afterwards.
    pub async fn fetch_all_states(&self) -> FeatureState {
        tracing::debug!("Fetching all device states");

        for feature in FETCHED_FEATURES {
            if let Err(e) = self.connection.send_command(Command::get(feature)).await {
                tracing::warn!("Failed to fetch state of {}: {}", feature, e);
            }
        }

        let state = self.connection.state();
        tracing::debug!("State fetch complete: {:?}", state);
        state
    }

    /// Find out whether a subwoofer is attached
    ///
    /// A bass level outside 0..=2 can only come from the subwoofer range.
    /// Otherwise the level is briefly set to -1, which only a subwoofer setup
    /// accepts, and then restored. The result is kept in
    /// [`FeatureState::has_subwoofer`].
    pub async fn detect_subwoofer(&self) -> Result<bool> {
        let response = self
            .connection
            .send_command(Command::get(FEATURE_BASS_LEVEL))
            .await?;
        let current = response
            .filter(|r| r.is_result_for(FEATURE_BASS_LEVEL))
            .and_then(|r| r.value)
            .as_ref()
            .and_then(state::parse_level)
            .filter(|level| BASS_LEVEL_RANGE.contains(level))
            .unwrap_or_else(|| self.connection.state().bass_level.into());

        if !BASS_LEVEL_RANGE_NO_SUB.contains(&current) {
            tracing::info!(
                "Subwoofer detected: bass level {} is outside 0-2 range",
                current
            );
            self.connection
                .with_state_mut(|state| state.has_subwoofer = Some(true));
            return Ok(true);
        }

        let probe = self
            .connection
            .send_command(Command::set(FEATURE_BASS_LEVEL, SUBWOOFER_PROBE_LEVEL))
            .await?;

        let Some(probe) = probe else {
            tracing::warn!("No answer to subwoofer probe, assuming no subwoofer");
            return Ok(false);
        };

        if !probe.is_ack() {
            tracing::info!(
                "No subwoofer detected: device rejected bass level {}",
                SUBWOOFER_PROBE_LEVEL
            );
            self.connection
                .with_state_mut(|state| state.has_subwoofer = Some(false));
            return Ok(false);
        }

        tracing::info!(
            "Subwoofer detected: device accepted bass level {}",
            SUBWOOFER_PROBE_LEVEL
        );
        let reverted = self
            .connection
            .send_command(Command::set(FEATURE_BASS_LEVEL, current))
            .await?;
        if !reverted.as_ref().is_some_and(Message::is_ack) {
            tracing::warn!("Failed to restore bass level {}", current);
        }
        self.connection.with_state_mut(|state| {
            state.has_subwoofer = Some(true);
            state.bass_level = current as i8;
        });
        Ok(true)
    }

    /// Put the device into Bluetooth pairing mode
    ///
    /// Switches the input to Bluetooth first if needed. Fails with
    /// [`QuadError::InvalidValue`] if the device refuses the input switch.
    pub async fn start_bluetooth_pairing(&self) -> Result<()> {
        tracing::info!("Triggering Bluetooth pairing mode");

        let input = self.get_input().await?;
        if input != INPUT_BLUETOOTH {
            tracing::info!("Current input is {}, switching to bluetooth", input);
            if !self.set_input(INPUT_BLUETOOTH).await? {
                tracing::error!("Failed to switch input to bluetooth");
                return Err(QuadError::InvalidValue {
                    feature: FEATURE_INPUT.to_string(),
                    value: INPUT_BLUETOOTH.to_string(),
                });
            }
        }

        if !self.set_feature(FEATURE_BLUETOOTH_MODE, BLUETOOTH_MODE_OFF).await? {
            tracing::warn!("Unexpected response setting bluetooth.mode to Off");
        }

        tokio::time::sleep(PAIRING_MODE_DELAY).await;

        if !self.set_feature(FEATURE_BLUETOOTH_MODE, BLUETOOTH_MODE_RX).await? {
            tracing::warn!("Unexpected response setting bluetooth.mode to RX");
        }

        tracing::info!("Bluetooth pairing mode triggered");
        Ok(())
    }

    // Notifications

    /// Run `callback` for every notification about `feature`
    ///
    /// Callbacks run in registration order on the listener task.
    pub fn register_notification_callback(
        &self,
        feature: &str,
        callback: NotificationCallback,
    ) -> CallbackId {
        self.connection.register_callback(feature, callback)
    }

    /// Remove a callback; returns whether it was registered
    pub fn unregister_notification_callback(&self, feature: &str, id: CallbackId) -> bool {
        self.connection.unregister_callback(feature, id)
    }

    /// Number of callbacks registered for a feature
    pub fn notification_callbacks(&self, feature: &str) -> usize {
        self.connection.callback_count(feature)
    }

    /// Receive every notification, for any feature
    ///
    /// Only notifications arriving after this call are delivered. The
    /// listener must be running, see [`listen_for_notifications`](Self::listen_for_notifications).
    pub fn subscribe(&self) -> NotificationReceiver {
        NotificationReceiver::new(self.connection.subscribe())
    }

    // Volume stepping

    /// Pause between volume transition steps; zero disables stepping
    pub fn volume_step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the pause between volume transition steps, at most one second
    pub fn set_volume_step_interval(&self, interval: Duration) -> Result<()> {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        config::validate_step_interval(ms)?;
        self.step_interval_ms.store(ms, Ordering::Relaxed);
        Ok(())
    }
}

fn check_range(feature: Feature, range: &RangeInclusive<i64>, value: i64) -> Result<()> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(QuadError::OutOfRange {
        feature,
        value,
        min: *range.start(),
        max: *range.end(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn out_of_range_values_fail_before_connecting() {
        // Nothing listens on this port; validation must win over connecting
        let config = ClientConfig {
            port: 9,
            connect_timeout_ms: 50,
            ..ClientConfig::default()
        };
        let client = QuadClient::with_config("127.0.0.1", "test", config).unwrap();

        let err = client.set_volume(101).await.unwrap_err();
        assert!(matches!(
            err,
            QuadError::OutOfRange { feature: FEATURE_VOLUME, value: 101, min: 0, max: 100 }
        ));
        assert!(matches!(
            client.set_rear_level(11).await,
            Err(QuadError::OutOfRange { .. })
        ));
        assert!(matches!(
            client.set_drc("sometimes").await,
            Err(QuadError::InvalidValue { .. })
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn bass_range_narrows_without_subwoofer() {
        let client = QuadClient::new("127.0.0.1", "test");
        client
            .connection
            .with_state_mut(|state| state.has_subwoofer = Some(false));

        let err = client.set_bass_level(-1).await.unwrap_err();
        assert!(matches!(err, QuadError::OutOfRange { min: 0, max: 2, .. }));
    }

    #[test]
    fn step_interval_is_bounded() {
        let client = QuadClient::new("127.0.0.1", "test");
        assert_eq!(client.volume_step_interval(), Duration::ZERO);

        client
            .set_volume_step_interval(Duration::from_millis(250))
            .unwrap();
        assert_eq!(client.volume_step_interval(), Duration::from_millis(250));

        assert!(client
            .set_volume_step_interval(Duration::from_millis(1001))
            .is_err());
        assert_eq!(client.volume_step_interval(), Duration::from_millis(250));

        // Clones share the setting
        assert_eq!(
            client.clone().volume_step_interval(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ClientConfig {
            volume_step_interval_ms: 5000,
            ..ClientConfig::default()
        };
        assert!(QuadClient::with_config("127.0.0.1", "test", config).is_err());
    }
}
