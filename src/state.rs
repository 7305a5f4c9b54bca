use crate::types::{
    self, ToggleFeature, BASS_LEVEL_RANGE, BASS_LEVEL_RANGE_NO_SUB, DEFAULT_BASS_LEVEL,
    FEATURE_AAV, FEATURE_AUTO_STANDBY, FEATURE_BASS_LEVEL, FEATURE_BLUETOOTH_MODE, FEATURE_DRC,
    FEATURE_HDMI_CEC, FEATURE_INPUT, FEATURE_NIGHT_MODE, FEATURE_POWER, FEATURE_REAR_LEVEL,
    FEATURE_SOUND_FIELD, FEATURE_VOICE_ENHANCER, FEATURE_VOLUME, INPUT_TV, POWER_OFF,
    REAR_LEVEL_RANGE, VOLUME_RANGE,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Last known value of every device feature
///
/// Written by the notification listener and by acknowledged `set` commands;
/// everyone else works on cloned snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureState {
    pub power: String,
    pub volume: u8,
    pub input: String,
    pub rear_level: i8,
    pub bass_level: i8,
    pub voice_enhancer: String,
    pub sound_field: String,
    pub night_mode: String,
    pub hdmi_cec: String,
    pub auto_standby: String,
    pub drc: String,
    pub aav: String,
    pub bluetooth_mode: Option<String>,

    // Outcome of subwoofer detection, None until detected
    pub has_subwoofer: Option<bool>,

    // Device-defined features outside the typed set, stored raw
    pub other: BTreeMap<String, Value>,
}

impl Default for FeatureState {
    fn default() -> Self {
        Self {
            power: POWER_OFF.to_string(),
            volume: 0,
            input: INPUT_TV.to_string(),
            rear_level: 0,
            bass_level: DEFAULT_BASS_LEVEL,
            voice_enhancer: types::VOICE_ENHANCER.off.to_string(),
            sound_field: types::SOUND_FIELD.off.to_string(),
            night_mode: types::NIGHT_MODE.off.to_string(),
            hdmi_cec: types::HDMI_CEC.off.to_string(),
            auto_standby: types::AUTO_STANDBY.off.to_string(),
            drc: "off".to_string(),
            aav: types::ADVANCED_AUTO_VOLUME.off.to_string(),
            bluetooth_mode: None,
            has_subwoofer: None,
            other: BTreeMap::new(),
        }
    }
}

impl FeatureState {
    /// Apply a value reported for a feature.
    ///
    /// Acknowledgments carry no state and are ignored. Numeric features only
    /// take values that parse and fall inside their range; anything else is
    /// dropped and the previous value kept. Returns whether the cache changed.
    pub fn update(&mut self, feature: &str, value: &Value) -> bool {
        if types::is_ack(value) {
            return false;
        }

        let applied = match feature {
            FEATURE_POWER => assign_text(&mut self.power, value),
            FEATURE_INPUT => assign_text(&mut self.input, value),
            FEATURE_VOICE_ENHANCER => assign_text(&mut self.voice_enhancer, value),
            FEATURE_SOUND_FIELD => assign_text(&mut self.sound_field, value),
            FEATURE_NIGHT_MODE => assign_text(&mut self.night_mode, value),
            FEATURE_HDMI_CEC => assign_text(&mut self.hdmi_cec, value),
            FEATURE_AUTO_STANDBY => assign_text(&mut self.auto_standby, value),
            FEATURE_DRC => assign_text(&mut self.drc, value),
            FEATURE_AAV => assign_text(&mut self.aav, value),
            FEATURE_BLUETOOTH_MODE => {
                value_text(value).map(|text| replace(&mut self.bluetooth_mode, Some(text)))
            }
            FEATURE_VOLUME => parse_in_range(value, &VOLUME_RANGE)
                .map(|v| replace(&mut self.volume, v as u8)),
            FEATURE_REAR_LEVEL => parse_in_range(value, &REAR_LEVEL_RANGE)
                .map(|v| replace(&mut self.rear_level, v as i8)),
            FEATURE_BASS_LEVEL => parse_in_range(value, &self.bass_level_range())
                .map(|v| replace(&mut self.bass_level, v as i8)),
            _ => {
                let previous = self.other.insert(feature.to_string(), value.clone());
                Some(previous.as_ref() != Some(value))
            }
        };

        match applied {
            Some(changed) => changed,
            None => {
                tracing::debug!("Invalid value {} for feature {}", value, feature);
                false
            }
        }
    }

    /// Valid bass levels for the detected speaker setup
    pub fn bass_level_range(&self) -> RangeInclusive<i64> {
        match self.has_subwoofer {
            Some(false) => BASS_LEVEL_RANGE_NO_SUB,
            _ => BASS_LEVEL_RANGE,
        }
    }

    /// Whether a toggle feature is currently on
    pub fn is_on(&self, toggle: ToggleFeature) -> bool {
        self.text(toggle.feature)
            .is_some_and(|value| toggle.is_on(value))
    }

    /// Cached value of a string feature
    pub fn text(&self, feature: &str) -> Option<&str> {
        match feature {
            FEATURE_POWER => Some(&self.power),
            FEATURE_INPUT => Some(&self.input),
            FEATURE_VOICE_ENHANCER => Some(&self.voice_enhancer),
            FEATURE_SOUND_FIELD => Some(&self.sound_field),
            FEATURE_NIGHT_MODE => Some(&self.night_mode),
            FEATURE_HDMI_CEC => Some(&self.hdmi_cec),
            FEATURE_AUTO_STANDBY => Some(&self.auto_standby),
            FEATURE_DRC => Some(&self.drc),
            FEATURE_AAV => Some(&self.aav),
            FEATURE_BLUETOOTH_MODE => self.bluetooth_mode.as_deref(),
            other => self.other.get(other).and_then(Value::as_str),
        }
    }

    /// Cached value of any feature as JSON
    pub fn value(&self, feature: &str) -> Option<Value> {
        match feature {
            FEATURE_VOLUME => Some(Value::from(self.volume)),
            FEATURE_REAR_LEVEL => Some(Value::from(self.rear_level)),
            FEATURE_BASS_LEVEL => Some(Value::from(self.bass_level)),
            other => self
                .text(other)
                .map(Value::from)
                .or_else(|| self.other.get(other).cloned()),
        }
    }
}

/// Parse an integer feature value, accepting numbers and numeric strings
pub(crate) fn parse_level(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_in_range(value: &Value, range: &RangeInclusive<i64>) -> Option<i64> {
    parse_level(value).filter(|v| range.contains(v))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn assign_text(slot: &mut String, value: &Value) -> Option<bool> {
    value_text(value).map(|text| replace(slot, text))
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn volume_in_range_is_applied() {
        let mut state = FeatureState::default();
        assert!(state.update(FEATURE_VOLUME, &json!(42)));
        assert_eq!(state.volume, 42);
        assert!(state.update(FEATURE_VOLUME, &json!("100")));
        assert_eq!(state.volume, 100);
        assert!(state.update(FEATURE_VOLUME, &json!(0)));
        assert_eq!(state.volume, 0);
    }

    #[test]
    fn out_of_range_and_garbage_keep_previous_value() {
        let mut state = FeatureState::default();
        state.update(FEATURE_VOLUME, &json!(30));

        assert!(!state.update(FEATURE_VOLUME, &json!(101)));
        assert!(!state.update(FEATURE_VOLUME, &json!(-1)));
        assert!(!state.update(FEATURE_VOLUME, &json!("loud")));
        assert!(!state.update(FEATURE_VOLUME, &json!(null)));
        assert!(!state.update(FEATURE_VOLUME, &json!({"v": 1})));
        assert_eq!(state.volume, 30);

        assert!(!state.update(FEATURE_REAR_LEVEL, &json!(11)));
        assert!(state.update(FEATURE_REAR_LEVEL, &json!(-10)));
        assert_eq!(state.rear_level, -10);
    }

    #[test]
    fn ack_never_changes_the_cache() {
        let mut state = FeatureState::default();
        let before = state.clone();
        for ack in ["ACK", "ack", "Ack"] {
            assert!(!state.update(FEATURE_POWER, &json!(ack)));
            assert!(!state.update(FEATURE_VOLUME, &json!(ack)));
            assert!(!state.update("some.other", &json!(ack)));
        }
        assert_eq!(state, before);
    }

    #[test]
    fn reapplying_same_value_is_a_no_op() {
        let mut state = FeatureState::default();
        assert!(state.update(FEATURE_POWER, &json!("on")));
        assert!(!state.update(FEATURE_POWER, &json!("on")));
        assert!(state.update("bluetooth.pairing", &json!("idle")));
        assert!(!state.update("bluetooth.pairing", &json!("idle")));
    }

    #[test]
    fn bass_range_follows_subwoofer_detection() {
        let mut state = FeatureState::default();
        assert!(state.update(FEATURE_BASS_LEVEL, &json!(-5)));
        assert_eq!(state.bass_level, -5);

        state.has_subwoofer = Some(false);
        assert!(!state.update(FEATURE_BASS_LEVEL, &json!(5)));
        assert_eq!(state.bass_level, -5);
        assert!(state.update(FEATURE_BASS_LEVEL, &json!(2)));
        assert_eq!(state.bass_level, 2);
    }

    #[test]
    fn string_features_accept_any_value() {
        let mut state = FeatureState::default();
        assert!(state.update(FEATURE_INPUT, &json!("hdmi1")));
        assert!(state.update(FEATURE_DRC, &json!("auto")));
        assert!(state.update(FEATURE_POWER, &json!(1)));
        assert_eq!(state.input, "hdmi1");
        assert_eq!(state.drc, "auto");
        assert_eq!(state.power, "1");
        assert!(!state.is_on(crate::types::POWER));
    }

    #[test]
    fn toggles_read_through_their_literals() {
        let mut state = FeatureState::default();
        state.update(FEATURE_VOICE_ENHANCER, &json!("upon"));
        assert!(state.is_on(crate::types::VOICE_ENHANCER));
        assert!(!state.is_on(crate::types::NIGHT_MODE));
        assert_eq!(state.value(FEATURE_VOLUME), Some(json!(0)));
        assert_eq!(state.value(FEATURE_VOICE_ENHANCER), Some(json!("upon")));
        assert_eq!(state.value("unknown.feature"), None);
    }
}
