//! Feature names, value constants and ranges used by the device.

use std::ops::RangeInclusive;

/// TCP port of the control protocol
pub const DEFAULT_PORT: u16 = 33336;

/// Feature identifier, a dotted name such as `main.volumestep`
pub type Feature = &'static str;

pub const FEATURE_POWER: Feature = "main.power";
pub const FEATURE_VOLUME: Feature = "main.volumestep";
pub const FEATURE_INPUT: Feature = "main.input";
pub const FEATURE_REAR_LEVEL: Feature = "main.rearvolumestep";
pub const FEATURE_BASS_LEVEL: Feature = "main.bassstep";
pub const FEATURE_VOICE_ENHANCER: Feature = "audio.voiceenhancer";
pub const FEATURE_SOUND_FIELD: Feature = "audio.soundfield";
pub const FEATURE_NIGHT_MODE: Feature = "audio.nightmode";
pub const FEATURE_HDMI_CEC: Feature = "hdmi.cec";
pub const FEATURE_AUTO_STANDBY: Feature = "system.autostandby";
pub const FEATURE_DRC: Feature = "audio.drangecomp";
pub const FEATURE_AAV: Feature = "audio.aav";
pub const FEATURE_BLUETOOTH_MODE: Feature = "bluetooth.mode";

/// Value a `set` result carries on success
pub const ACK: &str = "ACK";

pub const POWER_ON: &str = "on";
pub const POWER_OFF: &str = "off";

pub const INPUT_TV: &str = "tv";
pub const INPUT_HDMI: &str = "hdmi1";
pub const INPUT_SPOTIFY: &str = "spotify";
pub const INPUT_BLUETOOTH: &str = "bluetooth";

pub const BLUETOOTH_MODE_OFF: &str = "Off";
pub const BLUETOOTH_MODE_RX: &str = "RX";

/// Accepted dynamic range compression modes
pub const DRC_MODES: [&str; 3] = ["on", "off", "auto"];

pub const VOLUME_RANGE: RangeInclusive<i64> = 0..=100;
pub const REAR_LEVEL_RANGE: RangeInclusive<i64> = -10..=10;
/// Bass level range with a subwoofer attached
pub const BASS_LEVEL_RANGE: RangeInclusive<i64> = -10..=10;
/// Bass level range without a subwoofer (MIN, MID, MAX)
pub const BASS_LEVEL_RANGE_NO_SUB: RangeInclusive<i64> = 0..=2;

/// Bass level the device reports after a reset (MID)
pub const DEFAULT_BASS_LEVEL: i8 = 1;

/// Whether a value is the acknowledgment sentinel, in any letter case.
pub fn is_ack(value: &serde_json::Value) -> bool {
    value.as_str().is_some_and(|s| s.eq_ignore_ascii_case(ACK))
}

/// An on/off feature together with the literal values the device uses for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleFeature {
    pub feature: Feature,
    pub on: &'static str,
    pub off: &'static str,
}

impl ToggleFeature {
    /// Wire value for the requested state
    pub fn value(&self, enabled: bool) -> &'static str {
        if enabled {
            self.on
        } else {
            self.off
        }
    }

    /// Whether a cached wire value means "on"
    pub fn is_on(&self, value: &str) -> bool {
        value == self.on
    }
}

pub const VOICE_ENHANCER: ToggleFeature = ToggleFeature {
    feature: FEATURE_VOICE_ENHANCER,
    on: "upon",
    off: "upoff",
};

pub const SOUND_FIELD: ToggleFeature = ToggleFeature {
    feature: FEATURE_SOUND_FIELD,
    on: "on",
    off: "off",
};

pub const NIGHT_MODE: ToggleFeature = ToggleFeature {
    feature: FEATURE_NIGHT_MODE,
    on: "on",
    off: "off",
};

pub const HDMI_CEC: ToggleFeature = ToggleFeature {
    feature: FEATURE_HDMI_CEC,
    on: "on",
    off: "off",
};

pub const AUTO_STANDBY: ToggleFeature = ToggleFeature {
    feature: FEATURE_AUTO_STANDBY,
    on: "on",
    off: "off",
};

pub const ADVANCED_AUTO_VOLUME: ToggleFeature = ToggleFeature {
    feature: FEATURE_AAV,
    on: "on",
    off: "off",
};

pub const POWER: ToggleFeature = ToggleFeature {
    feature: FEATURE_POWER,
    on: POWER_ON,
    off: POWER_OFF,
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_is_case_insensitive() {
        assert!(is_ack(&json!("ACK")));
        assert!(is_ack(&json!("ack")));
        assert!(is_ack(&json!("Ack")));
        assert!(!is_ack(&json!("NACK")));
        assert!(!is_ack(&json!(1)));
    }

    #[test]
    fn voice_enhancer_uses_its_own_literals() {
        assert_eq!(VOICE_ENHANCER.value(true), "upon");
        assert_eq!(VOICE_ENHANCER.value(false), "upoff");
        assert!(VOICE_ENHANCER.is_on("upon"));
        assert!(!VOICE_ENHANCER.is_on("on"));
    }
}
