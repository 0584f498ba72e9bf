use bitflags::bitflags;
use std::fmt;

/// Capability keys understood by `config_get`, `config_set` and `config_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKey {
    /// Lists the scan options a driver accepts.
    ScanOptions,
    /// Lists the keys a device supports, together with their capabilities.
    DeviceOptions,

    Conn,
    SerialComm,
    NumLogicChannels,
    NumAnalogChannels,

    Samplerate,
    LimitSamples,
    LimitFrames,
    LimitMsec,

    Voltage,
    VoltageTarget,
    Current,
    CurrentLimit,
    Enabled,
    Regulation,

    SplWeightFreq,
    SplWeightTime,
    SplMeasurementRange,
    HoldMax,
    HoldMin,

    PatternMode,
    Amplitude,
    /// Share of the sample limit kept from before the trigger, in percent.
    CaptureRatio,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::ScanOptions => "scan_options",
            ConfigKey::DeviceOptions => "device_options",
            ConfigKey::Conn => "conn",
            ConfigKey::SerialComm => "serialcomm",
            ConfigKey::NumLogicChannels => "num_logic_channels",
            ConfigKey::NumAnalogChannels => "num_analog_channels",
            ConfigKey::Samplerate => "samplerate",
            ConfigKey::LimitSamples => "limit_samples",
            ConfigKey::LimitFrames => "limit_frames",
            ConfigKey::LimitMsec => "limit_time",
            ConfigKey::Voltage => "voltage",
            ConfigKey::VoltageTarget => "voltage_target",
            ConfigKey::Current => "current",
            ConfigKey::CurrentLimit => "current_limit",
            ConfigKey::Enabled => "enabled",
            ConfigKey::Regulation => "regulation",
            ConfigKey::SplWeightFreq => "spl_weight_freq",
            ConfigKey::SplWeightTime => "spl_weight_time",
            ConfigKey::SplMeasurementRange => "spl_meas_range",
            ConfigKey::HoldMax => "hold_max",
            ConfigKey::HoldMin => "hold_min",
            ConfigKey::PatternMode => "pattern",
            ConfigKey::Amplitude => "amplitude",
            ConfigKey::CaptureRatio => "captureratio",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Operations a key supports on a given device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConfigCap: u8 {
        const GET = 0b001;
        const SET = 0b010;
        const LIST = 0b100;
    }
}

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    U64(u64),
    F64(f64),
    Str(String),
    /// Continuous range, e.g. the settable span of a voltage target.
    Range { min: f64, max: f64, step: f64 },
    /// Integer range, e.g. the supported samplerates.
    U64Range { min: u64, max: u64, step: u64 },
    /// A measured span such as a sound level meter range (30..80 dB).
    Span(u64, u64),
    StrList(Vec<String>),
    KeyList(Vec<(ConfigKey, ConfigCap)>),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Integers are accepted where a float is expected.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::F64(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            ConfigValue::U64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::U64(v) => write!(f, "{v}"),
            ConfigValue::F64(v) => write!(f, "{v}"),
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Range { min, max, step } => write!(f, "{min}..{max} step {step}"),
            ConfigValue::U64Range { min, max, step } => write!(f, "{min}..{max} step {step}"),
            ConfigValue::Span(low, high) => write!(f, "{low}-{high}"),
            ConfigValue::StrList(items) => write!(f, "[{}]", items.join(", ")),
            ConfigValue::KeyList(keys) => {
                let names: Vec<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
                write!(f, "[{}]", names.join(", "))
            }
        }
    }
}

/// Builds the `KeyList` answer for `ConfigKey::DeviceOptions`.
pub fn key_list(keys: &[(ConfigKey, ConfigCap)]) -> ConfigValue {
    ConfigValue::KeyList(keys.to_vec())
}

/// Looks up the capabilities of `key` in a device option table.
pub fn capabilities(keys: &[(ConfigKey, ConfigCap)], key: ConfigKey) -> ConfigCap {
    keys.iter()
        .find(|(k, _)| *k == key)
        .map_or_else(ConfigCap::empty, |(_, cap)| *cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_as_str() {
        assert_eq!(ConfigKey::LimitSamples.as_str(), "limit_samples");
        assert_eq!(ConfigKey::SerialComm.to_string(), "serialcomm");
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(ConfigValue::U64(3).as_f64(), Some(3.0));
        assert_eq!(ConfigValue::Bool(true).as_u64(), None);
        assert_eq!(ConfigValue::Str("CV".into()).as_str(), Some("CV"));
    }

    #[test]
    fn test_capabilities_lookup() {
        let table = [
            (ConfigKey::Voltage, ConfigCap::GET),
            (ConfigKey::VoltageTarget, ConfigCap::GET | ConfigCap::SET | ConfigCap::LIST),
        ];
        assert!(capabilities(&table, ConfigKey::VoltageTarget).contains(ConfigCap::SET));
        assert!(!capabilities(&table, ConfigKey::Voltage).contains(ConfigCap::SET));
        assert!(capabilities(&table, ConfigKey::Samplerate).is_empty());
    }
}
