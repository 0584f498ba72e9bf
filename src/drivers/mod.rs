//! Device families shipped with the crate.

pub mod cem_dt885x;
pub mod demo;
pub mod manson_hcs;
pub mod status_psu;

use crate::config::{ConfigKey, ConfigValue};
use crate::device::DeviceError;

pub(crate) fn expect_f64(key: ConfigKey, value: &ConfigValue) -> Result<f64, DeviceError> {
    value
        .as_f64()
        .ok_or_else(|| DeviceError::Argument(format!("{key} expects a number, got {value}")))
}

pub(crate) fn expect_bool(key: ConfigKey, value: &ConfigValue) -> Result<bool, DeviceError> {
    value
        .as_bool()
        .ok_or_else(|| DeviceError::Argument(format!("{key} expects a boolean, got {value}")))
}

/// Checks `value` against an inclusive range.
pub(crate) fn check_range(key: ConfigKey, value: f64, min: f64, max: f64) -> Result<(), DeviceError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(DeviceError::Argument(format!(
            "{key} {value} outside of {min}..={max}"
        )))
    }
}
