//! The closed set of driver families and a registry to scan through them.

use crate::device::{DeviceError, DeviceInstance};
use crate::driver::{Driver, ScanOptions};
use crate::drivers::{cem_dt885x, demo, manson_hcs, status_psu};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    StatusPsu,
    MansonHcs,
    CemDt885x,
    Demo,
}

impl DriverKind {
    pub const ALL: [DriverKind; 4] = [
        DriverKind::StatusPsu,
        DriverKind::MansonHcs,
        DriverKind::CemDt885x,
        DriverKind::Demo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::StatusPsu => status_psu::NAME,
            DriverKind::MansonHcs => manson_hcs::NAME,
            DriverKind::CemDt885x => cem_dt885x::NAME,
            DriverKind::Demo => demo::NAME,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn create(&self) -> Box<dyn Driver> {
        match self {
            DriverKind::StatusPsu => Box::new(status_psu::StatusPsuDriver),
            DriverKind::MansonHcs => Box::new(manson_hcs::MansonDriver),
            DriverKind::CemDt885x => Box::new(cem_dt885x::DtDriver),
            DriverKind::Demo => Box::new(demo::DemoDriver),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Holds one driver per family the caller asked for.
#[derive(Debug)]
pub struct Registry {
    drivers: Vec<Box<dyn Driver>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Every known family.
    pub fn new() -> Self {
        Self::with_drivers(&DriverKind::ALL)
    }

    pub fn with_drivers(kinds: &[DriverKind]) -> Self {
        Self {
            drivers: kinds.iter().map(DriverKind::create).collect(),
        }
    }

    pub fn drivers(&self) -> impl Iterator<Item = &dyn Driver> {
        self.drivers.iter().map(AsRef::as_ref)
    }

    pub fn driver(&self, name: &str) -> Option<&dyn Driver> {
        self.drivers().find(|d| d.name() == name)
    }

    /// Scans with the driver called `name`.
    pub fn scan(&self, name: &str, options: ScanOptions) -> Result<Vec<DeviceInstance>, DeviceError> {
        let driver = self
            .driver(name)
            .ok_or_else(|| DeviceError::Argument(format!("no driver named '{name}'")))?;
        let devices = driver.scan(options)?;
        log::info!("{name}: scan found {} device(s).", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCap, ConfigKey, ConfigValue};
    use crate::transport::ScriptedTransport;

    #[test]
    fn test_names_round_trip() {
        for kind in DriverKind::ALL {
            assert_eq!(DriverKind::from_name(kind.name()), Some(kind));
            assert_eq!(kind.create().name(), kind.name());
        }
        assert_eq!(DriverKind::from_name("fx2lafw"), None);
        assert_eq!(DriverKind::Demo.to_string(), "demo");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::with_drivers(&[DriverKind::Demo, DriverKind::MansonHcs]);
        assert_eq!(registry.drivers().count(), 2);
        assert!(registry.driver("manson-hcs-3xxx").is_some());
        assert!(registry.driver("cem-dt-885x").is_none());
        assert!(matches!(
            registry.scan("cem-dt-885x", ScanOptions::new()),
            Err(DeviceError::Argument(_))
        ));
    }

    #[test]
    fn test_scan_through_registry() {
        let registry = Registry::new();
        let devices = registry
            .scan("demo", ScanOptions::new().with_logic_channels(2).with_analog_channels(1))
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].info().channels.len(), 3);

        let silent = ScriptedTransport::new("/dev/ttyUSB0");
        let devices = registry
            .scan("status-psu", ScanOptions::new().with_transport(silent))
            .unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_scan_options_listing() {
        let registry = Registry::new();
        let demo = registry.driver("demo").unwrap();
        let ConfigValue::KeyList(keys) = demo.config_list(ConfigKey::ScanOptions).unwrap() else {
            unreachable!("scan options are a key list");
        };
        assert_eq!(
            keys,
            vec![
                (ConfigKey::NumLogicChannels, ConfigCap::SET),
                (ConfigKey::NumAnalogChannels, ConfigCap::SET)
            ]
        );
    }
}
