//! Device instances: identity, channels, lifecycle and the configuration
//! surface shared by every driver.

use crate::acquisition::{Acquisition, SourceSpec};
use crate::config::{capabilities, ConfigCap, ConfigKey, ConfigValue};
use crate::datafeed::FeedError;
use crate::event_loop::Event;
use crate::sw_limits::SoftwareLimits;
use crate::transport::{Transport, TransportError};
use std::any::Any;
use std::fmt;

/// Identifier assigned by the session when a device is added.
pub type DeviceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    NotFound,
    Initializing,
    Inactive,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Logic,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub index: usize,
    pub kind: ChannelType,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub name: String,
    /// Indices into the device's channel list.
    pub channels: Vec<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{key} is not applicable to this device")]
    NotApplicable { key: ConfigKey },

    #[error("Device {0} is closed or busy")]
    ClosedOrBusy(String),

    #[error("Out of memory: {0}")]
    ResourceExhaustion(String),

    #[error("Unexpected reply from device: {0}")]
    Handshake(String),

    #[error("{key} needs a channel group")]
    ChannelGroupRequired { key: ConfigKey },

    #[error("Device is {actual:?}, expected {expected:?}")]
    WrongStatus {
        expected: DeviceStatus,
        actual: DeviceStatus,
    },

    #[error("Malformed datafeed payload: {0}")]
    Feed(#[from] FeedError),
}

/// Identity and channel layout of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub driver: &'static str,
    pub vendor: String,
    pub model: String,
    pub version: Option<String>,
    pub serial_num: Option<String>,
    pub connection_id: Option<String>,
    pub channels: Vec<Channel>,
    pub channel_groups: Vec<ChannelGroup>,
}

impl DeviceInfo {
    pub fn new(driver: &'static str, vendor: &str, model: &str) -> Self {
        Self {
            id: 0,
            driver,
            vendor: vendor.to_string(),
            model: model.to_string(),
            version: None,
            serial_num: None,
            connection_id: None,
            channels: Vec::new(),
            channel_groups: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_connection_id(mut self, connection_id: &str) -> Self {
        self.connection_id = Some(connection_id.to_string());
        self
    }

    /// Appends an enabled channel and returns its index.
    pub fn add_channel(&mut self, kind: ChannelType, name: &str) -> usize {
        let index = self.channels.len();
        self.channels.push(Channel {
            index,
            kind,
            name: name.to_string(),
            enabled: true,
        });
        index
    }

    pub fn add_group(&mut self, name: &str, channels: Vec<usize>) {
        self.channel_groups.push(ChannelGroup {
            name: name.to_string(),
            channels,
        });
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    pub fn group(&self, name: &str) -> Option<&ChannelGroup> {
        self.channel_groups.iter().find(|g| g.name == name)
    }

    pub fn channels_of(&self, kind: ChannelType) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(move |c| c.kind == kind)
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.channels.get(index).is_some_and(|c| c.enabled)
    }

    /// Vendor and model, plus the version when known.
    pub fn display_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {} {}", self.vendor, self.model, version),
            None => format!("{} {}", self.vendor, self.model),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())?;
        if let Some(conn) = &self.connection_id {
            write!(f, " on {conn}")?;
        }
        Ok(())
    }
}

/// Per-driver protocol state and configuration.
///
/// The instance resolves software limits and capability checks before any
/// of the configuration methods is called, so a context only sees keys it
/// listed in [`DeviceContext::options`] with the matching capability.
pub trait DeviceContext: fmt::Debug {
    fn options(&self) -> &[(ConfigKey, ConfigCap)];

    fn config_get(
        &self,
        key: ConfigKey,
        group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError>;

    /// `transport` is the open transport of the device, `None` while closed.
    fn config_set(
        &mut self,
        key: ConfigKey,
        value: &ConfigValue,
        group: Option<&ChannelGroup>,
        transport: Option<&mut dyn Transport>,
    ) -> Result<(), DeviceError>;

    fn config_list(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        Err(DeviceError::NotApplicable { key })
    }

    fn on_open(&mut self, _transport: Option<&mut dyn Transport>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn on_close(&mut self, _transport: Option<&mut dyn Transport>) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Prepares the device and tells the session which source to register.
    fn acquisition_start(&mut self, acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError>;

    /// Handles one readiness or timeout event of the registered source.
    fn receive(&mut self, acq: &mut Acquisition<'_>, event: Event) -> Result<(), DeviceError>;

    fn acquisition_stop(&mut self, _acq: &mut Acquisition<'_>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// The transport in `slot`, if it is open.
pub(crate) fn open_transport(slot: &mut Option<Box<dyn Transport>>) -> Option<&mut dyn Transport> {
    match slot {
        Some(transport) if transport.is_open() => {
            let transport: &mut dyn Transport = transport.as_mut();
            Some(transport)
        }
        _ => None,
    }
}

const LIMIT_OPTIONS: [(ConfigKey, ConfigCap); 3] = [
    (ConfigKey::LimitSamples, ConfigCap::GET.union(ConfigCap::SET)),
    (ConfigKey::LimitFrames, ConfigCap::GET.union(ConfigCap::SET)),
    (ConfigKey::LimitMsec, ConfigCap::GET.union(ConfigCap::SET)),
];

/// A device created by a driver scan. Owns exactly one transport (none for
/// virtual devices) and one context.
#[derive(Debug)]
pub struct DeviceInstance {
    pub(crate) info: DeviceInfo,
    pub(crate) status: DeviceStatus,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) context: Box<dyn DeviceContext>,
    pub(crate) limits: SoftwareLimits,
}

impl DeviceInstance {
    pub fn new(
        info: DeviceInfo,
        transport: Option<Box<dyn Transport>>,
        context: impl DeviceContext + 'static,
    ) -> Self {
        Self {
            info,
            status: DeviceStatus::Inactive,
            transport,
            context: Box::new(context),
            limits: SoftwareLimits::new(),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn limits(&self) -> &SoftwareLimits {
        &self.limits
    }

    /// The driver context, if it is of type `T`.
    pub fn context<T: DeviceContext + 'static>(&self) -> Option<&T> {
        self.context.as_any().downcast_ref::<T>()
    }

    pub fn is_open(&self) -> bool {
        self.status == DeviceStatus::Active
    }

    /// INACTIVE to ACTIVE. Opening an open device is a no-op.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        match self.status {
            DeviceStatus::Active => return Ok(()),
            DeviceStatus::Inactive => {}
            actual => {
                return Err(DeviceError::WrongStatus {
                    expected: DeviceStatus::Inactive,
                    actual,
                })
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.open().map_err(|e| match e {
                TransportError::Busy(conn) => DeviceError::ClosedOrBusy(conn),
                other => DeviceError::Transport(other),
            })?;
        }
        if let Err(e) = self.context.on_open(open_transport(&mut self.transport)) {
            if let Some(transport) = self.transport.as_mut() {
                let _ = transport.close();
            }
            return Err(e);
        }

        log::info!("Opened {}.", self.info);
        self.status = DeviceStatus::Active;
        Ok(())
    }

    /// ACTIVE to INACTIVE, releasing the transport. Closing a closed device
    /// is a no-op.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        if self.status != DeviceStatus::Active {
            return Ok(());
        }
        let flushed = self.context.on_close(open_transport(&mut self.transport));
        if let Some(transport) = self.transport.as_mut() {
            transport.close()?;
        }
        self.status = DeviceStatus::Inactive;
        log::info!("Closed {}.", self.info);
        flushed
    }

    fn resolve_group(&self, group: Option<&str>) -> Result<Option<&ChannelGroup>, DeviceError> {
        group
            .map(|name| {
                self.info
                    .group(name)
                    .ok_or_else(|| DeviceError::Argument(format!("unknown channel group '{name}'")))
            })
            .transpose()
    }

    fn check_cap(&self, key: ConfigKey, cap: ConfigCap) -> Result<(), DeviceError> {
        if capabilities(self.context.options(), key).contains(cap) {
            Ok(())
        } else {
            Err(DeviceError::NotApplicable { key })
        }
    }

    /// Every key this device supports, software limits included.
    pub fn options(&self) -> Vec<(ConfigKey, ConfigCap)> {
        LIMIT_OPTIONS
            .iter()
            .chain(self.context.options())
            .copied()
            .collect()
    }

    pub fn config_get(&self, key: ConfigKey, group: Option<&str>) -> Result<ConfigValue, DeviceError> {
        if SoftwareLimits::handles(key) {
            return self.limits.config_get(key);
        }
        self.check_cap(key, ConfigCap::GET)?;
        let group = self.resolve_group(group)?;
        self.context.config_get(key, group)
    }

    pub fn config_set(
        &mut self,
        key: ConfigKey,
        value: &ConfigValue,
        group: Option<&str>,
    ) -> Result<(), DeviceError> {
        if SoftwareLimits::handles(key) {
            return self.limits.config_set(key, value);
        }
        self.check_cap(key, ConfigCap::SET)?;
        let group = self.resolve_group(group)?.cloned();
        log::debug!("{}: setting {} to {}.", self.info.model, key, value);
        self.context
            .config_set(key, value, group.as_ref(), open_transport(&mut self.transport))
    }

    pub fn config_list(&self, key: ConfigKey, group: Option<&str>) -> Result<ConfigValue, DeviceError> {
        if key == ConfigKey::DeviceOptions {
            return Ok(ConfigValue::KeyList(self.options()));
        }
        self.check_cap(key, ConfigCap::LIST)?;
        let group = self.resolve_group(group)?;
        self.context.config_list(key, group)
    }

    pub fn set_channel_enabled(&mut self, index: usize, enabled: bool) -> Result<(), DeviceError> {
        let channel = self
            .info
            .channels
            .get_mut(index)
            .ok_or_else(|| DeviceError::Argument(format!("no channel with index {index}")))?;
        channel.enabled = enabled;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    /// Context with a single settable voltage and no acquisition behaviour.
    #[derive(Debug, Default)]
    pub(crate) struct NullContext {
        pub voltage: f64,
        pub closed: usize,
    }

    const NULL_OPTIONS: [(ConfigKey, ConfigCap); 1] =
        [(ConfigKey::VoltageTarget, ConfigCap::GET.union(ConfigCap::SET))];

    impl DeviceContext for NullContext {
        fn options(&self) -> &[(ConfigKey, ConfigCap)] {
            &NULL_OPTIONS
        }

        fn config_get(
            &self,
            _key: ConfigKey,
            _group: Option<&ChannelGroup>,
        ) -> Result<ConfigValue, DeviceError> {
            Ok(ConfigValue::F64(self.voltage))
        }

        fn config_set(
            &mut self,
            _key: ConfigKey,
            value: &ConfigValue,
            _group: Option<&ChannelGroup>,
            _transport: Option<&mut dyn Transport>,
        ) -> Result<(), DeviceError> {
            self.voltage = value
                .as_f64()
                .ok_or_else(|| DeviceError::Argument("expected a number".into()))?;
            Ok(())
        }

        fn on_close(&mut self, _transport: Option<&mut dyn Transport>) -> Result<(), DeviceError> {
            self.closed += 1;
            Ok(())
        }

        fn acquisition_start(
            &mut self,
            _acq: &mut Acquisition<'_>,
        ) -> Result<SourceSpec, DeviceError> {
            Ok(SourceSpec::timer(std::time::Duration::from_millis(1)))
        }

        fn receive(&mut self, _acq: &mut Acquisition<'_>, _event: Event) -> Result<(), DeviceError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn instance(transport: &ScriptedTransport) -> DeviceInstance {
        let mut info = DeviceInfo::new("null", "Acme", "Null").with_connection_id("mock0");
        info.add_channel(ChannelType::Analog, "CH1");
        info.add_group("CH1", vec![0]);
        DeviceInstance::new(info, Some(Box::new(transport.clone())), NullContext::default())
    }

    #[test]
    fn test_open_close_lifecycle() {
        let transport = ScriptedTransport::new("mock0");
        let mut device = instance(&transport);
        assert_eq!(device.status(), DeviceStatus::Inactive);

        device.open().unwrap();
        assert_eq!(device.status(), DeviceStatus::Active);
        device.open().unwrap();

        device.close().unwrap();
        device.close().unwrap();
        assert_eq!(device.status(), DeviceStatus::Inactive);
        assert_eq!(device.context::<NullContext>().unwrap().closed, 1);
    }

    #[test]
    fn test_open_claimed_transport_is_busy() {
        let transport = ScriptedTransport::new("mock0");
        let mut first = instance(&transport);
        let mut second = instance(&transport);
        first.open().unwrap();
        assert!(matches!(second.open(), Err(DeviceError::ClosedOrBusy(conn)) if conn == "mock0"));
        assert_eq!(second.status(), DeviceStatus::Inactive);
    }

    #[test]
    fn test_config_surface() {
        let transport = ScriptedTransport::new("mock0");
        let mut device = instance(&transport);

        device
            .config_set(ConfigKey::VoltageTarget, &ConfigValue::F64(5.0), None)
            .unwrap();
        assert_eq!(
            device.config_get(ConfigKey::VoltageTarget, Some("CH1")).unwrap(),
            ConfigValue::F64(5.0)
        );
        assert!(matches!(
            device.config_get(ConfigKey::Samplerate, None),
            Err(DeviceError::NotApplicable { key: ConfigKey::Samplerate })
        ));
        assert!(matches!(
            device.config_list(ConfigKey::VoltageTarget, None),
            Err(DeviceError::NotApplicable { .. })
        ));
        assert!(matches!(
            device.config_get(ConfigKey::VoltageTarget, Some("CH9")),
            Err(DeviceError::Argument(_))
        ));

        device
            .config_set(ConfigKey::LimitSamples, &ConfigValue::U64(10), None)
            .unwrap();
        assert_eq!(
            device.config_get(ConfigKey::LimitSamples, None).unwrap(),
            ConfigValue::U64(10)
        );

        let ConfigValue::KeyList(keys) = device.config_list(ConfigKey::DeviceOptions, None).unwrap()
        else {
            unreachable!("device options are a key list");
        };
        assert!(keys.contains(&(ConfigKey::LimitMsec, ConfigCap::GET | ConfigCap::SET)));
        assert!(keys.iter().any(|(k, _)| *k == ConfigKey::VoltageTarget));
    }

    #[test]
    fn test_channel_enable_flag() {
        let transport = ScriptedTransport::new("mock0");
        let mut device = instance(&transport);
        device.set_channel_enabled(0, false).unwrap();
        assert!(!device.info().is_enabled(0));
        assert!(device.set_channel_enabled(4, true).is_err());
    }
}
