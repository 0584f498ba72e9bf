//! The driver capability: one implementation per device family.

use crate::config::{ConfigCap, ConfigKey, ConfigValue};
use crate::device::{DeviceError, DeviceInstance};
use crate::transport::{available_ports, SerialParams, SerialTransport, Transport, TransportError};

/// Options for a driver scan.
#[derive(Debug, Default)]
pub struct ScanOptions {
    /// Connection string, e.g. a serial port path.
    pub conn: Option<String>,
    /// Serial parameters in `"9600/8n1"` notation.
    pub serialcomm: Option<String>,
    pub num_logic_channels: Option<usize>,
    pub num_analog_channels: Option<usize>,
    transport: Option<Box<dyn Transport>>,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conn(mut self, conn: &str) -> Self {
        self.conn = Some(conn.to_string());
        self
    }

    pub fn with_serialcomm(mut self, serialcomm: &str) -> Self {
        self.serialcomm = Some(serialcomm.to_string());
        self
    }

    pub fn with_logic_channels(mut self, n: usize) -> Self {
        self.num_logic_channels = Some(n);
        self
    }

    pub fn with_analog_channels(mut self, n: usize) -> Self {
        self.num_analog_channels = Some(n);
        self
    }

    /// Probes this transport instead of opening `conn`.
    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Transports a serial driver should probe, in order: an injected
    /// transport, the `conn` port, or every port with one of `usb_ids`.
    pub(crate) fn serial_candidates(
        &mut self,
        default_serialcomm: &str,
        usb_ids: &[(u16, u16)],
    ) -> Result<Vec<Box<dyn Transport>>, DeviceError> {
        if let Some(transport) = self.transport.take() {
            return Ok(vec![transport]);
        }
        let params: SerialParams = self
            .serialcomm
            .as_deref()
            .unwrap_or(default_serialcomm)
            .parse()
            .map_err(|e: TransportError| DeviceError::Argument(e.to_string()))?;

        let ports = match &self.conn {
            Some(conn) => vec![conn.clone()],
            None if usb_ids.is_empty() => {
                return Err(DeviceError::Argument("no connection given".into()));
            }
            None => available_ports(usb_ids)?
                .into_iter()
                .map(|found| found.port)
                .collect(),
        };
        Ok(ports
            .into_iter()
            .map(|port| Box::new(SerialTransport::new(&port, params.clone())) as Box<dyn Transport>)
            .collect())
    }
}

pub trait Driver: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    fn scan_options(&self) -> &'static [ConfigKey];

    /// Probes for devices. Returned instances are INACTIVE and own their
    /// (closed) transports. Pre-existing instances are never touched.
    fn scan(&self, options: ScanOptions) -> Result<Vec<DeviceInstance>, DeviceError>;

    /// Driver-level listing; only `ScanOptions` is answered.
    fn config_list(&self, key: ConfigKey) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigValue::KeyList(
                self.scan_options()
                    .iter()
                    .map(|k| (*k, ConfigCap::SET))
                    .collect(),
            )),
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }
}

/// Opens `transport`, runs `probe` against it and closes it again. Any
/// failure is logged and yields `None`.
pub(crate) fn probe_serial<T>(
    driver: &str,
    mut transport: Box<dyn Transport>,
    probe: impl FnOnce(&mut dyn Transport) -> Result<T, DeviceError>,
) -> Option<(T, Box<dyn Transport>)> {
    let conn = transport.connection_id().to_string();
    if let Err(e) = transport.open() {
        log::debug!("{driver}: cannot open {conn}: {e}");
        return None;
    }
    let result = probe(transport.as_mut());
    if let Err(e) = transport.close() {
        log::warn!("{driver}: closing {conn} after probe failed: {e}");
    }
    match result {
        Ok(found) => Some((found, transport)),
        Err(e) => {
            log::debug!("{driver}: no device on {conn}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    #[test]
    fn test_injected_transport_wins() {
        let mut options = ScanOptions::new()
            .with_conn("/dev/ttyUSB9")
            .with_transport(ScriptedTransport::new("mock0"));
        let candidates = options.serial_candidates("9600/8n1", &[]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].connection_id(), "mock0");
    }

    #[test]
    fn test_conn_and_serialcomm() {
        let mut options = ScanOptions::new()
            .with_conn("/dev/ttyUSB9")
            .with_serialcomm("115200/8n1");
        let candidates = options.serial_candidates("9600/8n1", &[]).unwrap();
        assert_eq!(candidates[0].connection_id(), "/dev/ttyUSB9");

        let mut bad = ScanOptions::new().with_conn("/dev/ttyUSB9").with_serialcomm("fast");
        assert!(matches!(
            bad.serial_candidates("9600/8n1", &[]),
            Err(DeviceError::Argument(_))
        ));
        assert!(ScanOptions::new().serial_candidates("9600/8n1", &[]).is_err());
    }

    #[test]
    fn test_probe_closes_transport() {
        let script = ScriptedTransport::new("mock0");
        script.reply_once(b"PING", b"PONG");
        let found = probe_serial("test", Box::new(script.clone()), |t| {
            let timeout = t.io_timeout(4);
            t.send(b"PING", timeout)?;
            let mut buf = [0u8; 4];
            t.read_blocking(&mut buf, timeout)?;
            Ok(buf)
        });
        let (reply, mut transport) = found.unwrap();
        assert_eq!(&reply, b"PONG");
        assert!(!transport.is_open());
        transport.open().unwrap();

        let missing = probe_serial("test", Box::new(ScriptedTransport::new("mock1")), |_| {
            Err::<(), _>(DeviceError::Handshake("silence".into()))
        });
        assert!(missing.is_none());
    }
}
