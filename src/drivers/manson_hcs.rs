//! Manson HCS-3xxx bench power supplies.
//!
//! ASCII request/response over serial. Every command ends in `\r` and every
//! reply is one or more `\r`-terminated lines followed by `OK\r`. During
//! acquisition the driver polls with `GETD`.

use super::{check_range, expect_bool, expect_f64};
use crate::acquisition::{Acquisition, SourceSpec};
use crate::analog::{Analog, Meaning, Mq, MqFlags, Unit};
use crate::config::{ConfigCap, ConfigKey, ConfigValue};
use crate::device::{ChannelGroup, ChannelType, DeviceContext, DeviceError, DeviceInfo, DeviceInstance};
use crate::driver::{probe_serial, Driver, ScanOptions};
use crate::event_loop::Event;
use crate::protocol::{parse_ascii_digits, FrameDecoder, ProtocolDesync, ReplyTracker, TerminatedFrames};
use crate::transport::{Transport, TransportError};
use std::any::Any;
use std::time::{Duration, Instant};

pub const NAME: &str = "manson-hcs-3xxx";
const VENDOR: &str = "Manson";
const DEFAULT_SERIALCOMM: &str = "9600/8n1";

const REPLY_END: &[u8] = b"OK\r";
const BUF_LEN: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const SOURCE_TIMEOUT: Duration = Duration::from_millis(10);
const GETD: &[u8] = b"GETD\r";

/// `(min, max, step)` of a settable quantity.
pub type Span = (f64, f64, f64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Model {
    /// What `GMOD` answers, with and without the `HCS-` prefix.
    pub ids: [&'static str; 2],
    pub name: &'static str,
    pub voltage: Span,
    pub current: Span,
}

const fn model(number: &'static str, id: &'static str, name: &'static str, voltage: Span, current: Span) -> Model {
    Model {
        ids: [number, id],
        name,
        voltage,
        current,
    }
}

pub static MODELS: [Model; 16] = [
    model("3100", "HCS-3100", "HCS-3100", (1.0, 18.0, 0.1), (0.0, 10.0, 0.10)),
    model("3102", "HCS-3102", "HCS-3102", (1.0, 36.0, 0.1), (0.0, 5.0, 0.01)),
    model("3104", "HCS-3104", "HCS-3104", (1.0, 60.0, 0.1), (0.0, 2.5, 0.01)),
    model("3150", "HCS-3150", "HCS-3150", (1.0, 18.0, 0.1), (0.0, 15.0, 0.10)),
    model("3200", "HCS-3200", "HCS-3200", (1.0, 18.0, 0.1), (0.0, 20.0, 0.10)),
    model("3202", "HCS-3202", "HCS-3202", (1.0, 36.0, 0.1), (0.0, 10.0, 0.10)),
    model("3204", "HCS-3204", "HCS-3204", (1.0, 60.0, 0.1), (0.0, 5.0, 0.01)),
    model("3300", "HCS-3300", "HCS-3300-USB", (1.0, 16.0, 0.1), (0.0, 30.0, 0.10)),
    model("3302", "HCS-3302", "HCS-3302-USB", (1.0, 32.0, 0.1), (0.0, 15.0, 0.10)),
    model("3304", "HCS-3304", "HCS-3304-USB", (1.0, 60.0, 0.1), (0.0, 8.0, 0.10)),
    model("3400", "HCS-3400", "HCS-3400-USB", (1.0, 16.0, 0.1), (0.0, 40.0, 0.10)),
    model("3402", "HCS-3402", "HCS-3402-USB", (1.0, 32.0, 0.1), (0.0, 20.0, 0.10)),
    model("3404", "HCS-3404", "HCS-3404-USB", (1.0, 60.0, 0.1), (0.0, 10.0, 0.10)),
    model("3600", "HCS-3600", "HCS-3600-USB", (1.0, 16.0, 0.1), (0.0, 60.0, 0.10)),
    model("3602", "HCS-3602", "HCS-3602-USB", (1.0, 32.0, 0.1), (0.0, 30.0, 0.10)),
    model("3604", "HCS-3604", "HCS-3604-USB", (1.0, 60.0, 0.1), (0.0, 15.0, 0.10)),
];

fn find_model(id: &str) -> Option<&'static Model> {
    MODELS.iter().find(|m| m.ids.contains(&id))
}

/// A decoded `GETD` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub voltage: f32,
    pub current: f32,
    pub constant_current: bool,
}

fn strip_line_end(unit: &[u8]) -> &[u8] {
    unit.strip_suffix(b"\r").unwrap_or(unit)
}

/// Parses `VVVVCCCCM` (hundredths of volts and amps, then `0` for CV or `1`
/// for CC).
pub fn parse_reading(unit: &[u8]) -> Option<Reading> {
    let line = strip_line_end(unit);
    if line.len() != 9 {
        return None;
    }
    let voltage = parse_ascii_digits(&line[0..4])?;
    let current = parse_ascii_digits(&line[4..8])?;
    let constant_current = match line[8] {
        b'0' => false,
        b'1' => true,
        _ => return None,
    };
    Some(Reading {
        voltage: voltage as f32 / 100.0,
        current: current as f32 / 100.0,
        constant_current,
    })
}

/// Parses a `GMAX` reply `VVVCCC` into device maxima.
fn parse_maxima(unit: &[u8], model: &Model) -> Option<(f64, f64)> {
    let line = strip_line_end(unit);
    if line.len() != 6 {
        return None;
    }
    let voltage = parse_ascii_digits(&line[0..3])?;
    let current = parse_ascii_digits(&line[3..6])?;
    Some((
        f64::from(voltage) * model.voltage.2,
        f64::from(current) * model.current.2,
    ))
}

fn command(transport: &mut dyn Transport, cmd: &str) -> Result<(), TransportError> {
    log::debug!("{NAME}: sending {:?}.", cmd);
    let timeout = transport.io_timeout(cmd.len());
    transport.send(cmd.as_bytes(), timeout)
}

/// Blocks until a unit ending in `OK\r` arrives and returns it without the
/// `OK\r`.
fn read_reply(transport: &mut dyn Transport) -> Result<Vec<u8>, DeviceError> {
    let mut frames = TerminatedFrames::new(REPLY_END, BUF_LEN);
    let deadline = Instant::now() + REQUEST_TIMEOUT;
    let mut byte = [0u8; 1];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || transport.read_blocking(&mut byte, remaining)? == 0 {
            return Err(DeviceError::Handshake(format!(
                "no complete reply, got {:?}",
                String::from_utf8_lossy(frames.pending())
            )));
        }
        if let Some(unit) = frames.feed(byte[0]) {
            return Ok(unit);
        }
    }
}

fn query(transport: &mut dyn Transport, cmd: &str) -> Result<Vec<u8>, DeviceError> {
    command(transport, cmd)?;
    read_reply(transport)
}

const OPTIONS: [(ConfigKey, ConfigCap); 5] = [
    (ConfigKey::Voltage, ConfigCap::GET),
    (
        ConfigKey::VoltageTarget,
        ConfigCap::GET.union(ConfigCap::SET).union(ConfigCap::LIST),
    ),
    (ConfigKey::Current, ConfigCap::GET),
    (
        ConfigKey::CurrentLimit,
        ConfigCap::GET.union(ConfigCap::SET).union(ConfigCap::LIST),
    ),
    (ConfigKey::Enabled, ConfigCap::GET.union(ConfigCap::SET)),
];

#[derive(Debug)]
pub struct MansonContext {
    model: &'static Model,
    voltage_max_device: f64,
    current_max_device: f64,
    reading: Reading,
    voltage_target: f64,
    current_limit: f64,
    output_enabled: bool,
    frames: TerminatedFrames,
    tracker: ReplyTracker,
}

impl MansonContext {
    fn new(model: &'static Model, reading: Reading, maxima: (f64, f64)) -> Self {
        Self {
            model,
            voltage_max_device: maxima.0,
            current_max_device: maxima.1,
            reading,
            voltage_target: 0.0,
            current_limit: 0.0,
            // The supply reports 0 V while the output is off.
            output_enabled: reading.voltage != 0.0,
            frames: TerminatedFrames::new(REPLY_END, BUF_LEN),
            tracker: ReplyTracker::new(REQUEST_TIMEOUT),
        }
    }

    pub fn model(&self) -> &Model {
        self.model
    }

    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    fn update(&mut self, reading: Reading) {
        self.reading = reading;
        self.output_enabled = reading.voltage != 0.0;
    }

    fn emit(acq: &mut Acquisition<'_>, reading: &Reading) {
        acq.send(Analog::from_f32(
            &[reading.voltage],
            Meaning::new(Mq::Voltage, Unit::Volt, MqFlags::DC, 0),
            2,
        ));
        acq.send(Analog::from_f32(
            &[reading.current],
            Meaning::new(Mq::Current, Unit::Ampere, MqFlags::empty(), 0),
            2,
        ));
        acq.record_samples(1);
    }

    fn request(&mut self, acq: &mut Acquisition<'_>) -> Result<(), DeviceError> {
        let now = Instant::now();
        if self.tracker.should_request_at(now) {
            let transport = acq.transport()?;
            transport.send(GETD, transport.io_timeout(GETD.len()))?;
            self.tracker.mark_sent_at(now);
        }
        Ok(())
    }
}

#[allow(clippy::cast_sign_loss)]
fn steps(value: f64, step: f64) -> u32 {
    (value / step).round() as u32
}

impl DeviceContext for MansonContext {
    fn options(&self) -> &[(ConfigKey, ConfigCap)] {
        &OPTIONS
    }

    fn config_get(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::Voltage => Ok(ConfigValue::F64(f64::from(self.reading.voltage))),
            ConfigKey::Current => Ok(ConfigValue::F64(f64::from(self.reading.current))),
            ConfigKey::VoltageTarget => Ok(ConfigValue::F64(self.voltage_target)),
            ConfigKey::CurrentLimit => Ok(ConfigValue::F64(self.current_limit)),
            ConfigKey::Enabled => Ok(ConfigValue::Bool(self.output_enabled)),
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }

    fn config_set(
        &mut self,
        key: ConfigKey,
        value: &ConfigValue,
        _group: Option<&ChannelGroup>,
        transport: Option<&mut dyn Transport>,
    ) -> Result<(), DeviceError> {
        let transport =
            transport.ok_or_else(|| DeviceError::ClosedOrBusy(format!("{NAME} is not open")))?;
        match key {
            ConfigKey::VoltageTarget => {
                let volts = expect_f64(key, value)?;
                let (min, _, step) = self.model.voltage;
                check_range(key, volts, min, self.voltage_max_device)?;
                query(transport, &format!("VOLT{:03}\r", steps(volts, step)))?;
                self.voltage_target = volts;
            }
            ConfigKey::CurrentLimit => {
                let amps = expect_f64(key, value)?;
                let (min, _, step) = self.model.current;
                check_range(key, amps, min, self.current_max_device)?;
                query(transport, &format!("CURR{:03}\r", steps(amps, step)))?;
                self.current_limit = amps;
            }
            ConfigKey::Enabled => {
                let enabled = expect_bool(key, value)?;
                // SOUT0 switches the output on.
                query(transport, &format!("SOUT{}\r", u8::from(!enabled)))?;
                self.output_enabled = enabled;
            }
            _ => return Err(DeviceError::NotApplicable { key }),
        }
        Ok(())
    }

    fn config_list(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::VoltageTarget => Ok(ConfigValue::Range {
                min: self.model.voltage.0,
                max: self.voltage_max_device,
                step: self.model.voltage.2,
            }),
            ConfigKey::CurrentLimit => Ok(ConfigValue::Range {
                min: self.model.current.0,
                max: self.current_max_device,
                step: self.model.current.2,
            }),
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }

    fn acquisition_start(&mut self, acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError> {
        self.frames.reset();
        self.tracker.mark_received();
        self.request(acq)?;
        Ok(SourceSpec::readable(SOURCE_TIMEOUT))
    }

    fn receive(&mut self, acq: &mut Acquisition<'_>, event: Event) -> Result<(), DeviceError> {
        if !event.is_timeout() {
            let mut buf = [0u8; BUF_LEN];
            let n = acq.transport()?.read_nonblocking(&mut buf)?;
            for unit in self.frames.feed_all(&buf[..n]) {
                self.tracker.mark_received();
                match parse_reading(&unit) {
                    Some(reading) => {
                        log::trace!("{NAME}: {reading:?}");
                        self.update(reading);
                        Self::emit(acq, &reading);
                        if acq.limits_exceeded() {
                            break;
                        }
                    }
                    None => log::debug!("{NAME}: {}", ProtocolDesync::InvalidDigits(unit)),
                }
            }
        }
        if acq.limits_exceeded() {
            return Ok(());
        }
        self.request(acq)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn identify(transport: &mut dyn Transport) -> Result<MansonContext, DeviceError> {
    transport.flush()?;
    let id = query(transport, "GMOD\r")?;
    let id = String::from_utf8_lossy(strip_line_end(&id)).into_owned();
    let model = find_model(&id)
        .ok_or_else(|| DeviceError::Handshake(format!("unknown model id '{id}'")))?;

    let reading = query(transport, "GETD\r")?;
    let reading = parse_reading(&reading)
        .ok_or_else(|| DeviceError::Handshake("unreadable GETD reply".into()))?;

    let maxima = query(transport, "GMAX\r")?;
    let maxima = parse_maxima(&maxima, model)
        .ok_or_else(|| DeviceError::Handshake("unreadable GMAX reply".into()))?;

    Ok(MansonContext::new(model, reading, maxima))
}

#[derive(Debug, Default)]
pub struct MansonDriver;

impl Driver for MansonDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn long_name(&self) -> &'static str {
        "Manson HCS-3xxx"
    }

    fn scan_options(&self) -> &'static [ConfigKey] {
        &[ConfigKey::Conn, ConfigKey::SerialComm]
    }

    fn scan(&self, mut options: ScanOptions) -> Result<Vec<DeviceInstance>, DeviceError> {
        let mut devices = Vec::new();
        for candidate in options.serial_candidates(DEFAULT_SERIALCOMM, &[])? {
            log::info!("Probing serial port {}.", candidate.connection_id());
            let Some((context, transport)) = probe_serial(NAME, candidate, identify) else {
                continue;
            };
            let mut info = DeviceInfo::new(NAME, VENDOR, context.model.name)
                .with_connection_id(transport.connection_id());
            info.add_channel(ChannelType::Analog, "CH1");
            log::info!("Found {info}.");
            devices.push(DeviceInstance::new(info, Some(transport), context));
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::Packet;
    use crate::session::{Session, StopReason};
    use crate::transport::ScriptedTransport;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn scripted_supply() -> ScriptedTransport {
        let script = ScriptedTransport::new("mock0");
        script.reply_once(b"GMOD\r", b"3302\rOK\r");
        script.reply_once(b"GETD\r", b"000000000\rOK\r");
        script.reply_once(b"GMAX\r", b"320150\rOK\r");
        script
    }

    fn scanned(script: &ScriptedTransport) -> DeviceInstance {
        let mut devices = MansonDriver
            .scan(ScanOptions::new().with_transport(script.clone()))
            .unwrap();
        assert_eq!(devices.len(), 1);
        devices.remove(0)
    }

    #[test]
    fn test_parse_reading() {
        let reading = parse_reading(b"123405671\r").unwrap();
        assert!((reading.voltage - 12.34).abs() < 1e-6);
        assert!((reading.current - 5.67).abs() < 1e-6);
        assert!(reading.constant_current);

        assert!(parse_reading(b"12a405670\r").is_none());
        assert!(parse_reading(b"123405672\r").is_none());
        assert!(parse_reading(b"1234\r").is_none());
    }

    #[test]
    fn test_scan_reads_model_and_maxima() {
        let script = scripted_supply();
        let device = scanned(&script);
        assert_eq!(device.info().vendor, "Manson");
        assert_eq!(device.info().model, "HCS-3302-USB");
        assert_eq!(script.written(), b"GMOD\rGETD\rGMAX\r".to_vec());

        let Ok(ConfigValue::Range { min, max, step }) =
            device.config_list(ConfigKey::VoltageTarget, None)
        else {
            unreachable!("voltage target is listable");
        };
        assert!((min - 1.0).abs() < 1e-9);
        assert!((max - 32.0).abs() < 1e-9);
        assert!((step - 0.1).abs() < 1e-9);
        assert_eq!(
            device.config_get(ConfigKey::Enabled, None).unwrap(),
            ConfigValue::Bool(false)
        );
    }

    #[test]
    fn test_unknown_model_is_skipped() {
        let script = ScriptedTransport::new("mock0");
        script.reply_once(b"GMOD\r", b"9999\rOK\r");
        let devices = MansonDriver
            .scan(ScanOptions::new().with_transport(script))
            .unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_config_set_writes_commands() {
        let script = scripted_supply();
        let mut device = scanned(&script);
        assert!(matches!(
            device.config_set(ConfigKey::VoltageTarget, &ConfigValue::F64(12.3), None),
            Err(DeviceError::ClosedOrBusy(_))
        ));

        device.open().unwrap();
        script.take_written();
        script.reply_always(b"\r", b"OK\r");

        device
            .config_set(ConfigKey::VoltageTarget, &ConfigValue::F64(12.3), None)
            .unwrap();
        device
            .config_set(ConfigKey::CurrentLimit, &ConfigValue::F64(1.5), None)
            .unwrap();
        device
            .config_set(ConfigKey::Enabled, &ConfigValue::Bool(true), None)
            .unwrap();
        assert_eq!(script.take_written(), b"VOLT123\rCURR015\rSOUT0\r".to_vec());
        assert_eq!(
            device.config_get(ConfigKey::VoltageTarget, None).unwrap(),
            ConfigValue::F64(12.3)
        );

        assert!(matches!(
            device.config_set(ConfigKey::VoltageTarget, &ConfigValue::F64(40.0), None),
            Err(DeviceError::Argument(_))
        ));
        assert!(script.written().is_empty());
    }

    #[test]
    fn test_polls_until_sample_limit() {
        let script = scripted_supply();
        let mut device = scanned(&script);
        device
            .config_set(ConfigKey::LimitSamples, &ConfigValue::U64(3), None)
            .unwrap();
        device.open().unwrap();
        script.take_written();
        script.reply_always(GETD, b"123405670\rOK\r");

        let mut session = Session::new();
        let values = Rc::new(RefCell::new(Vec::new()));
        let sink_values = Rc::clone(&values);
        session.add_sink(move |_: &DeviceInfo, p: &Packet| {
            if let Packet::Analog(analog) = p {
                sink_values.borrow_mut().extend(analog.to_f32().unwrap());
            }
        });
        let id = session.add_device(device);
        session.start().unwrap();
        session.run().unwrap();

        assert_eq!(session.stop_reason(id), Some(&StopReason::Limits));
        // No poll goes out after the reading that reached the limit.
        assert_eq!(script.written(), GETD.repeat(3));
        let values = values.borrow();
        assert_eq!(values.len(), 6);
        assert!((values[0] - 12.34).abs() < 1e-6);
        assert!((values[1] - 5.67).abs() < 1e-6);
        let context = session
            .device(id)
            .unwrap()
            .context::<MansonContext>()
            .unwrap();
        assert!(!context.reading().constant_current);
    }

    #[test]
    fn test_burst_of_replies_stops_at_sample_limit() {
        let script = scripted_supply();
        let mut device = scanned(&script);
        device
            .config_set(ConfigKey::LimitSamples, &ConfigValue::U64(1), None)
            .unwrap();
        device.open().unwrap();
        script.take_written();

        let mut session = Session::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = Rc::clone(&seen);
        session.add_sink(move |_: &DeviceInfo, p: &Packet| sink_seen.borrow_mut().push(p.clone()));
        let id = session.add_device(device);
        session.start().unwrap();
        script.push_rx(b"123405670\rOK\r100002001\rOK\r");
        session.run().unwrap();

        assert_eq!(session.stop_reason(id), Some(&StopReason::Limits));
        let values: Vec<f32> = seen
            .borrow()
            .iter()
            .filter_map(|p| match p {
                Packet::Analog(analog) => Some(analog.to_f32().unwrap()[0]),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 12.34).abs() < 1e-6);
        assert!((values[1] - 5.67).abs() < 1e-6);
        assert!(matches!(seen.borrow().last(), Some(Packet::End)));
        assert_eq!(script.written(), GETD.to_vec());
    }

    #[test]
    fn test_overflow_discards_until_next_reply_end() {
        let mut context = MansonContext::new(&MODELS[8], Reading::default(), (32.0, 15.0));
        let mut stream = vec![b'x'; 60];
        stream.extend_from_slice(b"OK\r");
        stream.extend_from_slice(b"123405670\rOK\r");
        let units = context.frames.feed_all(&stream);
        assert_eq!(units, vec![b"123405670\r".to_vec()]);
    }
}
