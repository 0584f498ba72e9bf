//! Programmable power supplies that stream fixed-size binary status frames.
//!
//! Every frame is 19 bytes: a `0xAA` sync byte, a token, 16 payload bytes
//! and a `0x64` trailer. Once streaming is switched on the supply sends a
//! STATUS frame on its own cadence; the host only writes to change the
//! output settings.

use super::{check_range, expect_bool, expect_f64};
use crate::acquisition::{Acquisition, SourceSpec};
use crate::analog::{Analog, Meaning, Mq, MqFlags, Unit};
use crate::config::{ConfigCap, ConfigKey, ConfigValue};
use crate::device::{ChannelGroup, ChannelType, DeviceContext, DeviceError, DeviceInfo, DeviceInstance};
use crate::driver::{probe_serial, Driver, ScanOptions};
use crate::event_loop::Event;
use crate::protocol::{FrameDecoder, ProtocolDesync};
use crate::transport::Transport;
use std::any::Any;
use std::time::Duration;

pub const NAME: &str = "status-psu";
const VENDOR: &str = "Generic";
const DEFAULT_SERIALCOMM: &str = "9600/8n1";
/// CH340 USB-serial bridge used by these supplies.
const USB_IDS: [(u16, u16); 1] = [(0x1a86, 0x7523)];

pub const FRAME_LEN: usize = 19;
const SYNC: u8 = 0xaa;
const TRAILER: u8 = 0x64;
const PAYLOAD_LEN: usize = FRAME_LEN - 3;

const SCAN_TIMEOUT: Duration = Duration::from_millis(300);
const SOURCE_TIMEOUT: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 64;

const STATUS_OUTPUT_ENABLED: u16 = 1 << 1;
const STATUS_CONSTANT_CURRENT: u16 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Token {
    Ident = 0x01,
    StreamOn = 0x10,
    StreamOff = 0x11,
    Status = 0x20,
    SetOutput = 0x21,
}

impl Token {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Token::Ident),
            0x10 => Some(Token::StreamOn),
            0x11 => Some(Token::StreamOff),
            0x20 => Some(Token::Status),
            0x21 => Some(Token::SetOutput),
            _ => None,
        }
    }
}

/// Builds a frame around `payload`; payload bytes past 16 are dropped.
pub fn encode(token: Token, payload: &[u8]) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = SYNC;
    frame[1] = token as u8;
    let n = payload.len().min(PAYLOAD_LEN);
    frame[2..2 + n].copy_from_slice(&payload[..n]);
    frame[FRAME_LEN - 1] = TRAILER;
    frame
}

/// A decoded STATUS frame in physical units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Status {
    pub output_enabled: bool,
    pub constant_current: bool,
    pub voltage: f32,
    pub voltage_target: f32,
    pub current_limit: f32,
    pub current: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Status(Status),
    Ident { model_id: u16 },
    Ack(Token),
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn scaled(raw: u32, divisor: f64) -> f32 {
    (f64::from(raw) / divisor) as f32
}

fn decode(frame: &[u8; FRAME_LEN]) -> Option<Reply> {
    match Token::from_byte(frame[1])? {
        Token::Status => {
            let flags = be_u16(&frame[2..4]);
            Some(Reply::Status(Status {
                output_enabled: flags & STATUS_OUTPUT_ENABLED != 0,
                constant_current: flags & STATUS_CONSTANT_CURRENT != 0,
                voltage: scaled(be_u32(&frame[4..8]), 100.0),
                voltage_target: scaled(be_u32(&frame[8..12]), 100.0),
                current_limit: scaled(be_u32(&frame[12..16]), 1000.0),
                current: scaled(u32::from(be_u16(&frame[16..18])), 1000.0),
            }))
        }
        Token::Ident => Some(Reply::Ident {
            model_id: be_u16(&frame[2..4]),
        }),
        token => Some(Reply::Ack(token)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    AwaitSync,
    AwaitToken,
    AwaitPayload,
}

/// Reassembles frames from arbitrarily fragmented input.
#[derive(Debug, Clone)]
pub struct StatusParser {
    state: ParseState,
    frame: [u8; FRAME_LEN],
    len: usize,
}

impl Default for StatusParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::AwaitSync,
            frame: [0; FRAME_LEN],
            len: 0,
        }
    }

    fn desync(&mut self, reason: ProtocolDesync) {
        log::debug!("{NAME}: {reason}, resynchronizing.");
        self.reset();
    }
}

impl FrameDecoder for StatusParser {
    type Output = Reply;

    fn feed(&mut self, byte: u8) -> Option<Reply> {
        match self.state {
            ParseState::AwaitSync => {
                if byte == SYNC {
                    self.frame[0] = byte;
                    self.len = 1;
                    self.state = ParseState::AwaitToken;
                }
                None
            }
            ParseState::AwaitToken => {
                if byte == SYNC {
                    // A second sync byte starts the frame over.
                    self.len = 1;
                } else if Token::from_byte(byte).is_some() {
                    self.frame[1] = byte;
                    self.len = 2;
                    self.state = ParseState::AwaitPayload;
                } else {
                    self.desync(ProtocolDesync::UnknownToken(byte));
                }
                None
            }
            ParseState::AwaitPayload => {
                self.frame[self.len] = byte;
                self.len += 1;
                if self.len < FRAME_LEN {
                    return None;
                }
                let frame = self.frame;
                self.reset();
                if frame[FRAME_LEN - 1] != TRAILER {
                    self.desync(ProtocolDesync::BadTrailer(frame[FRAME_LEN - 1]));
                    return None;
                }
                decode(&frame)
            }
        }
    }

    fn reset(&mut self) {
        self.state = ParseState::AwaitSync;
        self.len = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Model {
    pub id: u16,
    pub name: &'static str,
    /// Maximum output voltage in V.
    pub max_voltage: f64,
    /// Maximum output current in A.
    pub max_current: f64,
}

pub const MODELS: [Model; 3] = [
    Model {
        id: 0x0001,
        name: "PSU-3005",
        max_voltage: 30.0,
        max_current: 5.0,
    },
    Model {
        id: 0x0002,
        name: "PSU-3010",
        max_voltage: 30.0,
        max_current: 10.0,
    },
    Model {
        id: 0x0003,
        name: "PSU-6005",
        max_voltage: 60.0,
        max_current: 5.0,
    },
];

const VOLTAGE_STEP: f64 = 0.01;
const CURRENT_STEP: f64 = 0.001;

const OPTIONS: [(ConfigKey, ConfigCap); 6] = [
    (ConfigKey::Voltage, ConfigCap::GET),
    (ConfigKey::Current, ConfigCap::GET),
    (
        ConfigKey::VoltageTarget,
        ConfigCap::GET.union(ConfigCap::SET).union(ConfigCap::LIST),
    ),
    (
        ConfigKey::CurrentLimit,
        ConfigCap::GET.union(ConfigCap::SET).union(ConfigCap::LIST),
    ),
    (ConfigKey::Enabled, ConfigCap::GET.union(ConfigCap::SET)),
    (ConfigKey::Regulation, ConfigCap::GET),
];

#[derive(Debug)]
pub struct StatusPsuContext {
    model: Model,
    parser: StatusParser,
    status: Status,
    voltage_target: f64,
    current_limit: f64,
    output_enabled: bool,
    dirty: bool,
    acquiring: bool,
}

impl StatusPsuContext {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            parser: StatusParser::new(),
            status: Status::default(),
            voltage_target: 0.0,
            current_limit: 0.0,
            output_enabled: false,
            dirty: false,
            acquiring: false,
        }
    }

    /// The most recent STATUS frame.
    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// SET_OUTPUT reuses the STATUS field layout.
    #[allow(clippy::cast_sign_loss)]
    fn set_output_frame(&self) -> [u8; FRAME_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        let flags = if self.output_enabled { STATUS_OUTPUT_ENABLED } else { 0 };
        payload[0..2].copy_from_slice(&flags.to_be_bytes());
        let voltage = (self.voltage_target * 100.0).round() as u32;
        let current = (self.current_limit * 1000.0).round() as u32;
        payload[2..6].copy_from_slice(&voltage.to_be_bytes());
        payload[10..14].copy_from_slice(&current.to_be_bytes());
        encode(Token::SetOutput, &payload)
    }

    fn write_output(&mut self, transport: &mut dyn Transport) -> Result<(), DeviceError> {
        let frame = self.set_output_frame();
        transport.send(&frame, transport.io_timeout(FRAME_LEN))?;
        self.dirty = false;
        Ok(())
    }

    fn emit(acq: &mut Acquisition<'_>, status: &Status) {
        acq.frame_begin();
        acq.send(Analog::from_f32(
            &[status.voltage],
            Meaning::new(Mq::Voltage, Unit::Volt, MqFlags::DC, 0),
            2,
        ));
        acq.send(Analog::from_f32(
            &[status.current],
            Meaning::new(Mq::Current, Unit::Ampere, MqFlags::DC, 1),
            3,
        ));
        acq.frame_end();
        acq.record_samples(1);
    }
}

impl DeviceContext for StatusPsuContext {
    fn options(&self) -> &[(ConfigKey, ConfigCap)] {
        &OPTIONS
    }

    fn config_get(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::Voltage => Ok(ConfigValue::F64(f64::from(self.status.voltage))),
            ConfigKey::Current => Ok(ConfigValue::F64(f64::from(self.status.current))),
            ConfigKey::VoltageTarget => Ok(ConfigValue::F64(self.voltage_target)),
            ConfigKey::CurrentLimit => Ok(ConfigValue::F64(self.current_limit)),
            ConfigKey::Enabled => Ok(ConfigValue::Bool(self.output_enabled)),
            ConfigKey::Regulation => Ok(ConfigValue::Str(
                if self.status.constant_current { "CC" } else { "CV" }.to_string(),
            )),
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
        match key {
            ConfigKey::VoltageTarget => {
                let volts = expect_f64(key, value)?;
                check_range(key, volts, 0.0, self.model.max_voltage)?;
                self.voltage_target = volts;
            }
            ConfigKey::CurrentLimit => {
                let amps = expect_f64(key, value)?;
                check_range(key, amps, 0.0, self.model.max_current)?;
                self.current_limit = amps;
            }
            ConfigKey::Enabled => self.output_enabled = expect_bool(key, value)?,
            _ => return Err(DeviceError::NotApplicable { key }),
        }

        match transport {
            Some(transport) if self.acquiring => self.write_output(transport),
            _ => {
                self.dirty = true;
                Ok(())
            }
        }
    }

    fn config_list(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::VoltageTarget => Ok(ConfigValue::Range {
                min: 0.0,
                max: self.model.max_voltage,
                step: VOLTAGE_STEP,
            }),
            ConfigKey::CurrentLimit => Ok(ConfigValue::Range {
                min: 0.0,
                max: self.model.max_current,
                step: CURRENT_STEP,
            }),
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }

    fn on_close(&mut self, transport: Option<&mut dyn Transport>) -> Result<(), DeviceError> {
        match transport {
            Some(transport) if self.dirty => self.write_output(transport),
            _ => Ok(()),
        }
    }

    fn acquisition_start(&mut self, acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError> {
        self.parser.reset();
        let transport = acq.transport()?;
        transport.send(&encode(Token::StreamOn, &[]), transport.io_timeout(FRAME_LEN))?;
        self.acquiring = true;
        Ok(SourceSpec::readable(SOURCE_TIMEOUT))
    }

    fn receive(&mut self, acq: &mut Acquisition<'_>, _event: Event) -> Result<(), DeviceError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = acq.transport()?.read_nonblocking(&mut buf)?;
        for reply in self.parser.feed_all(&buf[..n]) {
            match reply {
                Reply::Status(status) => {
                    self.status = status;
                    Self::emit(acq, &status);
                    if acq.limits_exceeded() {
                        break;
                    }
                }
                other => log::trace!("{NAME}: ignoring {other:?}."),
            }
        }
        Ok(())
    }

    fn acquisition_stop(&mut self, acq: &mut Acquisition<'_>) -> Result<(), DeviceError> {
        self.acquiring = false;
        let transport = acq.transport()?;
        transport.send(&encode(Token::StreamOff, &[]), transport.io_timeout(FRAME_LEN))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn identify(transport: &mut dyn Transport) -> Result<Model, DeviceError> {
    transport.flush()?;
    let timeout = transport.io_timeout(FRAME_LEN);
    transport.send(&encode(Token::Ident, &[]), timeout)?;

    let mut frame = [0u8; FRAME_LEN];
    let n = transport.read_blocking(&mut frame, SCAN_TIMEOUT)?;
    let mut parser = StatusParser::new();
    match parser.feed_all(&frame[..n]).first() {
        Some(Reply::Ident { model_id }) => MODELS
            .iter()
            .find(|m| m.id == *model_id)
            .copied()
            .ok_or_else(|| DeviceError::Handshake(format!("unknown model id 0x{model_id:04x}"))),
        _ => Err(DeviceError::Handshake(format!(
            "no identification frame in {:02x?}",
            &frame[..n]
        ))),
    }
}

#[derive(Debug, Default)]
pub struct StatusPsuDriver;

impl Driver for StatusPsuDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn long_name(&self) -> &'static str {
        "Power supplies with binary status streaming"
    }

    fn scan_options(&self) -> &'static [ConfigKey] {
        &[ConfigKey::Conn, ConfigKey::SerialComm]
    }

    fn scan(&self, mut options: ScanOptions) -> Result<Vec<DeviceInstance>, DeviceError> {
        let mut devices = Vec::new();
        for candidate in options.serial_candidates(DEFAULT_SERIALCOMM, &USB_IDS)? {
            let Some((model, transport)) = probe_serial(NAME, candidate, identify) else {
                continue;
            };
            let mut info = DeviceInfo::new(NAME, VENDOR, model.name)
                .with_connection_id(transport.connection_id());
            info.add_channel(ChannelType::Analog, "V");
            info.add_channel(ChannelType::Analog, "I");
            log::info!("Found {info}.");
            devices.push(DeviceInstance::new(info, Some(transport), StatusPsuContext::new(model)));
        }
        Ok(devices)
    }
}
