//! CEM DT-885x sound level meters.
//!
//! The meter streams on its own. Each setting or reading arrives as
//! `0xA5 <token> <payload>`, with the payload length fixed per token. While
//! the display is held the meter sends nothing but `0xFF`.

use crate::acquisition::{Acquisition, SourceSpec};
use crate::analog::{Analog, Meaning, Mq, MqFlags, Unit};
use crate::config::{ConfigCap, ConfigKey, ConfigValue};
use crate::device::{ChannelGroup, ChannelType, DeviceContext, DeviceError, DeviceInfo, DeviceInstance};
use crate::driver::{probe_serial, Driver, ScanOptions};
use crate::event_loop::Event;
use crate::protocol::{bcd_digits, Accumulator, FrameDecoder, ProtocolDesync, RateLimiter};
use crate::transport::Transport;
use std::any::Any;
use std::time::{Duration, Instant};

pub const NAME: &str = "cem-dt-885x";
const VENDOR: &str = "CEM";
const MODEL: &str = "DT-885x";
const DEFAULT_SERIALCOMM: &str = "9600/8n1";

const CMD_MEASUREMENT: u8 = 0xa5;
const CMD_LOG_DOWNLOAD: u8 = 0xbb;
const HOLD_MARKER: u8 = 0xff;

const BUF_SIZE: usize = 32;
const HOLD_REPEAT_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SCAN_TIME: Duration = Duration::from_secs(1);
const SOURCE_TIMEOUT: Duration = Duration::from_millis(150);
const READ_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Token {
    WeightTimeFast = 0x02,
    WeightTimeSlow = 0x03,
    HoldMax = 0x04,
    HoldMin = 0x05,
    Time = 0x06,
    MeasRangeOver = 0x07,
    MeasRangeUnder = 0x08,
    StoreFull = 0x09,
    RecordingOn = 0x0a,
    MeasWasReadout = 0x0b,
    MeasWasBargraph = 0x0c,
    Measurement = 0x0d,
    HoldNone = 0x0e,
    BatteryLow = 0x0f,
    MeasRangeOk = 0x11,
    StoreOk = 0x19,
    RecordingOff = 0x1a,
    WeightFreqA = 0x1b,
    WeightFreqC = 0x1c,
    BatteryOk = 0x1f,
    MeasRange30To80 = 0x30,
    MeasRange30To130 = 0x40,
    MeasRange50To100 = 0x4b,
    MeasRange80To130 = 0x4c,
}

const TOKENS: [Token; 24] = [
    Token::WeightTimeFast,
    Token::WeightTimeSlow,
    Token::HoldMax,
    Token::HoldMin,
    Token::Time,
    Token::MeasRangeOver,
    Token::MeasRangeUnder,
    Token::StoreFull,
    Token::RecordingOn,
    Token::MeasWasReadout,
    Token::MeasWasBargraph,
    Token::Measurement,
    Token::HoldNone,
    Token::BatteryLow,
    Token::MeasRangeOk,
    Token::StoreOk,
    Token::RecordingOff,
    Token::WeightFreqA,
    Token::WeightFreqC,
    Token::BatteryOk,
    Token::MeasRange30To80,
    Token::MeasRange30To130,
    Token::MeasRange50To100,
    Token::MeasRange80To130,
];

impl Token {
    pub fn from_byte(byte: u8) -> Option<Self> {
        TOKENS.iter().copied().find(|t| *t as u8 == byte)
    }

    /// Payload bytes following the token.
    pub fn payload_len(self) -> usize {
        match self {
            Token::Time => 3,
            Token::Measurement => 2,
            Token::MeasWasReadout | Token::WeightFreqA | Token::WeightFreqC => 1,
            _ => 0,
        }
    }

    /// The `(low, high)` dB range this token selects.
    fn range(self) -> Option<(u64, u64)> {
        match self {
            Token::MeasRange30To80 => Some((30, 80)),
            Token::MeasRange30To130 => Some((30, 130)),
            Token::MeasRange50To100 => Some((50, 100)),
            Token::MeasRange80To130 => Some((80, 130)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Setting { token: Token, payload: Vec<u8> },
    /// The display is still held; the last reading is due again.
    HoldRepeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Init,
    AwaitToken,
    Payload(Token),
    Unknown(u8),
}

/// Splits the meter's byte stream into records.
#[derive(Debug, Clone)]
pub struct DtParser {
    state: ParseState,
    payload: Accumulator,
    hold: RateLimiter,
    in_hold: bool,
}

impl Default for DtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DtParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Init,
            payload: Accumulator::new(BUF_SIZE),
            hold: RateLimiter::new(HOLD_REPEAT_INTERVAL),
            in_hold: false,
        }
    }

    /// Whether the last byte seen was a hold marker.
    pub fn in_hold(&self) -> bool {
        self.in_hold
    }

    fn start_command(&mut self, byte: u8) {
        self.payload.clear();
        self.state = match byte {
            CMD_MEASUREMENT => ParseState::AwaitToken,
            CMD_LOG_DOWNLOAD => {
                log::debug!("{NAME}: ignoring stored-log transfer.");
                ParseState::Init
            }
            _ => ParseState::Init,
        };
    }

    pub fn feed_at(&mut self, byte: u8, now: Instant) -> Option<Record> {
        if byte == HOLD_MARKER {
            if !self.in_hold {
                // The meter starts from scratch once the hold is released.
                self.in_hold = true;
                self.hold.arm_at(now);
                self.state = ParseState::Init;
                self.payload.clear();
                return None;
            }
            return self.hold.ready_at(now).then_some(Record::HoldRepeat);
        }
        self.in_hold = false;
        self.hold.reset();

        match self.state {
            ParseState::Init => {
                self.start_command(byte);
                None
            }
            ParseState::AwaitToken => match Token::from_byte(byte) {
                Some(token) if token.payload_len() == 0 => {
                    self.state = ParseState::Init;
                    Some(Record::Setting {
                        token,
                        payload: Vec::new(),
                    })
                }
                Some(token) => {
                    self.state = ParseState::Payload(token);
                    None
                }
                None => {
                    self.state = ParseState::Unknown(byte);
                    None
                }
            },
            ParseState::Payload(token) => {
                if self.payload.push(byte).is_err() {
                    self.state = ParseState::Init;
                    return None;
                }
                if self.payload.len() < token.payload_len() {
                    return None;
                }
                self.state = ParseState::Init;
                Some(Record::Setting {
                    token,
                    payload: self.payload.take(),
                })
            }
            ParseState::Unknown(token) => {
                if byte == CMD_MEASUREMENT || byte == CMD_LOG_DOWNLOAD {
                    log::debug!(
                        "{NAME}: {} with payload {:02x?}.",
                        ProtocolDesync::UnknownToken(token),
                        self.payload.as_slice()
                    );
                    self.start_command(byte);
                } else if let Err(desync) = self.payload.push(byte) {
                    log::debug!("{NAME}: {desync}, resynchronizing.");
                    self.state = ParseState::Init;
                }
                None
            }
        }
    }
}

impl FrameDecoder for DtParser {
    type Output = Record;

    fn feed(&mut self, byte: u8) -> Option<Record> {
        self.feed_at(byte, Instant::now())
    }

    fn reset(&mut self) {
        self.state = ParseState::Init;
        self.payload.clear();
        self.hold.reset();
        self.in_hold = false;
    }
}

/// Decodes the `d1 d2 d3 . d4` dB reading.
pub fn decode_spl(payload: &[u8]) -> Option<f32> {
    let [first, second] = payload else {
        return None;
    };
    let (d1, d2) = bcd_digits(*first)?;
    let (d3, d4) = bcd_digits(*second)?;
    let tenths = u16::from(d1) * 1000 + u16::from(d2) * 100 + u16::from(d3) * 10 + u16::from(d4);
    Some(f32::from(tenths) / 10.0)
}

const LIST: ConfigCap = ConfigCap::GET.union(ConfigCap::LIST);

const OPTIONS: [(ConfigKey, ConfigCap); 5] = [
    (ConfigKey::SplWeightFreq, LIST),
    (ConfigKey::SplWeightTime, LIST),
    (ConfigKey::HoldMax, ConfigCap::GET),
    (ConfigKey::HoldMin, ConfigCap::GET),
    (ConfigKey::SplMeasurementRange, ConfigCap::GET),
];

#[derive(Debug)]
pub struct DtContext {
    parser: DtParser,
    mqflags: MqFlags,
    last_spl: Option<f32>,
    meas_range: Option<(u64, u64)>,
    recording: Option<bool>,
}

impl Default for DtContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DtContext {
    pub fn new() -> Self {
        Self {
            parser: DtParser::new(),
            mqflags: MqFlags::empty(),
            last_spl: None,
            meas_range: None,
            recording: None,
        }
    }

    pub fn mqflags(&self) -> MqFlags {
        if self.parser.in_hold() {
            self.mqflags | MqFlags::HOLD
        } else {
            self.mqflags
        }
    }

    pub fn last_spl(&self) -> Option<f32> {
        self.last_spl
    }

    pub fn is_recording(&self) -> Option<bool> {
        self.recording
    }

    fn set_flags(&mut self, set: MqFlags, clear: MqFlags) {
        self.mqflags.remove(clear);
        self.mqflags.insert(set);
    }

    fn emit(&self, acq: &mut Acquisition<'_>) {
        let Some(spl) = self.last_spl else {
            return;
        };
        acq.send(Analog::from_f32(
            &[spl],
            Meaning::new(Mq::SoundPressureLevel, Unit::DecibelSpl, self.mqflags(), 0),
            1,
        ));
        acq.record_samples(1);
    }

    fn apply(&mut self, acq: &mut Acquisition<'_>, record: Record) {
        let (token, payload) = match record {
            Record::HoldRepeat => {
                self.emit(acq);
                return;
            }
            Record::Setting { token, payload } => (token, payload),
        };
        log::trace!("{NAME}: token {token:?} payload {payload:02x?}");

        match token {
            Token::WeightTimeFast => {
                self.set_flags(MqFlags::SPL_TIME_WEIGHT_F, MqFlags::SPL_TIME_WEIGHT_S);
            }
            Token::WeightTimeSlow => {
                self.set_flags(MqFlags::SPL_TIME_WEIGHT_S, MqFlags::SPL_TIME_WEIGHT_F);
            }
            Token::WeightFreqA => {
                self.set_flags(MqFlags::SPL_FREQ_WEIGHT_A, MqFlags::SPL_FREQ_WEIGHT_C);
            }
            Token::WeightFreqC => {
                self.set_flags(MqFlags::SPL_FREQ_WEIGHT_C, MqFlags::SPL_FREQ_WEIGHT_A);
            }
            Token::HoldMax => self.set_flags(MqFlags::HOLD | MqFlags::MAX, MqFlags::MIN),
            Token::HoldMin => self.set_flags(MqFlags::HOLD | MqFlags::MIN, MqFlags::MAX),
            Token::HoldNone => {
                self.set_flags(MqFlags::empty(), MqFlags::MAX | MqFlags::MIN | MqFlags::HOLD);
            }
            Token::Measurement => {
                self.last_spl = decode_spl(&payload);
                if self.last_spl.is_none() {
                    log::debug!("{NAME}: {}", ProtocolDesync::InvalidDigits(payload));
                }
            }
            Token::MeasWasBargraph
                if self.mqflags.intersects(MqFlags::MAX | MqFlags::MIN) =>
            {
                // The display ignores bargraph readings in min/max hold.
            }
            Token::MeasWasReadout | Token::MeasWasBargraph => self.emit(acq),
            Token::RecordingOn => self.recording = Some(true),
            Token::RecordingOff => self.recording = Some(false),
            Token::MeasRange30To80
            | Token::MeasRange30To130
            | Token::MeasRange50To100
            | Token::MeasRange80To130 => self.meas_range = token.range(),
            Token::Time
            | Token::StoreOk
            | Token::StoreFull
            | Token::BatteryOk
            | Token::BatteryLow
            | Token::MeasRangeOk
            | Token::MeasRangeOver
            | Token::MeasRangeUnder => {}
        }
    }

    /// Runs `bytes` received at `now` through the parser. Bytes after the
    /// reading that reaches a software limit are dropped.
    pub fn process_at(&mut self, acq: &mut Acquisition<'_>, bytes: &[u8], now: Instant) {
        for byte in bytes {
            if let Some(record) = self.parser.feed_at(*byte, now) {
                self.apply(acq, record);
                if acq.limits_exceeded() {
                    break;
                }
            }
        }
    }
}

impl DeviceContext for DtContext {
    fn options(&self) -> &[(ConfigKey, ConfigCap)] {
        &OPTIONS
    }

    fn config_get(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        let flags = self.mqflags;
        let unknown = || DeviceError::NotApplicable { key };
        match key {
            ConfigKey::SplWeightFreq => {
                if flags.contains(MqFlags::SPL_FREQ_WEIGHT_A) {
                    Ok(ConfigValue::Str("A".into()))
                } else if flags.contains(MqFlags::SPL_FREQ_WEIGHT_C) {
                    Ok(ConfigValue::Str("C".into()))
                } else {
                    Err(unknown())
                }
            }
            ConfigKey::SplWeightTime => {
                if flags.contains(MqFlags::SPL_TIME_WEIGHT_F) {
                    Ok(ConfigValue::Str("F".into()))
                } else if flags.contains(MqFlags::SPL_TIME_WEIGHT_S) {
                    Ok(ConfigValue::Str("S".into()))
                } else {
                    Err(unknown())
                }
            }
            ConfigKey::HoldMax => Ok(ConfigValue::Bool(flags.contains(MqFlags::MAX))),
            ConfigKey::HoldMin => Ok(ConfigValue::Bool(flags.contains(MqFlags::MIN))),
            ConfigKey::SplMeasurementRange => self
                .meas_range
                .map(|(low, high)| ConfigValue::Span(low, high))
                .ok_or_else(unknown),
            _ => Err(unknown()),
        }
    }

    fn config_set(
        &mut self,
        key: ConfigKey,
        _value: &ConfigValue,
        _group: Option<&ChannelGroup>,
        _transport: Option<&mut dyn Transport>,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::NotApplicable { key })
    }

    fn config_list(
        &self,
        key: ConfigKey,
        _group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::SplWeightFreq => Ok(ConfigValue::StrList(vec!["A".into(), "C".into()])),
            ConfigKey::SplWeightTime => Ok(ConfigValue::StrList(vec!["F".into(), "S".into()])),
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }

    fn acquisition_start(&mut self, _acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError> {
        self.parser.reset();
        Ok(SourceSpec::readable(SOURCE_TIMEOUT))
    }

    fn receive(&mut self, acq: &mut Acquisition<'_>, event: Event) -> Result<(), DeviceError> {
        if event.is_timeout() {
            return Ok(());
        }
        let mut buf = [0u8; READ_CHUNK];
        let n = acq.transport()?.read_nonblocking(&mut buf)?;
        self.process_at(acq, &buf[..n], Instant::now());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Listens for a command byte; the meter talks without being asked.
fn listen(transport: &mut dyn Transport) -> Result<(), DeviceError> {
    let deadline = Instant::now() + MAX_SCAN_TIME;
    let mut buf = [0u8; READ_CHUNK];
    while Instant::now() < deadline {
        let n = transport.read_nonblocking(&mut buf)?;
        if buf[..n].contains(&CMD_MEASUREMENT) {
            return Ok(());
        }
        // About one byte arrives per millisecond.
        std::thread::sleep(Duration::from_millis(1));
    }
    Err(DeviceError::Handshake(format!(
        "no 0x{CMD_MEASUREMENT:02x} within {MAX_SCAN_TIME:?}"
    )))
}

#[derive(Debug, Default)]
pub struct DtDriver;

impl Driver for DtDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn long_name(&self) -> &'static str {
        "CEM DT-885x"
    }

    fn scan_options(&self) -> &'static [ConfigKey] {
        &[ConfigKey::Conn]
    }

    fn scan(&self, mut options: ScanOptions) -> Result<Vec<DeviceInstance>, DeviceError> {
        let mut devices = Vec::new();
        for candidate in options.serial_candidates(DEFAULT_SERIALCOMM, &[])? {
            let Some(((), transport)) = probe_serial(NAME, candidate, listen) else {
                continue;
            };
            let mut info =
                DeviceInfo::new(NAME, VENDOR, MODEL).with_connection_id(transport.connection_id());
            info.add_channel(ChannelType::Analog, "SPL");
            log::info!("Found {info}.");
            devices.push(DeviceInstance::new(info, Some(transport), DtContext::new()));
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::Packet;
    use crate::pipeline::Pipeline;
    use crate::sw_limits::{LimitDimension, SoftwareLimits};
    use crate::transport::ScriptedTransport;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Harness {
        info: DeviceInfo,
        limits: SoftwareLimits,
        pipeline: Pipeline,
        seen: Rc<RefCell<Vec<Analog>>>,
    }

    impl Harness {
        fn new() -> Self {
            let mut info = DeviceInfo::new(NAME, VENDOR, MODEL);
            info.add_channel(ChannelType::Analog, "SPL");
            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink_seen = Rc::clone(&seen);
            let mut pipeline = Pipeline::new();
            pipeline.add_sink(move |_: &DeviceInfo, p: &Packet| {
                if let Packet::Analog(analog) = p {
                    sink_seen.borrow_mut().push(analog.clone());
                }
            });
            Self {
                info,
                limits: SoftwareLimits::new(),
                pipeline,
                seen,
            }
        }

        fn process(&mut self, context: &mut DtContext, bytes: &[u8], now: Instant) {
            let mut acq = Acquisition::new(&self.info, None, &mut self.limits, &mut self.pipeline, None);
            context.process_at(&mut acq, bytes, now);
        }

        fn values(&self) -> Vec<f32> {
            self.seen
                .borrow()
                .iter()
                .flat_map(|a| a.to_f32().unwrap())
                .collect()
        }
    }

    const READING_94_5: [u8; 7] = [0xa5, 0x0d, 0x09, 0x45, 0xa5, 0x0b, 0x00];

    #[test]
    fn test_decode_spl() {
        assert_eq!(decode_spl(&[0x09, 0x45]), Some(94.5));
        assert_eq!(decode_spl(&[0x12, 0x03]), Some(120.3));
        assert_eq!(decode_spl(&[0x0a, 0x45]), None);
        assert_eq!(decode_spl(&[0x09]), None);
    }

    #[test]
    fn test_readout_carries_weighting_flags() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        let now = Instant::now();
        harness.process(&mut context, &[0xa5, 0x1b, 0x00, 0xa5, 0x02], now);
        harness.process(&mut context, &READING_94_5, now);

        assert_eq!(harness.values(), vec![94.5]);
        let flags = harness.seen.borrow()[0].meaning.mqflags;
        assert_eq!(flags, MqFlags::SPL_FREQ_WEIGHT_A | MqFlags::SPL_TIME_WEIGHT_F);
        assert_eq!(harness.limits.samples_read(), 1);
        assert_eq!(
            context.config_get(ConfigKey::SplWeightFreq, None).unwrap(),
            ConfigValue::Str("A".into())
        );
        assert_eq!(
            context.config_get(ConfigKey::SplWeightTime, None).unwrap(),
            ConfigValue::Str("F".into())
        );
    }

    #[test]
    fn test_burst_of_readouts_stops_at_sample_limit() {
        let mut harness = Harness::new();
        harness.limits = SoftwareLimits::new().with_limit(LimitDimension::Samples, 1);
        harness.limits.start();
        let mut context = DtContext::new();

        let mut burst = READING_94_5.to_vec();
        burst.extend_from_slice(&[0xa5, 0x0d, 0x12, 0x03, 0xa5, 0x0b, 0x00]);
        harness.process(&mut context, &burst, Instant::now());

        assert_eq!(harness.values(), vec![94.5]);
        assert_eq!(harness.limits.samples_read(), 1);
        assert!(harness.limits.exceeded());
    }

    #[test]
    fn test_invalid_bcd_emits_nothing() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        harness.process(&mut context, &[0xa5, 0x0d, 0x0a, 0x45, 0xa5, 0x0b, 0x00], Instant::now());
        assert!(harness.values().is_empty());
    }

    #[test]
    fn test_bargraph_suppressed_in_max_hold() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        let now = Instant::now();
        harness.process(&mut context, &[0xa5, 0x04, 0xa5, 0x0d, 0x09, 0x45, 0xa5, 0x0c], now);
        assert!(harness.values().is_empty());
        assert_eq!(
            context.config_get(ConfigKey::HoldMax, None).unwrap(),
            ConfigValue::Bool(true)
        );

        harness.process(&mut context, &[0xa5, 0x0b, 0x00], now);
        assert_eq!(harness.values(), vec![94.5]);
        let flags = harness.seen.borrow()[0].meaning.mqflags;
        assert!(flags.contains(MqFlags::HOLD | MqFlags::MAX));

        harness.process(&mut context, &[0xa5, 0x0e, 0xa5, 0x0c], now);
        assert_eq!(harness.values().len(), 2);
    }

    #[test]
    fn test_hold_marker_repeats_at_most_once_per_second() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        let start = Instant::now();
        harness.process(&mut context, &READING_94_5, start);
        assert_eq!(harness.values().len(), 1);

        harness.process(&mut context, &[0xff], start);
        harness.process(&mut context, &[0xff; 20], start + Duration::from_millis(500));
        assert_eq!(harness.values().len(), 1);

        harness.process(&mut context, &[0xff; 20], start + Duration::from_millis(1000));
        harness.process(&mut context, &[0xff; 20], start + Duration::from_millis(1500));
        assert_eq!(harness.values().len(), 2);
        assert!(harness.seen.borrow()[1].meaning.mqflags.contains(MqFlags::HOLD));

        harness.process(&mut context, &[0xff], start + Duration::from_millis(2100));
        assert_eq!(harness.values().len(), 3);

        // Leaving hold clears the flag and starts over.
        harness.process(&mut context, &READING_94_5, start + Duration::from_millis(2200));
        assert_eq!(harness.values().len(), 4);
        assert!(!harness.seen.borrow()[3].meaning.mqflags.contains(MqFlags::HOLD));
    }

    #[test]
    fn test_hold_interrupts_partial_command() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        let now = Instant::now();
        harness.process(&mut context, &[0xa5, 0x0d, 0x09, 0xff, 0x45], now);
        harness.process(&mut context, &[0xa5, 0x0b, 0x00], now);
        assert!(harness.values().is_empty());
    }

    #[test]
    fn test_unknown_token_resyncs() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        let mut stream = vec![0xa5, 0x77, 0x01, 0x02, 0x03];
        stream.extend_from_slice(&READING_94_5);
        harness.process(&mut context, &stream, Instant::now());
        assert_eq!(harness.values(), vec![94.5]);

        let mut overflow = vec![0xa5, 0x77];
        overflow.extend_from_slice(&[0x01; BUF_SIZE + 1]);
        overflow.extend_from_slice(&READING_94_5);
        harness.process(&mut context, &overflow, Instant::now());
        assert_eq!(harness.values().len(), 2);
    }

    #[test]
    fn test_measurement_range_and_recording() {
        let mut harness = Harness::new();
        let mut context = DtContext::new();
        assert!(context.config_get(ConfigKey::SplMeasurementRange, None).is_err());
        harness.process(&mut context, &[0xa5, 0x4b, 0xa5, 0x0a], Instant::now());
        assert_eq!(
            context.config_get(ConfigKey::SplMeasurementRange, None).unwrap(),
            ConfigValue::Span(50, 100)
        );
        assert_eq!(context.is_recording(), Some(true));
    }

    #[test]
    fn test_scan_listens_for_command_byte() {
        let script = ScriptedTransport::new("mock0");
        script.push_rx(&[0x00, 0x12, 0xa5, 0x0b]);
        let devices = DtDriver
            .scan(ScanOptions::new().with_transport(script.clone()))
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].info().model, MODEL);
        assert!(script.written().is_empty());

        let dead = ScriptedTransport::new("mock1");
        dead.disconnect();
        let devices = DtDriver.scan(ScanOptions::new().with_transport(dead)).unwrap();
        assert!(devices.is_empty());
        assert!(DtDriver.scan(ScanOptions::new()).is_err());
    }
}
