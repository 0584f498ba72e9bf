//! Virtual device generating logic and analog test patterns.
//!
//! Driven by a timer instead of a transport. Every tick works out how many
//! samples the configured samplerate calls for since the start and sends the
//! missing ones.

use super::{check_range, expect_f64};
use crate::acquisition::{Acquisition, SourceSpec};
use crate::analog::{Analog, Meaning, Mq, MqFlags, Unit};
use crate::config::{ConfigCap, ConfigKey, ConfigValue};
use crate::device::{ChannelGroup, ChannelType, DeviceContext, DeviceError, DeviceInfo, DeviceInstance};
use crate::driver::{Driver, ScanOptions};
use crate::event_loop::Event;
use crate::logic::Logic;
use crate::sw_limits::{LimitDimension, Remaining, SoftwareLimits};
use crate::transport::Transport;
use crate::trigger::SoftTrigger;
use rand::Rng;
use std::any::Any;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

pub const NAME: &str = "demo";
const LOGIC_GROUP: &str = "Logic";

const DEFAULT_LOGIC_CHANNELS: usize = 8;
const DEFAULT_ANALOG_CHANNELS: usize = 4;
const DEFAULT_SAMPLERATE: u64 = 200_000;
const DEFAULT_AMPLITUDE: f64 = 10.0;
const MIN_SAMPLERATE: u64 = 1;
const MAX_SAMPLERATE: u64 = 1_000_000_000;

const TICK: Duration = Duration::from_millis(100);
const LOGIC_BUFSIZE: usize = 4096;
const ANALOG_SAMPLES_PER_PERIOD: u64 = 20;

/// Spells "sigrok" across the first channels when scrolled through.
const PATTERN_SIGROK: [u8; 64] = [
    0x4c, 0x92, 0x92, 0x92, 0x64, 0x00, 0x00, 0x00, //
    0x82, 0xfe, 0xfe, 0x82, 0x00, 0x00, 0x00, 0x00, //
    0x7c, 0x82, 0x82, 0x92, 0x74, 0x00, 0x00, 0x00, //
    0xfe, 0x12, 0x12, 0x32, 0xcc, 0x00, 0x00, 0x00, //
    0x7c, 0x82, 0x82, 0x82, 0x7c, 0x00, 0x00, 0x00, //
    0xfe, 0x10, 0x28, 0x44, 0x82, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xbe, 0xbe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicPattern {
    Sigrok,
    Random,
    Incremental,
    AllLow,
    AllHigh,
}

impl LogicPattern {
    pub const ALL: [LogicPattern; 5] = [
        LogicPattern::Sigrok,
        LogicPattern::Random,
        LogicPattern::Incremental,
        LogicPattern::AllLow,
        LogicPattern::AllHigh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicPattern::Sigrok => "sigrok",
            LogicPattern::Random => "random",
            LogicPattern::Incremental => "incremental",
            LogicPattern::AllLow => "all-low",
            LogicPattern::AllHigh => "all-high",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogPattern {
    Square,
    Sine,
    Triangle,
    Sawtooth,
}

impl AnalogPattern {
    pub const ALL: [AnalogPattern; 4] = [
        AnalogPattern::Square,
        AnalogPattern::Sine,
        AnalogPattern::Triangle,
        AnalogPattern::Sawtooth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalogPattern::Square => "square",
            AnalogPattern::Sine => "sine",
            AnalogPattern::Triangle => "triangle",
            AnalogPattern::Sawtooth => "sawtooth",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// The value at sample `position`; one period spans
    /// `ANALOG_SAMPLES_PER_PERIOD` samples.
    #[allow(clippy::cast_precision_loss)]
    pub fn value(self, amplitude: f64, position: u64) -> f32 {
        let phase = (position % ANALOG_SAMPLES_PER_PERIOD) as f64 / ANALOG_SAMPLES_PER_PERIOD as f64;
        let value = match self {
            AnalogPattern::Square => {
                if phase < 0.5 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            AnalogPattern::Sine => amplitude * (2.0 * PI * phase).sin(),
            AnalogPattern::Triangle => (2.0 * amplitude / PI) * (2.0 * PI * phase).sin().asin(),
            AnalogPattern::Sawtooth => 2.0 * amplitude * (phase - (0.5 + phase).floor()),
        };
        value as f32
    }
}

#[derive(Debug, Clone)]
struct AnalogGenerator {
    /// Index into the device's channel list.
    channel: usize,
    pattern: AnalogPattern,
    amplitude: f64,
}

/// What a channel group addresses.
enum Target {
    Logic,
    Analog(usize),
}

const OPTIONS: [(ConfigKey, ConfigCap); 6] = [
    (ConfigKey::NumLogicChannels, ConfigCap::GET),
    (ConfigKey::NumAnalogChannels, ConfigCap::GET),
    (
        ConfigKey::Samplerate,
        ConfigCap::GET.union(ConfigCap::SET).union(ConfigCap::LIST),
    ),
    (
        ConfigKey::PatternMode,
        ConfigCap::GET.union(ConfigCap::SET).union(ConfigCap::LIST),
    ),
    (ConfigKey::Amplitude, ConfigCap::GET.union(ConfigCap::SET)),
    (ConfigKey::CaptureRatio, ConfigCap::GET.union(ConfigCap::SET)),
];

#[derive(Debug)]
pub struct DemoContext {
    num_logic: usize,
    unitsize: usize,
    logic_pattern: LogicPattern,
    analog: Vec<AnalogGenerator>,
    samplerate: u64,
    capture_ratio: u64,
    step: usize,
    started: Option<Instant>,
    generated: u64,
    analog_position: u64,
    trigger: Option<SoftTrigger>,
}

impl DemoContext {
    fn new(num_logic: usize, analog_channels: Vec<usize>) -> Self {
        Self {
            num_logic,
            unitsize: num_logic.div_ceil(8),
            logic_pattern: LogicPattern::Sigrok,
            analog: analog_channels
                .into_iter()
                .enumerate()
                .map(|(i, channel)| AnalogGenerator {
                    channel,
                    pattern: AnalogPattern::ALL[i % AnalogPattern::ALL.len()],
                    amplitude: DEFAULT_AMPLITUDE,
                })
                .collect(),
            samplerate: DEFAULT_SAMPLERATE,
            capture_ratio: 0,
            step: 0,
            started: None,
            generated: 0,
            analog_position: 0,
            trigger: None,
        }
    }

    pub fn samplerate(&self) -> u64 {
        self.samplerate
    }

    /// Samples generated since the acquisition started, triggered or not.
    pub fn generated(&self) -> u64 {
        self.generated
    }

    fn target(&self, key: ConfigKey, group: Option<&ChannelGroup>) -> Result<Target, DeviceError> {
        let group = group.ok_or(DeviceError::ChannelGroupRequired { key })?;
        if group.name == LOGIC_GROUP {
            return Ok(Target::Logic);
        }
        group
            .channels
            .first()
            .and_then(|channel| self.analog.iter().position(|a| a.channel == *channel))
            .map(Target::Analog)
            .ok_or_else(|| DeviceError::Argument(format!("group '{}' has no generator", group.name)))
    }

    fn pre_trigger_samples(&self, limits: &SoftwareLimits) -> usize {
        let samples = limits
            .limit(LimitDimension::Samples)
            .map_or(0, |limit| limit.saturating_mul(self.capture_ratio) / 100);
        usize::try_from(samples).unwrap_or(usize::MAX)
    }

    fn triggered(&self) -> bool {
        self.trigger.as_ref().map_or(true, SoftTrigger::fired)
    }

    fn logic_chunk(&mut self, samples: usize) -> Vec<u8> {
        let mut data = vec![0u8; samples * self.unitsize];
        match self.logic_pattern {
            LogicPattern::Sigrok => {
                for sample in data.chunks_exact_mut(self.unitsize) {
                    for (j, byte) in sample.iter_mut().enumerate() {
                        *byte = !(PATTERN_SIGROK[(self.step + j) % PATTERN_SIGROK.len()] >> 1);
                    }
                    self.step = self.step.wrapping_add(1);
                }
            }
            LogicPattern::Random => rand::thread_rng().fill(&mut data[..]),
            LogicPattern::Incremental => {
                for sample in data.chunks_exact_mut(self.unitsize) {
                    sample.fill(self.step as u8);
                    self.step = self.step.wrapping_add(1);
                }
            }
            LogicPattern::AllLow => {}
            LogicPattern::AllHigh => data.fill(0xff),
        }

        let spare = self.unitsize * 8 - self.num_logic;
        if spare > 0 {
            let mask = 0xffu8 >> spare;
            for sample in data.chunks_exact_mut(self.unitsize) {
                sample[self.unitsize - 1] &= mask;
            }
        }
        data
    }

    /// Sends `todo` freshly generated logic samples, holding them back until
    /// the trigger fires. Returns how many samples went out.
    fn send_logic(
        &mut self,
        acq: &mut Acquisition<'_>,
        todo: u64,
        budget: u64,
    ) -> Result<u64, DeviceError> {
        let per_chunk = (LOGIC_BUFSIZE / self.unitsize) as u64;
        let mut remaining = todo;
        let mut sent = 0u64;
        while remaining > 0 {
            let n = remaining.min(per_chunk);
            remaining -= n;
            let data = self.logic_chunk(n as usize);

            let (offset, released) = match self.trigger.as_mut() {
                None => (0, 0),
                Some(soft) => match soft.check(acq, &data)? {
                    Some(hit) => (hit.offset, hit.pre_trigger_samples as u64),
                    None => continue,
                },
            };
            sent += released;

            let post = (n - offset as u64).min(budget.saturating_sub(sent));
            if post > 0 {
                let start = offset * self.unitsize;
                let end = start + post as usize * self.unitsize;
                acq.send(Logic::new(self.unitsize, data[start..end].to_vec())?);
                sent += post;
            }
        }
        Ok(sent)
    }

    /// One packet per enabled analog channel.
    fn send_analog(&mut self, acq: &mut Acquisition<'_>, samples: u64) {
        for generator in &self.analog {
            if !acq.info().is_enabled(generator.channel) {
                continue;
            }
            let values: Vec<f32> = (0..samples)
                .map(|i| generator.pattern.value(generator.amplitude, self.analog_position + i))
                .collect();
            acq.send(Analog::from_f32(
                &values,
                Meaning::new(Mq::Voltage, Unit::Volt, MqFlags::empty(), generator.channel),
                3,
            ));
        }
        self.analog_position += samples;
    }

    /// Catches up with the samplerate as of `now`.
    pub fn generate_at(&mut self, acq: &mut Acquisition<'_>, now: Instant) -> Result<(), DeviceError> {
        let Some(started) = self.started else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(started).as_micros();
        let expected =
            u64::try_from(elapsed * u128::from(self.samplerate) / 1_000_000).unwrap_or(u64::MAX);
        let budget = match acq.limits().remaining(LimitDimension::Samples) {
            Remaining::Count(left) => left,
            _ => u64::MAX,
        };
        let todo = expected.saturating_sub(self.generated).min(budget);
        if todo == 0 {
            return Ok(());
        }

        let framed = acq.limits().limit(LimitDimension::Frames).is_some();
        if framed {
            acq.frame_begin();
        }

        let mut counted = 0;
        if self.num_logic > 0 {
            counted = self.send_logic(acq, todo, budget)?;
        }
        if self.triggered() && !self.analog.is_empty() {
            self.send_analog(acq, todo);
            if self.num_logic == 0 {
                counted = todo;
            }
        }
        self.generated += todo;

        if framed {
            acq.frame_end();
        }
        acq.record_samples(counted);
        Ok(())
    }
}

impl DeviceContext for DemoContext {
    fn options(&self) -> &[(ConfigKey, ConfigCap)] {
        &OPTIONS
    }

    fn config_get(
        &self,
        key: ConfigKey,
        group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::U64(self.samplerate)),
            ConfigKey::NumLogicChannels => Ok(ConfigValue::U64(self.num_logic as u64)),
            ConfigKey::NumAnalogChannels => Ok(ConfigValue::U64(self.analog.len() as u64)),
            ConfigKey::CaptureRatio => Ok(ConfigValue::U64(self.capture_ratio)),
            ConfigKey::PatternMode => match self.target(key, group)? {
                Target::Logic => Ok(ConfigValue::Str(self.logic_pattern.as_str().into())),
                Target::Analog(i) => Ok(ConfigValue::Str(self.analog[i].pattern.as_str().into())),
            },
            ConfigKey::Amplitude => match self.target(key, group)? {
                Target::Logic => Err(DeviceError::NotApplicable { key }),
                Target::Analog(i) => Ok(ConfigValue::F64(self.analog[i].amplitude)),
            },
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }

    fn config_set(
        &mut self,
        key: ConfigKey,
        value: &ConfigValue,
        group: Option<&ChannelGroup>,
        _transport: Option<&mut dyn Transport>,
    ) -> Result<(), DeviceError> {
        match key {
            ConfigKey::Samplerate => {
                let rate = value
                    .as_u64()
                    .filter(|r| (MIN_SAMPLERATE..=MAX_SAMPLERATE).contains(r))
                    .ok_or_else(|| {
                        DeviceError::Argument(format!(
                            "{key} must be {MIN_SAMPLERATE}..={MAX_SAMPLERATE} Hz, got {value}"
                        ))
                    })?;
                self.samplerate = rate;
            }
            ConfigKey::CaptureRatio => {
                self.capture_ratio = value
                    .as_u64()
                    .filter(|r| *r <= 100)
                    .ok_or_else(|| DeviceError::Argument(format!("{key} is a percentage, got {value}")))?;
            }
            ConfigKey::PatternMode => {
                let name = value
                    .as_str()
                    .ok_or_else(|| DeviceError::Argument(format!("{key} expects a name, got {value}")))?;
                let unknown = || DeviceError::Argument(format!("unknown pattern '{name}'"));
                match self.target(key, group)? {
                    Target::Logic => {
                        self.logic_pattern = LogicPattern::from_name(name).ok_or_else(unknown)?;
                    }
                    Target::Analog(i) => {
                        self.analog[i].pattern = AnalogPattern::from_name(name).ok_or_else(unknown)?;
                    }
                }
            }
            ConfigKey::Amplitude => {
                let Target::Analog(i) = self.target(key, group)? else {
                    return Err(DeviceError::NotApplicable { key });
                };
                let amplitude = expect_f64(key, value)?;
                check_range(key, amplitude, 0.0, f64::MAX)?;
                self.analog[i].amplitude = amplitude;
            }
            _ => return Err(DeviceError::NotApplicable { key }),
        }
        Ok(())
    }

    fn config_list(
        &self,
        key: ConfigKey,
        group: Option<&ChannelGroup>,
    ) -> Result<ConfigValue, DeviceError> {
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::U64Range {
                min: MIN_SAMPLERATE,
                max: MAX_SAMPLERATE,
                step: 1,
            }),
            ConfigKey::PatternMode => {
                let names: Vec<String> = match self.target(key, group)? {
                    Target::Logic => LogicPattern::ALL.iter().map(|p| p.as_str().into()).collect(),
                    Target::Analog(_) => AnalogPattern::ALL.iter().map(|p| p.as_str().into()).collect(),
                };
                Ok(ConfigValue::StrList(names))
            }
            _ => Err(DeviceError::NotApplicable { key }),
        }
    }

    fn acquisition_start(&mut self, acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError> {
        self.trigger = match acq.trigger() {
            Some(trigger) => Some(SoftTrigger::new(
                trigger,
                acq.info(),
                self.unitsize,
                self.pre_trigger_samples(acq.limits()),
            )?),
            None => None,
        };
        self.step = 0;
        self.generated = 0;
        self.analog_position = 0;
        self.started = Some(Instant::now());
        log::debug!(
            "{NAME}: generating at {} Hz, logic pattern {}.",
            self.samplerate,
            self.logic_pattern.as_str()
        );
        Ok(SourceSpec::timer(TICK))
    }

    fn receive(&mut self, acq: &mut Acquisition<'_>, _event: Event) -> Result<(), DeviceError> {
        self.generate_at(acq, Instant::now())
    }

    fn acquisition_stop(&mut self, _acq: &mut Acquisition<'_>) -> Result<(), DeviceError> {
        self.started = None;
        self.trigger = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The channel layout of a demo device: logic channels `D0..` in one group,
/// then analog channels `A0..` with a group each.
fn build(num_logic: usize, num_analog: usize) -> (DeviceInfo, DemoContext) {
    let mut info = DeviceInfo::new(NAME, "Labfeed", "Demo device");
    let logic: Vec<usize> = (0..num_logic)
        .map(|i| info.add_channel(ChannelType::Logic, &format!("D{i}")))
        .collect();
    if !logic.is_empty() {
        info.add_group(LOGIC_GROUP, logic);
    }
    let mut analog = Vec::with_capacity(num_analog);
    for i in 0..num_analog {
        let name = format!("A{i}");
        let channel = info.add_channel(ChannelType::Analog, &name);
        info.add_group(&name, vec![channel]);
        analog.push(channel);
    }
    (info, DemoContext::new(num_logic, analog))
}

#[derive(Debug, Default)]
pub struct DemoDriver;

impl Driver for DemoDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn long_name(&self) -> &'static str {
        "Demo driver and pattern generator"
    }

    fn scan_options(&self) -> &'static [ConfigKey] {
        &[ConfigKey::NumLogicChannels, ConfigKey::NumAnalogChannels]
    }

    fn scan(&self, options: ScanOptions) -> Result<Vec<DeviceInstance>, DeviceError> {
        let num_logic = options.num_logic_channels.unwrap_or(DEFAULT_LOGIC_CHANNELS);
        let num_analog = options.num_analog_channels.unwrap_or(DEFAULT_ANALOG_CHANNELS);
        if num_logic + num_analog == 0 {
            return Err(DeviceError::Argument("a demo device needs at least one channel".into()));
        }
        let (info, context) = build(num_logic, num_analog);
        Ok(vec![DeviceInstance::new(info, None, context)])
    }
}
