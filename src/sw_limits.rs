//! Software acquisition limits.
//!
//! Tracks how many samples and frames a device has produced since the
//! acquisition started and compares them, together with the elapsed time,
//! against the configured ceilings. A ceiling of zero means "no limit".

use crate::config::{ConfigKey, ConfigValue};
use crate::device::DeviceError;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDimension {
    Samples,
    Frames,
    Time,
}

/// Distance to a ceiling, as reported by [`SoftwareLimits::remaining`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Unlimited,
    Count(u64),
    Time(Duration),
}

#[derive(Debug, Clone, Default)]
pub struct SoftwareLimits {
    limit_samples: u64,
    limit_frames: u64,
    limit_msec: u64,
    samples_read: u64,
    frames_read: u64,
    start_time: Option<Instant>,
    tripped: bool,
}

impl SoftwareLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, dimension: LimitDimension, value: u64) -> Self {
        self.set_limit(dimension, value);
        self
    }

    pub fn set_limit(&mut self, dimension: LimitDimension, value: u64) {
        match dimension {
            LimitDimension::Samples => self.limit_samples = value,
            LimitDimension::Frames => self.limit_frames = value,
            LimitDimension::Time => self.limit_msec = value,
        }
    }

    /// The configured ceiling, `None` when the dimension is unlimited.
    pub fn limit(&self, dimension: LimitDimension) -> Option<u64> {
        let value = match dimension {
            LimitDimension::Samples => self.limit_samples,
            LimitDimension::Frames => self.limit_frames,
            LimitDimension::Time => self.limit_msec,
        };
        (value != 0).then_some(value)
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.samples_read = 0;
        self.frames_read = 0;
        self.start_time = Some(now);
        self.tripped = false;
    }

    pub fn record_samples(&mut self, n: u64) {
        self.samples_read = self.samples_read.saturating_add(n);
    }

    pub fn record_frames(&mut self, n: u64) {
        self.frames_read = self.frames_read.saturating_add(n);
    }

    pub fn samples_read(&self) -> u64 {
        self.samples_read
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn exceeded(&mut self) -> bool {
        self.exceeded_at(Instant::now())
    }

    /// Once this returns true it keeps doing so until the next `start`.
    pub fn exceeded_at(&mut self, now: Instant) -> bool {
        if self.tripped {
            return true;
        }

        if self.limit_samples != 0 && self.samples_read >= self.limit_samples {
            log::debug!("Requested number of samples ({}) reached.", self.limit_samples);
            self.tripped = true;
        } else if self.limit_frames != 0 && self.frames_read >= self.limit_frames {
            log::debug!("Requested number of frames ({}) reached.", self.limit_frames);
            self.tripped = true;
        } else if let (Some(start), true) = (self.start_time, self.limit_msec != 0) {
            if now.saturating_duration_since(start) >= Duration::from_millis(self.limit_msec) {
                log::debug!("Requested sampling time ({} ms) reached.", self.limit_msec);
                self.tripped = true;
            }
        }

        self.tripped
    }

    pub fn remaining(&self, dimension: LimitDimension) -> Remaining {
        self.remaining_at(dimension, Instant::now())
    }

    pub fn remaining_at(&self, dimension: LimitDimension, now: Instant) -> Remaining {
        match dimension {
            LimitDimension::Samples if self.limit_samples != 0 => {
                Remaining::Count(self.limit_samples.saturating_sub(self.samples_read))
            }
            LimitDimension::Frames if self.limit_frames != 0 => {
                Remaining::Count(self.limit_frames.saturating_sub(self.frames_read))
            }
            LimitDimension::Time if self.limit_msec != 0 => {
                let limit = Duration::from_millis(self.limit_msec);
                let elapsed = self
                    .start_time
                    .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
                Remaining::Time(limit.saturating_sub(elapsed))
            }
            _ => Remaining::Unlimited,
        }
    }

    /// Keys this tracker answers for every device.
    pub fn handles(key: ConfigKey) -> bool {
        Self::dimension_for(key).is_some()
    }

    fn dimension_for(key: ConfigKey) -> Option<LimitDimension> {
        match key {
            ConfigKey::LimitSamples => Some(LimitDimension::Samples),
            ConfigKey::LimitFrames => Some(LimitDimension::Frames),
            ConfigKey::LimitMsec => Some(LimitDimension::Time),
            _ => None,
        }
    }

    pub fn config_get(&self, key: ConfigKey) -> Result<ConfigValue, DeviceError> {
        let dimension = Self::dimension_for(key).ok_or(DeviceError::NotApplicable { key })?;
        Ok(ConfigValue::U64(self.limit(dimension).unwrap_or(0)))
    }

    pub fn config_set(&mut self, key: ConfigKey, value: &ConfigValue) -> Result<(), DeviceError> {
        let dimension = Self::dimension_for(key).ok_or(DeviceError::NotApplicable { key })?;
        let limit = value.as_u64().ok_or_else(|| {
            DeviceError::Argument(format!("{key} expects an integer, got {value:?}"))
        })?;
        self.set_limit(dimension, limit);
        Ok(())
    }
}
