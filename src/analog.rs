//! Analog payloads: measured quantity, unit, flags and sample encoding.

use crate::datafeed::FeedError;
use bitflags::bitflags;
use std::fmt;

/// Measured quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mq {
    Voltage,
    Current,
    Power,
    Resistance,
    Frequency,
    Temperature,
    SoundPressureLevel,
    Time,
}

impl Mq {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mq::Voltage => "voltage",
            Mq::Current => "current",
            Mq::Power => "power",
            Mq::Resistance => "resistance",
            Mq::Frequency => "frequency",
            Mq::Temperature => "temperature",
            Mq::SoundPressureLevel => "sound_pressure_level",
            Mq::Time => "time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Volt,
    Ampere,
    Watt,
    Ohm,
    Hertz,
    Celsius,
    DecibelSpl,
    Second,
    Unitless,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::Ohm => "\u{2126}",
            Unit::Hertz => "Hz",
            Unit::Celsius => "\u{b0}C",
            Unit::DecibelSpl => "dB",
            Unit::Second => "s",
            Unit::Unitless => "",
        }
    }

    /// Whether values in this unit may be shown with an SI prefix.
    pub fn si_prefix_friendly(&self) -> bool {
        matches!(
            self,
            Unit::Volt | Unit::Ampere | Unit::Watt | Unit::Ohm | Unit::Hertz | Unit::Second
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MqFlags: u32 {
        const AC = 1 << 0;
        const DC = 1 << 1;
        const RMS = 1 << 2;
        const DIODE = 1 << 3;
        const HOLD = 1 << 4;
        const MAX = 1 << 5;
        const MIN = 1 << 6;
        const AUTORANGE = 1 << 7;
        const RELATIVE = 1 << 8;
        const SPL_FREQ_WEIGHT_A = 1 << 9;
        const SPL_FREQ_WEIGHT_C = 1 << 10;
        const SPL_FREQ_WEIGHT_Z = 1 << 11;
        const SPL_FREQ_WEIGHT_FLAT = 1 << 12;
        const SPL_TIME_WEIGHT_S = 1 << 13;
        const SPL_TIME_WEIGHT_F = 1 << 14;
        const SPL_LAT = 1 << 15;
        const SPL_PCT_OVER_ALARM = 1 << 16;
        const DURATION = 1 << 17;
        const AVG = 1 << 18;
        const REFERENCE = 1 << 19;
        const UNSTABLE = 1 << 20;
        const FOUR_WIRE = 1 << 21;
    }
}

const FLAG_SUFFIXES: [(MqFlags, &str); 22] = [
    (MqFlags::AC, " AC"),
    (MqFlags::DC, " DC"),
    (MqFlags::RMS, " RMS"),
    (MqFlags::DIODE, " DIODE"),
    (MqFlags::HOLD, " HOLD"),
    (MqFlags::MAX, " MAX"),
    (MqFlags::MIN, " MIN"),
    (MqFlags::AUTORANGE, " AUTO"),
    (MqFlags::RELATIVE, " REL"),
    (MqFlags::SPL_FREQ_WEIGHT_A, "(A)"),
    (MqFlags::SPL_FREQ_WEIGHT_C, "(C)"),
    (MqFlags::SPL_FREQ_WEIGHT_Z, "(Z)"),
    (MqFlags::SPL_FREQ_WEIGHT_FLAT, "(SPL)"),
    (MqFlags::SPL_TIME_WEIGHT_S, " S"),
    (MqFlags::SPL_TIME_WEIGHT_F, " F"),
    (MqFlags::SPL_LAT, " LAT"),
    (MqFlags::SPL_PCT_OVER_ALARM, "%oA"),
    (MqFlags::DURATION, " DURATION"),
    (MqFlags::AVG, " AVG"),
    (MqFlags::REFERENCE, " REF"),
    (MqFlags::UNSTABLE, " UNSTABLE"),
    (MqFlags::FOUR_WIRE, " 4-WIRE"),
];

/// A fraction `p / q`. Equality compares numeric value, so `1/2 == 2/4`.
#[derive(Debug, Clone, Copy)]
pub struct Rational {
    pub p: i64,
    pub q: u64,
}

impl Rational {
    pub const ONE: Self = Self { p: 1, q: 1 };
    pub const ZERO: Self = Self { p: 0, q: 1 };

    pub const fn new(p: i64, q: u64) -> Self {
        Self { p, q }
    }

    pub fn mul(&self, other: &Self) -> Result<Self, FeedError> {
        let p = i128::from(self.p) * i128::from(other.p);
        let q = i128::from(self.q) * i128::from(other.q);
        reduce(p, q)
    }

    pub fn div(&self, divisor: &Self) -> Result<Self, FeedError> {
        if divisor.p == 0 {
            return Err(FeedError::RationalOverflow);
        }
        let inverse_p = i128::from(divisor.q) * i128::from(divisor.p.signum());
        let inverse_q = i128::from(divisor.p.unsigned_abs());
        let p = i128::from(self.p) * inverse_p;
        let q = i128::from(self.q) * inverse_q;
        reduce(p, q)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn to_f64(&self) -> f64 {
        self.p as f64 / self.q as f64
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn reduce(p: i128, q: i128) -> Result<Rational, FeedError> {
    let divisor = gcd(p.unsigned_abs(), q.unsigned_abs()).max(1);
    let divisor = i128::try_from(divisor).map_err(|_| FeedError::RationalOverflow)?;
    let p = i64::try_from(p / divisor).map_err(|_| FeedError::RationalOverflow)?;
    let q = u64::try_from(q / divisor).map_err(|_| FeedError::RationalOverflow)?;
    Ok(Rational { p, q })
}

impl PartialEq for Rational {
    fn eq(&self, other: &Self) -> bool {
        i128::from(self.p) * i128::from(other.q) == i128::from(other.p) * i128::from(self.q)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.p, self.q)
    }
}

/// How the raw sample bytes of an analog payload are laid out.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    pub unitsize: u8,
    pub is_signed: bool,
    pub is_float: bool,
    pub is_bigendian: bool,
    /// Significant digits after the decimal point when `is_digits_decimal`.
    pub digits: i8,
    pub is_digits_decimal: bool,
    pub scale: Rational,
    pub offset: Rational,
}

impl Encoding {
    /// Host-endian `f32` samples.
    pub fn float32(digits: i8) -> Self {
        Self {
            unitsize: 4,
            is_signed: true,
            is_float: true,
            is_bigendian: cfg!(target_endian = "big"),
            digits,
            is_digits_decimal: true,
            scale: Rational::ONE,
            offset: Rational::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Meaning {
    pub mq: Mq,
    pub unit: Unit,
    pub mqflags: MqFlags,
    /// Indices of the channels these samples belong to.
    pub channels: Vec<usize>,
}

impl Meaning {
    pub fn new(mq: Mq, unit: Unit, mqflags: MqFlags, channel: usize) -> Self {
        Self {
            mq,
            unit,
            mqflags,
            channels: vec![channel],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogSpec {
    pub spec_digits: i8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analog {
    pub data: Vec<u8>,
    pub num_samples: usize,
    pub encoding: Encoding,
    pub meaning: Meaning,
    pub spec: AnalogSpec,
}

impl Analog {
    pub fn from_f32(values: &[f32], meaning: Meaning, digits: i8) -> Self {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self {
            data,
            num_samples: values.len(),
            encoding: Encoding::float32(digits),
            meaning,
            spec: AnalogSpec {
                spec_digits: digits,
            },
        }
    }

    /// Decodes every sample to `f32`, applying scale and offset.
    #[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
    pub fn to_f32(&self) -> Result<Vec<f32>, FeedError> {
        let encoding = &self.encoding;
        let size = usize::from(encoding.unitsize);
        let needed = size
            .checked_mul(self.num_samples)
            .ok_or(FeedError::UnsupportedEncoding(encoding.unitsize))?;
        let raw = self.data.get(..needed).ok_or(FeedError::Truncated {
            expected: needed,
            actual: self.data.len(),
        })?;

        let scale = encoding.scale.to_f64();
        let offset = encoding.offset.to_f64();
        let is_unity = encoding.scale == Rational::ONE && encoding.offset == Rational::ZERO;

        let mut out = Vec::with_capacity(self.num_samples);
        for chunk in raw.chunks_exact(size) {
            let value = if encoding.is_float {
                match size {
                    4 => {
                        let bytes = [chunk[0], chunk[1], chunk[2], chunk[3]];
                        f64::from(if encoding.is_bigendian {
                            f32::from_be_bytes(bytes)
                        } else {
                            f32::from_le_bytes(bytes)
                        })
                    }
                    8 => {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(chunk);
                        if encoding.is_bigendian {
                            f64::from_be_bytes(bytes)
                        } else {
                            f64::from_le_bytes(bytes)
                        }
                    }
                    _ => return Err(FeedError::UnsupportedEncoding(encoding.unitsize)),
                }
            } else {
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(FeedError::UnsupportedEncoding(encoding.unitsize));
                }
                let mut bytes = [0u8; 8];
                let raw = if encoding.is_bigendian {
                    bytes[8 - size..].copy_from_slice(chunk);
                    u64::from_be_bytes(bytes)
                } else {
                    bytes[..size].copy_from_slice(chunk);
                    u64::from_le_bytes(bytes)
                };
                if encoding.is_signed {
                    let shift = 64 - 8 * size as u32;
                    (((raw << shift) as i64) >> shift) as f64
                } else {
                    raw as f64
                }
            };
            let value = if is_unity {
                value
            } else {
                value * scale + offset
            };
            out.push(value as f32);
        }
        Ok(out)
    }

    /// Unit symbol followed by the flag suffixes, e.g. `"V DC"`.
    pub fn unit_string(&self) -> String {
        let mut s = self.meaning.unit.symbol().to_string();
        for (flag, suffix) in FLAG_SUFFIXES {
            if self.meaning.mqflags.contains(flag) {
                s.push_str(suffix);
            }
        }
        s
    }
}

const SI_PREFIXES: [&str; 10] = ["f", "p", "n", "\u{b5}", "m", "", "k", "M", "G", "T"];
const NEG_PREFIX_COUNT: i32 = 5;
const POS_PREFIX_COUNT: i32 = 4;

/// Rescales `value` to the nearest SI prefix, adjusting `digits` to match.
#[allow(clippy::cast_possible_truncation)]
pub fn si_prefix(value: f32, digits: i8) -> (f32, i8, &'static str) {
    if value.is_nan() {
        return (value, digits, SI_PREFIXES[NEG_PREFIX_COUNT as usize]);
    }

    let logval = value.abs().log10();
    let digits_i = i32::from(digits);
    let mut prefix = ((logval / 3.0) as i32).saturating_sub(i32::from(logval < 1.0));
    prefix = prefix.max(-NEG_PREFIX_COUNT);
    if 3 * prefix < -digits_i {
        prefix = (-digits_i + 2 * i32::from(digits_i < 0)) / 3;
    }
    prefix = prefix.min(POS_PREFIX_COUNT);

    let scaled = value * 10f32.powi(-3 * prefix);
    let digits = (digits_i + 3 * prefix).clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8;
    let index = usize::try_from(prefix + NEG_PREFIX_COUNT).unwrap_or(0);
    (scaled, digits, SI_PREFIXES[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meaning() -> Meaning {
        Meaning::new(Mq::Voltage, Unit::Volt, MqFlags::DC, 0)
    }

    #[test]
    fn test_float_round_trip() {
        let analog = Analog::from_f32(&[3.56, -1.25], meaning(), 2);
        assert_eq!(analog.to_f32().unwrap(), vec![3.56, -1.25]);
        assert_eq!(analog.unit_string(), "V DC");
    }

    #[test]
    fn test_scaled_big_endian_integers() {
        let analog = Analog {
            data: vec![0x01, 0x64, 0xff, 0xff],
            num_samples: 2,
            encoding: Encoding {
                unitsize: 2,
                is_signed: true,
                is_float: false,
                is_bigendian: true,
                digits: 2,
                is_digits_decimal: true,
                scale: Rational::new(1, 100),
                offset: Rational::ZERO,
            },
            meaning: meaning(),
            spec: AnalogSpec { spec_digits: 2 },
        };
        let values = analog.to_f32().unwrap();
        assert!((values[0] - 3.56).abs() < 1e-6);
        assert!((values[1] + 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_unsupported_and_truncated() {
        let mut analog = Analog::from_f32(&[1.0], meaning(), 0);
        analog.encoding.unitsize = 3;
        analog.num_samples = 1;
        analog.data = vec![0; 3];
        assert!(matches!(analog.to_f32(), Err(FeedError::UnsupportedEncoding(3))));

        let mut short = Analog::from_f32(&[1.0], meaning(), 0);
        short.num_samples = 2;
        assert!(matches!(short.to_f32(), Err(FeedError::Truncated { .. })));
    }

    #[test]
    fn test_rational_arithmetic() {
        assert_eq!(Rational::new(1, 2), Rational::new(2, 4));
        assert_ne!(Rational::new(1, 2), Rational::new(1, 3));
        let product = Rational::new(2, 3).mul(&Rational::new(3, 4)).unwrap();
        assert_eq!(product, Rational::new(1, 2));
        assert_eq!(product.q, 2);
        let quotient = Rational::new(1, 2).div(&Rational::new(-1, 4)).unwrap();
        assert_eq!(quotient, Rational::new(-2, 1));
        assert!(Rational::new(i64::MAX, 1).mul(&Rational::new(3, 1)).is_err());
        assert!(Rational::ONE.div(&Rational::ZERO).is_err());
    }

    #[test]
    fn test_si_prefix() {
        let (value, digits, prefix) = si_prefix(0.0123, 4);
        assert_eq!(prefix, "m");
        assert!((value - 12.3).abs() < 1e-4);
        assert_eq!(digits, 1);

        let (value, _, prefix) = si_prefix(12_000.0, 0);
        assert_eq!(prefix, "k");
        assert!((value - 12.0).abs() < 1e-4);
    }
}
