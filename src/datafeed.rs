//! Datafeed packets.
//!
//! A session delivers one HEADER, then any mix of META, LOGIC, ANALOG,
//! FRAME_BEGIN/FRAME_END and TRIGGER packets, and finally one END per
//! device.

use crate::analog::Analog;
use crate::config::{ConfigKey, ConfigValue};
use crate::logic::Logic;
use std::time::SystemTime;

pub const FEED_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("Unit size must not be zero")]
    ZeroUnitSize,

    #[error("Buffer of {len} bytes is not a multiple of unit size {unitsize}")]
    Misaligned { len: usize, unitsize: usize },

    #[error("{channels} channels do not fit into {unitsize} byte(s) per sample")]
    TooManyChannels { channels: usize, unitsize: usize },

    #[error("Unsupported analog unit size: {0}")]
    UnsupportedEncoding(u8),

    #[error("Analog payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Rational arithmetic overflow")]
    RationalOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

impl Header {
    pub fn now() -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Meta {
    pub config: Vec<(ConfigKey, ConfigValue)>,
}

impl Meta {
    pub fn single(key: ConfigKey, value: ConfigValue) -> Self {
        Self {
            config: vec![(key, value)],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Header(Header),
    Meta(Meta),
    Logic(Logic),
    Analog(Analog),
    FrameBegin,
    FrameEnd,
    Trigger,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketKind {
    Header,
    Meta,
    Logic,
    Analog,
    FrameBegin,
    FrameEnd,
    Trigger,
    End,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Header => "HEADER",
            PacketKind::Meta => "META",
            PacketKind::Logic => "LOGIC",
            PacketKind::Analog => "ANALOG",
            PacketKind::FrameBegin => "FRAME_BEGIN",
            PacketKind::FrameEnd => "FRAME_END",
            PacketKind::Trigger => "TRIGGER",
            PacketKind::End => "END",
        }
    }
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Header(_) => PacketKind::Header,
            Packet::Meta(_) => PacketKind::Meta,
            Packet::Logic(_) => PacketKind::Logic,
            Packet::Analog(_) => PacketKind::Analog,
            Packet::FrameBegin => PacketKind::FrameBegin,
            Packet::FrameEnd => PacketKind::FrameEnd,
            Packet::Trigger => PacketKind::Trigger,
            Packet::End => PacketKind::End,
        }
    }

    /// Packets that carry stream structure rather than data. Transforms
    /// never see them.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Packet::Header(_) | Packet::FrameBegin | Packet::FrameEnd | Packet::Trigger | Packet::End
        )
    }

    /// One-line summary for packet dumps.
    pub fn describe(&self) -> String {
        match self {
            Packet::Header(header) => format!("HEADER (feed version {})", header.feed_version),
            Packet::Meta(meta) => {
                let items: Vec<String> = meta
                    .config
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect();
                format!("META [{}]", items.join(", "))
            }
            Packet::Logic(logic) => format!(
                "LOGIC ({} samples, unitsize {})",
                logic.num_samples(),
                logic.unitsize()
            ),
            Packet::Analog(analog) => format!(
                "ANALOG ({} samples, {} in {}, channels {:?})",
                analog.num_samples,
                analog.meaning.mq.as_str(),
                analog.unit_string(),
                analog.meaning.channels
            ),
            other => other.kind().as_str().to_string(),
        }
    }
}

impl From<Logic> for Packet {
    fn from(logic: Logic) -> Self {
        Packet::Logic(logic)
    }
}

impl From<Analog> for Packet {
    fn from(analog: Analog) -> Self {
        Packet::Analog(analog)
    }
}

impl From<Meta> for Packet {
    fn from(meta: Meta) -> Self {
        Packet::Meta(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::{Meaning, Mq, MqFlags, Unit};

    #[test]
    fn test_describe() {
        let logic = Logic::new(1, vec![0, 1, 2]).unwrap();
        assert_eq!(
            Packet::from(logic).describe(),
            "LOGIC (3 samples, unitsize 1)"
        );

        let analog = Analog::from_f32(
            &[1.0],
            Meaning::new(Mq::Current, Unit::Ampere, MqFlags::DC, 1),
            3,
        );
        assert_eq!(
            Packet::from(analog).describe(),
            "ANALOG (1 samples, current in A DC, channels [1])"
        );
        assert_eq!(Packet::FrameEnd.describe(), "FRAME_END");
        assert_eq!(
            Packet::from(Meta::single(ConfigKey::Samplerate, ConfigValue::U64(10))).describe(),
            "META [samplerate=10]"
        );
    }

    #[test]
    fn test_header_version() {
        let header = Header::now();
        assert_eq!(header.feed_version, FEED_VERSION);
        assert_eq!(Packet::Header(header).kind(), PacketKind::Header);
    }
}
