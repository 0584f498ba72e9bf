//! Delivery of datafeed packets to transforms and sinks.
//!
//! Every packet first runs through the transform chain in order; whatever
//! comes out the other end is handed to each sink, synchronously, before
//! [`Pipeline::send`] returns. HEADER and END packets bypass the transforms
//! so the stream framing can never be lost.

use crate::analog::{Analog, Rational};
use crate::datafeed::{FeedError, Packet};
use crate::device::DeviceInfo;

/// Consumer of the packet stream.
pub trait PacketSink {
    fn receive(&mut self, device: &DeviceInfo, packet: &Packet);
}

impl<F> PacketSink for F
where
    F: FnMut(&DeviceInfo, &Packet),
{
    fn receive(&mut self, device: &DeviceInfo, packet: &Packet) {
        self(device, packet);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Transform {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Packet could not be decoded: {0}")]
    Feed(#[from] FeedError),
}

/// A stage that may rewrite or swallow packets before they reach sinks.
pub trait Transform {
    fn name(&self) -> &str;

    /// `Ok(None)` swallows the packet. Control packets (HEADER, FRAME_BEGIN,
    /// FRAME_END, TRIGGER, END) never reach a transform.
    fn receive(&mut self, device: &DeviceInfo, packet: Packet)
        -> Result<Option<Packet>, TransformError>;
}

#[derive(Default)]
pub struct Pipeline {
    transforms: Vec<Box<dyn Transform>>,
    sinks: Vec<Box<dyn PacketSink>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.transforms.iter().map(|t| t.name()).collect();
        f.debug_struct("Pipeline")
            .field("transforms", &names)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transform(&mut self, transform: impl Transform + 'static) {
        self.transforms.push(Box::new(transform));
    }

    pub fn add_sink(&mut self, sink: impl PacketSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn send(&mut self, device: &DeviceInfo, packet: Packet) {
        let mut packet = packet;
        if !packet.is_control() {
            for transform in &mut self.transforms {
                match transform.receive(device, packet) {
                    Ok(Some(next)) => packet = next,
                    Ok(None) => return,
                    Err(e) => {
                        log::error!("Dropping packet from {}: {}", device.model, e);
                        return;
                    }
                }
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{} {}: {}", device.id, device.model, packet.describe());
        }
        for sink in &mut self.sinks {
            sink.receive(device, &packet);
        }
    }
}

/// Multiplies every analog sample by a constant factor.
#[derive(Debug, Clone)]
pub struct ScaleTransform {
    factor: Rational,
}

impl ScaleTransform {
    pub fn new(factor: Rational) -> Self {
        Self { factor }
    }
}

impl Transform for ScaleTransform {
    fn name(&self) -> &str {
        "scale"
    }

    #[allow(clippy::cast_possible_truncation)]
    fn receive(
        &mut self,
        _device: &DeviceInfo,
        packet: Packet,
    ) -> Result<Option<Packet>, TransformError> {
        let Packet::Analog(analog) = packet else {
            return Ok(Some(packet));
        };
        let factor = self.factor.to_f64() as f32;
        let values: Vec<f32> = analog.to_f32()?.into_iter().map(|v| v * factor).collect();
        let mut scaled = Analog::from_f32(&values, analog.meaning, analog.encoding.digits);
        scaled.spec = analog.spec;
        Ok(Some(Packet::Analog(scaled)))
    }
}

/// Inverts every logic bit.
#[derive(Debug, Clone, Default)]
pub struct InvertTransform;

impl Transform for InvertTransform {
    fn name(&self) -> &str {
        "invert"
    }

    fn receive(
        &mut self,
        _device: &DeviceInfo,
        packet: Packet,
    ) -> Result<Option<Packet>, TransformError> {
        let Packet::Logic(mut logic) = packet else {
            return Ok(Some(packet));
        };
        for byte in logic.data_mut() {
            *byte = !*byte;
        }
        Ok(Some(Packet::Logic(logic)))
    }
}
