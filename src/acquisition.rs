//! What a driver sees while it acquires.
//!
//! An [`Acquisition`] bundles borrowed views of everything a device context
//! may touch from inside a callback: its transport, its limits, the packet
//! pipeline and the session trigger. It lives for exactly one callback.

use crate::datafeed::Packet;
use crate::device::{DeviceError, DeviceInfo};
use crate::event_loop::Interest;
use crate::pipeline::Pipeline;
use crate::sw_limits::SoftwareLimits;
use crate::transport::Transport;
use crate::trigger::Trigger;
use std::time::Duration;

/// The event source a device wants registered for its acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSpec {
    /// Poll the device transport; with `timeout` set the callback also
    /// fires after that much silence.
    Transport {
        interest: Interest,
        timeout: Option<Duration>,
    },
    /// A pure timer with no transport behind it.
    Timer { interval: Duration },
}

impl SourceSpec {
    pub fn readable(timeout: Duration) -> Self {
        SourceSpec::Transport {
            interest: Interest::READABLE,
            timeout: Some(timeout),
        }
    }

    pub fn timer(interval: Duration) -> Self {
        SourceSpec::Timer { interval }
    }
}

pub struct Acquisition<'a> {
    info: &'a DeviceInfo,
    transport: Option<&'a mut dyn Transport>,
    limits: &'a mut SoftwareLimits,
    pipeline: &'a mut Pipeline,
    trigger: Option<&'a Trigger>,
    stop_requested: bool,
}

impl<'a> Acquisition<'a> {
    pub fn new(
        info: &'a DeviceInfo,
        transport: Option<&'a mut dyn Transport>,
        limits: &'a mut SoftwareLimits,
        pipeline: &'a mut Pipeline,
        trigger: Option<&'a Trigger>,
    ) -> Self {
        Self {
            info,
            transport,
            limits,
            pipeline,
            trigger,
            stop_requested: false,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        self.info
    }

    /// The open transport, or `ClosedOrBusy` for devices without one.
    pub fn transport(&mut self) -> Result<&mut dyn Transport, DeviceError> {
        match self.transport.as_deref_mut() {
            Some(transport) => Ok(transport),
            None => Err(DeviceError::ClosedOrBusy(self.info.model.clone())),
        }
    }

    pub fn send(&mut self, packet: impl Into<Packet>) {
        self.pipeline.send(self.info, packet.into());
    }

    pub fn frame_begin(&mut self) {
        self.send(Packet::FrameBegin);
    }

    /// Closes a frame and counts it against the frame limit.
    pub fn frame_end(&mut self) {
        self.send(Packet::FrameEnd);
        self.limits.record_frames(1);
    }

    pub fn record_samples(&mut self, n: u64) {
        self.limits.record_samples(n);
    }

    pub fn limits(&self) -> &SoftwareLimits {
        self.limits
    }

    /// Whether a software limit has been reached. Drivers that decode
    /// several readings per callback check this after each one.
    pub fn limits_exceeded(&mut self) -> bool {
        self.limits.exceeded()
    }

    pub fn trigger(&self) -> Option<&'a Trigger> {
        self.trigger
    }

    /// Asks the session to stop this device once the callback returns.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::PacketKind;
    use crate::sw_limits::LimitDimension;
    use crate::transport::ScriptedTransport;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_frames_count_against_limits() {
        let info = DeviceInfo::new("test", "Acme", "Box");
        let mut limits = SoftwareLimits::new().with_limit(LimitDimension::Frames, 2);
        limits.start();
        let mut pipeline = Pipeline::new();
        let kinds = Rc::new(RefCell::new(Vec::new()));
        let sink_kinds = Rc::clone(&kinds);
        pipeline.add_sink(move |_: &DeviceInfo, p: &Packet| sink_kinds.borrow_mut().push(p.kind()));

        let mut acq = Acquisition::new(&info, None, &mut limits, &mut pipeline, None);
        acq.frame_begin();
        acq.frame_end();
        acq.record_samples(5);
        assert_eq!(acq.limits().frames_read(), 1);
        assert_eq!(acq.limits().samples_read(), 5);
        assert!(matches!(acq.transport(), Err(DeviceError::ClosedOrBusy(_))));
        assert!(!acq.stop_requested());
        acq.request_stop();
        assert!(acq.stop_requested());

        assert_eq!(*kinds.borrow(), vec![PacketKind::FrameBegin, PacketKind::FrameEnd]);
    }

    #[test]
    fn test_transport_is_reachable() {
        let info = DeviceInfo::new("test", "Acme", "Box");
        let mut limits = SoftwareLimits::new();
        let mut pipeline = Pipeline::new();
        let script = ScriptedTransport::new("mock0");
        let mut transport = script.clone();
        transport.open().unwrap();

        let mut acq = Acquisition::new(&info, Some(&mut transport), &mut limits, &mut pipeline, None);
        acq.transport()
            .unwrap()
            .send(b"GETD\r", Duration::from_millis(10))
            .unwrap();
        assert_eq!(script.written(), b"GETD\r");
    }
}
