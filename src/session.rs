//! Acquisition sessions.
//!
//! A [`Session`] owns a set of open devices, the packet pipeline and the
//! event loop that drives them. Starting it sends a HEADER per device and
//! registers each device's source; every readiness event is handed to the
//! device context, after which the software limits are checked. A device
//! that stops for any reason (limits, user request, its own request or an
//! error) gets its source unregistered and an END packet, synchronously.

use crate::acquisition::{Acquisition, SourceSpec};
use crate::datafeed::{Header, Packet};
use crate::device::{open_transport, DeviceError, DeviceId, DeviceInstance, DeviceStatus};
use crate::event_loop::{Event, EventLoop, Flow, Interest, LoopError, Readiness, SourceHandle};
use crate::pipeline::{PacketSink, Pipeline, Transform};
use crate::trigger::Trigger;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No device with id {0} in this session")]
    UnknownDevice(DeviceId),

    #[error("Device {0} is not open")]
    DeviceNotOpen(DeviceId),

    #[error("Device {0} is already acquiring")]
    AlreadyRunning(DeviceId),

    #[error("Device {id} failed: {source}")]
    Device {
        id: DeviceId,
        #[source]
        source: DeviceError,
    },

    #[error("Event loop error: {0}")]
    Loop(#[from] LoopError),
}

/// Why a device's acquisition ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A software limit was reached.
    Limits,
    /// The driver finished on its own.
    Completed,
    UserRequest,
    TransportError(String),
    DeviceError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How often quiet transports are re-polled for readiness.
    pub poll_interval: Duration,
    /// Upper bound for a single `run_iteration`.
    pub max_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2),
            max_wait: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct DeviceSlot {
    device: DeviceInstance,
    running: bool,
    source: Option<SourceHandle>,
    stop_reason: Option<StopReason>,
}

/// State shared with event loop callbacks.
struct SessionCore {
    devices: BTreeMap<DeviceId, DeviceSlot>,
    pipeline: Pipeline,
    trigger: Option<Trigger>,
    on_stopped: Option<Box<dyn FnMut()>>,
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("pipeline", &self.pipeline)
            .field("trigger", &self.trigger)
            .finish()
    }
}

impl Readiness for SessionCore {
    fn readiness(&mut self, handle: SourceHandle, interest: Interest) -> Result<Interest, LoopError> {
        let SourceHandle::Io(id) = handle else {
            return Ok(Interest::empty());
        };
        let transport = self
            .devices
            .get_mut(&id)
            .and_then(|slot| slot.device.transport.as_mut())
            .ok_or_else(|| LoopError::Poll(format!("no transport behind source {handle}")))?;
        Ok(transport.readiness(interest))
    }
}

impl SessionCore {
    fn dispatch(&mut self, id: DeviceId, event: Event) -> Flow {
        let Some(slot) = self.devices.get_mut(&id) else {
            return Flow::Remove;
        };
        if !slot.running {
            return Flow::Remove;
        }

        let DeviceInstance {
            info,
            transport,
            context,
            limits,
            ..
        } = &mut slot.device;
        let (result, stop_requested) = {
            let mut acq = Acquisition::new(
                info,
                open_transport(transport),
                limits,
                &mut self.pipeline,
                self.trigger.as_ref(),
            );
            let result = context.receive(&mut acq, event);
            (result, acq.stop_requested())
        };

        let reason = match result {
            Err(DeviceError::Transport(e)) => {
                log::error!("{info}: transport failed: {e}");
                Some(StopReason::TransportError(e.to_string()))
            }
            Err(e) => {
                log::error!("{info}: {e}");
                Some(StopReason::DeviceError(e.to_string()))
            }
            Ok(()) if stop_requested => Some(StopReason::Completed),
            Ok(()) if limits.exceeded() => Some(StopReason::Limits),
            Ok(()) => None,
        };

        match reason {
            Some(reason) => {
                self.finish(id, reason);
                Flow::Remove
            }
            None => Flow::Continue,
        }
    }

    /// Stops `id`'s acquisition and sends its END. The caller takes care of
    /// the event source.
    fn finish(&mut self, id: DeviceId, reason: StopReason) {
        let Some(slot) = self.devices.get_mut(&id) else {
            return;
        };
        if !slot.running {
            return;
        }
        slot.device.status = DeviceStatus::Stopping;

        {
            let DeviceInstance {
                info,
                transport,
                context,
                limits,
                ..
            } = &mut slot.device;
            let _span = tracing::debug_span!("acquisition", device = %info).entered();
            let mut acq = Acquisition::new(
                info,
                open_transport(transport),
                limits,
                &mut self.pipeline,
                self.trigger.as_ref(),
            );
            if let Err(e) = context.acquisition_stop(&mut acq) {
                log::warn!("{info}: stopping acquisition failed: {e}");
            }
            self.pipeline.send(info, Packet::End);
            log::info!(
                "Acquisition on {info} stopped ({reason:?}) after {} samples, {} frames.",
                limits.samples_read(),
                limits.frames_read()
            );
        }

        slot.device.status = DeviceStatus::Active;
        slot.running = false;
        slot.source = None;
        slot.stop_reason = Some(reason);

        if !self.devices.values().any(|s| s.running) {
            if let Some(on_stopped) = self.on_stopped.as_mut() {
                on_stopped();
            }
        }
    }
}

/// A set of devices acquiring together.
pub struct Session {
    core: SessionCore,
    event_loop: EventLoop<SessionCore>,
    config: SessionConfig,
    next_id: DeviceId,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("core", &self.core)
            .field("event_loop", &self.event_loop)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            core: SessionCore {
                devices: BTreeMap::new(),
                pipeline: Pipeline::new(),
                trigger: None,
                on_stopped: None,
            },
            event_loop: EventLoop::new().with_poll_interval(config.poll_interval),
            config,
            next_id: 1,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Takes ownership of a device and returns its session id.
    pub fn add_device(&mut self, mut device: DeviceInstance) -> DeviceId {
        let id = self.next_id;
        self.next_id += 1;
        device.info.id = id;
        log::debug!("Adding {} as device {}.", device.info, id);
        self.core.devices.insert(
            id,
            DeviceSlot {
                device,
                running: false,
                source: None,
                stop_reason: None,
            },
        );
        id
    }

    /// Stops the device if needed and hands it back.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<DeviceInstance, SessionError> {
        self.stop_device(id)?;
        self.core
            .devices
            .remove(&id)
            .map(|slot| slot.device)
            .ok_or(SessionError::UnknownDevice(id))
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceInstance> {
        self.core.devices.get(&id).map(|slot| &slot.device)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut DeviceInstance> {
        self.core.devices.get_mut(&id).map(|slot| &mut slot.device)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.core.devices.keys().copied().collect()
    }

    pub fn add_sink(&mut self, sink: impl PacketSink + 'static) {
        self.core.pipeline.add_sink(sink);
    }

    pub fn add_transform(&mut self, transform: impl Transform + 'static) {
        self.core.pipeline.add_transform(transform);
    }

    /// Trigger read by devices that support software triggering when their
    /// acquisition starts.
    pub fn set_trigger(&mut self, trigger: Option<Trigger>) {
        self.core.trigger = trigger;
    }

    /// Called each time the last running device stops.
    pub fn on_stopped(&mut self, callback: impl FnMut() + 'static) {
        self.core.on_stopped = Some(Box::new(callback));
    }

    /// Starts every device in the session. If one fails, the devices
    /// started before it are stopped again.
    pub fn start(&mut self) -> Result<(), SessionError> {
        for (id, slot) in &self.core.devices {
            if slot.running {
                return Err(SessionError::AlreadyRunning(*id));
            }
            if !slot.device.is_open() {
                return Err(SessionError::DeviceNotOpen(*id));
            }
        }

        let ids = self.device_ids();
        for (n, id) in ids.iter().enumerate() {
            if let Err(e) = self.start_device(*id) {
                for started in &ids[..n] {
                    self.stop_with(*started, StopReason::UserRequest);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Starts a single device.
    pub fn start_device(&mut self, id: DeviceId) -> Result<(), SessionError> {
        let core = &mut self.core;
        let slot = core
            .devices
            .get_mut(&id)
            .ok_or(SessionError::UnknownDevice(id))?;
        if slot.running {
            return Err(SessionError::AlreadyRunning(id));
        }
        if !slot.device.is_open() {
            return Err(SessionError::DeviceNotOpen(id));
        }

        let spec = {
            let DeviceInstance {
                info,
                transport,
                context,
                limits,
                ..
            } = &mut slot.device;
            let _span = tracing::debug_span!("acquisition", device = %info).entered();
            log::info!("Starting acquisition on {info}.");

            core.pipeline.send(info, Packet::Header(Header::now()));
            limits.start();
            let mut acq = Acquisition::new(
                info,
                open_transport(transport),
                limits,
                &mut core.pipeline,
                core.trigger.as_ref(),
            );
            match context.acquisition_start(&mut acq) {
                Ok(spec) => spec,
                Err(source) => {
                    log::error!("{info}: acquisition start failed: {source}");
                    core.pipeline.send(info, Packet::End);
                    slot.stop_reason = Some(StopReason::DeviceError(source.to_string()));
                    return Err(SessionError::Device { id, source });
                }
            }
        };

        let (handle, interest, timeout) = match spec {
            SourceSpec::Transport { interest, timeout } => (SourceHandle::Io(id), interest, timeout),
            SourceSpec::Timer { interval } => (SourceHandle::Timer(id), Interest::empty(), Some(interval)),
        };
        self.event_loop.register(
            handle,
            interest,
            timeout,
            move |core: &mut SessionCore, _: &mut EventLoop<SessionCore>, event| {
                core.dispatch(id, event)
            },
        )?;

        slot.running = true;
        slot.source = Some(handle);
        slot.stop_reason = None;
        Ok(())
    }

    /// Waits for at most the configured maximum and dispatches whatever
    /// became ready. A failing readiness poll stops every device.
    pub fn run_iteration(&mut self) -> Result<usize, SessionError> {
        match self.event_loop.run_iteration(&mut self.core, self.config.max_wait) {
            Ok(n) => Ok(n),
            Err(e) => {
                log::error!("Event loop failed: {e}");
                for id in self.device_ids() {
                    self.stop_with(id, StopReason::TransportError(e.to_string()));
                }
                Err(e.into())
            }
        }
    }

    /// Runs until every device has stopped.
    pub fn run(&mut self) -> Result<(), SessionError> {
        while self.is_running() {
            self.run_iteration()?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.event_loop.is_empty()
    }

    pub fn is_device_running(&self, id: DeviceId) -> bool {
        self.core.devices.get(&id).is_some_and(|slot| slot.running)
    }

    /// Stops every running device.
    pub fn stop(&mut self) {
        for id in self.device_ids() {
            self.stop_with(id, StopReason::UserRequest);
        }
    }

    pub fn stop_device(&mut self, id: DeviceId) -> Result<(), SessionError> {
        if !self.core.devices.contains_key(&id) {
            return Err(SessionError::UnknownDevice(id));
        }
        self.stop_with(id, StopReason::UserRequest);
        Ok(())
    }

    fn stop_with(&mut self, id: DeviceId, reason: StopReason) {
        if let Some(handle) = self.core.devices.get(&id).and_then(|slot| slot.source) {
            self.event_loop.unregister(handle);
        }
        self.core.finish(id, reason);
    }

    /// Why the device's last acquisition ended, if it has.
    pub fn stop_reason(&self, id: DeviceId) -> Option<&StopReason> {
        self.core.devices.get(&id).and_then(|slot| slot.stop_reason.as_ref())
    }

    /// Stops, then closes every device.
    pub fn close_all(&mut self) -> Result<(), SessionError> {
        self.stop();
        for (id, slot) in &mut self.core.devices {
            slot.device
                .close()
                .map_err(|source| SessionError::Device { id: *id, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::{Analog, Meaning, Mq, MqFlags, Unit};
    use crate::config::{ConfigCap, ConfigKey, ConfigValue};
    use crate::datafeed::PacketKind;
    use crate::device::{ChannelGroup, ChannelType, DeviceContext, DeviceInfo};
    use crate::transport::{ScriptedTransport, Transport};
    use std::any::Any;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Emits one sample per tick; optionally stops itself after `stop_after`.
    #[derive(Debug, Default)]
    struct Ticker {
        ticks: u64,
        stop_after: Option<u64>,
        fail_start: bool,
    }

    impl DeviceContext for Ticker {
        fn options(&self) -> &[(ConfigKey, ConfigCap)] {
            &[]
        }

        fn config_get(
            &self,
            key: ConfigKey,
            _group: Option<&ChannelGroup>,
        ) -> Result<ConfigValue, DeviceError> {
            Err(DeviceError::NotApplicable { key })
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

        fn acquisition_start(&mut self, _acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError> {
            if self.fail_start {
                return Err(DeviceError::Handshake("no answer".into()));
            }
            Ok(SourceSpec::timer(Duration::from_millis(1)))
        }

        fn receive(&mut self, acq: &mut Acquisition<'_>, _event: Event) -> Result<(), DeviceError> {
            self.ticks += 1;
            let meaning = Meaning::new(Mq::Voltage, Unit::Volt, MqFlags::DC, 0);
            acq.send(Analog::from_f32(&[1.0], meaning, 2));
            acq.record_samples(1);
            if self.stop_after == Some(self.ticks) {
                acq.request_stop();
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Reads whatever its transport has and counts the bytes as samples.
    #[derive(Debug, Default)]
    struct Reader;

    impl DeviceContext for Reader {
        fn options(&self) -> &[(ConfigKey, ConfigCap)] {
            &[]
        }

        fn config_get(
            &self,
            key: ConfigKey,
            _group: Option<&ChannelGroup>,
        ) -> Result<ConfigValue, DeviceError> {
            Err(DeviceError::NotApplicable { key })
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

        fn acquisition_start(&mut self, _acq: &mut Acquisition<'_>) -> Result<SourceSpec, DeviceError> {
            Ok(SourceSpec::readable(Duration::from_millis(5)))
        }

        fn receive(&mut self, acq: &mut Acquisition<'_>, _event: Event) -> Result<(), DeviceError> {
            let mut buf = [0u8; 16];
            let n = acq.transport()?.read_nonblocking(&mut buf)?;
            acq.record_samples(n as u64);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn open_device(context: impl DeviceContext + 'static, transport: Option<ScriptedTransport>) -> DeviceInstance {
        let mut info = DeviceInfo::new("test", "Acme", "Box");
        info.add_channel(ChannelType::Analog, "CH1");
        let transport = transport.map(|t| Box::new(t) as Box<dyn Transport>);
        let mut device = DeviceInstance::new(info, transport, context);
        device.open().unwrap();
        device
    }

    fn recorder(session: &mut Session) -> Rc<RefCell<Vec<(DeviceId, PacketKind)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink_seen = Rc::clone(&seen);
        session.add_sink(move |info: &DeviceInfo, p: &Packet| {
            sink_seen.borrow_mut().push((info.id, p.kind()));
        });
        seen
    }

    #[test]
    fn test_sample_limit_ends_with_one_end_packet() {
        let mut session = Session::new();
        let seen = recorder(&mut session);
        let stopped = Rc::new(Cell::new(0));
        let stopped_count = Rc::clone(&stopped);
        session.on_stopped(move || stopped_count.set(stopped_count.get() + 1));

        let mut device = open_device(Ticker::default(), None);
        device
            .config_set(ConfigKey::LimitSamples, &ConfigValue::U64(3), None)
            .unwrap();
        let id = session.add_device(device);

        session.start().unwrap();
        session.run().unwrap();

        let kinds: Vec<PacketKind> = seen.borrow().iter().map(|(_, k)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                PacketKind::Header,
                PacketKind::Analog,
                PacketKind::Analog,
                PacketKind::Analog,
                PacketKind::End
            ]
        );
        assert_eq!(session.stop_reason(id), Some(&StopReason::Limits));
        assert_eq!(session.device(id).unwrap().limits().samples_read(), 3);
        assert_eq!(session.device(id).unwrap().status(), DeviceStatus::Active);
        assert_eq!(stopped.get(), 1);
        assert!(!session.is_running());
    }

    #[test]
    fn test_user_stop_and_driver_stop() {
        let mut session = Session::new();
        let seen = recorder(&mut session);
        let manual = session.add_device(open_device(Ticker::default(), None));
        let finishing = session.add_device(open_device(
            Ticker {
                stop_after: Some(2),
                ..Ticker::default()
            },
            None,
        ));

        session.start().unwrap();
        assert!(matches!(session.start(), Err(SessionError::AlreadyRunning(_))));
        while session.is_device_running(finishing) {
            session.run_iteration().unwrap();
        }
        assert_eq!(session.stop_reason(finishing), Some(&StopReason::Completed));
        assert!(session.is_device_running(manual));

        session.stop();
        assert_eq!(session.stop_reason(manual), Some(&StopReason::UserRequest));
        let ends = seen
            .borrow()
            .iter()
            .filter(|(_, k)| *k == PacketKind::End)
            .count();
        assert_eq!(ends, 2);
        assert!(!session.is_running());
    }

    #[test]
    fn test_transport_failure_stops_only_that_device() {
        let mut session = Session::new();
        let seen = recorder(&mut session);
        let script = ScriptedTransport::new("mock0");
        let broken = session.add_device(open_device(Reader, Some(script.clone())));
        let healthy = session.add_device(open_device(Ticker::default(), None));

        session.start().unwrap();
        script.push_rx(b"abc");
        session.run_iteration().unwrap();
        script.disconnect();
        while session.is_device_running(broken) {
            session.run_iteration().unwrap();
        }

        assert!(matches!(
            session.stop_reason(broken),
            Some(StopReason::TransportError(_))
        ));
        assert!(session.is_device_running(healthy));
        assert!(seen.borrow().contains(&(broken, PacketKind::End)));
        session.stop();
    }

    #[test]
    fn test_start_requires_open_devices_and_rolls_back() {
        let mut session = Session::new();
        let info = DeviceInfo::new("test", "Acme", "Closed");
        let closed = session.add_device(DeviceInstance::new(info, None, Ticker::default()));
        assert!(matches!(session.start(), Err(SessionError::DeviceNotOpen(id)) if id == closed));
        session.remove_device(closed).unwrap();

        let seen = recorder(&mut session);
        let good = session.add_device(open_device(Ticker::default(), None));
        let bad = session.add_device(open_device(
            Ticker {
                fail_start: true,
                ..Ticker::default()
            },
            None,
        ));
        assert!(matches!(
            session.start(),
            Err(SessionError::Device { id, source: DeviceError::Handshake(_) }) if id == bad
        ));
        assert!(!session.is_running());
        assert_eq!(session.stop_reason(good), Some(&StopReason::UserRequest));
        let seen = seen.borrow();
        assert_eq!(seen.iter().filter(|(_, k)| *k == PacketKind::Header).count(), 2);
        assert_eq!(seen.iter().filter(|(_, k)| *k == PacketKind::End).count(), 2);
    }

    #[test]
    fn test_unknown_device() {
        let mut session = Session::new();
        assert!(matches!(session.stop_device(42), Err(SessionError::UnknownDevice(42))));
        assert!(session.device(42).is_none());
        session.run().unwrap();
    }
}
