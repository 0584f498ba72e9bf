//! # labfeed-rs
//!
//! An acquisition core for lab instruments: serial and virtual devices are
//! driven from one single-threaded event loop, their byte streams are turned
//! into a typed datafeed, and every packet is handed to the registered sinks.
//!
//! ## Features
//!
//! - **Event loop**: readiness-driven dispatch of serial sources and timers,
//!   no threads involved
//! - **Drivers**: a binary status-frame power supply, the Manson HCS-3xxx
//!   family, CEM DT-885x sound level meters and a demo pattern generator
//! - **Datafeed**: HEADER/LOGIC/ANALOG/FRAME/TRIGGER/END packets with analog
//!   encodings, quantities, units and flags
//! - **Software limits**: sample, frame and time ceilings enforced per device
//! - **Software trigger**: multi-stage logic triggers with pre-trigger data
//! - **DataFrame output**: a `polars` sink for tabulating captures
//!
//! ## Examples
//!
//! ### Capture from the demo device
//!
//! ```rust
//! use labfeed_rs::{ConfigKey, ConfigValue, Registry, ScanOptions, Session, TableSink};
//!
//! let registry = Registry::new();
//! let mut device = registry.scan("demo", ScanOptions::new())?.remove(0);
//! device.config_set(ConfigKey::Samplerate, &ConfigValue::U64(1_000), None)?;
//! device.config_set(ConfigKey::LimitSamples, &ConfigValue::U64(100), None)?;
//! device.open()?;
//!
//! let table = TableSink::new();
//! let mut session = Session::new();
//! session.add_sink(table.clone());
//! session.add_device(device);
//! session.start()?;
//! session.run()?;
//!
//! println!("{}", table.summary()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Stream a power supply
//!
//! ```rust,no_run
//! use labfeed_rs::{DeviceInfo, Packet, Registry, ScanOptions, Session};
//!
//! let registry = Registry::new();
//! let options = ScanOptions::new().with_conn("/dev/ttyUSB0");
//! let mut device = registry.scan("manson-hcs-3xxx", options)?.remove(0);
//! device.open()?;
//!
//! let mut session = Session::new();
//! session.add_sink(|info: &DeviceInfo, packet: &Packet| {
//!     println!("{}: {}", info.display_name(), packet.describe());
//! });
//! session.add_device(device);
//! session.start()?;
//! session.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger
//!
//! ```rust
//! use labfeed_rs::{BitState, Trigger};
//!
//! let trigger = Trigger::start_capturing_when()
//!     .bit(0, BitState::High)
//!     .bit(1, BitState::Low)
//!     .starts_matching();
//! assert_eq!(trigger.stages().len(), 1);
//! ```

pub mod acquisition;
pub mod analog;
pub mod config;
pub mod datafeed;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod event_loop;
pub mod frame_sink;
pub mod logic;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sw_limits;
pub mod transport;
pub mod trigger;

// Re-export the main types for convenience
pub use acquisition::{Acquisition, SourceSpec};
pub use analog::{Analog, Encoding, Meaning, Mq, MqFlags, Rational, Unit};
pub use config::{ConfigCap, ConfigKey, ConfigValue};
pub use datafeed::{FeedError, Header, Meta, Packet, PacketKind};
pub use device::{
    Channel, ChannelGroup, ChannelType, DeviceContext, DeviceError, DeviceId, DeviceInfo,
    DeviceInstance, DeviceStatus,
};
pub use driver::{Driver, ScanOptions};
pub use event_loop::{Event, EventLoop, Flow, Interest, LoopError, SourceHandle};
pub use frame_sink::{TableError, TableSink};
pub use logic::{Logic, LogicBuilder};
pub use pipeline::{PacketSink, Pipeline, Transform, TransformError};
pub use registry::{DriverKind, Registry};
pub use session::{Session, SessionConfig, SessionError, StopReason};
pub use sw_limits::{LimitDimension, SoftwareLimits};
pub use transport::{ScriptedTransport, SerialParams, SerialTransport, Transport, TransportError};
pub use trigger::{BitState, SoftTrigger, Trigger, TriggerMatch};
