// Demo device capture example
//
// This example captures generated patterns from the virtual demo device,
// optionally behind a software trigger, and tabulates the result.

use clap::Parser;
use labfeed_rs::{
    BitState, ConfigKey, ConfigValue, DeviceInfo, Packet, PacketKind, Registry, ScanOptions,
    Session, TableSink, Trigger,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "demo_capture")]
#[command(version = "0.1")]
#[command(about = "Capture test patterns from the demo device")]
struct Args {
    /// Samplerate in Hz
    #[arg(short, long, default_value_t = 10_000)]
    samplerate: u64,

    /// Number of samples to capture
    #[arg(short = 'n', long, default_value_t = 2_000)]
    samples: u64,

    /// Number of logic channels
    #[arg(long, default_value_t = 8)]
    logic: usize,

    /// Number of analog channels
    #[arg(long, default_value_t = 2)]
    analog: usize,

    /// Logic pattern
    #[arg(short, long, default_value = "sigrok", value_parser = ["sigrok", "random", "incremental", "all-low", "all-high"])]
    pattern: String,

    /// Start capturing on a rising edge of this logic channel
    #[arg(short, long)]
    trigger: Option<usize>,

    /// Pre-trigger share of the capture, in percent
    #[arg(long, default_value_t = 10)]
    capture_ratio: u64,

    /// Write the logic samples to this CSV file
    #[arg(long)]
    csv: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let options = ScanOptions::new()
        .with_logic_channels(args.logic)
        .with_analog_channels(args.analog);
    let mut device = Registry::new().scan("demo", options)?.remove(0);
    device.config_set(ConfigKey::Samplerate, &ConfigValue::U64(args.samplerate), None)?;
    device.config_set(ConfigKey::LimitSamples, &ConfigValue::U64(args.samples), None)?;
    device.config_set(ConfigKey::CaptureRatio, &ConfigValue::U64(args.capture_ratio), None)?;
    if args.logic > 0 {
        device.config_set(
            ConfigKey::PatternMode,
            &ConfigValue::Str(args.pattern.clone()),
            Some("Logic"),
        )?;
    }
    device.open()?;
    println!("Capturing {} samples at {} Hz from {}", args.samples, args.samplerate, device.info());

    let counts: Rc<RefCell<BTreeMap<PacketKind, usize>>> = Rc::default();
    let sink_counts = Rc::clone(&counts);
    let table = TableSink::new();

    let mut session = Session::new();
    session.add_sink(move |_: &DeviceInfo, packet: &Packet| {
        *sink_counts.borrow_mut().entry(packet.kind()).or_default() += 1;
    });
    session.add_sink(table.clone());
    if let Some(channel) = args.trigger {
        println!("Waiting for a rising edge on D{channel}");
        session.set_trigger(Some(
            Trigger::start_capturing_when()
                .bit(channel, BitState::High)
                .starts_matching(),
        ));
    }
    let id = session.add_device(device);

    let started = std::time::Instant::now();
    session.start()?;
    session.run()?;
    println!("Done after {:?}: {:?}", started.elapsed(), session.stop_reason(id));

    println!("\nPackets:");
    for (kind, count) in counts.borrow().iter() {
        println!("  {:<12} {count}", kind.as_str());
    }

    if args.analog > 0 {
        println!("\nAnalog summary:\n{}", table.summary()?);
    }
    if args.logic > 0 {
        let logic = table.logic_frame(id)?;
        println!("\nLogic samples:\n{}", logic.head(Some(10)));
        if let Some(path) = &args.csv {
            table.write_logic_csv(id, path)?;
            println!("Saved logic samples to {path}");
        }
    }

    Ok(())
}
