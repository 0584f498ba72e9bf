// Power supply streaming example
//
// This example opens a power supply, optionally programs its output and
// prints every reading until the sample limit is reached.

use clap::Parser;
use labfeed_rs::{ConfigKey, ConfigValue, DeviceInfo, Packet, Registry, ScanOptions, Session, TableSink};

#[derive(Parser)]
#[command(name = "stream_psu")]
#[command(version = "0.1")]
#[command(about = "Stream voltage and current readings from a power supply")]
struct Args {
    /// Driver to use
    #[arg(short, long, default_value = "manson-hcs-3xxx", value_parser = ["manson-hcs-3xxx", "status-psu"])]
    driver: String,

    /// Serial port of the supply; enumerates by USB id when omitted
    #[arg(short, long)]
    conn: Option<String>,

    /// Number of readings to take
    #[arg(short = 'n', long, default_value_t = 10)]
    samples: u64,

    /// Output voltage to program, in volts
    #[arg(long)]
    voltage: Option<f64>,

    /// Current limit to program, in amperes
    #[arg(long)]
    current: Option<f64>,

    /// Write all readings to this CSV file
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

    let mut options = ScanOptions::new();
    if let Some(conn) = &args.conn {
        options = options.with_conn(conn);
    }
    let registry = Registry::new();
    let mut devices = registry.scan(&args.driver, options)?;
    if devices.is_empty() {
        println!("No {} supply found. Please connect a device and try again.", args.driver);
        return Ok(());
    }
    let mut device = devices.remove(0);
    println!("Found {}", device.info());

    device.open()?;
    if let Some(voltage) = args.voltage {
        device.config_set(ConfigKey::VoltageTarget, &ConfigValue::F64(voltage), None)?;
        println!("Programmed {voltage:.2} V");
    }
    if let Some(current) = args.current {
        device.config_set(ConfigKey::CurrentLimit, &ConfigValue::F64(current), None)?;
        println!("Programmed {current:.3} A limit");
    }
    device.config_set(ConfigKey::LimitSamples, &ConfigValue::U64(args.samples), None)?;

    let table = TableSink::new();
    let mut session = Session::new();
    session.add_sink(|_: &DeviceInfo, packet: &Packet| {
        if let Packet::Analog(analog) = packet {
            if let Ok(values) = analog.to_f32() {
                for value in values {
                    println!("  {:?}: {value:.3} {}", analog.meaning.mq, analog.unit_string());
                }
            }
        }
    });
    session.add_sink(table.clone());
    let id = session.add_device(device);

    session.start()?;
    session.run()?;
    if let Some(reason) = session.stop_reason(id) {
        println!("Stopped: {reason:?}");
    }

    println!("{}", table.summary()?);
    if let Some(path) = &args.csv {
        table.write_analog_csv(path)?;
        println!("Saved readings to {path}");
    }

    session.close_all()?;
    Ok(())
}
