// Device discovery example
//
// This example scans with one driver, or with every known driver, and prints
// what each found device offers.

use clap::Parser;
use labfeed_rs::{ConfigCap, DeviceInstance, DriverKind, Registry, ScanOptions};

#[derive(Parser)]
#[command(name = "scan")]
#[command(version = "0.1")]
#[command(about = "List devices the labfeed drivers can find")]
struct Args {
    /// Driver to scan with; all drivers when omitted
    driver: Option<String>,

    /// Serial port to probe instead of enumerating by USB id
    #[arg(short, long)]
    conn: Option<String>,

    /// Serial parameters, e.g. 9600/8n1
    #[arg(short, long)]
    serialcomm: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn scan_options(args: &Args) -> ScanOptions {
    let mut options = ScanOptions::new();
    if let Some(conn) = &args.conn {
        options = options.with_conn(conn);
    }
    if let Some(serialcomm) = &args.serialcomm {
        options = options.with_serialcomm(serialcomm);
    }
    options
}

fn print_device(device: &DeviceInstance) {
    let info = device.info();
    println!("  {info}");
    for channel in &info.channels {
        println!("    channel {} {:?} {}", channel.index, channel.kind, channel.name);
    }
    for (key, cap) in device.options() {
        if !cap.contains(ConfigCap::GET) {
            continue;
        }
        match device.config_get(key, None) {
            Ok(value) => println!("    {key} = {value}"),
            Err(e) => println!("    {key}: {e}"),
        }
    }
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

    let kinds: Vec<DriverKind> = match &args.driver {
        Some(name) => match DriverKind::from_name(name) {
            Some(kind) => vec![kind],
            None => {
                eprintln!("Unknown driver: {name}");
                for kind in DriverKind::ALL {
                    eprintln!("  {kind}");
                }
                std::process::exit(1);
            }
        },
        None => DriverKind::ALL.to_vec(),
    };
    let registry = Registry::with_drivers(&kinds);

    for driver in registry.drivers() {
        println!("{} ({})", driver.name(), driver.long_name());
        match registry.scan(driver.name(), scan_options(&args)) {
            Ok(devices) if devices.is_empty() => println!("  nothing found"),
            Ok(devices) => devices.iter().for_each(print_device),
            Err(e) => println!("  scan failed: {e}"),
        }
    }

    Ok(())
}
