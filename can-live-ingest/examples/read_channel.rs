//! Standalone manual-read tool
//!
//! Opens one PCAN-Basic channel, drains it on the calling thread at a fixed
//! interval and prints every new message plus a summary.
//!
//! Usage:
//!   read_channel <channel> [--fd] [--library <path>] [--ticks <count>] [--timestamps]
//!
//! Example:
//!   read_channel usb1 --ticks 500 --timestamps

use can_live_ingest::{
    AggregationTable, ChannelDescriptor, ChannelHandle, ChannelRegistry, IngestConfig,
    IngestionEngine, PcanBasic,
};
use std::env;
use std::sync::Arc;
use std::thread;

const FD_BITRATE: &str = "f_clock_mhz=20, nom_brp=5, nom_tseg1=2, nom_tseg2=1, nom_sjw=1, data_brp=2, data_tseg1=3, data_tseg2=1, data_sjw=1";

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage: {} <channel> [--fd] [--library <path>] [--ticks <count>] [--timestamps]",
            args[0]
        );
        std::process::exit(1);
    }

    let channel: ChannelHandle = match args[1].parse() {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let mut fd = false;
    let mut library = None;
    let mut ticks = 100usize;
    let mut timestamps = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--fd" => fd = true,
            "--timestamps" => timestamps = true,
            "--library" if i + 1 < args.len() => {
                library = Some(args[i + 1].clone());
                i += 1;
            }
            "--ticks" if i + 1 < args.len() => {
                ticks = args[i + 1].parse().unwrap_or(ticks);
                i += 1;
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
        i += 1;
    }

    let driver = match library {
        Some(path) => PcanBasic::load_from(path),
        None => PcanBasic::load(),
    };
    let driver = match driver {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let opened = if fd {
        driver.initialize_fd(channel, FD_BITRATE)
    } else {
        driver.initialize(channel, 0x001C)
    };
    if let Err(e) = opened {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let registry = Arc::new(ChannelRegistry::new());
    registry.add(if fd {
        ChannelDescriptor::fd(channel)
    } else {
        ChannelDescriptor::classic(channel)
    });
    let table = Arc::new(AggregationTable::new());
    let config = IngestConfig::new().with_timestamps(timestamps);

    let engine = match IngestionEngine::new(driver.clone(), registry, table.clone(), config.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    println!("Reading {} for {} tick(s)...", channel, ticks);
    for _ in 0..ticks {
        let known = table.len();
        if let Err(e) = engine.poll_once() {
            eprintln!("Read failed: {}", e);
            break;
        }

        for row in table.snapshot().iter().skip(known) {
            println!(
                "new  {:<20} {:08X}h len={:<2} {}",
                row.type_label,
                row.id,
                row.length,
                row.timestamp.as_deref().unwrap_or("")
            );
        }
        thread::sleep(config.poll_interval());
    }

    let stats = engine.stats();
    println!("\n=== READ SUMMARY ===");
    println!("Frames read: {}", stats.frames);
    println!("Distinct messages: {}", table.len());
    println!("Bus error reads: {}", stats.bus_error_reads);
    println!("Overrun reads: {}", stats.overrun_reads + stats.queue_overrun_reads);

    let mut rows = table.snapshot();
    rows.sort_by(|a, b| b.count.cmp(&a.count));
    println!("\nTop 10 Most Frequent Messages:");
    for row in rows.iter().take(10) {
        println!("  {:08X}h {}: {} times", row.id, row.type_label, row.count);
    }

    if let Err(e) = driver.uninitialize(channel) {
        eprintln!("{}", e);
    }
}
