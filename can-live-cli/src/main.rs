//! CAN Live Monitor CLI Application
//!
//! Console front end for the can-live-ingest library:
//! - Opens PCAN-Basic channels (or a simulated bus with generated traffic)
//! - Runs the ingestion engine in polling or event mode
//! - Periodically prints the aggregation table (text or JSON)

use anyhow::{bail, Context, Result};
use can_live_ingest::{
    AggregationTable, ChannelDescriptor, ChannelHandle, ChannelRegistry, FrameSource,
    IngestionEngine, IngestionHandle, PcanBasic, ReadMode, SimulatedBus,
};
use chrono::Local;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod config;
mod report;
mod simulate;

use config::{AppConfig, ChannelConfig, DisplayConfig, DisplayFormat};
use simulate::TrafficGenerator;

/// CAN Live Monitor - Aggregate live CAN traffic per message
#[derive(Parser, Debug)]
#[command(name = "can-live-cli")]
#[command(about = "Monitor live CAN / CAN-FD traffic from PCAN-Basic channels", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the PCAN-Basic library (default: platform library name)
    #[arg(long, value_name = "FILE")]
    library: Option<PathBuf>,

    /// Channel to monitor, e.g. usb1 or usb2:fd (can be repeated)
    #[arg(long, value_name = "CHANNEL")]
    channel: Vec<ChannelConfig>,

    /// Frame delivery mode: polling or event
    #[arg(long, value_name = "MODE")]
    mode: Option<ReadMode>,

    /// Request and display hardware timestamps
    #[arg(long)]
    timestamps: bool,

    /// Polling interval in milliseconds
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,

    /// Display refresh period in milliseconds
    #[arg(long, value_name = "MS")]
    refresh_ms: Option<u64>,

    /// Stop after this many seconds (default: run until interrupted)
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// Print snapshots as JSON
    #[arg(long)]
    json: bool,

    /// Use a simulated bus with generated traffic instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Live Monitor CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using ingestion library v{}", can_live_ingest::VERSION);

    let config = build_config(&args)?;

    if config.channels.is_empty() {
        println!("CAN Live Monitor - No channel specified");
        println!("\nQuick Start:");
        println!("  can-live-cli --channel usb1");
        println!("  can-live-cli --channel usb1 --channel usb2:fd --mode event");
        println!("  can-live-cli --simulate --channel usb1 --duration-secs 5");
        println!("\nFrom a configuration file:");
        println!("  can-live-cli --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    }

    run(&config, args.duration_secs.map(Duration::from_secs))
}

/// Merge the configuration file (if any) with command-line overrides
fn build_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(library) = &args.library {
        config.driver.library = Some(library.clone());
    }
    if args.simulate {
        config.driver.simulate = true;
    }
    if !args.channel.is_empty() {
        config.channels = args.channel.clone();
    }
    if let Some(mode) = args.mode {
        config.ingest.mode = mode;
    }
    if args.timestamps {
        config.ingest.timestamps = true;
    }
    if let Some(interval) = args.interval_ms {
        config.ingest.poll_interval_ms = interval;
    }
    if let Some(refresh) = args.refresh_ms {
        config.display.refresh_ms = refresh;
    }
    if args.json {
        config.display.format = DisplayFormat::Json;
    }

    config.validate()?;
    log::debug!("Effective configuration: {:?}", config);
    Ok(config)
}

fn run(config: &AppConfig, duration: Option<Duration>) -> Result<()> {
    let registry = Arc::new(ChannelRegistry::new());
    registry.add_all_channels_marker();
    for channel in &config.channels {
        registry.add(channel.descriptor()?);
    }

    if config.driver.simulate {
        let bus = Arc::new(SimulatedBus::new());
        let generator = TrafficGenerator::spawn(
            bus.clone(),
            traffic_channels(&registry, config.ingest.mode),
            simulate::DEFAULT_PERIOD,
        )?;
        let outcome = ingest(bus, registry, config, duration);
        generator.stop();
        return outcome;
    }

    let driver = Arc::new(match &config.driver.library {
        Some(path) => PcanBasic::load_from(path)?,
        None => PcanBasic::load()?,
    });

    let _channels = OpenChannels::open(Arc::clone(&driver), &config.channels)?;
    ingest(driver, registry, config, duration)
}

/// Channels the chosen mode reads; polling skips inactive ones
fn traffic_channels(registry: &ChannelRegistry, mode: ReadMode) -> Vec<ChannelDescriptor> {
    match mode {
        ReadMode::Polling => registry.active_channels(),
        ReadMode::Event => registry.channels(),
    }
}

/// Run the engine over `source` until the duration elapses or a fault occurs
fn ingest(
    source: Arc<dyn FrameSource>,
    registry: Arc<ChannelRegistry>,
    config: &AppConfig,
    duration: Option<Duration>,
) -> Result<()> {
    let table = Arc::new(AggregationTable::new());
    let engine = IngestionEngine::new(source, registry, table, config.ingest.clone())?;
    let handle = engine.start().context("Failed to start ingestion")?;

    let outcome = monitor(&engine, &config.display, duration);
    finish(handle, outcome)
}

/// Stop ingestion; a monitor error takes precedence over the stop result
fn finish(handle: IngestionHandle, outcome: Result<()>) -> Result<()> {
    let stopped = handle.stop();
    outcome?;
    stopped.context("Ingestion ended with an error")
}

fn monitor(engine: &IngestionEngine, display: &DisplayConfig, duration: Option<Duration>) -> Result<()> {
    let faults = engine.faults();
    let refresh = Duration::from_millis(display.refresh_ms);
    let deadline = duration.map(|d| Instant::now() + d);

    loop {
        match faults.recv_timeout(refresh) {
            Ok(fault) => bail!("Ingestion stopped by a driver fault: {}", fault),
            Err(RecvTimeoutError::Timeout) => print_snapshot(engine, display.format)?,
            Err(RecvTimeoutError::Disconnected) => bail!("Fault channel closed"),
        }

        if deadline.map_or(false, |d| Instant::now() >= d) {
            log::info!("Monitoring duration elapsed");
            return Ok(());
        }
    }
}

fn print_snapshot(engine: &IngestionEngine, format: DisplayFormat) -> Result<()> {
    let rows = engine.table().snapshot();
    let stats = engine.stats();
    let now = Local::now();

    match format {
        DisplayFormat::Table => print!("{}", report::render_table(&rows, &stats, now)),
        DisplayFormat::Json => println!("{}", report::render_json(&rows, &stats, now)?),
    }
    Ok(())
}

/// Initialized hardware channels, uninitialized on drop
struct OpenChannels {
    driver: Arc<PcanBasic>,
    handles: Vec<ChannelHandle>,
}

impl OpenChannels {
    fn open(driver: Arc<PcanBasic>, channels: &[ChannelConfig]) -> Result<Self> {
        let mut open = Self {
            driver,
            handles: Vec::with_capacity(channels.len()),
        };

        for channel in channels {
            let handle = channel.handle()?;
            let initialized = if channel.fd {
                open.driver.initialize_fd(handle, channel.bitrate_fd())
            } else {
                open.driver.initialize(handle, channel.btr0btr1())
            };
            initialized.with_context(|| format!("Failed to initialize channel {}", handle))?;
            open.handles.push(handle);
        }

        Ok(open)
    }
}

impl Drop for OpenChannels {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = self.driver.uninitialize(handle) {
                log::warn!("Failed to uninitialize channel {}: {}", handle, e);
            }
        }
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "can-live-cli",
            "--channel",
            "usb1",
            "--channel",
            "usb2:fd",
            "--mode",
            "event",
            "--interval-ms",
            "5",
            "--json",
            "--simulate",
        ]);

        let config = build_config(&args).unwrap();
        assert!(config.driver.simulate);
        assert_eq!(config.channels.len(), 2);
        assert!(config.channels[1].fd);
        assert_eq!(config.ingest.mode, ReadMode::Event);
        assert_eq!(config.ingest.poll_interval_ms, 5);
        assert_eq!(config.display.format, DisplayFormat::Json);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let args = Args::parse_from(["can-live-cli", "--channel", "usb1", "--interval-ms", "0"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_traffic_only_for_read_channels() {
        let registry = ChannelRegistry::new();
        registry.add_all_channels_marker();
        registry.add(ChannelDescriptor::classic(ChannelHandle(0x51)));
        registry.add(ChannelDescriptor::classic(ChannelHandle(0x52)).with_active(false));

        let polled = traffic_channels(&registry, ReadMode::Polling);
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].handle, ChannelHandle(0x51));

        assert_eq!(traffic_channels(&registry, ReadMode::Event).len(), 2);
    }

    #[test]
    fn test_simulated_run_completes() {
        let args = Args::parse_from([
            "can-live-cli",
            "--simulate",
            "--channel",
            "usb1",
            "--channel",
            "usb2:fd",
            "--refresh-ms",
            "20",
            "--interval-ms",
            "1",
        ]);
        let config = build_config(&args).unwrap();
        run(&config, Some(Duration::from_millis(100))).unwrap();
    }
}
