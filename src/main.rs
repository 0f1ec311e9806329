//! beaconhound: exposure notification beacon capture and identity linking.
//!
//! Reads encounters from a serial BLE sniffer or a replay log, tracks
//! every rotating identifier, and reports which identifiers appear to be
//! the same physical device.
//!
//! ```text
//! beaconhound --backend nrf --listener link
//! beaconhound --backend replay --replay-log encounters.csv --end-of-log finish --listener ndjson
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use beaconhound::capture::open_capture;
use beaconhound::comm::NdjsonListener;
use beaconhound::config::Config;
use beaconhound::dispatch::{Dispatcher, EventKind};
use beaconhound::listeners::{DeviceTableListener, LinkReportListener, LogListener};
use beaconhound::pipeline::{stop_flag, Pipeline, Shutdown};
use beaconhound::protocol::VERSION;
use beaconhound::sniffer::{find_sniffers, probe_baud_rate, SnifferControl};
use beaconhound::source::{EncounterSource, EndOfLog, ReplaySource, SnifferSource};
use beaconhound::tracker::{DeviceTracker, SharedTracker};
use beaconhound::transport::{Transport, SNIFFER_BAUD_RATES};

/// Minimum time between device table redraws.
const TABLE_REDRAW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// nRF BLE sniffer on a serial port
    Nrf,
    /// Previously recorded encounters log
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListenerKind {
    /// Live table of tracked devices
    List,
    /// One line per linked identifier pair
    Link,
    /// NDJSON event stream on stdout
    Ndjson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EndOfLogArg {
    Idle,
    Finish,
}

#[derive(Parser)]
#[command(name = "beaconhound")]
#[command(version, about = "Link rotating exposure notification identifiers captured by a BLE sniffer")]
struct Cli {
    /// Encounter source.
    #[arg(short, long, value_enum, default_value_t = Backend::Nrf)]
    backend: Backend,

    /// Consumers of the processed stream. Repeat for several.
    #[arg(short, long, value_enum, default_values_t = [ListenerKind::List])]
    listener: Vec<ListenerKind>,

    /// JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sniffer serial port. Discovered when omitted.
    #[arg(short, long)]
    port: Option<String>,

    /// Sniffer baud rate. Probed when omitted.
    #[arg(long)]
    baud: Option<u32>,

    /// Encounters log to read in replay mode.
    #[arg(long)]
    replay_log: Option<PathBuf>,

    /// What replay does at the end of the log.
    #[arg(long, value_enum)]
    end_of_log: Option<EndOfLogArg>,

    /// Replay records at their original pace.
    #[arg(long)]
    realtime: bool,

    /// Append every encounter to this file.
    #[arg(long)]
    encounters_log: Option<PathBuf>,

    /// Append the first sighting of each device to this file.
    #[arg(long)]
    devices_log: Option<PathBuf>,

    /// Write every sniffer packet to this pcap file.
    #[arg(long)]
    capture: Option<PathBuf>,

    /// List attached sniffers and exit.
    #[arg(long)]
    list_sniffers: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    log::info!("beaconhound v{} starting", VERSION);

    if cli.list_sniffers {
        for (port, rate) in find_sniffers() {
            println!("{port} @ {rate}");
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let tracker = DeviceTracker::shared(config.tracker);
    let stop = stop_flag();

    // ── Source ───────────────────────────────────────────────────────

    let mut transport: Option<Arc<Transport>> = None;
    let (mut source, source_name): (Box<dyn EncounterSource>, &str) = match cli.backend {
        Backend::Nrf => {
            let t = Arc::new(open_sniffer(&cli, &config)?);
            let layout = config.layout.to_layout()?;
            let mut sniffer =
                SnifferSource::new(Arc::clone(&t), t.port(), config.framing.decoder(), layout, config.filter);
            if let Some(path) = &cli.capture {
                let writer = open_capture(path).with_context(|| format!("opening capture file {}", path.display()))?;
                log::info!("Capturing packets to {}", path.display());
                sniffer = sniffer.with_capture(Box::new(writer));
            }
            transport = Some(t);
            (Box::new(sniffer) as Box<dyn EncounterSource>, "nrf")
        }
        Backend::Replay => {
            let Some(path) = &cli.replay_log else {
                bail!("the replay backend needs --replay-log");
            };
            let file = File::open(path).with_context(|| format!("opening replay log {}", path.display()))?;
            let name = path.display().to_string();
            let replay = ReplaySource::new(file, name, config.replay);
            (Box::new(replay) as Box<dyn EncounterSource>, "replay")
        }
    };

    {
        let stop = Arc::clone(&stop);
        let transport = transport.clone();
        ctrlc::set_handler(move || {
            log::info!("Interrupt received, shutting down");
            stop.store(true, Ordering::Relaxed);
            if let Some(t) = &transport {
                t.close();
            }
        })
        .context("installing Ctrl-C handler")?;
    }

    // ── Listeners ────────────────────────────────────────────────────

    let dispatcher = build_dispatcher(&cli, &tracker, source_name)?;
    let mut pipeline = Pipeline::new(tracker, config.linker, dispatcher, config.poll_interval());
    let shutdown = pipeline.run(source.as_mut(), &stop);

    if let Some(t) = transport {
        if let Err(e) = SnifferControl::new(&t).go_idle() {
            log::debug!("Could not idle sniffer: {}", e);
        }
        t.close();
    }

    match shutdown {
        // Ctrl-C closes the port under the source, which reports it as lost.
        Shutdown::SourceFailed(reason) if !stop.load(Ordering::Relaxed) => bail!("capture ended: {reason}"),
        _ => {
            log::info!("Done.");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(port) = &cli.port {
        config.serial.port = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = Some(baud);
    }
    if let Some(end) = cli.end_of_log {
        config.replay.end_of_log = match end {
            EndOfLogArg::Idle => EndOfLog::Idle,
            EndOfLogArg::Finish => EndOfLog::Finish,
        };
    }
    if cli.realtime {
        config.replay.realtime = true;
    }
    config.validate()?;
    Ok(config)
}

/// Open the configured or first discovered sniffer and start scanning.
fn open_sniffer(cli: &Cli, config: &Config) -> anyhow::Result<Transport> {
    let port = match &config.serial.port {
        Some(port) => port.clone(),
        None => match find_sniffers().into_iter().next() {
            Some((port, _)) => port,
            None => bail!("no sniffer found; pass --port"),
        },
    };
    let baud = match config.serial.baud_rate {
        Some(rate) => rate,
        None => probe_baud_rate(&port).unwrap_or_else(|| {
            log::warn!("{} did not answer a ping, trying {} baud", port, SNIFFER_BAUD_RATES[0]);
            SNIFFER_BAUD_RATES[0]
        }),
    };
    log::debug!("Sniffer options: backend {:?}, port {}, baud {}", cli.backend, port, baud);

    let transport = Transport::open(&port, baud)?;
    let mut control = SnifferControl::new(&transport);
    control.set_adv_hop_sequence(&config.serial.hop_sequence)?;
    control.start_scan(false, false, false)?;
    log::info!("Scanning for exposure notification beacons on {}", port);
    Ok(transport)
}

fn append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn build_dispatcher(cli: &Cli, tracker: &SharedTracker, source_name: &str) -> anyhow::Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new();

    for kind in &cli.listener {
        match kind {
            ListenerKind::List => dispatcher.subscribe_many(
                &EventKind::ALL,
                DeviceTableListener::new(io::stdout(), Arc::clone(tracker), TABLE_REDRAW),
            ),
            ListenerKind::Link => dispatcher.subscribe_many(
                &[EventKind::Linked, EventKind::SourceClosed],
                LinkReportListener::new(io::stdout()),
            ),
            ListenerKind::Ndjson => {
                dispatcher.subscribe_many(&EventKind::ALL, NdjsonListener::new(io::stdout(), source_name)?)
            }
        }
    }

    if cli.encounters_log.is_some() || cli.devices_log.is_some() {
        if cli.backend == Backend::Replay && cli.encounters_log == cli.replay_log {
            bail!("--encounters-log must differ from --replay-log");
        }
        let encounters = cli.encounters_log.as_deref().map(append).transpose()?;
        let devices = cli.devices_log.as_deref().map(append).transpose()?;
        dispatcher.subscribe(EventKind::Encounter, LogListener::new(encounters, devices));
    }

    for kind in EventKind::ALL {
        log::debug!("{:?}: {} listener(s)", kind, dispatcher.subscriber_count(kind));
    }
    Ok(dispatcher)
}
