// tools/rx_monitor_cli/main.rs
//
// Receive monitor: runs one receive worker and prints what lands in the
// frame table once a second until Ctrl-C.
//
//   rx_monitor_cli --interface can0
//   rx_monitor_cli --simulate 500 --json

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wiretap_rx::io::socketcan::SocketCanDriver;
use wiretap_rx::io::ScriptedDriver;
use wiretap_rx::settings::default_settings_path;
use wiretap_rx::{
    load_settings, tlog, ChannelId, DeliveryMode, DriverAdapter, FrameTable, FrameTableView,
    RawFrame, ReceiveWorker, ReceiverSettings, SharedChannel, WorkerMessage,
};

#[derive(Parser, Debug)]
#[command(name = "rx_monitor_cli", about = "Watch a CAN / CAN FD receive channel")]
struct Args {
    /// Settings file (defaults to <config dir>/wiretap/receiver.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SocketCAN interface, overrides the settings file
    #[arg(short, long)]
    interface: Option<String>,

    /// Generate this many frames from a scripted driver instead of hardware
    #[arg(long, value_name = "FRAMES")]
    simulate: Option<u32>,

    /// Channel handle, e.g. 0x51
    #[arg(long, value_parser = parse_channel)]
    channel: Option<u16>,

    /// Print the table as JSON instead of log lines
    #[arg(long)]
    json: bool,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn parse_channel(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid channel '{}': {}", s, e))
}

/// Records shown per report
const LATEST: usize = 8;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tlog!("[monitor] {}", e);
        wiretap_rx::logging::stop_file_logging();
        std::process::exit(1);
    }
    wiretap_rx::logging::stop_file_logging();
}

async fn run(args: Args) -> Result<(), String> {
    let mut settings = match args.config.clone().or_else(default_settings_path) {
        Some(path) => load_settings(&path)?,
        None => ReceiverSettings::default(),
    };
    if let Some(channel) = args.channel {
        settings.channel = channel;
    }
    if let Some(interface) = &args.interface {
        settings.interface = Some(interface.clone());
    }
    if let Some(dir) = args.log_dir.clone().or_else(|| settings.log_dir.clone()) {
        wiretap_rx::logging::init_file_logging(&dir)?;
    }

    let id = settings.channel_id();
    let feeder_done = Arc::new(AtomicBool::new(false));
    let (driver, scripted): (Arc<dyn DriverAdapter>, Option<Arc<ScriptedDriver>>) =
        match (args.simulate, &settings.interface) {
            (Some(_), _) => {
                let driver = Arc::new(ScriptedDriver::new());
                (driver.clone(), Some(driver))
            }
            (None, Some(interface)) => (
                Arc::new(SocketCanDriver::single(id, interface, settings.configure_interface)),
                None,
            ),
            (None, None) => {
                return Err("no interface configured; pass --interface or --simulate".to_string())
            }
        };

    let channel = SharedChannel::open(driver.as_ref(), id, &settings.bitrate_or_default())?;
    let table = FrameTable::new(settings.key_policy);
    let view = table.view();
    let (mut worker, mut messages) =
        ReceiveWorker::new(driver.clone(), channel, table, settings.receive_options());
    worker.start()?;

    let feeder = match (scripted, args.simulate) {
        (Some(driver), Some(count)) => Some(spawn_feeder(
            driver,
            id,
            count,
            settings.delivery_mode,
            feeder_done.clone(),
        )),
        _ => None,
    };

    let mut report = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tlog!("[monitor] Ctrl-C, closing {}", id);
                break;
            }
            _ = report.tick() => print_report(&view, args.json),
            message = messages.recv() => match message {
                Some(WorkerMessage::TableCleared { channel, status, removed }) => {
                    tlog!("[monitor] {} fault {}: table cleared ({} records)", channel, status, removed);
                }
                Some(WorkerMessage::Fault { channel, error }) => {
                    tlog!("[monitor] {} stopped: {}", channel, error);
                    break;
                }
                Some(WorkerMessage::Ended { channel, reason }) => {
                    tlog!("[monitor] {} poll loop ended ({})", channel, reason);
                }
                None => break,
            },
        }
    }

    feeder_done.store(true, Ordering::Release);
    if let Some(handle) = feeder {
        let _ = handle.join();
    }
    print_report(&view, args.json);
    worker.close_channel().await.map_err(String::from)
}

fn print_report(view: &FrameTableView, json: bool) {
    if json {
        println!("{}", view.to_json());
        return;
    }
    tlog!("[monitor] {} records ({} clears)", view.len(), view.clear_count());
    for (key, record) in view.latest(LATEST) {
        tlog!(
            "[monitor]   #{} id=0x{:X} dlc={} x{} {}",
            key,
            record.frame.id,
            record.frame.dlc,
            record.receipt_count,
            record.payload_hex()
        );
    }
}

/// Push simulated traffic into the scripted driver: a burst every 10 ms,
/// raising a receive event after each burst when events are in use.
fn spawn_feeder(
    driver: Arc<ScriptedDriver>,
    id: ChannelId,
    count: u32,
    mode: DeliveryMode,
    done: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut sent = 0u32;
        while sent < count && !done.load(Ordering::Acquire) {
            let burst = (count - sent).min(16);
            driver.push_frames(
                id,
                (sent..sent + burst).map(|n| {
                    let counter = n.to_le_bytes();
                    if n % 4 == 3 {
                        RawFrame::fd(0x18FF_0000 | (n % 8), true, true, &[counter.as_slice(); 4].concat())
                    } else {
                        RawFrame::standard(0x100 + (n % 8), &counter)
                    }
                }),
            );
            sent += burst;
            if mode != DeliveryMode::Timer {
                driver.fire_event(id);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        tlog!("[monitor] Simulation finished, {} frames queued", sent);
    })
}
