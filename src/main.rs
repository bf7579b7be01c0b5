//! src/main.rs
//!
//! Thin CLI over the scan and benchmark engines. Everything here is
//! presentation: the engines run on their own worker threads and this loop
//! just renders their event streams.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use disk_surveyor::{
    BenchEvent, BenchmarkConfig, BenchmarkResult, CancelToken, ScanEvent, ScanOutcome,
    ScanProgress, SpeedBenchmark, StorageKind, SurfaceScanner, DEFAULT_BUCKET_COUNT, NOT_MEASURED,
};

const LOG_FILE: &str = "disk_surveyor.log";

type LogHandle = Option<Arc<Mutex<File>>>;

fn current_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn log_simple<S: AsRef<str>>(log_f: &LogHandle, pb: Option<&ProgressBar>, msg: S) {
    let line = format!("[{}] {}", current_timestamp(), msg.as_ref());
    match pb {
        Some(pb) => pb.println(line.as_str()),
        None => eprintln!("{line}"),
    }
    if let Some(lf) = log_f {
        let mut guard = lf.lock();
        let _ = writeln!(*guard, "{line}");
        let _ = guard.flush();
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Full-surface read scan of a raw device.
    Scan {
        /// Raw device path, e.g. /dev/sdb or \\.\PhysicalDrive1.
        #[clap(long)]
        device: PathBuf,
        #[clap(long, default_value_t = DEFAULT_BUCKET_COUNT)]
        buckets: usize,
    },
    /// Sequential and random-4K throughput benchmark on a volume.
    Bench {
        /// Directory on the volume under test; a temporary file is created
        /// there and removed afterwards.
        #[clap(long)]
        path: PathBuf,
        /// Storage type; auto-detected when omitted.
        #[clap(long, value_enum)]
        kind: Option<KindChoice>,
        /// Skip the write phases (their figures are reported as -1).
        #[clap(long)]
        no_write: bool,
        #[clap(long)]
        size_mb: Option<u64>,
        #[clap(long)]
        iterations: Option<u32>,
        #[clap(long)]
        passes: Option<u32>,
        /// Keep OS caching enabled. Debugging only; figures then reflect RAM,
        /// not the media.
        #[clap(long)]
        buffered: bool,
        /// Print the result as JSON.
        #[clap(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum KindChoice {
    Unknown,
    Hdd,
    Ssd,
    Nvme,
    Emmc,
    Usb,
    Optical,
    Network,
}

impl From<KindChoice> for StorageKind {
    fn from(k: KindChoice) -> Self {
        match k {
            KindChoice::Unknown => StorageKind::Unknown,
            KindChoice::Hdd => StorageKind::Hdd,
            KindChoice::Ssd => StorageKind::Ssd,
            KindChoice::Nvme => StorageKind::Nvme,
            KindChoice::Emmc => StorageKind::Emmc,
            KindChoice::Usb => StorageKind::Usb,
            KindChoice::Optical => StorageKind::Optical,
            KindChoice::Network => StorageKind::Network,
        }
    }
}

fn setup_signal_handler(cancel: CancelToken, log_f: LogHandle) {
    ctrlc::set_handler(move || {
        log_simple(
            &log_f,
            None,
            "Received Ctrl+C; finishing the current chunk, then stopping...",
        );
        cancel.request();
    })
    .expect("Error setting Ctrl+C handler");
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {wide_msg}")
        .unwrap()
        .progress_chars("##-")
}

fn run_scan_command(
    log_f: &LogHandle,
    device: PathBuf,
    buckets: usize,
    cancel: CancelToken,
) -> i32 {
    log_simple(log_f, None, format!("Scanning {}", device.display()));
    let (tx, rx) = unbounded();
    let scanner = SurfaceScanner::new();
    let Some(handle) = scanner.start(device, buckets, tx, cancel) else {
        log_simple(log_f, None, "A scan is already running.");
        return 1;
    };

    let pb = ProgressBar::new(100);
    pb.set_style(progress_style());
    let mut last: Option<ScanProgress> = None;
    let mut outcome = ScanOutcome::Failed("scan worker vanished".into());
    for ev in rx.iter() {
        match ev {
            ScanEvent::Progress(p) => {
                pb.set_position(p.percent as u64);
                pb.set_message(format!(
                    "good {} slow {} bad {} | {:.1} MB/s",
                    p.good_sectors, p.slow_sectors, p.bad_sectors, p.avg_mbps
                ));
                last = Some(p);
            }
            ScanEvent::Finished(o) => {
                outcome = o;
                break;
            }
        }
    }
    let _ = handle.join();
    pb.finish_and_clear();

    match outcome {
        ScanOutcome::Completed => {
            let Some(p) = last else {
                log_simple(log_f, None, "Scan finished without progress data.");
                return 1;
            };
            log_simple(log_f, None, "--- Surface Scan Summary ---");
            log_simple(
                log_f,
                None,
                format!(
                    "  Sectors: {} good, {} slow, {} bad ({} bytes scanned)",
                    p.good_sectors, p.slow_sectors, p.bad_sectors, p.bytes_scanned
                ),
            );
            log_simple(log_f, None, format!("  Average: {:.1} MB/s", p.avg_mbps));
            if p.bad_sectors == 0 {
                log_simple(log_f, None, "Result: PASSED (no bad sectors)");
                0
            } else {
                log_simple(
                    log_f,
                    None,
                    format!("Result: FAILED ({} bad sectors)", p.bad_sectors),
                );
                1
            }
        }
        ScanOutcome::Cancelled => {
            log_simple(log_f, None, "Scan cancelled.");
            130
        }
        ScanOutcome::Failed(msg) => {
            log_simple(log_f, None, format!("Scan failed: {msg}"));
            1
        }
    }
}

fn format_figure(mbps: f64) -> String {
    if mbps == NOT_MEASURED {
        "not measured".to_string()
    } else {
        format!("{mbps:.1} MB/s")
    }
}

fn print_bench_result(log_f: &LogHandle, result: &BenchmarkResult, json: bool) {
    if json {
        println!("{}", result.to_json());
        return;
    }
    log_simple(log_f, None, "--- Benchmark Summary ---");
    log_simple(
        log_f,
        None,
        format!(
            "  Sequential read:  {}",
            format_figure(result.sequential_read_mbps)
        ),
    );
    log_simple(
        log_f,
        None,
        format!(
            "  Sequential write: {}",
            format_figure(result.sequential_write_mbps)
        ),
    );
    log_simple(
        log_f,
        None,
        format!(
            "  Random 4K read:   {}",
            format_figure(result.random_read_mbps)
        ),
    );
    log_simple(
        log_f,
        None,
        format!(
            "  Random 4K write:  {}",
            format_figure(result.random_write_mbps)
        ),
    );
}

#[allow(clippy::too_many_arguments)]
fn run_bench_command(
    log_f: &LogHandle,
    path: PathBuf,
    kind: Option<KindChoice>,
    no_write: bool,
    size_mb: Option<u64>,
    iterations: Option<u32>,
    passes: Option<u32>,
    buffered: bool,
    json: bool,
    cancel: CancelToken,
) -> i32 {
    let kind = kind.map(StorageKind::from).unwrap_or_else(|| {
        let detected = StorageKind::detect(&path);
        log_simple(
            log_f,
            None,
            format!("Detected storage type: {}", detected.label()),
        );
        detected
    });
    let mut config = BenchmarkConfig::for_kind(kind, !no_write);
    if let Some(v) = size_mb {
        config.file_size_mb = v;
    }
    if let Some(v) = iterations {
        config.random_iterations = v;
    }
    if let Some(v) = passes {
        config.passes = v;
    }
    if buffered {
        config.direct_io = false;
    }
    log_simple(
        log_f,
        None,
        format!(
            "Benchmarking {} ({} MB file, {} random iterations, {} passes)",
            path.display(),
            config.file_size_mb,
            config.random_iterations,
            config.passes
        ),
    );

    let (tx, rx) = unbounded();
    let bench = SpeedBenchmark::new();
    let Some(handle) = bench.start(path, config, tx, cancel) else {
        log_simple(log_f, None, "A benchmark is already running.");
        return 1;
    };

    let pb = ProgressBar::new(100);
    pb.set_style(progress_style());
    let mut result: Option<BenchmarkResult> = None;
    for ev in rx.iter() {
        match ev {
            BenchEvent::Progress(p) => {
                pb.set_position(p.percent as u64);
                pb.set_message(format!("{} | {:.1} MB/s", p.phase.label(), p.mbps));
            }
            BenchEvent::Finished(r) => {
                result = Some(r);
                break;
            }
        }
    }
    let _ = handle.join();
    pb.finish_and_clear();

    match result {
        Some(r) if r.completed => {
            print_bench_result(log_f, &r, json);
            0
        }
        Some(r) => {
            match &r.error {
                Some(msg) => log_simple(log_f, None, format!("Benchmark failed: {msg}")),
                None => log_simple(log_f, None, "Benchmark cancelled."),
            }
            if json {
                println!("{}", r.to_json());
            }
            if r.error.is_some() {
                1
            } else {
                130
            }
        }
        None => {
            log_simple(log_f, None, "Benchmark worker vanished without a result.");
            1
        }
    }
}

fn main() {
    let log_f: LogHandle = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
    {
        Ok(f) => Some(Arc::new(Mutex::new(f))),
        Err(e) => {
            eprintln!(
                "[{}] Failed to open log file '{}': {}. Further logs will only go to stderr.",
                current_timestamp(),
                LOG_FILE,
                e
            );
            None
        }
    };

    let cli = Cli::parse();
    let cancel = CancelToken::new();
    setup_signal_handler(cancel.clone(), log_f.clone());

    let code = match cli.command {
        Commands::Scan { device, buckets } => run_scan_command(&log_f, device, buckets, cancel),
        Commands::Bench {
            path,
            kind,
            no_write,
            size_mb,
            iterations,
            passes,
            buffered,
            json,
        } => run_bench_command(
            &log_f, path, kind, no_write, size_mb, iterations, passes, buffered, json, cancel,
        ),
    };
    std::process::exit(code);
}
