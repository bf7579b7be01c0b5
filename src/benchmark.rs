//! Multi-phase throughput benchmark.
//!
//! Measures sequential (1 MiB chunks) and random-4K read/write speed against
//! a temporary file, unbuffered and write-through so the figures reflect the
//! media rather than the OS cache. Phases run in fixed order, each averaged
//! over a number of passes chosen from the storage-type hint. Unlike the
//! surface scanner, any I/O failure after setup is fatal to the whole run:
//! the goal here is throughput measurement, not fault mapping.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::aligned_io::{aligned_buffer, DiskError, DiskFile, OpenProfile};
use crate::cancel::CancelToken;
use crate::drive_geometry::{free_space, StorageKind};
use crate::events::{BenchEvent, BenchmarkPhase, BenchmarkProgress, BenchmarkResult};

pub const TEST_FILE_NAME: &str = "disk_surveyor_bench.bin";
pub const SEQ_CHUNK_BYTES: usize = 1024 * 1024;
pub const RANDOM_BLOCK_BYTES: usize = 4096;
const SETTLE_BETWEEN_PASSES: Duration = Duration::from_millis(100);
/// Emit progress every this many blocks/iterations, to bound event volume.
const PROGRESS_STRIDE: u64 = 64;
/// Seed for the deterministic fill used when write tests are skipped.
const PREPARE_SEED: u64 = 0x5d15_c0de;

const MB: u64 = 1024 * 1024;
const MB_F: f64 = (1024 * 1024) as f64;

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub file_size_mb: u64,
    pub random_iterations: u32,
    pub passes: u32,
    pub include_write_tests: bool,
    /// Defeat the OS cache. Always on for real measurements; tests turn it
    /// off so they can run on filesystems without direct-I/O support.
    pub direct_io: bool,
}

impl BenchmarkConfig {
    pub fn for_kind(kind: StorageKind, include_write_tests: bool) -> Self {
        let (file_size_mb, random_iterations, passes) = match kind {
            StorageKind::Nvme | StorageKind::Ssd => (1024, 4096, 3),
            StorageKind::Hdd => (1024, 2048, 3),
            // USB sticks, eMMC and anything unidentified get a lighter run.
            _ => (256, 1024, 2),
        };
        Self {
            file_size_mb,
            random_iterations,
            passes,
            include_write_tests,
            direct_io: true,
        }
    }

    pub fn file_bytes(&self) -> u64 {
        self.file_size_mb.saturating_mul(MB)
    }
}

/// Worker-thread benchmark engine. One run at a time; a start request while
/// a run is active is a silent no-op.
pub struct SpeedBenchmark {
    running: Arc<AtomicBool>,
}

impl Default for SpeedBenchmark {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SpeedBenchmark {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the benchmark against a temp file in `dir` on a dedicated worker
    /// thread. Returns `None` if a run is already active. Exactly one
    /// `BenchEvent::Finished` is delivered per run.
    pub fn start(
        &self,
        dir: PathBuf,
        config: BenchmarkConfig,
        events: Sender<BenchEvent>,
        cancel: CancelToken,
    ) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let guard = RunningGuard(Arc::clone(&self.running));
        Some(thread::spawn(move || {
            let _guard = guard;
            let result = run_benchmark(&dir, &config, &events, &cancel);
            let _ = events.send(BenchEvent::Finished(result));
        }))
    }
}

/// Free-space precondition: the run needs room for the test file plus the
/// same amount of headroom.
pub fn check_free_space(available: u64, required: u64) -> Result<(), DiskError> {
    if available < required {
        return Err(DiskError::FreeSpace {
            required_mb: required / MB,
            available_mb: available / MB,
        });
    }
    Ok(())
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Rejects configurations the phase loops cannot run: a file smaller than
/// one sequential chunk leaves the random phase with an empty offset range,
/// and zero passes would average an empty sample set.
fn validate_config(cfg: &BenchmarkConfig) -> Result<(), String> {
    if cfg.file_bytes() < SEQ_CHUNK_BYTES as u64 {
        return Err(format!(
            "test file size of {} MB is too small; at least 1 MB is required",
            cfg.file_size_mb
        ));
    }
    if cfg.passes == 0 {
        return Err("at least one pass is required".to_string());
    }
    if cfg.random_iterations == 0 {
        return Err("at least one random iteration is required".to_string());
    }
    Ok(())
}

/// Deletes the test file on every exit path, success or not.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoDir {
    Read,
    Write,
}

/// Synchronous benchmark run. Returns the terminal result; the caller
/// delivers it as the single `Finished` event.
pub fn run_benchmark(
    dir: &Path,
    cfg: &BenchmarkConfig,
    events: &Sender<BenchEvent>,
    cancel: &CancelToken,
) -> BenchmarkResult {
    if let Err(msg) = validate_config(cfg) {
        return BenchmarkResult::failure(msg);
    }
    let required = cfg.file_bytes().saturating_mul(2);
    let available = match free_space(dir) {
        Ok(v) => v,
        Err(e) => return BenchmarkResult::failure(e.to_user_message()),
    };
    if let Err(e) = check_free_space(available, required) {
        return BenchmarkResult::failure(e.to_user_message());
    }

    let path = dir.join(TEST_FILE_NAME);
    let _cleanup = TempFileGuard(path.clone());
    let mut result = BenchmarkResult::default();
    match run_phases(&path, cfg, events, cancel, &mut result) {
        Ok(true) => {
            result.completed = true;
            let _ = events.send(BenchEvent::Progress(BenchmarkProgress {
                phase: BenchmarkPhase::Complete,
                percent: 100.0,
                mbps: 0.0,
            }));
        }
        Ok(false) => {} // cancelled: no partial averages, no error
        Err(e) => result.error = Some(e.to_user_message()),
    }
    result
}

/// `Ok(true)` = all phases measured, `Ok(false)` = cancelled mid-run.
fn run_phases(
    path: &Path,
    cfg: &BenchmarkConfig,
    events: &Sender<BenchEvent>,
    cancel: &CancelToken,
    result: &mut BenchmarkResult,
) -> Result<bool, DiskError> {
    if cfg.include_write_tests {
        // Each phase owns a fixed quarter of the progress range.
        let Some(v) = sequential_phase(path, cfg, IoDir::Write, (0.0, 25.0), events, cancel)?
        else {
            return Ok(false);
        };
        result.sequential_write_mbps = v;
        let Some(v) = sequential_phase(path, cfg, IoDir::Read, (25.0, 50.0), events, cancel)?
        else {
            return Ok(false);
        };
        result.sequential_read_mbps = v;
        let Some(v) = random_phase(path, cfg, IoDir::Write, (50.0, 75.0), events, cancel)? else {
            return Ok(false);
        };
        result.random_write_mbps = v;
        let Some(v) = random_phase(path, cfg, IoDir::Read, (75.0, 100.0), events, cancel)? else {
            return Ok(false);
        };
        result.random_read_mbps = v;
    } else {
        // Read-only mode: the file still has to exist before it can be read.
        // Populating it is setup, not measurement, so buffered I/O and a
        // fixed seed are fine here.
        if !prepare_read_file(path, cfg, events, cancel)? {
            return Ok(false);
        }
        let Some(v) = sequential_phase(path, cfg, IoDir::Read, (0.0, 50.0), events, cancel)?
        else {
            return Ok(false);
        };
        result.sequential_read_mbps = v;
        let Some(v) = random_phase(path, cfg, IoDir::Read, (50.0, 100.0), events, cancel)? else {
            return Ok(false);
        };
        result.random_read_mbps = v;
    }
    Ok(true)
}

fn profile_for(dir: IoDir, direct_io: bool) -> OpenProfile {
    match (dir, direct_io) {
        (_, false) => OpenProfile::Buffered,
        (IoDir::Read, true) => OpenProfile::DirectRead,
        (IoDir::Write, true) => OpenProfile::DirectWrite,
    }
}

fn emit_progress(
    events: &Sender<BenchEvent>,
    phase: BenchmarkPhase,
    range: (f64, f64),
    done: u64,
    total: u64,
    mbps: f64,
) {
    let (lo, hi) = range;
    let fraction = if total == 0 {
        0.0
    } else {
        done as f64 / total as f64
    };
    let _ = events.send(BenchEvent::Progress(BenchmarkProgress {
        phase,
        percent: lo + (hi - lo) * fraction,
        mbps,
    }));
}

/// One full-file sequential phase: `passes` repetitions of reading or
/// writing the whole file in 1 MiB aligned chunks, reporting the mean MB/s.
/// `None` means cancelled.
fn sequential_phase(
    path: &Path,
    cfg: &BenchmarkConfig,
    dir: IoDir,
    range: (f64, f64),
    events: &Sender<BenchEvent>,
    cancel: &CancelToken,
) -> Result<Option<f64>, DiskError> {
    let phase = match dir {
        IoDir::Write => BenchmarkPhase::SequentialWrite,
        IoDir::Read => BenchmarkPhase::SequentialRead,
    };
    let blocks = cfg.file_bytes() / SEQ_CHUNK_BYTES as u64;
    let total_units = blocks * cfg.passes as u64;
    let mut buf = aligned_buffer(SEQ_CHUNK_BYTES);
    if dir == IoDir::Write {
        rand::thread_rng().fill(buf.as_mut_slice());
    }

    let mut speeds = Vec::with_capacity(cfg.passes as usize);
    let mut done_units = 0u64;
    for pass in 0..cfg.passes {
        let mut disk = DiskFile::open(path, profile_for(dir, cfg.direct_io))?;
        let pass_started = Instant::now();
        let mut window = ThroughputWindow::new();
        let mut window_bytes = 0u64;
        let mut pass_units = 0u64;
        let mut pass_bytes = 0u64;
        for _ in 0..blocks {
            if cancel.is_requested() {
                return Ok(None);
            }
            let moved = match dir {
                IoDir::Write => disk.write_chunk(buf.as_slice())?.bytes,
                IoDir::Read => {
                    let io = disk.read_chunk(buf.as_mut_slice())?;
                    if io.bytes < buf.len() {
                        return Err(DiskError::Read {
                            offset: disk.position(),
                            len: buf.len(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "benchmark file shorter than expected",
                            ),
                        });
                    }
                    io.bytes
                }
            };
            pass_bytes += moved as u64;
            window_bytes += moved as u64;
            done_units += 1;
            pass_units += 1;
            // The stride counter and the window both live inside one pass,
            // so an emission never charges the previous pass's blocks or the
            // settle delay to the current window.
            if pass_units % PROGRESS_STRIDE == 0 {
                let mbps = window.rate(window_bytes);
                window_bytes = 0;
                emit_progress(events, phase, range, done_units, total_units, mbps);
            }
        }
        if dir == IoDir::Write {
            disk.sync()?;
        }
        let secs = pass_started.elapsed().as_secs_f64().max(1e-9);
        speeds.push(pass_bytes as f64 / MB_F / secs);
        if pass + 1 < cfg.passes {
            thread::sleep(SETTLE_BETWEEN_PASSES);
        }
    }
    Ok(Some(mean(&speeds)))
}

/// One random-4K phase: `passes` repetitions of `random_iterations` single
/// 4 KiB transfers at uniformly random aligned offsets. `None` means
/// cancelled.
fn random_phase(
    path: &Path,
    cfg: &BenchmarkConfig,
    dir: IoDir,
    range: (f64, f64),
    events: &Sender<BenchEvent>,
    cancel: &CancelToken,
) -> Result<Option<f64>, DiskError> {
    let phase = match dir {
        IoDir::Write => BenchmarkPhase::RandomWrite,
        IoDir::Read => BenchmarkPhase::RandomRead,
    };
    let slots = cfg.file_bytes() / RANDOM_BLOCK_BYTES as u64;
    let total_units = cfg.random_iterations as u64 * cfg.passes as u64;
    let mut buf = aligned_buffer(RANDOM_BLOCK_BYTES);
    if dir == IoDir::Write {
        rand::thread_rng().fill(buf.as_mut_slice());
    }

    let mut speeds = Vec::with_capacity(cfg.passes as usize);
    let mut done_units = 0u64;
    for pass in 0..cfg.passes {
        let mut disk = DiskFile::open(path, profile_for(dir, cfg.direct_io))?;
        // Unseeded by design: benchmark numbers are not meant to be
        // byte-for-byte reproducible across runs.
        let mut rng = rand::thread_rng();
        let pass_started = Instant::now();
        let mut window = ThroughputWindow::new();
        let mut window_bytes = 0u64;
        let mut pass_units = 0u64;
        for _ in 0..cfg.random_iterations {
            if cancel.is_requested() {
                return Ok(None);
            }
            let offset = rng.gen_range(0..slots) * RANDOM_BLOCK_BYTES as u64;
            disk.seek(offset)?;
            match dir {
                IoDir::Write => {
                    disk.write_chunk(buf.as_slice())?;
                }
                IoDir::Read => {
                    disk.read_chunk(buf.as_mut_slice())?;
                }
            }
            done_units += 1;
            pass_units += 1;
            window_bytes += RANDOM_BLOCK_BYTES as u64;
            if pass_units % PROGRESS_STRIDE == 0 {
                let mbps = window.rate(window_bytes);
                window_bytes = 0;
                emit_progress(events, phase, range, done_units, total_units, mbps);
            }
        }
        let secs = pass_started.elapsed().as_secs_f64().max(1e-9);
        speeds.push(cfg.random_iterations as f64 * RANDOM_BLOCK_BYTES as f64 / MB_F / secs);
        if pass + 1 < cfg.passes {
            thread::sleep(SETTLE_BETWEEN_PASSES);
        }
    }
    Ok(Some(mean(&speeds)))
}

/// Write the file once with deterministic pseudo-random content so the read
/// phases have something to measure. Buffered on purpose.
fn prepare_read_file(
    path: &Path,
    cfg: &BenchmarkConfig,
    events: &Sender<BenchEvent>,
    cancel: &CancelToken,
) -> Result<bool, DiskError> {
    let blocks = cfg.file_bytes() / SEQ_CHUNK_BYTES as u64;
    let mut rng = StdRng::seed_from_u64(PREPARE_SEED);
    let mut buf = aligned_buffer(SEQ_CHUNK_BYTES);
    let mut disk = DiskFile::open(path, OpenProfile::Buffered)?;
    for b in 0..blocks {
        if cancel.is_requested() {
            return Ok(false);
        }
        rng.fill(buf.as_mut_slice());
        disk.write_chunk(buf.as_slice())?;
        if b % PROGRESS_STRIDE == 0 {
            emit_progress(
                events,
                BenchmarkPhase::PreparingFile,
                (0.0, 0.0),
                b,
                blocks,
                0.0,
            );
        }
    }
    disk.sync()?;
    Ok(true)
}

/// Instantaneous throughput over the window since the previous emission.
struct ThroughputWindow {
    since: Instant,
}

impl ThroughputWindow {
    fn new() -> Self {
        Self {
            since: Instant::now(),
        }
    }

    fn rate(&mut self, bytes: u64) -> f64 {
        let secs = self.since.elapsed().as_secs_f64().max(1e-9);
        self.since = Instant::now();
        bytes as f64 / MB_F / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NOT_MEASURED;
    use tempfile::tempdir;

    fn tiny_config() -> BenchmarkConfig {
        BenchmarkConfig {
            file_size_mb: 2,
            random_iterations: 32,
            passes: 2,
            include_write_tests: true,
            direct_io: false,
        }
    }

    fn run(dir: &Path, cfg: &BenchmarkConfig, cancel: &CancelToken) -> (BenchmarkResult, Vec<BenchEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let result = run_benchmark(dir, cfg, &tx, cancel);
        drop(tx);
        (result, rx.iter().collect())
    }

    #[test]
    fn pass_speeds_average_arithmetically() {
        assert_eq!(mean(&[100.0, 120.0]), 110.0);
        assert_eq!(mean(&[5.0]), 5.0);
    }

    #[test]
    fn free_space_check_names_the_required_amount() {
        let err = check_free_space(100 * MB, 2 * 256 * MB).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("512 MB"), "{msg}");
        assert!(msg.contains("free space"), "{msg}");
    }

    #[test]
    fn presets_follow_the_storage_kind() {
        let nvme = BenchmarkConfig::for_kind(StorageKind::Nvme, true);
        assert_eq!(nvme.file_size_mb, 1024);
        assert_eq!(nvme.random_iterations, 4096);
        assert_eq!(nvme.passes, 3);

        let hdd = BenchmarkConfig::for_kind(StorageKind::Hdd, true);
        assert_eq!(hdd.random_iterations, 2048);

        let usb = BenchmarkConfig::for_kind(StorageKind::Usb, false);
        assert_eq!(usb.file_size_mb, 256);
        assert_eq!(usb.passes, 2);
        assert!(!usb.include_write_tests);
    }

    #[test]
    fn full_run_measures_all_four_figures_and_cleans_up() {
        let dir = tempdir().unwrap();
        let (result, _events) = run(dir.path(), &tiny_config(), &CancelToken::new());

        assert!(result.completed, "{:?}", result.error);
        assert!(result.sequential_write_mbps > 0.0);
        assert!(result.sequential_read_mbps > 0.0);
        assert!(result.random_write_mbps > 0.0);
        assert!(result.random_read_mbps > 0.0);
        assert!(!dir.path().join(TEST_FILE_NAME).exists());
    }

    #[test]
    fn read_only_run_reports_write_sentinels() {
        let dir = tempdir().unwrap();
        let cfg = BenchmarkConfig {
            include_write_tests: false,
            ..tiny_config()
        };
        let (result, events) = run(dir.path(), &cfg, &CancelToken::new());

        assert!(result.completed, "{:?}", result.error);
        assert_eq!(result.sequential_write_mbps, NOT_MEASURED);
        assert_eq!(result.random_write_mbps, NOT_MEASURED);
        assert!(result.sequential_read_mbps > 0.0);
        assert!(result.random_read_mbps > 0.0);
        // The file is still pre-populated before the read phases.
        let prepared = events.iter().any(|ev| {
            matches!(
                ev,
                BenchEvent::Progress(p) if p.phase == BenchmarkPhase::PreparingFile
            )
        });
        assert!(prepared);
        assert!(!dir.path().join(TEST_FILE_NAME).exists());
    }

    #[test]
    fn degenerate_configs_fail_fast_without_io() {
        let dir = tempdir().unwrap();

        // A file smaller than one sequential chunk leaves the random phase
        // with no offsets to draw from.
        let cfg = BenchmarkConfig {
            file_size_mb: 0,
            ..tiny_config()
        };
        let (result, events) = run(dir.path(), &cfg, &CancelToken::new());
        assert!(!result.completed);
        assert!(result.error.unwrap().contains("too small"));
        assert!(events.is_empty());
        assert!(!dir.path().join(TEST_FILE_NAME).exists());

        let cfg = BenchmarkConfig {
            passes: 0,
            ..tiny_config()
        };
        let (result, _) = run(dir.path(), &cfg, &CancelToken::new());
        assert!(!result.completed);
        assert!(result.error.unwrap().contains("pass"));

        let cfg = BenchmarkConfig {
            random_iterations: 0,
            ..tiny_config()
        };
        let (result, _) = run(dir.path(), &cfg, &CancelToken::new());
        assert!(!result.completed);
        assert!(result.error.unwrap().contains("iteration"));
    }

    #[test]
    fn each_pass_restarts_the_progress_stride() {
        let dir = tempdir().unwrap();
        // 96 iterations over 2 passes: one stride emission per pass. A
        // stride counter carried across passes would spill a third emission
        // over the pass boundary.
        let cfg = BenchmarkConfig {
            random_iterations: 96,
            ..tiny_config()
        };
        let (result, events) = run(dir.path(), &cfg, &CancelToken::new());
        assert!(result.completed, "{:?}", result.error);

        let random_write: Vec<_> = events
            .iter()
            .filter_map(|ev| match ev {
                BenchEvent::Progress(p) if p.phase == BenchmarkPhase::RandomWrite => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(random_write.len(), 2);
        for p in random_write {
            assert!(p.mbps.is_finite());
            assert!(p.mbps > 0.0);
        }
    }

    #[test]
    fn insufficient_space_fails_fast_without_io() {
        let dir = tempdir().unwrap();
        let cfg = BenchmarkConfig {
            file_size_mb: u64::MAX / MB / 4,
            ..tiny_config()
        };
        let (result, events) = run(dir.path(), &cfg, &CancelToken::new());

        assert!(!result.completed);
        let msg = result.error.unwrap();
        assert!(msg.contains("free space"), "{msg}");
        assert!(events.is_empty());
        assert!(!dir.path().join(TEST_FILE_NAME).exists());
    }

    #[test]
    fn cancellation_yields_incomplete_without_error() {
        let dir = tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.request();
        let (result, _events) = run(dir.path(), &tiny_config(), &cancel);

        assert!(!result.completed);
        assert!(result.error.is_none());
        assert_eq!(result.sequential_write_mbps, NOT_MEASURED);
        assert!(!dir.path().join(TEST_FILE_NAME).exists());
    }

    #[test]
    fn progress_percent_stays_inside_each_phase_range() {
        let dir = tempdir().unwrap();
        let cfg = BenchmarkConfig {
            random_iterations: 256,
            ..tiny_config()
        };
        let (result, events) = run(dir.path(), &cfg, &CancelToken::new());
        assert!(result.completed);

        let mut last_percent = 0.0f64;
        for ev in &events {
            if let BenchEvent::Progress(p) = ev {
                assert!(p.percent >= 0.0 && p.percent <= 100.0);
                assert!(p.percent >= last_percent - 1e-9, "regressed at {:?}", p.phase);
                last_percent = p.percent;
                let range = match p.phase {
                    BenchmarkPhase::PreparingFile => (0.0, 0.0),
                    BenchmarkPhase::SequentialWrite => (0.0, 25.0),
                    BenchmarkPhase::SequentialRead => (25.0, 50.0),
                    BenchmarkPhase::RandomWrite => (50.0, 75.0),
                    BenchmarkPhase::RandomRead => (75.0, 100.0),
                    BenchmarkPhase::Complete => (100.0, 100.0),
                };
                assert!(p.percent >= range.0 && p.percent <= range.1);
            }
        }
        // The run ends on the terminal marker at 100%.
        match events.last() {
            Some(BenchEvent::Progress(p)) => {
                assert_eq!(p.phase, BenchmarkPhase::Complete);
                assert_eq!(p.percent, 100.0);
            }
            other => panic!("expected a final Complete progress event, got {other:?}"),
        }
    }
}
