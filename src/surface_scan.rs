//! Full-surface sequential read scanner.
//!
//! One strictly-forward pass over the device's whole addressable range in
//! 64 KiB sector-aligned chunks. Chunks that read cleanly count their sectors
//! good (or slow, past the 200 ms threshold); a failed chunk read falls back
//! to a sector-by-sector retry so the bad-sector count isolates exactly the
//! unreadable sectors without aborting the scan. Byte positions map onto a
//! fixed number of display buckets and one progress event is emitted per
//! bucket transition.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::aligned_io::{aligned_buffer, BlockDevice, RawDevice};
use crate::cancel::CancelToken;
use crate::events::{ScanEvent, ScanOutcome, ScanProgress};

pub const SCAN_CHUNK_BYTES: u64 = 64 * 1024;
/// A chunk slower than this counts its sectors as slow rather than good.
pub const SLOW_CHUNK_MS: f64 = 200.0;
pub const DEFAULT_BUCKET_COUNT: usize = 1000;
/// Floor for reported chunk times, so downstream rate math never divides by
/// zero.
const MIN_CHUNK_MS: f64 = 0.01;

/// Worker-thread scan engine. One scan at a time; a start request while a
/// scan is running is a silent no-op.
pub struct SurfaceScanner {
    running: Arc<AtomicBool>,
}

impl Default for SurfaceScanner {
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

impl SurfaceScanner {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open `device_path` read-only in unbuffered sequential mode and scan
    /// it on a dedicated worker thread. Returns `None` if a scan is already
    /// running. Exactly one `ScanEvent::Finished` is delivered per run.
    pub fn start(
        &self,
        device_path: PathBuf,
        bucket_count: usize,
        events: Sender<ScanEvent>,
        cancel: CancelToken,
    ) -> Option<JoinHandle<()>> {
        self.spawn(events, move |events| match RawDevice::open(&device_path) {
            Ok(mut dev) => run_scan(&mut dev, bucket_count, events, &cancel),
            Err(e) => ScanOutcome::Failed(e.to_user_message()),
        })
    }

    /// Scan an already-open device. The seam used by tests to inject
    /// synthetic faults and timings.
    pub fn start_with_device(
        &self,
        mut device: Box<dyn BlockDevice + Send>,
        bucket_count: usize,
        events: Sender<ScanEvent>,
        cancel: CancelToken,
    ) -> Option<JoinHandle<()>> {
        self.spawn(events, move |events| {
            run_scan(device.as_mut(), bucket_count, events, &cancel)
        })
    }

    fn spawn<F>(&self, events: Sender<ScanEvent>, job: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(&Sender<ScanEvent>) -> ScanOutcome + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let guard = RunningGuard(Arc::clone(&self.running));
        Some(thread::spawn(move || {
            let _guard = guard;
            let outcome = job(&events);
            let _ = events.send(ScanEvent::Finished(outcome));
        }))
    }
}

/// Per-bucket accumulator, flushed as one progress event when the scan
/// crosses into the next bucket or reaches the end of the device.
struct BucketAccum {
    index: usize,
    has_bad: bool,
    time_ms_sum: f64,
    chunks: u64,
}

impl BucketAccum {
    fn new(index: usize) -> Self {
        Self {
            index,
            has_bad: false,
            time_ms_sum: 0.0,
            chunks: 0,
        }
    }

    fn record(&mut self, elapsed_ms: f64, has_bad: bool) {
        self.has_bad |= has_bad;
        self.time_ms_sum += elapsed_ms;
        self.chunks += 1;
    }

    fn average_ms(&self) -> f64 {
        if self.chunks == 0 {
            MIN_CHUNK_MS
        } else {
            (self.time_ms_sum / self.chunks as f64).max(MIN_CHUNK_MS)
        }
    }
}

fn bucket_index(pos: u64, total: u64, buckets: usize) -> usize {
    (((pos as f64 / total as f64) * buckets as f64) as usize).min(buckets - 1)
}

fn align_down(v: u64, align: u64) -> u64 {
    v / align * align
}

#[allow(clippy::too_many_arguments)]
fn emit_bucket(
    events: &Sender<ScanEvent>,
    bucket: &BucketAccum,
    percent: u8,
    bytes_scanned: u64,
    total_bytes: u64,
    counts: (u64, u64, u64),
    started: &Instant,
) {
    let (good_sectors, bad_sectors, slow_sectors) = counts;
    let secs = started.elapsed().as_secs_f64().max(1e-6);
    let _ = events.send(ScanEvent::Progress(ScanProgress {
        percent,
        bytes_scanned,
        total_bytes,
        good_sectors,
        bad_sectors,
        slow_sectors,
        avg_mbps: bytes_scanned as f64 / (1024.0 * 1024.0) / secs,
        bucket_index: bucket.index,
        bucket_good: !bucket.has_bad,
        bucket_avg_ms: bucket.average_ms(),
    }));
}

/// The scan loop proper. Runs to one of the three terminal outcomes; the
/// caller is responsible for delivering the terminal event.
pub fn run_scan(
    dev: &mut dyn BlockDevice,
    bucket_count: usize,
    events: &Sender<ScanEvent>,
    cancel: &CancelToken,
) -> ScanOutcome {
    let total = dev.total_bytes();
    let sector = dev.sector_size() as u64;
    if total == 0 || sector == 0 {
        return ScanOutcome::Failed(format!(
            "cannot read disk geometry: device reports {total} bytes, {sector}-byte sectors"
        ));
    }
    let bucket_count = bucket_count.max(1);
    let chunk_len = (SCAN_CHUNK_BYTES / sector).max(1) * sector;
    let mut chunk_buf = aligned_buffer(chunk_len as usize);
    let mut sector_buf = aligned_buffer(sector as usize);

    let mut good_sectors = 0u64;
    let mut bad_sectors = 0u64;
    let mut slow_sectors = 0u64;
    let started = Instant::now();

    let mut bucket = BucketAccum::new(0);
    let mut pos = 0u64;
    while pos < total {
        if cancel.is_requested() {
            return ScanOutcome::Cancelled;
        }

        let idx = bucket_index(pos, total, bucket_count);
        if idx != bucket.index {
            let percent = (pos.saturating_mul(100) / total) as u8;
            emit_bucket(
                events,
                &bucket,
                percent,
                pos,
                total,
                (good_sectors, bad_sectors, slow_sectors),
                &started,
            );
            bucket = BucketAccum::new(idx);
        }

        let len = align_down(chunk_len.min(total - pos), sector);
        if len == 0 {
            // Sub-sector tail of a regular file; unaddressable in unbuffered
            // mode. Every full sector has been covered.
            break;
        }
        let sectors_in_chunk = len / sector;
        let mut chunk_has_bad = false;
        let elapsed_ms = match dev.read_at(pos, &mut chunk_buf.as_mut_slice()[..len as usize]) {
            Ok(io) => {
                let ms = io.elapsed.as_secs_f64() * 1000.0;
                if ms >= SLOW_CHUNK_MS {
                    slow_sectors += sectors_in_chunk;
                } else {
                    good_sectors += sectors_in_chunk;
                }
                ms
            }
            Err(_) => {
                // The chunk failed as a whole. Re-read it one sector at a
                // time to isolate exactly which sectors are unreadable; the
                // rest of the chunk still counts as good.
                let retry_started = Instant::now();
                for s in 0..sectors_in_chunk {
                    let sector_offset = pos + s * sector;
                    match dev.read_at(sector_offset, sector_buf.as_mut_slice()) {
                        Ok(_) => good_sectors += 1,
                        Err(_) => {
                            bad_sectors += 1;
                            chunk_has_bad = true;
                        }
                    }
                }
                retry_started.elapsed().as_secs_f64() * 1000.0
            }
        };
        bucket.record(elapsed_ms.max(MIN_CHUNK_MS), chunk_has_bad);
        pos += len;
    }

    // The last bucket is flushed even though the position has reached the
    // total size.
    if bucket.chunks > 0 {
        emit_bucket(
            events,
            &bucket,
            100,
            pos,
            total,
            (good_sectors, bad_sectors, slow_sectors),
            &started,
        );
    }
    ScanOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned_io::{ChunkIo, DiskError};
    use crate::events::ScanEvent;
    use std::collections::HashSet;
    use std::io;
    use std::time::Duration;

    /// Synthetic device: every read takes `chunk_time`; any read touching a
    /// sector listed in `bad` fails.
    struct SimDevice {
        total: u64,
        sector: u32,
        bad: HashSet<u64>,
        chunk_time: Duration,
    }

    impl SimDevice {
        fn clean(total: u64, sector: u32, chunk_time: Duration) -> Self {
            Self {
                total,
                sector,
                bad: HashSet::new(),
                chunk_time,
            }
        }
    }

    impl BlockDevice for SimDevice {
        fn total_bytes(&self) -> u64 {
            self.total
        }

        fn sector_size(&self) -> u32 {
            self.sector
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<ChunkIo, DiskError> {
            let step = self.sector as u64;
            let mut o = offset;
            while o < offset + buf.len() as u64 {
                if self.bad.contains(&o) {
                    return Err(DiskError::Read {
                        offset: o,
                        len: buf.len(),
                        source: io::Error::other("simulated media error"),
                    });
                }
                o += step;
            }
            let bytes = buf.len().min(self.total.saturating_sub(offset) as usize);
            Ok(ChunkIo {
                bytes,
                elapsed: self.chunk_time,
            })
        }
    }

    fn collect_progress(
        dev: &mut dyn BlockDevice,
        buckets: usize,
        cancel: &CancelToken,
    ) -> (ScanOutcome, Vec<ScanProgress>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let outcome = run_scan(dev, buckets, &tx, cancel);
        drop(tx);
        let progress = rx
            .iter()
            .map(|ev| match ev {
                ScanEvent::Progress(p) => p,
                ScanEvent::Finished(_) => panic!("core loop must not emit terminal events"),
            })
            .collect();
        (outcome, progress)
    }

    #[test]
    fn clean_fast_device_is_all_good_sectors() {
        // 100 MB, 512-byte sectors, every chunk reads in 10 ms.
        let mut dev = SimDevice::clean(100_000_000, 512, Duration::from_millis(10));
        let (outcome, progress) = collect_progress(&mut dev, DEFAULT_BUCKET_COUNT, &CancelToken::new());

        assert_eq!(outcome, ScanOutcome::Completed);
        let last = progress.last().unwrap();
        assert_eq!(last.bad_sectors, 0);
        assert_eq!(last.slow_sectors, 0);
        assert_eq!(last.good_sectors, 100_000_000 / 512);
        assert_eq!(last.percent, 100);
        assert!(last.avg_mbps > 0.0);
    }

    #[test]
    fn sector_accounting_covers_the_whole_device() {
        let total = 64 * 1024 * 64; // exactly 64 chunks
        let mut dev = SimDevice::clean(total, 4096, Duration::from_millis(1));
        let (outcome, progress) = collect_progress(&mut dev, 10, &CancelToken::new());

        assert_eq!(outcome, ScanOutcome::Completed);
        let last = progress.last().unwrap();
        assert_eq!(
            last.good_sectors + last.bad_sectors + last.slow_sectors,
            total / 4096
        );
        assert_eq!(last.bytes_scanned, total);
    }

    #[test]
    fn slow_chunks_count_sectors_as_slow_not_bad() {
        let total = 64 * 1024 * 8;
        let mut dev = SimDevice::clean(total, 512, Duration::from_millis(250));
        let (outcome, progress) = collect_progress(&mut dev, 100, &CancelToken::new());

        // Slow media still completes; slow is descriptive, not a failure.
        assert_eq!(outcome, ScanOutcome::Completed);
        let last = progress.last().unwrap();
        assert_eq!(last.slow_sectors, total / 512);
        assert_eq!(last.good_sectors, 0);
        assert_eq!(last.bad_sectors, 0);
        assert!(last.bucket_avg_ms >= 200.0);
    }

    #[test]
    fn failed_chunk_narrows_to_individual_bad_sectors() {
        // One failing 64 KiB chunk: the one covering offset 1,000,000
        // (983040..1048576). Three of its 128 sectors are actually bad.
        let total = 2 * 1024 * 1024;
        let chunk_base = 983_040u64;
        let mut dev = SimDevice::clean(total, 512, Duration::from_millis(1));
        for s in [10u64, 20, 30] {
            dev.bad.insert(chunk_base + s * 512);
        }
        let (outcome, progress) = collect_progress(&mut dev, 100, &CancelToken::new());

        assert_eq!(outcome, ScanOutcome::Completed);
        let last = progress.last().unwrap();
        assert_eq!(last.bad_sectors, 3);
        assert_eq!(last.good_sectors, total / 512 - 3);
        // The bucket holding the failed chunk is flagged, the rest are good.
        let flagged: Vec<_> = progress.iter().filter(|p| !p.bucket_good).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(
            flagged[0].bucket_index,
            ((chunk_base as f64 / total as f64) * 100.0) as usize
        );
    }

    #[test]
    fn buckets_are_monotone_and_cover_the_full_range() {
        // Evenly divisible: exactly one chunk per bucket.
        let buckets = DEFAULT_BUCKET_COUNT;
        let total = SCAN_CHUNK_BYTES * buckets as u64;
        let mut dev = SimDevice::clean(total, 512, Duration::from_millis(1));
        let (outcome, progress) = collect_progress(&mut dev, buckets, &CancelToken::new());

        assert_eq!(outcome, ScanOutcome::Completed);
        assert_eq!(progress.len(), buckets);
        for (expected, p) in progress.iter().enumerate() {
            assert_eq!(p.bucket_index, expected);
        }
        // The final bucket is flushed at the total-size boundary.
        assert_eq!(progress.last().unwrap().bucket_index, buckets - 1);
        assert_eq!(progress.last().unwrap().percent, 100);
    }

    #[test]
    fn percent_is_monotone_non_decreasing() {
        let total = 100_000_000;
        let mut dev = SimDevice::clean(total, 512, Duration::from_millis(1));
        let (_, progress) = collect_progress(&mut dev, 137, &CancelToken::new());
        let mut last = 0u8;
        for p in &progress {
            assert!(p.percent >= last);
            last = p.percent;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn cancellation_before_the_first_chunk_emits_nothing() {
        let mut dev = SimDevice::clean(64 * 1024 * 16, 512, Duration::from_millis(1));
        let cancel = CancelToken::new();
        cancel.request();
        let (outcome, progress) = collect_progress(&mut dev, 100, &cancel);
        assert_eq!(outcome, ScanOutcome::Cancelled);
        assert!(progress.is_empty());
    }

    #[test]
    fn zero_geometry_fails_the_scan() {
        let mut dev = SimDevice::clean(0, 512, Duration::from_millis(1));
        let (outcome, progress) = collect_progress(&mut dev, 100, &CancelToken::new());
        match outcome {
            ScanOutcome::Failed(msg) => assert!(msg.contains("geometry"), "{msg}"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(progress.is_empty());
    }

    #[test]
    fn bucket_index_clamps_to_the_last_bucket() {
        assert_eq!(bucket_index(0, 1000, 10), 0);
        assert_eq!(bucket_index(999, 1000, 10), 9);
        assert_eq!(bucket_index(500, 1000, 10), 5);
    }
}
