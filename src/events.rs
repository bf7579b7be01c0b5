//! Progress and result types pushed over the engines' event channels.
//!
//! Delivery contract: events are sent from the engine's worker thread over a
//! `crossbeam_channel` sender, in order, fire-and-forget. Every run ends with
//! exactly one `Finished` event regardless of outcome, so consumers can
//! reliably stop spinners and re-enable controls. A disconnected receiver
//! never aborts a run.

use serde_json::json;

/// Sentinel throughput figure meaning "this phase was not measured".
pub const NOT_MEASURED: f64 = -1.0;

/// Snapshot emitted by the surface scanner, once per display-bucket
/// transition. Owned by the consumer once sent.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    /// 0–100, monotonically non-decreasing across a run.
    pub percent: u8,
    pub bytes_scanned: u64,
    pub total_bytes: u64,
    pub good_sectors: u64,
    pub bad_sectors: u64,
    pub slow_sectors: u64,
    /// Running average over the whole scan so far, in MB/s.
    pub avg_mbps: f64,
    /// The display bucket just finalized.
    pub bucket_index: usize,
    /// Good iff no sector in the bucket failed to read.
    pub bucket_good: bool,
    /// Average chunk read time over the bucket, in milliseconds. Always a
    /// small positive value, never zero.
    pub bucket_avg_ms: f64,
}

/// Terminal state of a scan. The engine never judges pass/fail; consumers
/// conventionally treat `Completed` with zero bad sectors as a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Progress(ScanProgress),
    Finished(ScanOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkPhase {
    PreparingFile,
    SequentialWrite,
    SequentialRead,
    RandomWrite,
    RandomRead,
    Complete,
}

impl BenchmarkPhase {
    pub fn label(self) -> &'static str {
        match self {
            BenchmarkPhase::PreparingFile => "preparing-file",
            BenchmarkPhase::SequentialWrite => "sequential-write",
            BenchmarkPhase::SequentialRead => "sequential-read",
            BenchmarkPhase::RandomWrite => "random-write",
            BenchmarkPhase::RandomRead => "random-read",
            BenchmarkPhase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkProgress {
    pub phase: BenchmarkPhase,
    /// 0–100 across the whole multi-phase run.
    pub percent: f64,
    /// Instantaneous throughput over the most recent measurement window.
    pub mbps: f64,
}

/// Terminal benchmark outcome. Exactly one of `completed == true` with
/// figures, or `completed == false` (error message set unless cancelled).
#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub sequential_read_mbps: f64,
    pub sequential_write_mbps: f64,
    pub random_read_mbps: f64,
    pub random_write_mbps: f64,
    pub completed: bool,
    pub error: Option<String>,
}

impl Default for BenchmarkResult {
    fn default() -> Self {
        Self {
            sequential_read_mbps: NOT_MEASURED,
            sequential_write_mbps: NOT_MEASURED,
            random_read_mbps: NOT_MEASURED,
            random_write_mbps: NOT_MEASURED,
            completed: false,
            error: None,
        }
    }
}

impl BenchmarkResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sequential_read_mbps": self.sequential_read_mbps,
            "sequential_write_mbps": self.sequential_write_mbps,
            "random_read_mbps": self.random_read_mbps,
            "random_write_mbps": self.random_write_mbps,
            "completed": self.completed,
            "error": self.error,
        })
    }
}

#[derive(Debug, Clone)]
pub enum BenchEvent {
    Progress(BenchmarkProgress),
    Finished(BenchmarkResult),
}
