//! Low-level storage diagnostics.
//!
//! Two independent engines share one design: open a raw, unbuffered handle,
//! perform timed I/O in fixed-size aligned chunks, aggregate statistics, and
//! push progress snapshots to a subscriber over a channel.
//!
//! - [`SurfaceScanner`] walks a device's whole addressable range and maps
//!   good/slow/bad sectors onto display buckets.
//! - [`SpeedBenchmark`] measures sequential and random-4K read/write
//!   throughput against a temporary file, sized by storage type.
//!
//! Both run their timed loop on a single dedicated worker thread, honour a
//! shared [`CancelToken`] at chunk boundaries, and always deliver exactly one
//! terminal event per run.

pub mod aligned_io;
pub mod benchmark;
pub mod cancel;
pub mod drive_geometry;
pub mod events;
pub mod surface_scan;

pub use aligned_io::{
    aligned_buffer, BlockDevice, ChunkIo, DiskError, DiskFile, OpenProfile, RawDevice,
};
pub use benchmark::{run_benchmark, BenchmarkConfig, SpeedBenchmark};
pub use cancel::CancelToken;
pub use drive_geometry::{free_space, DriveGeometry, StorageKind};
pub use events::{
    BenchEvent, BenchmarkPhase, BenchmarkProgress, BenchmarkResult, ScanEvent, ScanOutcome,
    ScanProgress, NOT_MEASURED,
};
pub use surface_scan::{run_scan, SurfaceScanner, DEFAULT_BUCKET_COUNT};
