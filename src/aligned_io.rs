//! Aligned, unbuffered disk I/O primitive.
//!
//! Both engines talk to storage through [`DiskFile`]: a raw device or file
//! handle opened with OS caching defeated, so measured throughput reflects the
//! physical media rather than RAM. Chunk lengths and offsets passed to an
//! unbuffered handle must be pre-aligned to the device sector size; this layer
//! never rounds silently.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use aligned_vec::{AVec, ConstAlign};
use cfg_if::cfg_if;
use thiserror::Error;

use crate::drive_geometry::DriveGeometry;

/// Alignment used for all direct-I/O buffers. 4096 satisfies both 512e and
/// 4Kn devices.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot read disk geometry for {path:?}: {reason}")]
    Geometry { path: PathBuf, reason: String },
    #[error("seek to offset {offset} failed: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("read of {len} bytes at offset {offset} failed: {source}")]
    Read {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("write of {len} bytes at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("flush failed: {source}")]
    Flush {
        #[source]
        source: io::Error,
    },
    #[error("not enough free space: {required_mb} MB required, {available_mb} MB available")]
    FreeSpace { required_mb: u64, available_mb: u64 },
}

impl DiskError {
    /// Extra guidance for the user when the failure has a common remedy.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            DiskError::Open { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                Some("access denied; try running with elevated privileges")
            }
            _ => None,
        }
    }

    /// Render the error the way it should be shown to a person, hint included.
    pub fn to_user_message(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{self} ({hint})"),
            None => self.to_string(),
        }
    }
}

/// How a [`DiskFile`] is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenProfile {
    /// Read-only, OS cache defeated, sequential access hint.
    DirectRead,
    /// Read/write, OS cache defeated, write-through. Creates the file if
    /// missing.
    DirectWrite,
    /// Plain buffered read/write. Setup work only (e.g. pre-populating a
    /// benchmark file); never used inside a timed loop.
    Buffered,
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::os::unix::fs::OpenOptionsExt;

        fn apply_direct_flags(opts: &mut OpenOptions, _profile: OpenProfile) {
            opts.custom_flags(libc::O_DIRECT);
        }
    } else if #[cfg(target_os = "windows")] {
        use std::os::windows::fs::OpenOptionsExt;
        use winapi::um::winbase::{
            FILE_FLAG_NO_BUFFERING, FILE_FLAG_SEQUENTIAL_SCAN, FILE_FLAG_WRITE_THROUGH,
        };

        fn apply_direct_flags(opts: &mut OpenOptions, profile: OpenProfile) {
            let flags = match profile {
                OpenProfile::DirectRead => FILE_FLAG_NO_BUFFERING | FILE_FLAG_SEQUENTIAL_SCAN,
                _ => FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH,
            };
            opts.custom_flags(flags);
        }
    } else {
        // macOS has no open-time flag; F_NOCACHE is applied after open.
        fn apply_direct_flags(_opts: &mut OpenOptions, _profile: OpenProfile) {}
    }
}

/// Outcome of one positioned chunk transfer.
#[derive(Debug, Clone, Copy)]
pub struct ChunkIo {
    /// Bytes actually transferred. For reads this may be less than requested
    /// at end-of-device; zero bytes at EOF is not an error.
    pub bytes: usize,
    pub elapsed: Duration,
}

/// A raw device or file handle with explicit positioning and timed transfers.
pub struct DiskFile {
    file: File,
    pos: u64,
}

impl DiskFile {
    pub fn open(path: &Path, profile: OpenProfile) -> Result<Self, DiskError> {
        let mut opts = OpenOptions::new();
        match profile {
            OpenProfile::DirectRead => {
                opts.read(true);
            }
            OpenProfile::DirectWrite => {
                opts.read(true).write(true).create(true);
            }
            OpenProfile::Buffered => {
                opts.read(true).write(true).create(true);
            }
        }
        if profile != OpenProfile::Buffered {
            apply_direct_flags(&mut opts, profile);
        }
        let file = opts.open(path).map_err(|source| DiskError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        #[cfg(target_os = "macos")]
        if profile != OpenProfile::Buffered {
            use std::os::unix::io::AsRawFd;
            // No O_DIRECT on macOS; F_NOCACHE is the equivalent.
            unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        }
        #[cfg(target_os = "linux")]
        if profile == OpenProfile::DirectRead {
            use std::os::unix::io::AsRawFd;
            unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
        }
        Ok(Self { file, pos: 0 })
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), DiskError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|source| DiskError::Seek { offset, source })?;
        self.pos = offset;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the current position. Fills the buffer
    /// unless end-of-device is reached first.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ChunkIo, DiskError> {
        let started = Instant::now();
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break, // end of device
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DiskError::Read {
                        offset: self.pos,
                        len: buf.len(),
                        source,
                    })
                }
            }
        }
        self.pos += filled as u64;
        Ok(ChunkIo {
            bytes: filled,
            elapsed: started.elapsed(),
        })
    }

    /// Write the whole buffer at the current position.
    pub fn write_chunk(&mut self, buf: &[u8]) -> Result<ChunkIo, DiskError> {
        let started = Instant::now();
        let mut written = 0usize;
        while written < buf.len() {
            match self.file.write(&buf[written..]) {
                Ok(0) => {
                    return Err(DiskError::Write {
                        offset: self.pos,
                        len: buf.len(),
                        source: io::Error::new(
                            io::ErrorKind::WriteZero,
                            "device accepted no bytes",
                        ),
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DiskError::Write {
                        offset: self.pos,
                        len: buf.len(),
                        source,
                    })
                }
            }
        }
        self.pos += written as u64;
        Ok(ChunkIo {
            bytes: written,
            elapsed: started.elapsed(),
        })
    }

    pub fn sync(&mut self) -> Result<(), DiskError> {
        self.file
            .sync_all()
            .map_err(|source| DiskError::Flush { source })
    }
}

/// Allocate a zeroed buffer aligned for direct I/O.
pub fn aligned_buffer(len: usize) -> AVec<u8, ConstAlign<DIRECT_IO_ALIGNMENT>> {
    let mut v = AVec::with_capacity(DIRECT_IO_ALIGNMENT, len);
    for _ in 0..len {
        v.push(0);
    }
    v
}

/// The seam the surface scanner runs against. Production code uses
/// [`RawDevice`]; tests substitute synthetic devices with injected faults and
/// timings.
pub trait BlockDevice {
    fn total_bytes(&self) -> u64;
    fn sector_size(&self) -> u32;
    /// Positioned read. Reading at end-of-device returns zero bytes, not an
    /// error; an error means the underlying call reported a media failure.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<ChunkIo, DiskError>;
}

/// A physical device opened read-only in unbuffered sequential mode, with its
/// geometry captured at open time.
pub struct RawDevice {
    disk: DiskFile,
    geometry: DriveGeometry,
}

impl RawDevice {
    pub fn open(path: &Path) -> Result<Self, DiskError> {
        let disk = DiskFile::open(path, OpenProfile::DirectRead)?;
        let geometry = DriveGeometry::query(path)?;
        Ok(Self { disk, geometry })
    }

    pub fn geometry(&self) -> DriveGeometry {
        self.geometry
    }
}

impl BlockDevice for RawDevice {
    fn total_bytes(&self) -> u64 {
        self.geometry.total_bytes
    }

    fn sector_size(&self) -> u32 {
        self.geometry.sector_size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<ChunkIo, DiskError> {
        self.disk.seek(offset)?;
        self.disk.read_chunk(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn aligned_buffer_is_aligned() {
        let buf = aligned_buffer(64 * 1024);
        assert_eq!(buf.as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);
        assert_eq!(buf.len(), 64 * 1024);
    }

    #[test]
    fn buffered_roundtrip_with_positioning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk.bin");
        let mut disk = DiskFile::open(&path, OpenProfile::Buffered).unwrap();

        let payload = vec![0xA5u8; 8192];
        let wrote = disk.write_chunk(&payload).unwrap();
        assert_eq!(wrote.bytes, payload.len());
        assert_eq!(disk.position(), payload.len() as u64);

        disk.seek(4096).unwrap();
        let mut back = vec![0u8; 4096];
        let read = disk.read_chunk(&mut back).unwrap();
        assert_eq!(read.bytes, 4096);
        assert!(back.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn short_read_at_end_of_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let mut disk = DiskFile::open(&path, OpenProfile::Buffered).unwrap();
        disk.write_chunk(&[1u8; 1000]).unwrap();

        disk.seek(0).unwrap();
        let mut buf = vec![0u8; 4096];
        let io = disk.read_chunk(&mut buf).unwrap();
        assert_eq!(io.bytes, 1000);
    }

    #[test]
    fn permission_errors_carry_an_elevation_hint() {
        let err = DiskError::Open {
            path: PathBuf::from("/dev/sda"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        let msg = err.to_user_message();
        assert!(msg.contains("elevated privileges"), "{msg}");
    }
}
