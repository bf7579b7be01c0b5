//! Device geometry, storage-kind detection and free-space queries.
//!
//! The scanner needs the device's total addressable size and native sector
//! size at open time; the benchmark needs a free-space figure and a
//! storage-type hint to size its test file. All three are thin OS queries.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

use crate::aligned_io::DiskError;

pub const FALLBACK_SECTOR_SIZE: u32 = 512;

/// Total size and native sector size of a device, captured at scan start.
/// A scan never resizes mid-run; this snapshot is authoritative for the run.
#[derive(Debug, Clone, Copy)]
pub struct DriveGeometry {
    pub total_bytes: u64,
    pub sector_size: u32,
}

impl DriveGeometry {
    pub fn query(path: &Path) -> Result<Self, DiskError> {
        let total_bytes = query_total_bytes(path).map_err(|e| DiskError::Geometry {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if total_bytes == 0 {
            return Err(DiskError::Geometry {
                path: path.to_path_buf(),
                reason: "device reports zero size".into(),
            });
        }
        let sector_size = query_sector_size(path).unwrap_or(FALLBACK_SECTOR_SIZE);
        Ok(Self {
            total_bytes,
            sector_size,
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_bytes / self.sector_size as u64
    }
}

/// Works for both block devices and regular files: seeking to the end of an
/// opened handle reports the addressable size on every supported OS.
fn query_total_bytes(path: &Path) -> io::Result<u64> {
    let mut f = File::open(path)?;
    f.seek(SeekFrom::End(0))
}

#[cfg(target_os = "linux")]
fn query_sector_size(path: &Path) -> Option<u32> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let md = std::fs::metadata(path).ok()?;
    let dev = if md.file_type().is_block_device() {
        md.rdev()
    } else {
        // Regular file or mount point: fall back to the device backing the
        // filesystem it lives on.
        md.dev()
    };
    let major = libc::major(dev);
    let minor = libc::minor(dev);
    let node = format!("/sys/dev/block/{major}:{minor}");
    // Partitions keep their queue attributes on the parent disk node.
    for rel in ["queue/logical_block_size", "../queue/logical_block_size"] {
        if let Ok(v) = std::fs::read_to_string(format!("{node}/{rel}")) {
            if let Ok(n) = v.trim().parse::<u32>() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(target_os = "windows")]
fn query_sector_size(path: &Path) -> Option<u32> {
    win::drive_geometry(path).map(|g| g.bytes_per_sector)
}

#[cfg(target_os = "macos")]
fn query_sector_size(path: &Path) -> Option<u32> {
    let dict = mac::diskutil_info(path)?;
    dict.get("DeviceBlockSize")
        .and_then(|v| v.as_signed_integer())
        .map(|n| n as u32)
}

#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
fn query_sector_size(_path: &Path) -> Option<u32> {
    None
}

/// Storage-type hint supplied to the benchmark sizing logic. Detection is
/// best-effort; `Unknown` is always a safe answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Unknown,
    Hdd,
    Ssd,
    Nvme,
    Emmc,
    Usb,
    Optical,
    Network,
}

impl StorageKind {
    pub fn detect(path: &Path) -> StorageKind {
        detect_kind(path).unwrap_or(StorageKind::Unknown)
    }

    pub fn label(self) -> &'static str {
        match self {
            StorageKind::Unknown => "unknown",
            StorageKind::Hdd => "HDD",
            StorageKind::Ssd => "SSD",
            StorageKind::Nvme => "NVMe",
            StorageKind::Emmc => "eMMC",
            StorageKind::Usb => "USB",
            StorageKind::Optical => "optical",
            StorageKind::Network => "network",
        }
    }
}

#[cfg(target_os = "linux")]
fn detect_kind(path: &Path) -> Option<StorageKind> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let md = std::fs::metadata(path).ok()?;
    let dev = if md.file_type().is_block_device() {
        md.rdev()
    } else {
        md.dev()
    };
    let major = libc::major(dev);
    let minor = libc::minor(dev);
    let node = std::fs::canonicalize(format!("/sys/dev/block/{major}:{minor}")).ok()?;
    let disk = if node.join("queue").exists() {
        node
    } else {
        node.parent()?.to_path_buf()
    };

    if let Ok(link) = std::fs::read_link(disk.join("device/subsystem")) {
        match link.file_name().and_then(|s| s.to_str()) {
            Some("nvme") => return Some(StorageKind::Nvme),
            Some("usb") => return Some(StorageKind::Usb),
            Some("mmc") => return Some(StorageKind::Emmc),
            _ => {}
        }
    }
    let rotational = std::fs::read_to_string(disk.join("queue/rotational"))
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())?;
    Some(if rotational != 0 {
        StorageKind::Hdd
    } else {
        StorageKind::Ssd
    })
}

#[cfg(target_os = "windows")]
fn detect_kind(path: &Path) -> Option<StorageKind> {
    // Drive geometry only distinguishes fixed/removable media; finer bus
    // detail comes from the caller's inventory layer.
    win::drive_geometry(path).map(|g| match g.media_type {
        11 => StorageKind::Usb,    // RemovableMedia
        12 | 13 => StorageKind::Hdd, // FixedMedia; rotational unless told otherwise
        _ => StorageKind::Unknown,
    })
}

#[cfg(target_os = "macos")]
fn detect_kind(path: &Path) -> Option<StorageKind> {
    let dict = mac::diskutil_info(path)?;
    let protocol = dict
        .get("Protocol")
        .or_else(|| dict.get("BusProtocol"))
        .and_then(|v| v.as_string())
        .map(|s| s.to_ascii_lowercase());
    match protocol.as_deref() {
        Some("usb") => return Some(StorageKind::Usb),
        Some("nvme") | Some("pci-express") => return Some(StorageKind::Nvme),
        Some("sd") | Some("mmc") => return Some(StorageKind::Emmc),
        _ => {}
    }
    let solid = dict.get("SolidState").and_then(|v| v.as_boolean())?;
    Some(if solid {
        StorageKind::Ssd
    } else {
        StorageKind::Hdd
    })
}

#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
fn detect_kind(_path: &Path) -> Option<StorageKind> {
    None
}

/// Free space on the filesystem containing `path`, in bytes.
#[cfg(target_family = "unix")]
pub fn free_space(path: &Path) -> Result<u64, DiskError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let dir = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    let c_path = CString::new(dir.as_os_str().as_bytes()).map_err(|e| DiskError::Geometry {
        path: path.to_path_buf(),
        reason: format!("invalid path: {e}"),
    })?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat as *mut _) } != 0 {
        return Err(DiskError::Geometry {
            path: path.to_path_buf(),
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(target_family = "windows")]
pub fn free_space(path: &Path) -> Result<u64, DiskError> {
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::fileapi::GetDiskFreeSpaceExW;
    use winapi::um::winnt::ULARGE_INTEGER;

    let mut dir = path.to_path_buf();
    if path.is_file() || !path.exists() {
        dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
    }
    let mut wide: Vec<u16> = dir.as_os_str().encode_wide().collect();
    if wide.last() != Some(&0) {
        wide.push(0);
    }
    let mut free: ULARGE_INTEGER = unsafe { std::mem::zeroed() };
    let mut total: ULARGE_INTEGER = unsafe { std::mem::zeroed() };
    let mut total_free: ULARGE_INTEGER = unsafe { std::mem::zeroed() };
    if unsafe { GetDiskFreeSpaceExW(wide.as_ptr(), &mut free, &mut total, &mut total_free) } == 0 {
        return Err(DiskError::Geometry {
            path: path.to_path_buf(),
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(unsafe { *free.QuadPart() })
}

#[cfg(target_os = "windows")]
mod win {
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::{mem, ptr};
    use winapi::um::{
        fileapi::CreateFileW,
        handleapi::CloseHandle,
        ioapiset::DeviceIoControl,
        winbase::FILE_FLAG_BACKUP_SEMANTICS,
        winioctl::{DISK_GEOMETRY, IOCTL_DISK_GET_DRIVE_GEOMETRY},
        winnt::{FILE_SHARE_READ, FILE_SHARE_WRITE, GENERIC_READ},
    };

    pub struct WinGeometry {
        pub bytes_per_sector: u32,
        pub media_type: u32,
    }

    pub fn drive_geometry(path: &Path) -> Option<WinGeometry> {
        let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
        if wide.last() != Some(&0) {
            wide.push(0);
        }
        unsafe {
            let handle = CreateFileW(
                wide.as_ptr(),
                GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null_mut(),
                3, // OPEN_EXISTING
                FILE_FLAG_BACKUP_SEMANTICS,
                ptr::null_mut(),
            );
            if handle.is_null() {
                return None;
            }
            let mut geom: DISK_GEOMETRY = mem::zeroed();
            let mut bytes = 0u32;
            let ok = DeviceIoControl(
                handle,
                IOCTL_DISK_GET_DRIVE_GEOMETRY,
                ptr::null_mut(),
                0,
                &mut geom as *mut _ as *mut _,
                mem::size_of::<DISK_GEOMETRY>() as u32,
                &mut bytes,
                ptr::null_mut(),
            );
            CloseHandle(handle);
            if ok == 0 {
                return None;
            }
            Some(WinGeometry {
                bytes_per_sector: geom.BytesPerSector,
                media_type: geom.MediaType,
            })
        }
    }
}

#[cfg(target_os = "macos")]
mod mac {
    use plist::Value;
    use std::path::Path;
    use std::process::Command;

    pub fn diskutil_info(path: &Path) -> Option<plist::Dictionary> {
        let out = Command::new("diskutil")
            .args(["info", "-plist"])
            .arg(path)
            .output()
            .ok()?;
        Value::from_reader_xml(&*out.stdout)
            .ok()?
            .into_dictionary()
    }
}
