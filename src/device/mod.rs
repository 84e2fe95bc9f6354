//! Resolution of the monitored block device from a filesystem path.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while resolving the device descriptor.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("cannot stat {}: {source}", path.display())]
    Stat { path: PathBuf, source: io::Error },

    #[error("cannot statvfs {}: {source}", path.display())]
    Statvfs { path: PathBuf, source: io::Error },

    #[error("path {} contains an interior NUL byte", path.display())]
    InvalidPath { path: PathBuf },
}

/// Kernel device number split into major and minor parts.
///
/// Trace events print devices as `major,minor`, so this is the key used to
/// filter the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode a userspace `dev_t` (glibc encoding: 12-bit major, 20-bit minor
    /// split across the low and high words).
    pub const fn from_dev(dev: u64) -> Self {
        let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
        let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
        Self {
            major: major as u32,
            minor: minor as u32,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Immutable description of the monitored device, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// Filesystem block size in bytes.
    pub block_size: u32,
    /// Total number of filesystem blocks.
    pub total_blocks: u64,
}

impl DeviceDescriptor {
    pub const fn new(id: DeviceId, block_size: u32, total_blocks: u64) -> Self {
        Self {
            id,
            block_size,
            total_blocks,
        }
    }

    /// Resolve the device backing `path`.
    pub fn resolve(path: &Path) -> Result<Self, DeviceError> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::metadata(path).map_err(|source| DeviceError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        let id = DeviceId::from_dev(meta.dev());

        let (block_size, total_blocks) = statvfs(path)?;

        Ok(Self {
            id,
            block_size,
            total_blocks,
        })
    }

    /// Convert a 512-byte sector number into a filesystem block number.
    pub fn sector_to_block(&self, sector: u64) -> u64 {
        if self.block_size <= 512 {
            return sector;
        }
        let sectors_per_block = u64::from(self.block_size / 512);
        sector / sectors_per_block
    }
}

fn statvfs(path: &Path) -> Result<(u32, u64), DeviceError> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        DeviceError::InvalidPath {
            path: path.to_path_buf(),
        }
    })?;

    let mut buf = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // Safety: `c_path` is a valid NUL-terminated string and `buf` points to
    // writable memory sized for `struct statvfs`.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(DeviceError::Statvfs {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    // Safety: statvfs returned 0, so the struct is fully initialized.
    let vfs = unsafe { buf.assume_init() };

    let block_size = u32::try_from(vfs.f_bsize).unwrap_or(u32::MAX);
    #[allow(clippy::unnecessary_cast)]
    let total_blocks = vfs.f_blocks as u64;

    Ok((block_size, total_blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dev_classic_encoding() {
        // sda3: major 8, minor 3.
        assert_eq!(DeviceId::from_dev(0x0803), DeviceId::new(8, 3));
        // nvme0n1p2: major 259, minor 2.
        assert_eq!(DeviceId::from_dev((259 << 8) | 2), DeviceId::new(259, 2));
    }

    #[test]
    fn test_from_dev_large_minor() {
        // makedev(253, 300): minor bits above 8 live at bits 20..
        let dev: u64 = (253 << 8) | (300 & 0xff) | ((300 & !0xff) << 12);
        assert_eq!(DeviceId::from_dev(dev), DeviceId::new(253, 300));
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::new(8, 3).to_string(), "8:3");
    }

    #[test]
    fn test_sector_to_block() {
        let dev = DeviceDescriptor::new(DeviceId::new(8, 0), 4096, 1000);
        assert_eq!(dev.sector_to_block(0), 0);
        assert_eq!(dev.sector_to_block(7), 0);
        assert_eq!(dev.sector_to_block(8), 1);
        assert_eq!(dev.sector_to_block(103_233_032), 12_904_129);

        let small = DeviceDescriptor::new(DeviceId::new(8, 0), 512, 1000);
        assert_eq!(small.sector_to_block(77), 77);
    }

    #[test]
    fn test_resolve_temp_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let dev = DeviceDescriptor::resolve(dir.path()).expect("resolve");
        assert!(dev.block_size > 0);
    }

    #[test]
    fn test_resolve_missing_path_is_error() {
        let err = DeviceDescriptor::resolve(Path::new("/nonexistent/blockmon/path"))
            .expect_err("should fail");
        assert!(matches!(err, DeviceError::Stat { .. }));
        assert!(err.to_string().contains("/nonexistent/blockmon/path"));
    }
}
