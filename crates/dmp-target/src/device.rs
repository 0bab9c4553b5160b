//! Underlying device handles
//!
//! Resolves a table argument (a path or `MAJOR:MINOR`) to an open file and
//! provides positional I/O on it. A [`BlockDevice`] is shared by `Arc`: the
//! volume descriptor holds one reference and every in-flight request holds
//! another, so the file stays open until the last of them is gone.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// sysfs directory indexing block devices by `MAJOR:MINOR`
const SYSFS_DEV_BLOCK: &str = "/sys/dev/block";

/// Largest buffer used when zero-filling a range
const ZERO_CHUNK: usize = 1024 * 1024;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// How the table wants its devices opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Access mode of the table a volume belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableMode {
    pub access: AccessMode,
    /// Claim block devices exclusively (`O_EXCL`)
    pub exclusive: bool,
}

impl TableMode {
    pub const fn read_only() -> Self {
        Self {
            access: AccessMode::ReadOnly,
            exclusive: false,
        }
    }
}

/// An open underlying device
#[derive(Debug)]
pub struct BlockDevice {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    mode: TableMode,
    is_block_device: bool,
}

impl BlockDevice {
    /// Resolve `identifier` and open it with `mode`
    pub fn open(identifier: &str, mode: TableMode) -> std::io::Result<Self> {
        let path = resolve(Path::new(SYSFS_DEV_BLOCK), identifier)?;
        Self::open_path(path, mode)
    }

    /// Open a device or file by path
    pub fn open_path(path: impl Into<PathBuf>, mode: TableMode) -> std::io::Result<Self> {
        let path = path.into();
        let is_block_device = is_block_device(&path)?;

        let mut options = OpenOptions::new();
        options.read(true).write(mode.access.is_writable());

        #[cfg(target_os = "linux")]
        {
            // On Linux, O_EXCL on a block device fails if it is mounted or
            // already claimed.
            if mode.exclusive && is_block_device {
                options.custom_flags(libc::O_EXCL);
            }
        }

        let file = options.open(&path)?;
        let size = if is_block_device {
            block_device_size(&file)?
        } else {
            file.metadata()?.len()
        };

        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, path = %path.display(), size, "opened device");

        Ok(Self {
            id,
            path,
            file,
            size,
            mode,
            is_block_device,
        })
    }

    /// Process-unique handle id
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Size in whole sectors
    pub const fn size_sectors(&self) -> u64 {
        self.size >> crate::SECTOR_SHIFT
    }

    pub const fn mode(&self) -> TableMode {
        self.mode
    }

    pub const fn is_block_device(&self) -> bool {
        self.is_block_device
    }

    /// Fill `buf` from byte `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    /// Write all of `data` at byte `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// Write zeroes over `len` bytes starting at `offset`
    pub fn zero_range(&self, offset: u64, len: u64) -> std::io::Result<()> {
        let zeroes = vec![0u8; usize::try_from(len).map_or(ZERO_CHUNK, |n| n.min(ZERO_CHUNK))];
        let mut pos = offset;
        let mut remaining = len;
        while remaining > 0 {
            let n = usize::try_from(remaining).map_or(zeroes.len(), |r| r.min(zeroes.len()));
            self.file.write_all_at(&zeroes[..n], pos)?;
            pos += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Flush written data to stable storage
    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

/// Resolve a table argument to a device path.
///
/// `MAJOR:MINOR` is looked up under `sysfs_root` through the `DEVNAME` entry
/// of its `uevent` file; anything else is taken as a path.
fn resolve(sysfs_root: &Path, identifier: &str) -> std::io::Result<PathBuf> {
    let Some((major, minor)) = parse_dev_t(identifier) else {
        return Ok(PathBuf::from(identifier));
    };

    let uevent = sysfs_root.join(format!("{major}:{minor}")).join("uevent");
    let contents = std::fs::read_to_string(&uevent)?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(|name| Path::new("/dev").join(name.trim()))
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no DEVNAME in {}", uevent.display()),
            )
        })
}

fn parse_dev_t(identifier: &str) -> Option<(u32, u32)> {
    let (major, minor) = identifier.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn is_block_device(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;
    Ok(std::fs::metadata(path)?.file_type().is_block_device())
}

/// Get block device size using ioctl
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64 ioctl
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    // SAFETY: the fd is open for the duration of the call and `size` is a
    // valid u64 the kernel writes into.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(size)
}

/// Get block device size (non-Linux fallback)
#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    let size = f.seek(SeekFrom::End(0))?;
    f.seek(SeekFrom::Start(0))?;
    Ok(size)
}
