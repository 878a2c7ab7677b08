#![forbid(unsafe_code)]
//! Sector-addressed device boundary.
//!
//! The cache talks to storage exclusively through [`SectorDevice`]: fixed-size
//! sector reads and writes plus a sector-count query. Two implementations are
//! provided: [`FileSectorDevice`] for disk images (Linux `pread`/`pwrite`
//! style I/O) and [`MemSectorDevice`], a shared in-memory store for tests and
//! tooling.

use bufcache_error::{CacheError, Result};
use bufcache_types::{SectorNumber, SECTOR_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Fixed-size sector I/O interface.
///
/// All transfers are exactly [`SECTOR_SIZE`] bytes; implementations reject
/// anything else.
pub trait SectorDevice: Send + Sync {
    /// Read one sector into `buf`. `buf.len()` MUST equal `SECTOR_SIZE`.
    fn read_sector(&self, sector: SectorNumber, buf: &mut [u8]) -> Result<()>;

    /// Write one sector from `buf`. `buf.len()` MUST equal `SECTOR_SIZE`.
    fn write_sector(&self, sector: SectorNumber, buf: &[u8]) -> Result<()>;

    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_buf(len: usize) -> Result<()> {
    if len != SECTOR_SIZE {
        return Err(CacheError::BufferSize {
            got: len,
            expected: SECTOR_SIZE,
        });
    }
    Ok(())
}

fn check_range(sector: SectorNumber, sector_count: u64) -> Result<()> {
    if sector.0 >= sector_count {
        return Err(CacheError::OutOfRange {
            sector: sector.0,
            sector_count,
        });
    }
    Ok(())
}

fn sector_offset(sector: SectorNumber) -> Result<u64> {
    sector
        .byte_offset()
        .ok_or_else(|| CacheError::Geometry(format!("sector {} offset overflows u64", sector.0)))
}

/// File-backed sector device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Falls back to a read-only handle when the
/// image cannot be opened for writing.
#[derive(Debug, Clone)]
pub struct FileSectorDevice {
    file: Arc<File>,
    sector_count: u64,
    writable: bool,
}

impl FileSectorDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let size = u64::try_from(SECTOR_SIZE)
            .map_err(|_| CacheError::Geometry("SECTOR_SIZE does not fit u64".to_owned()))?;
        if len % size != 0 {
            return Err(CacheError::Geometry(format!(
                "image length is not sector-aligned: len_bytes={len} sector_size={size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            sector_count: len / size,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl SectorDevice for FileSectorDevice {
    fn read_sector(&self, sector: SectorNumber, buf: &mut [u8]) -> Result<()> {
        check_buf(buf.len())?;
        check_range(sector, self.sector_count)?;
        self.file.read_exact_at(buf, sector_offset(sector)?)?;
        Ok(())
    }

    fn write_sector(&self, sector: SectorNumber, buf: &[u8]) -> Result<()> {
        check_buf(buf.len())?;
        if !self.writable {
            return Err(CacheError::ReadOnly);
        }
        check_range(sector, self.sector_count)?;
        self.file.write_all_at(buf, sector_offset(sector)?)?;
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Shared in-memory sector device.
///
/// Cloning yields another handle to the same backing store, so a test can
/// hand one clone to the cache and inspect the other directly.
#[derive(Debug, Clone)]
pub struct MemSectorDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    sector_count: u64,
}

impl MemSectorDevice {
    /// Create a zero-filled device with `sector_count` sectors.
    ///
    /// # Panics
    ///
    /// Panics if the image does not fit in addressable memory. This type is
    /// test and tooling support; the file-backed device is the real path.
    #[must_use]
    pub fn new(sector_count: u64) -> Self {
        let len = usize::try_from(sector_count)
            .ok()
            .and_then(|count| count.checked_mul(SECTOR_SIZE))
            .expect("sector_count does not fit in memory");
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
            sector_count,
        }
    }

    fn span(&self, sector: SectorNumber) -> Result<(usize, usize)> {
        check_range(sector, self.sector_count)?;
        let start = usize::try_from(sector_offset(sector)?)
            .map_err(|_| CacheError::Geometry("sector offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(SECTOR_SIZE)
            .ok_or_else(|| CacheError::Geometry("sector range overflows usize".to_owned()))?;
        Ok((start, end))
    }
}

impl SectorDevice for MemSectorDevice {
    fn read_sector(&self, sector: SectorNumber, buf: &mut [u8]) -> Result<()> {
        check_buf(buf.len())?;
        let (start, end) = self.span(sector)?;
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_sector(&self, sector: SectorNumber, buf: &[u8]) -> Result<()> {
        check_buf(buf.len())?;
        let (start, end) = self.span(sector)?;
        let mut bytes = self.bytes.lock();
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
