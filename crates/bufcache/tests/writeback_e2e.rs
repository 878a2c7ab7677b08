#![forbid(unsafe_code)]
//! End-to-end write-back coverage: daemon drain, clean shutdown, explicit
//! flush, and a file-backed image.

use bufcache::{
    CacheConfig, MemSectorDevice, SectorCache, SectorDevice, SectorNumber, SECTOR_SIZE,
};
use bufcache_error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Device wrapper recording every sector write and sync.
#[derive(Debug)]
struct CountingSectorDevice<D: SectorDevice> {
    inner: D,
    writes: Mutex<Vec<u64>>,
    sync_calls: AtomicUsize,
}

impl<D: SectorDevice> CountingSectorDevice<D> {
    fn new(inner: D) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
            sync_calls: AtomicUsize::new(0),
        }
    }

    fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    fn sync_count(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }
}

impl<D: SectorDevice> SectorDevice for CountingSectorDevice<D> {
    fn read_sector(&self, sector: SectorNumber, buf: &mut [u8]) -> Result<()> {
        self.inner.read_sector(sector, buf)
    }

    fn write_sector(&self, sector: SectorNumber, buf: &[u8]) -> Result<()> {
        self.writes.lock().push(sector.0);
        self.inner.write_sector(sector, buf)
    }

    fn sector_count(&self) -> u64 {
        self.inner.sector_count()
    }

    fn sync(&self) -> Result<()> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.sync()
    }
}

fn sector_payload(sector: u64, salt: u8) -> Vec<u8> {
    let mut out = vec![salt; SECTOR_SIZE];
    out[..8].copy_from_slice(&sector.to_le_bytes());
    out
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn wait_for_dirty_drain<D: SectorDevice>(cache: &SectorCache<D>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cache.dirty_count() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(cache.dirty_count(), 0, "dirty sectors did not drain in time");
}

#[test]
fn daemon_drains_dirty_sectors() {
    let shared = MemSectorDevice::new(256);
    let cache = SectorCache::with_config(
        shared.clone(),
        CacheConfig {
            capacity: 128,
            flush_interval: Duration::from_millis(20),
        },
    )
    .expect("cache");

    let mut checksums = HashMap::new();
    for sector in 0_u64..100 {
        let payload = sector_payload(sector, 0xA5);
        checksums.insert(sector, blake3_hex(&payload));
        cache.write(SectorNumber(sector), &payload).expect("write");
    }

    wait_for_dirty_drain(&cache, Duration::from_secs(2));
    cache.close().expect("close");

    let mut out = [0_u8; SECTOR_SIZE];
    for sector in 0_u64..100 {
        shared
            .read_sector(SectorNumber(sector), &mut out)
            .expect("device read");
        assert_eq!(blake3_hex(&out), checksums[&sector], "sector {sector}");
    }
}

#[test]
fn close_flushes_everything() {
    let shared = MemSectorDevice::new(128);
    let counted = CountingSectorDevice::new(shared.clone());
    let cache = SectorCache::with_config(
        counted,
        CacheConfig {
            capacity: 64,
            // Long enough that the daemon never fires on its own.
            flush_interval: Duration::from_secs(2),
        },
    )
    .expect("cache");

    let mut checksums = HashMap::new();
    for sector in 0_u64..50 {
        let payload = sector_payload(sector, 0x2A);
        checksums.insert(sector, blake3_hex(&payload));
        cache.write(SectorNumber(sector), &payload).expect("write");
    }
    assert!(cache.dirty_count() > 0, "expected dirty sectors before close");

    cache.close().expect("close");

    let mut out = [0_u8; SECTOR_SIZE];
    for sector in 0_u64..50 {
        shared
            .read_sector(SectorNumber(sector), &mut out)
            .expect("device read");
        assert_eq!(blake3_hex(&out), checksums[&sector], "sector {sector}");
    }
}

#[test]
fn flush_is_idempotent_once_clean() {
    let shared = MemSectorDevice::new(64);
    let counted = CountingSectorDevice::new(shared);
    let cache = SectorCache::with_config(
        counted,
        CacheConfig {
            capacity: 32,
            flush_interval: Duration::from_secs(3600),
        },
    )
    .expect("cache");

    for sector in 0_u64..10 {
        cache
            .write(SectorNumber(sector), &sector_payload(sector, 0x33))
            .expect("write");
    }

    cache.flush().expect("first flush");
    let writes_after_first = cache.device().write_count();
    assert_eq!(writes_after_first, 10);
    assert_eq!(cache.device().sync_count(), 1);

    cache.flush().expect("second flush");
    assert_eq!(
        cache.device().write_count(),
        writes_after_first,
        "a clean cache must not rewrite sectors"
    );
    assert_eq!(cache.device().sync_count(), 2);
}

#[test]
fn file_backed_image_survives_reopen() {
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(&vec![0_u8; SECTOR_SIZE * 32]).expect("seed image");
    tmp.flush().expect("seed flush");

    let expected = sector_payload(17, 0x99);
    {
        let device = bufcache::FileSectorDevice::open(tmp.path()).expect("open");
        let cache = SectorCache::with_config(
            device,
            CacheConfig {
                capacity: 8,
                flush_interval: Duration::from_millis(50),
            },
        )
        .expect("cache");
        cache.write(SectorNumber(17), &expected).expect("write");
        cache.close().expect("close");
    }

    let reopened = bufcache::FileSectorDevice::open(tmp.path()).expect("reopen");
    let mut out = [0_u8; SECTOR_SIZE];
    reopened
        .read_sector(SectorNumber(17), &mut out)
        .expect("read");
    assert_eq!(blake3_hex(&out), blake3_hex(&expected));
}
