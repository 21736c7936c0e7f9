//! Disk file manager: one file per batch of migrated sectors,
//! bucket-sharded under `<storage_root>/history/<handle % 10>/`. Exposes the
//! same raw byte-addressed shape as [`crate::ram_pool::RamPool`] so the
//! extended-sector layer can dispatch on handle range without the two
//! backing stores looking different from the outside.

pub(crate) mod format;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use lru::LruCache;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::handle::{ExtendedHandle, DISK_BASE};
use crate::record::RecordKind;

use format::{DiskFileHeader, HEADER_LEN};

/// One disk file the recovery scan found intact, with its first handle and
/// decoded header. The caller (recovery.rs) walks `header.populated_slots`
/// to rebuild chain links.
pub(crate) struct RecoveredSector {
    pub(crate) base: ExtendedHandle,
    pub(crate) sensor_id: u32,
    pub(crate) header: DiskFileHeader,
}

/// A file the recovery scan rejected (bad magic, header checksum, or
/// payload checksum) and moved to the quarantine directory.
pub(crate) struct QuarantinedFile {
    pub(crate) original_path: std::path::PathBuf,
    pub(crate) reason: &'static str,
    /// Base handle parsed from the filename at quarantine time, known even
    /// though the header itself failed to decode.
    pub(crate) handle: ExtendedHandle,
}

struct OpenFile {
    base: u32,
    sensor_id: u32,
    handle_file: File,
    header: DiskFileHeader,
    slots: usize,
}

impl OpenFile {
    fn slot_offset(&self, slot: usize) -> u64 {
        (HEADER_LEN + slot * self.header.stride as usize) as u64
    }

    fn payload_region_len(&self) -> usize {
        self.slots * self.header.stride as usize
    }

    fn recompute_and_write_checksum(&mut self) -> Result<()> {
        let mut payload = vec![0u8; self.payload_region_len()];
        self.handle_file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        self.handle_file.read_exact(&mut payload)?;
        let checksum = crc32fast::hash(&payload);
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, checksum);
        self.handle_file.seek(SeekFrom::Start((HEADER_LEN + self.payload_region_len()) as u64))?;
        self.handle_file.write_all(&buf)?;
        Ok(())
    }

    fn rewrite_header(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        self.header.write_to(&mut buf);
        self.handle_file.seek(SeekFrom::Start(0))?;
        self.handle_file.write_all(&buf)?;
        Ok(())
    }
}

struct Inner {
    fd_cache: LruCache<u32, OpenFile>,
    /// Base id of the file each sensor is currently appending slots into,
    /// if it still has capacity.
    open_for_append: HashMap<u32, u32>,
    next_file_index: u32,
}

/// Owns every disk file backing migrated sectors.
pub(crate) struct DiskManager {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

fn file_base_and_slot(handle: ExtendedHandle, slots_per_sector: usize) -> (u32, usize) {
    let id = handle.disk_id();
    let offset = (id - DISK_BASE) as usize;
    let slots_per_sector = slots_per_sector.max(1);
    let file_index = offset / slots_per_sector;
    let slot = offset % slots_per_sector;
    (DISK_BASE + (file_index * slots_per_sector) as u32, slot)
}

fn file_path(config: &StoreConfig, base: u32, sensor_id: u32) -> std::path::PathBuf {
    config.bucket_dir(base).join(format!("sector_{}_sensor_{}.imx", base, sensor_id))
}

/// Sibling of [`file_path`] in the same bucket directory, used as the
/// write-then-rename staging location. Its name can never collide with a
/// real `.imx` file and [`parse_sector_filename`] rejects it outright, so a
/// crash mid-write just leaves an orphaned `.tmp` file for the next
/// [`DiskManager::open`] scan to clean up.
fn temp_file_path(config: &StoreConfig, base: u32, sensor_id: u32) -> std::path::PathBuf {
    config.bucket_dir(base).join(format!("sector_{}_sensor_{}.imx.tmp", base, sensor_id))
}

impl DiskManager {
    /// Scans every bucket directory under the storage root, registers every
    /// intact file, quarantines every corrupt one, and recovers the
    /// monotone file-index counter. Idempotent: callable again
    /// on an already-scanned root without side effects beyond re-reading.
    pub(crate) fn open(config: StoreConfig) -> Result<(Self, Vec<RecoveredSector>, Vec<QuarantinedFile>)> {
        fs::create_dir_all(config.history_dir())?;
        fs::create_dir_all(&config.recovery_quarantine_dir)?;
        for bucket in 0..10 {
            fs::create_dir_all(config.history_dir().join(bucket.to_string()))?;
        }

        let mut recovered = Vec::new();
        let mut quarantined = Vec::new();
        let mut next_file_index = 0u32;
        let slots_per_sector = config.slots_per_disk_sector();

        for bucket in 0..10 {
            let dir = config.history_dir().join(bucket.to_string());
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => return Err(Error::Io(err)),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();

                // A `.tmp` staging file left behind by a crash between
                // writing and the rename that would have made it visible as
                // a real `.imx` file. It never held live data as far as any
                // chain or the previous run's allocator was concerned.
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!("failed to remove stale temp file {}: {}", path.display(), err);
                    }
                    continue;
                }

                let Some((base, sensor_id)) = parse_sector_filename(&path) else { continue };

                match read_and_verify(&path, slots_per_sector, config.require_checksums) {
                    Ok(header) => {
                        let file_index = (base - DISK_BASE) / slots_per_sector as u32;
                        next_file_index = next_file_index.max(file_index + 1);
                        recovered.push(RecoveredSector {
                            base: ExtendedHandle::from_disk_id(base),
                            sensor_id,
                            header,
                        });
                    }
                    Err(reason) => {
                        warn!("quarantining {}: {}", path.display(), reason);
                        let dest = config.recovery_quarantine_dir.join(
                            path.file_name().expect("file name present from read_dir entry"),
                        );
                        if let Err(err) = fs::rename(&path, &dest) {
                            warn!("failed to quarantine {}: {}", path.display(), err);
                        }
                        quarantined.push(QuarantinedFile {
                            original_path: path,
                            reason,
                            handle: ExtendedHandle::from_disk_id(base),
                        });
                    }
                }
            }
        }

        let manager = DiskManager {
            config,
            inner: Mutex::new(Inner {
                fd_cache: LruCache::new(std::num::NonZeroUsize::new(1).unwrap()),
                open_for_append: HashMap::new(),
                next_file_index,
            }),
        };
        // fd_cache capacity depends on config, set it now that `manager.config` exists.
        manager.inner.lock().unwrap().fd_cache =
            LruCache::new(std::num::NonZeroUsize::new(manager.config.fd_cache_size.max(1)).unwrap());

        Ok((manager, recovered, quarantined))
    }

    /// Allocates a fresh slot for `sensor_id`, reusing the sensor's
    /// currently-open file if it has room, else creating a new one. The
    /// slot's bytes are zeroed; callers write their payload with
    /// [`DiskManager::write_at`] afterward (same two-phase shape as
    /// [`crate::sat::Sat::allocate`] + [`crate::ram_pool::RamPool`]).
    pub(crate) fn allocate_slot(&self, sensor_id: u32, kind: RecordKind, created_ms: u64) -> Result<ExtendedHandle> {
        let slots_per_sector = self.config.slots_per_disk_sector();
        let mut inner = self.inner.lock().unwrap();

        if let Some(&base) = inner.open_for_append.get(&sensor_id) {
            if let Some(open) = inner.fd_cache.get_mut(&base) {
                if (open.header.populated_slots as usize) < slots_per_sector {
                    let slot = open.header.populated_slots as usize;
                    open.header.set_slot_occupied(slot, true);
                    open.header.populated_slots += 1;
                    open.rewrite_header()?;
                    return Ok(ExtendedHandle::from_disk_id(base + slot as u32));
                }
            }
            inner.open_for_append.remove(&sensor_id);
        }

        let file_index = inner.next_file_index;
        inner.next_file_index += 1;
        let base = DISK_BASE + file_index * slots_per_sector as u32;

        let path = file_path(&self.config, base, sensor_id);
        let tmp_path = temp_file_path(&self.config, base, sensor_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut header = DiskFileHeader::new(sensor_id, self.config.sector_size as u32, kind, 1, created_ms);
        header.set_slot_occupied(0, true);
        header.populated_slots = 1;

        // Write-to-temp-then-rename: the bucket directory never observes a
        // half-written `sector_*.imx` file under its final name.
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&tmp_path)?;
        let mut buf = Vec::with_capacity(HEADER_LEN);
        header.write_to(&mut buf);
        buf.resize(HEADER_LEN + slots_per_sector * self.config.sector_size, 0);
        let checksum = crc32fast::hash(&buf[HEADER_LEN..]);
        let mut checksum_buf = [0u8; 4];
        LittleEndian::write_u32(&mut checksum_buf, checksum);
        buf.extend_from_slice(&checksum_buf);
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        fsync_parent_dir(&path)?;

        let open = OpenFile { base, sensor_id, handle_file: file, header, slots: slots_per_sector };
        inner.fd_cache.put(base, open);
        inner.open_for_append.insert(sensor_id, base);
        debug!("created disk sector file base={} sensor={}", base, sensor_id);
        Ok(ExtendedHandle::from_disk_id(base))
    }

    fn with_open_file<T>(&self, inner: &mut Inner, handle: ExtendedHandle, f: impl FnOnce(&mut OpenFile) -> Result<T>) -> Result<T> {
        let slots_per_sector = self.config.slots_per_disk_sector();
        let (base, _slot) = file_base_and_slot(handle, slots_per_sector);
        if inner.fd_cache.get(&base).is_none() {
            let (sensor_id, header) = locate_by_base(&self.config, base)
                .ok_or(Error::NotFound { handle })?;
            let path = file_path(&self.config, base, sensor_id);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            inner.fd_cache.put(base, OpenFile { base, sensor_id, handle_file: file, header, slots: slots_per_sector });
        }
        let open = inner.fd_cache.get_mut(&base).expect("just inserted or already present");
        f(open)
    }

    pub(crate) fn read_at(&self, handle: ExtendedHandle, offset: usize, buf: &mut [u8]) -> Result<()> {
        let slots_per_sector = self.config.slots_per_disk_sector();
        let (_base, slot) = file_base_and_slot(handle, slots_per_sector);
        let mut inner = self.inner.lock().unwrap();
        self.with_open_file(&mut inner, handle, |open| {
            if !open.header.slot_occupied(slot) {
                return Err(Error::NotFound { handle });
            }
            open.handle_file.seek(SeekFrom::Start(open.slot_offset(slot) + offset as u64))?;
            open.handle_file.read_exact(buf)?;
            Ok(())
        })
    }

    pub(crate) fn write_at(&self, handle: ExtendedHandle, offset: usize, buf: &[u8]) -> Result<()> {
        let slots_per_sector = self.config.slots_per_disk_sector();
        let (_base, slot) = file_base_and_slot(handle, slots_per_sector);
        let mut inner = self.inner.lock().unwrap();
        self.with_open_file(&mut inner, handle, |open| {
            if !open.header.slot_occupied(slot) {
                return Err(Error::NotFound { handle });
            }
            let slot_offset = open.slot_offset(slot);
            open.handle_file.seek(SeekFrom::Start(slot_offset + offset as u64))?;
            open.handle_file.write_all(buf)?;
            open.recompute_and_write_checksum()?;
            open.handle_file.sync_data()?;
            Ok(())
        })
    }

    /// Marks the slot free. If the whole file empties out, deletes it and
    /// evicts it from the fd cache.
    pub(crate) fn slots_per_sector(&self) -> usize {
        self.config.slots_per_disk_sector()
    }

    pub(crate) fn free_slot(&self, handle: ExtendedHandle) -> Result<()> {
        let slots_per_sector = self.config.slots_per_disk_sector();
        let (base, slot) = file_base_and_slot(handle, slots_per_sector);
        let mut inner = self.inner.lock().unwrap();
        let now_empty = self.with_open_file(&mut inner, handle, |open| {
            if !open.header.slot_occupied(slot) {
                return Err(Error::NotFound { handle });
            }
            open.header.set_slot_occupied(slot, false);
            open.header.populated_slots -= 1;
            open.rewrite_header()?;
            Ok(open.header.populated_slots == 0)
        })?;
        if now_empty {
            let sensor_id = inner.fd_cache.peek(&base).map(|o| o.sensor_id);
            inner.fd_cache.pop(&base);
            inner.open_for_append.retain(|_, v| *v != base);
            if let Some(sensor_id) = sensor_id {
                let path = file_path(&self.config, base, sensor_id);
                fs::remove_file(&path)?;
                debug!("removed exhausted disk sector file base={} sensor={}", base, sensor_id);
            }
        }
        Ok(())
    }
}

fn parse_sector_filename(path: &std::path::Path) -> Option<(u32, u32)> {
    let name = path.file_stem()?.to_str()?;
    let rest = name.strip_prefix("sector_")?;
    let (base_str, rest) = rest.split_once("_sensor_")?;
    let base: u32 = base_str.parse().ok()?;
    let sensor_id: u32 = rest.parse().ok()?;
    Some((base, sensor_id))
}

fn read_and_verify(path: &std::path::Path, slots_per_sector: usize, require_checksums: bool) -> std::result::Result<DiskFileHeader, &'static str> {
    let mut file = File::open(path).map_err(|_| "open failed")?;
    let mut header_buf = vec![0u8; HEADER_LEN];
    file.read_exact(&mut header_buf).map_err(|_| "short header")?;
    let header = DiskFileHeader::read_from(&header_buf, ExtendedHandle::null()).map_err(|_| "header checksum mismatch")?;

    let payload_len = slots_per_sector * header.stride as usize;
    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload).map_err(|_| "short payload")?;
    let mut checksum_buf = [0u8; 4];
    file.read_exact(&mut checksum_buf).map_err(|_| "short checksum")?;
    if require_checksums {
        let stored = LittleEndian::read_u32(&checksum_buf);
        if crc32fast::hash(&payload) != stored {
            return Err("payload checksum mismatch");
        }
    }
    Ok(header)
}

/// Recovery-path-only: re-derive the file's sensor id and header by
/// re-scanning its bucket directory. Used when the fd cache evicted a file
/// we still need to address by handle.
fn locate_by_base(config: &StoreConfig, base: u32) -> Option<(u32, DiskFileHeader)> {
    let dir = config.bucket_dir(base);
    let entries = fs::read_dir(&dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some((file_base, sensor_id)) = parse_sector_filename(&path) {
            if file_base == base {
                let header = read_and_verify(&path, config.slots_per_disk_sector(), config.require_checksums).ok()?;
                return Some((sensor_id, header));
            }
        }
    }
    None
}

#[cfg(unix)]
fn fsync_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = File::open(parent)?;
        dir.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> (tempfile::TempDir, StoreConfig) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path()).sector_size(32).disk_sector_size(128);
        (dir, cfg)
    }

    #[test]
    fn allocate_write_read_round_trip() {
        let (_dir, cfg) = config();
        let (mgr, recovered, quarantined) = DiskManager::open(cfg).unwrap();
        assert!(recovered.is_empty());
        assert!(quarantined.is_empty());

        let handle = mgr.allocate_slot(7, RecordKind::Tsd, 0).unwrap();
        let payload = vec![0xAB; 32];
        mgr.write_at(handle, 0, &payload).unwrap();

        let mut out = vec![0u8; 32];
        mgr.read_at(handle, 0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn second_allocation_packs_into_same_file_until_full() {
        let (_dir, cfg) = config();
        let (mgr, _, _) = DiskManager::open(cfg).unwrap();
        let a = mgr.allocate_slot(1, RecordKind::Tsd, 0).unwrap();
        let b = mgr.allocate_slot(1, RecordKind::Tsd, 0).unwrap();
        assert_eq!(a.disk_id() + 1, b.disk_id());
    }

    #[test]
    fn freeing_last_slot_deletes_file() {
        let (_dir, cfg) = config();
        let (mgr, _, _) = DiskManager::open(cfg).unwrap();
        let handle = mgr.allocate_slot(3, RecordKind::Tsd, 0).unwrap();
        mgr.free_slot(handle).unwrap();
        assert!(mgr.read_at(handle, 0, &mut [0u8; 32]).is_err());
    }

    #[test]
    fn recovery_rediscovers_written_file() {
        let (_dir, cfg) = config();
        let root = cfg.storage_root.clone();
        {
            let (mgr, _, _) = DiskManager::open(cfg).unwrap();
            let handle = mgr.allocate_slot(9, RecordKind::Evt, 123).unwrap();
            mgr.write_at(handle, 0, &vec![1u8; 32]).unwrap();
        }
        let reopened = StoreConfig::new(&root).sector_size(32).disk_sector_size(128);
        let (_mgr, recovered, quarantined) = DiskManager::open(reopened).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(quarantined.is_empty());
        assert_eq!(recovered[0].sensor_id, 9);
    }
}
