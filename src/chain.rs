//! Per-sensor chained-sector record store: each sensor owns a
//! singly-linked chain of sectors, head = oldest, tail = newest, modeled the
//! way `fatfs::table` walks FAT cluster chains — just with an
//! [`crate::handle::ExtendedHandle`] instead of a cluster number, and a
//! sector that can live in RAM or on disk.

use std::collections::HashMap;
use std::sync::Mutex;

use log::trace;

use crate::error::{Error, Result};
use crate::extended::ExtendedStore;
use crate::handle::ExtendedHandle;
use crate::record::{Record, RecordKind};
use crate::ram_pool::HEADER_LEN as SECTOR_HEADER_LEN;
use crate::sat::Sat;

const OFF_SENSOR: usize = 0;
const OFF_NEXT: usize = 4;
const OFF_COUNT: usize = 8;
const OFF_CONSUMED: usize = 9;
const OFF_KIND: usize = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SectorHeader {
    pub(crate) sensor_id: u32,
    pub(crate) next: ExtendedHandle,
    pub(crate) count: u8,
    pub(crate) consumed: u8,
    pub(crate) kind: RecordKind,
}

impl SectorHeader {
    fn encode(self, buf: &mut [u8; SECTOR_HEADER_LEN]) {
        buf[OFF_SENSOR..OFF_SENSOR + 4].copy_from_slice(&self.sensor_id.to_le_bytes());
        buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&self.next.raw().to_le_bytes());
        buf[OFF_COUNT] = self.count;
        buf[OFF_CONSUMED] = self.consumed;
        buf[OFF_KIND] = self.kind.tag();
    }

    fn decode(buf: &[u8; SECTOR_HEADER_LEN]) -> Option<Self> {
        let sensor_id = u32::from_le_bytes(buf[OFF_SENSOR..OFF_SENSOR + 4].try_into().unwrap());
        let next_raw = u32::from_le_bytes(buf[OFF_NEXT..OFF_NEXT + 4].try_into().unwrap());
        let kind = RecordKind::from_tag(buf[OFF_KIND])?;
        Some(SectorHeader {
            sensor_id,
            next: if next_raw == 0 { ExtendedHandle::null() } else if next_raw < crate::handle::DISK_BASE {
                ExtendedHandle::from_ram_index(next_raw)
            } else {
                ExtendedHandle::from_disk_id(next_raw)
            },
            count: buf[OFF_COUNT],
            consumed: buf[OFF_CONSUMED],
            kind,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ChainState {
    head: ExtendedHandle,
    tail: ExtendedHandle,
    /// First sector still resident in RAM, walking from `head`. `NONE` if
    /// the chain's entire current content has already migrated to disk (the
    /// next append reinstates it at the new tail).
    first_ram: ExtendedHandle,
    record_count: u64,
    kind: RecordKind,
}

pub(crate) struct MigrationOutcome {
    pub(crate) sectors_freed: u32,
}

/// Owns the RAM/disk backing stores and the per-sensor chain table.
pub(crate) struct ChainStore {
    sector_size: usize,
    sat: Sat,
    store: ExtendedStore,
    chains: Mutex<HashMap<u32, ChainState>>,
}

fn capacity_for(kind: RecordKind, sector_size: usize) -> usize {
    (sector_size - SECTOR_HEADER_LEN) / kind.record_size()
}

impl ChainStore {
    pub(crate) fn new(sector_size: usize, sat: Sat, store: ExtendedStore) -> Self {
        ChainStore { sector_size, sat, store, chains: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn sat(&self) -> &Sat {
        &self.sat
    }

    pub(crate) fn store(&self) -> &ExtendedStore {
        &self.store
    }

    pub(crate) fn read_header(&self, handle: ExtendedHandle) -> Result<SectorHeader> {
        let mut buf = [0u8; SECTOR_HEADER_LEN];
        self.store.read(handle, 0, SECTOR_HEADER_LEN, self.sector_size, &mut buf)?;
        SectorHeader::decode(&buf).ok_or(Error::CorruptState { sensor: None, detail: "unknown record kind tag in sector header" })
    }

    fn write_header(&self, handle: ExtendedHandle, header: SectorHeader) -> Result<()> {
        let mut buf = [0u8; SECTOR_HEADER_LEN];
        header.encode(&mut buf);
        self.store.write(handle, 0, SECTOR_HEADER_LEN, self.sector_size, &buf)
    }

    fn record_offset(&self, index: u8, kind: RecordKind) -> usize {
        SECTOR_HEADER_LEN + index as usize * kind.record_size()
    }

    /// Appends one record to `sensor`'s chain, allocating a new RAM sector
    /// when the tail is full or the chain does not exist yet. Returns
    /// [`Error::NoSpace`] if the RAM pool is exhausted; the caller (engine)
    /// is expected to run a migration pass and retry.
    pub(crate) fn append(&self, sensor: u32, record: Record) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        let state = chains.entry(sensor).or_insert(ChainState {
            head: ExtendedHandle::null(),
            tail: ExtendedHandle::null(),
            first_ram: ExtendedHandle::null(),
            record_count: 0,
            kind: record.kind(),
        });

        if state.tail.is_null() {
            let handle = self.sat.allocate(Some(sensor));
            if handle.is_null() {
                return Err(Error::NoSpace { sensor: Some(sensor) });
            }
            self.sat.mark_used(handle, sensor, record.kind());
            self.write_header(
                handle,
                SectorHeader { sensor_id: sensor, next: ExtendedHandle::null(), count: 0, consumed: 0, kind: record.kind() },
            )?;
            state.head = handle;
            state.tail = handle;
            state.first_ram = handle;
            state.kind = record.kind();
        }

        let mut tail_header = self.read_header(state.tail)?;
        let capacity = capacity_for(tail_header.kind, self.sector_size);
        if (tail_header.count as usize) >= capacity {
            let new_handle = self.sat.allocate(Some(sensor));
            if new_handle.is_null() {
                return Err(Error::NoSpace { sensor: Some(sensor) });
            }
            self.sat.mark_used(new_handle, sensor, record.kind());
            self.write_header(
                new_handle,
                SectorHeader { sensor_id: sensor, next: ExtendedHandle::null(), count: 0, consumed: 0, kind: record.kind() },
            )?;

            tail_header.next = new_handle;
            self.write_header(state.tail, tail_header)?;
            if state.tail.is_ram() {
                self.sat.set_next(state.tail, new_handle);
            }
            if state.first_ram.is_null() {
                state.first_ram = new_handle;
            }
            state.tail = new_handle;
            tail_header = self.read_header(new_handle)?;
        }

        let offset = self.record_offset(tail_header.count, tail_header.kind);
        let mut buf = vec![0u8; tail_header.kind.record_size()];
        record.encode(&mut buf);
        self.store.write(state.tail, offset, buf.len(), buf.len(), &buf)?;
        tail_header.count += 1;
        self.write_header(state.tail, tail_header)?;
        state.record_count += 1;
        trace!("sensor {} appended record, chain length now {}", sensor, state.record_count);
        Ok(())
    }

    /// Decodes the oldest not-yet-erased record without consuming it.
    pub(crate) fn peek_oldest(&self, sensor: u32) -> Result<Record> {
        let chains = self.chains.lock().unwrap();
        let state = chains.get(&sensor).ok_or(Error::NotFound { handle: ExtendedHandle::null() })?;
        if state.head.is_null() {
            return Err(Error::NotFound { handle: ExtendedHandle::null() });
        }
        let header = self.read_header(state.head)?;
        if header.consumed >= header.count {
            return Err(Error::NotFound { handle: state.head });
        }
        let offset = self.record_offset(header.consumed, header.kind);
        let mut buf = vec![0u8; header.kind.record_size()];
        self.store.read(state.head, offset, buf.len(), buf.len(), &mut buf)?;
        Ok(Record::decode(header.kind, &buf))
    }

    /// Marks the oldest record consumed, freeing its sector once every
    /// record in it has been consumed.
    pub(crate) fn erase_oldest(&self, sensor: u32) -> Result<()> {
        let mut chains = self.chains.lock().unwrap();
        let state = chains.get_mut(&sensor).ok_or(Error::NotFound { handle: ExtendedHandle::null() })?;
        if state.head.is_null() {
            return Err(Error::NotFound { handle: ExtendedHandle::null() });
        }
        let mut header = self.read_header(state.head)?;
        if header.consumed >= header.count {
            return Err(Error::NotFound { handle: state.head });
        }
        header.consumed += 1;
        self.write_header(state.head, header)?;
        state.record_count -= 1;

        if header.consumed == header.count {
            let freed = state.head;
            let next = header.next;
            if freed.is_ram() {
                self.sat.free(freed);
                self.store.ram().zero(freed);
            } else {
                self.store.disk().free_slot(freed)?;
            }
            if state.first_ram == freed {
                state.first_ram = next;
            }
            state.head = next;
            if next.is_null() {
                state.tail = ExtendedHandle::null();
                state.first_ram = ExtendedHandle::null();
            }
        }
        Ok(())
    }

    pub(crate) fn length(&self, sensor: u32) -> u64 {
        self.chains.lock().unwrap().get(&sensor).map(|s| s.record_count).unwrap_or(0)
    }

    /// Candidate RAM sector (with its age) for migration: the oldest
    /// still-RAM sector of each live chain, i.e. `first_ram`.
    /// Chains whose entire current content already migrated (`first_ram`
    /// null) are skipped — there is nothing left to move until the next
    /// append extends them again.
    pub(crate) fn migration_candidates(&self) -> Vec<(u32, ExtendedHandle, u64)> {
        let chains = self.chains.lock().unwrap();
        chains
            .iter()
            .filter(|(_, s)| s.first_ram.is_ram())
            .map(|(&sensor, s)| (sensor, s.first_ram, self.sat.meta(s.first_ram).age))
            .collect()
    }

    /// Copies up to `max_sectors` consecutive RAM sectors starting at
    /// `sensor`'s `first_ram` onto disk, relinking the chain in place, and
    /// freeing the RAM sectors. Stops early at the tail (a chain never
    /// migrates its own still-being-appended-to tail sector).
    pub(crate) fn migrate_prefix(&self, sensor: u32, max_sectors: u32, now_ms: u64) -> Result<MigrationOutcome> {
        let mut chains = self.chains.lock().unwrap();
        let state = chains.get_mut(&sensor).ok_or(Error::NotFound { handle: ExtendedHandle::null() })?;
        let mut freed = 0u32;
        let mut cursor = state.first_ram;
        let mut prev_disk_handle: Option<ExtendedHandle> = None;

        while freed < max_sectors && cursor.is_ram() && cursor != state.tail {
            let header = self.read_header(cursor)?;
            let disk_handle = self.store.disk().allocate_slot(sensor, header.kind, now_ms)?;
            let mut raw = vec![0u8; self.sector_size];
            self.store.read(cursor, 0, self.sector_size, self.sector_size, &mut raw)?;
            if let Err(err) = self.store.write(disk_handle, 0, self.sector_size, self.sector_size, &raw) {
                // The file for disk_handle was already created and fsynced by
                // allocate_slot; a failed copy must not leave it dangling,
                // unlinked from any chain.
                let _ = self.store.disk().free_slot(disk_handle);
                return Err(err);
            }

            if let Some(prev) = prev_disk_handle {
                let mut prev_header = self.read_header(prev)?;
                prev_header.next = disk_handle;
                self.write_header(prev, prev_header)?;
            } else {
                state.head = disk_handle;
            }

            let next = header.next;
            self.sat.free(cursor);
            self.store.ram().zero(cursor);
            freed += 1;
            prev_disk_handle = Some(disk_handle);
            cursor = next;
        }

        if let Some(prev) = prev_disk_handle {
            let mut prev_header = self.read_header(prev)?;
            prev_header.next = cursor;
            self.write_header(prev, prev_header)?;
        }
        state.first_ram = if cursor.is_ram() { cursor } else { ExtendedHandle::null() };
        if state.head.is_null() {
            state.head = cursor;
        }

        Ok(MigrationOutcome { sectors_freed: freed })
    }

    /// Rebuilds one chain's state from a disk-only segment discovered at
    /// startup. Called once per recovered sensor before any
    /// append/read traffic arrives; chains are appended to in creation-time
    /// order by the caller.
    pub(crate) fn register_recovered_segment(&self, sensor: u32, head: ExtendedHandle, tail: ExtendedHandle, record_count: u64, kind: RecordKind) {
        let mut chains = self.chains.lock().unwrap();
        let entry = chains.entry(sensor).or_insert(ChainState {
            head: ExtendedHandle::null(),
            tail: ExtendedHandle::null(),
            first_ram: ExtendedHandle::null(),
            record_count: 0,
            kind,
        });
        if entry.head.is_null() {
            entry.head = head;
        }
        entry.tail = tail;
        entry.record_count += record_count;
        entry.kind = kind;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::disk::DiskManager;
    use crate::ram_pool::RamPool;

    fn new_store(ram_sectors: u32, sector_size: usize) -> (tempfile::TempDir, ChainStore) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path()).ram_sectors(ram_sectors).sector_size(sector_size).disk_sector_size(sector_size * 4);
        let sat = Sat::new(cfg.ram_sectors);
        let ram = RamPool::new(cfg.ram_sectors, cfg.sector_size);
        let (disk, _, _) = DiskManager::open(cfg.clone()).unwrap();
        let extended = ExtendedStore::new(ram, disk, cfg.sector_size);
        (dir, ChainStore::new(cfg.sector_size, sat, extended))
    }

    #[test]
    fn append_and_drain_preserves_order() {
        let (_dir, chain) = new_store(8, 32);
        for i in 0..12u32 {
            chain.append(1, Record::Tsd(i)).unwrap();
        }
        assert_eq!(chain.length(1), 12);
        for i in 0..12u32 {
            assert_eq!(chain.peek_oldest(1).unwrap(), Record::Tsd(i));
            chain.erase_oldest(1).unwrap();
        }
        assert_eq!(chain.length(1), 0);
        assert!(chain.peek_oldest(1).is_err());
    }

    #[test]
    fn exhausting_ram_pool_reports_no_space() {
        let (_dir, chain) = new_store(2, 32);
        let mut failed = false;
        for i in 0..100u32 {
            if chain.append(1, Record::Tsd(i)).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn migration_moves_prefix_to_disk_and_read_back_still_works() {
        let (_dir, chain) = new_store(8, 32);
        for i in 0..10u32 {
            chain.append(1, Record::Tsd(i)).unwrap();
        }
        let candidates = chain.migration_candidates();
        assert_eq!(candidates.len(), 1);
        let outcome = chain.migrate_prefix(1, 2, 0).unwrap();
        assert!(outcome.sectors_freed >= 1);

        for i in 0..10u32 {
            assert_eq!(chain.peek_oldest(1).unwrap(), Record::Tsd(i));
            chain.erase_oldest(1).unwrap();
        }
    }
}
