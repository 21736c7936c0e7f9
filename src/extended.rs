//! Extended-sector layer: the single read/write surface that
//! unifies RAM and disk storage behind [`crate::handle::ExtendedHandle`].
//! Every caller above this layer — the chain store, the tiered controller,
//! recovery — goes through here instead of touching `RamPool`/`DiskManager`
//! directly.

use crate::disk::DiskManager;
use crate::error::{Error, Result};
use crate::handle::ExtendedHandle;
use crate::ram_pool::RamPool;

pub(crate) struct ExtendedStore {
    ram: RamPool,
    disk: DiskManager,
    sector_size: usize,
}

impl ExtendedStore {
    pub(crate) fn new(ram: RamPool, disk: DiskManager, sector_size: usize) -> Self {
        ExtendedStore { ram, disk, sector_size }
    }

    pub(crate) fn ram(&self) -> &RamPool {
        &self.ram
    }

    pub(crate) fn disk(&self) -> &DiskManager {
        &self.disk
    }

    pub(crate) fn disk_slots_per_sector(&self) -> usize {
        self.disk.slots_per_sector()
    }

    /// Byte-exact read: `length` bytes starting at `offset`, defensively
    /// bounds-checked against `capacity` regardless of which tier backs the
    /// handle.
    pub(crate) fn read(&self, handle: ExtendedHandle, offset: usize, length: usize, capacity: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(handle, offset, length, capacity)?;
        if handle.is_ram() {
            self.ram.read_at(handle, offset, &mut buf[..length]);
            Ok(())
        } else if handle.is_disk() {
            self.disk.read_at(handle, offset, &mut buf[..length])
        } else {
            Err(Error::InvalidHandle { handle })
        }
    }

    pub(crate) fn write(&self, handle: ExtendedHandle, offset: usize, length: usize, capacity: usize, buf: &[u8]) -> Result<()> {
        self.check_bounds(handle, offset, length, capacity)?;
        if handle.is_ram() {
            self.ram.write_at(handle, offset, &buf[..length]);
            Ok(())
        } else if handle.is_disk() {
            self.disk.write_at(handle, offset, &buf[..length])
        } else {
            Err(Error::InvalidHandle { handle })
        }
    }

    fn check_bounds(&self, handle: ExtendedHandle, offset: usize, length: usize, capacity: usize) -> Result<()> {
        if handle.is_null() {
            return Err(Error::InvalidHandle { handle });
        }
        if length > capacity {
            return Err(Error::InvalidLength { handle, length, capacity });
        }
        if offset + length > self.sector_size {
            return Err(Error::InvalidLength { handle, length: offset + length, capacity: self.sector_size });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::record::RecordKind;

    fn store() -> (tempfile::TempDir, ExtendedStore) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path()).ram_sectors(4).sector_size(32).disk_sector_size(128);
        let ram = RamPool::new(cfg.ram_sectors, cfg.sector_size);
        let (disk, _, _) = DiskManager::open(cfg.clone()).unwrap();
        (dir, ExtendedStore::new(ram, disk, cfg.sector_size))
    }

    #[test]
    fn ram_round_trip_is_byte_exact() {
        let (_dir, store) = store();
        let handle = ExtendedHandle::from_ram_index(1);
        let payload = [0xAAu8; 16];
        store.write(handle, 0, 16, 16, &payload).unwrap();
        let mut out = [0u8; 16];
        store.read(handle, 0, 16, 16, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn length_greater_than_capacity_is_rejected() {
        let (_dir, store) = store();
        let handle = ExtendedHandle::from_ram_index(1);
        let payload = [0u8; 16];
        let err = store.write(handle, 0, 16, 4, &payload).unwrap_err();
        assert!(matches!(err, Error::InvalidLength { .. }));
    }

    #[test]
    fn null_handle_is_rejected() {
        let (_dir, store) = store();
        let mut buf = [0u8; 4];
        let err = store.read(ExtendedHandle::null(), 0, 4, 4, &mut buf).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle { .. }));
    }

    #[test]
    fn disk_round_trip_is_byte_exact() {
        let (_dir, store) = store();
        let handle = store.disk().allocate_slot(1, RecordKind::Tsd, 0).unwrap();
        let payload = [0x55u8; 32];
        store.write(handle, 0, 32, 32, &payload).unwrap();
        let mut out = [0u8; 32];
        store.read(handle, 0, 32, 32, &mut out).unwrap();
        assert_eq!(out, payload);
    }
}
