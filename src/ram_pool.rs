use std::sync::Mutex;

use crate::handle::ExtendedHandle;

/// Size in bytes of the in-band sector header packed at the front of every
/// RAM sector: owning sensor id (4), next-sector extended handle
/// (4), live record count (1), consumed-from-head count (1), record kind
/// tag (1), one reserved byte for future use.
pub(crate) const HEADER_LEN: usize = 12;

/// Contiguous backing region of `N_RAM` fixed-size sectors.
///
/// Exposes only raw byte access; the chain store layers record semantics
/// on top, and the extended-sector layer uses this directly
/// for its byte-exact read/write contract, header bytes included.
pub(crate) struct RamPool {
    sector_size: usize,
    bytes: Mutex<Vec<u8>>,
}

impl RamPool {
    pub(crate) fn new(ram_sectors: u32, sector_size: usize) -> Self {
        assert!(sector_size > HEADER_LEN, "sector_size must leave room for the header");
        RamPool { sector_size, bytes: Mutex::new(vec![0u8; ram_sectors as usize * sector_size]) }
    }

    pub(crate) fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.sector_size - HEADER_LEN
    }

    fn sector_range(&self, handle: ExtendedHandle) -> core::ops::Range<usize> {
        debug_assert!(handle.is_ram());
        let start = handle.ram_index() * self.sector_size;
        start..(start + self.sector_size)
    }

    /// Raw read within one sector's bytes (header included). Caller has
    /// already validated `offset + buf.len() <= sector_size`.
    pub(crate) fn read_at(&self, handle: ExtendedHandle, offset: usize, buf: &mut [u8]) {
        let range = self.sector_range(handle);
        let guard = self.bytes.lock().unwrap();
        let sector = &guard[range];
        buf.copy_from_slice(&sector[offset..offset + buf.len()]);
    }

    /// Raw write within one sector's bytes (header included).
    pub(crate) fn write_at(&self, handle: ExtendedHandle, offset: usize, buf: &[u8]) {
        let range = self.sector_range(handle);
        let mut guard = self.bytes.lock().unwrap();
        let sector = &mut guard[range];
        sector[offset..offset + buf.len()].copy_from_slice(buf);
    }

    /// Zeroes an entire sector, used when a sector is freed so that a free
    /// sector's header always reads as zero.
    pub(crate) fn zero(&self, handle: ExtendedHandle) {
        let range = self.sector_range(handle);
        let mut guard = self.bytes.lock().unwrap();
        guard[range].fill(0);
    }
}
