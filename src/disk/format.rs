use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::handle::ExtendedHandle;
use crate::record::RecordKind;

pub(crate) const MAGIC: &[u8; 4] = b"IMXS";
pub(crate) const VERSION_V2: u8 = 2;

/// Occupancy bitmap lives in the header's 16 reserved bytes, which gives
/// 128 bits — exactly the slot count of the default configuration
/// (4096-byte disk sector / 32-byte RAM sector). Configurations that pack
/// more slots per disk sector than this are rejected by
/// `StoreConfig::validate`.
pub(crate) const MAX_SLOTS_PER_SECTOR: usize = 128;

const HEADER_LEN_FIXED: usize = 4 /* magic */
    + 1 /* version */
    + 4 /* sensor id */
    + 2 /* sector count (populated slots) */
    + 4 /* per-slot stride */
    + 1 /* record type */
    + 2 /* entries per slot */
    + 8 /* created UTC ms */
    + 4 /* header checksum */;

pub(crate) const HEADER_LEN: usize = HEADER_LEN_FIXED + 16;

/// Fixed bit-exact header for one disk file. Always written
/// in little-endian; readers byte-swap on big-endian hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiskFileHeader {
    pub(crate) version: u8,
    pub(crate) sensor_id: u32,
    pub(crate) populated_slots: u16,
    pub(crate) stride: u32,
    pub(crate) record_type: RecordKind,
    pub(crate) entries_per_slot: u16,
    pub(crate) created_ms: u64,
    /// One bit per slot; set means the slot holds live sector data.
    pub(crate) occupancy: [u8; 16],
}

impl DiskFileHeader {
    pub(crate) fn new(
        sensor_id: u32,
        stride: u32,
        record_type: RecordKind,
        entries_per_slot: u16,
        created_ms: u64,
    ) -> Self {
        DiskFileHeader {
            version: VERSION_V2,
            sensor_id,
            populated_slots: 0,
            stride,
            record_type,
            entries_per_slot,
            created_ms,
            occupancy: [0u8; 16],
        }
    }

    pub(crate) fn slot_occupied(&self, slot: usize) -> bool {
        debug_assert!(slot < MAX_SLOTS_PER_SECTOR);
        (self.occupancy[slot / 8] >> (slot % 8)) & 1 != 0
    }

    pub(crate) fn set_slot_occupied(&mut self, slot: usize, occupied: bool) {
        debug_assert!(slot < MAX_SLOTS_PER_SECTOR);
        if occupied {
            self.occupancy[slot / 8] |= 1 << (slot % 8);
        } else {
            self.occupancy[slot / 8] &= !(1 << (slot % 8));
        }
    }

    fn checksum_bytes(&self) -> [u8; HEADER_LEN_FIXED - 4 + 16] {
        let mut buf = [0u8; HEADER_LEN_FIXED - 4 + 16];
        let mut w = 0;
        buf[w..w + 4].copy_from_slice(MAGIC);
        w += 4;
        buf[w] = self.version;
        w += 1;
        LittleEndian::write_u32(&mut buf[w..w + 4], self.sensor_id);
        w += 4;
        LittleEndian::write_u16(&mut buf[w..w + 2], self.populated_slots);
        w += 2;
        LittleEndian::write_u32(&mut buf[w..w + 4], self.stride);
        w += 4;
        buf[w] = self.record_type.tag();
        w += 1;
        LittleEndian::write_u16(&mut buf[w..w + 2], self.entries_per_slot);
        w += 2;
        LittleEndian::write_u64(&mut buf[w..w + 8], self.created_ms);
        w += 8;
        buf[w..w + 16].copy_from_slice(&self.occupancy);
        w += 16;
        debug_assert_eq!(w, buf.len());
        buf
    }

    pub(crate) fn header_checksum(&self) -> u32 {
        crc32fast::hash(&self.checksum_bytes())
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.checksum_bytes());
        let mut checksum_buf = [0u8; 4];
        LittleEndian::write_u32(&mut checksum_buf, self.header_checksum());
        out.extend_from_slice(&checksum_buf);
    }

    pub(crate) fn read_from(buf: &[u8], handle_for_errors: ExtendedHandle) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ChecksumMismatch { handle: handle_for_errors });
        }
        if &buf[0..4] != MAGIC {
            return Err(Error::ChecksumMismatch { handle: handle_for_errors });
        }
        let version = buf[4];
        if version != VERSION_V2 {
            return Err(Error::ChecksumMismatch { handle: handle_for_errors });
        }
        let sensor_id = LittleEndian::read_u32(&buf[5..9]);
        let populated_slots = LittleEndian::read_u16(&buf[9..11]);
        let stride = LittleEndian::read_u32(&buf[11..15]);
        let record_type = RecordKind::from_tag(buf[15])
            .ok_or(Error::ChecksumMismatch { handle: handle_for_errors })?;
        let entries_per_slot = LittleEndian::read_u16(&buf[16..18]);
        let created_ms = LittleEndian::read_u64(&buf[18..26]);
        let mut occupancy = [0u8; 16];
        occupancy.copy_from_slice(&buf[26..42]);
        let stored_checksum = LittleEndian::read_u32(&buf[42..46]);

        let header = DiskFileHeader {
            version,
            sensor_id,
            populated_slots,
            stride,
            record_type,
            entries_per_slot,
            created_ms,
            occupancy,
        };
        if header.header_checksum() != stored_checksum {
            return Err(Error::ChecksumMismatch { handle: handle_for_errors });
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut header = DiskFileHeader::new(42, 32, RecordKind::Tsd, 5, 1_700_000_000_000);
        header.set_slot_occupied(0, true);
        header.set_slot_occupied(3, true);
        header.populated_slots = 2;
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        let decoded = DiskFileHeader::read_from(&buf, ExtendedHandle::null()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.slot_occupied(0));
        assert!(decoded.slot_occupied(3));
        assert!(!decoded.slot_occupied(1));
    }

    #[test]
    fn tampered_header_fails_checksum() {
        let header = DiskFileHeader::new(1, 32, RecordKind::Evt, 2, 0);
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        buf[5] ^= 0xFF;
        assert!(DiskFileHeader::read_from(&buf, ExtendedHandle::null()).is_err());
    }
}
