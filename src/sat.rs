use std::sync::Mutex;

use crate::handle::{ExtendedHandle, DISK_BASE};
use crate::record::RecordKind;

/// Per-sector bookkeeping the allocator keeps alongside the occupancy
/// bitmap. Kept in sync with the in-band sector header the chain store
/// writes, so the tiered controller can scan ages and owners without
/// touching sector bytes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SectorMeta {
    pub(crate) sensor: Option<u32>,
    pub(crate) next: ExtendedHandle,
    pub(crate) kind: Option<RecordKind>,
    /// Monotonically increasing "age" stamp assigned at allocation time,
    /// used by the tiered controller to pick the oldest chain heads first.
    /// Not a wall-clock timestamp.
    pub(crate) age: u64,
}

/// Eventually-consistent allocator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatStatistics {
    pub total: u32,
    pub used: u32,
    pub free: u32,
    pub peak_used: u32,
    pub allocation_failures: u64,
}

impl SatStatistics {
    pub fn usage_percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.used as u64 * 100) / self.total as u64) as u8
        }
    }
}

struct SatInner {
    // One bit per RAM sector; set means occupied. Stored as 64-bit words,
    // a plain hand-rolled bitset in the style `fatfs::table` manipulates
    // FAT entry bits directly.
    bitmap: Vec<u64>,
    meta: Vec<SectorMeta>,
    total: u32,
    used: u32,
    peak_used: u32,
    allocation_failures: u64,
    // Rotating scan hint: spreads allocations across the
    // bitmap instead of always starting at bit 0.
    hint: u32,
    next_age: u64,
}

impl SatInner {
    fn bit(&self, index: u32) -> bool {
        let word = self.bitmap[(index / 64) as usize];
        (word >> (index % 64)) & 1 != 0
    }

    fn set_bit(&mut self, index: u32, value: bool) {
        let word = &mut self.bitmap[(index / 64) as usize];
        if value {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }
}

/// The Sector Allocation Table: a bounded pool of RAM sector ids plus the
/// metadata needed to walk chains without touching sector bytes.
///
/// Process-wide singleton by design: one allocator per store,
/// modeled here as owned state behind a coarse lock rather than
/// an ambient global.
pub struct Sat {
    inner: Mutex<SatInner>,
}

impl Sat {
    pub(crate) fn new(ram_sectors: u32) -> Self {
        let words = ((ram_sectors as usize) + 63) / 64;
        Sat {
            inner: Mutex::new(SatInner {
                bitmap: vec![0u64; words],
                meta: vec![SectorMeta::default(); ram_sectors as usize],
                total: ram_sectors,
                used: 0,
                peak_used: 0,
                allocation_failures: 0,
                hint: 0,
                next_age: 0,
            }),
        }
    }

    /// Scans the bitmap from the rotating hint, wrapping once, and returns
    /// the first free sector. Returns `NONE` and bumps the failure counter on
    /// exhaustion.
    pub(crate) fn allocate(&self, sensor: Option<u32>) -> ExtendedHandle {
        let mut inner = self.inner.lock().unwrap();
        if inner.used >= inner.total {
            inner.allocation_failures += 1;
            return ExtendedHandle::null();
        }
        let total = inner.total;
        let start = inner.hint % total.max(1);
        let mut found = None;
        for offset in 0..total {
            let idx = (start + offset) % total;
            if !inner.bit(idx) {
                found = Some(idx);
                break;
            }
        }
        let idx = match found {
            Some(idx) => idx,
            None => {
                inner.allocation_failures += 1;
                return ExtendedHandle::null();
            }
        };
        inner.set_bit(idx, true);
        let age = inner.next_age;
        inner.next_age += 1;
        inner.meta[idx as usize] = SectorMeta { sensor, next: ExtendedHandle::null(), kind: None, age };
        inner.used += 1;
        inner.peak_used = inner.peak_used.max(inner.used);
        inner.hint = idx + 1;
        ExtendedHandle::from_ram_index(idx + 1)
    }

    /// Clears metadata, clears the occupancy bit, and updates counters.
    pub(crate) fn free(&self, handle: ExtendedHandle) {
        debug_assert!(handle.is_ram());
        let idx = handle.ram_index() as u32;
        let mut inner = self.inner.lock().unwrap();
        if inner.bit(idx) {
            inner.set_bit(idx, false);
            inner.meta[idx as usize] = SectorMeta::default();
            inner.used -= 1;
        }
    }

    pub(crate) fn is_used(&self, handle: ExtendedHandle) -> bool {
        debug_assert!(handle.is_ram());
        let idx = handle.ram_index() as u32;
        self.inner.lock().unwrap().bit(idx)
    }

    pub(crate) fn mark_used(&self, handle: ExtendedHandle, sensor: u32, kind: RecordKind) {
        debug_assert!(handle.is_ram());
        let idx = handle.ram_index();
        let mut inner = self.inner.lock().unwrap();
        inner.meta[idx].sensor = Some(sensor);
        inner.meta[idx].kind = Some(kind);
    }

    pub(crate) fn set_next(&self, handle: ExtendedHandle, next: ExtendedHandle) {
        debug_assert!(handle.is_ram());
        let idx = handle.ram_index();
        self.inner.lock().unwrap().meta[idx].next = next;
    }

    pub(crate) fn meta(&self, handle: ExtendedHandle) -> SectorMeta {
        debug_assert!(handle.is_ram());
        let idx = handle.ram_index();
        self.inner.lock().unwrap().meta[idx]
    }

    pub fn statistics(&self) -> SatStatistics {
        let inner = self.inner.lock().unwrap();
        SatStatistics {
            total: inner.total,
            used: inner.used,
            free: inner.total - inner.used,
            peak_used: inner.peak_used,
            allocation_failures: inner.allocation_failures,
        }
    }

    /// Count of maximal runs of set bits divided by total set bits — a
    /// cheap proxy that rises with chain interleaving. Not
    /// contractual; may be refined without breaking callers.
    pub fn fragmentation(&self) -> f32 {
        let inner = self.inner.lock().unwrap();
        if inner.used == 0 {
            return 0.0;
        }
        let mut runs = 0u32;
        let mut prev_set = false;
        for idx in 0..inner.total {
            let set = inner.bit(idx);
            if set && !prev_set {
                runs += 1;
            }
            prev_set = set;
        }
        runs as f32 / inner.used as f32
    }

    pub(crate) fn ram_sectors(&self) -> u32 {
        self.inner.lock().unwrap().total
    }
}

/// Sanity helper used by tests and the extended-sector layer: does this
/// raw id fall in the RAM range at all? (The disk range starts at
/// [`DISK_BASE`].)
pub(crate) fn is_ram_range(raw: u32, ram_sectors: u32) -> bool {
    raw > 0 && raw <= ram_sectors && raw < DISK_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let sat = Sat::new(4);
        let a = sat.allocate(Some(1));
        let b = sat.allocate(Some(1));
        assert!(a.is_ram() && b.is_ram());
        assert_ne!(a, b);
        let stats = sat.statistics();
        assert_eq!(stats.used, 2);
        assert_eq!(stats.free, 2);
        sat.free(a);
        assert_eq!(sat.statistics().used, 1);
        assert!(!sat.is_used(a));
    }

    #[test]
    fn exhaustion_increments_failure_counter_exactly_once() {
        let sat = Sat::new(2);
        let _a = sat.allocate(Some(1));
        let _b = sat.allocate(Some(1));
        assert!(sat.allocate(Some(1)).is_null());
        assert_eq!(sat.statistics().allocation_failures, 1);
        assert!(sat.allocate(Some(1)).is_null());
        assert_eq!(sat.statistics().allocation_failures, 2);
    }

    #[test]
    fn used_plus_free_equals_total_under_churn() {
        let sat = Sat::new(16);
        let mut live = Vec::new();
        for i in 0..10 {
            live.push(sat.allocate(Some(i)));
        }
        for h in live.drain(..5) {
            sat.free(h);
        }
        for i in 10..13 {
            live.push(sat.allocate(Some(i)));
        }
        let stats = sat.statistics();
        assert_eq!(stats.used + stats.free, stats.total);
        assert_eq!(stats.used, 8);
    }
}
