//! Startup crash recovery: rebuilds chain state purely from
//! disk, since the RAM pool does not survive a restart. Runs once during
//! [`crate::engine::Store::init`] and is safe to run again against an
//! already-recovered root — the disk scan itself
//! ([`crate::disk::DiskManager::open`]) is idempotent, and re-deriving
//! chain links from the same on-disk headers yields the same result.

use std::collections::HashMap;

use log::{info, warn};

use crate::chain::ChainStore;
use crate::disk::{QuarantinedFile, RecoveredSector};
use crate::events::{Event, EventSink};
use crate::handle::ExtendedHandle;

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub sensors_recovered: u32,
    pub sectors_recovered: u32,
    pub records_recovered: u64,
    pub files_quarantined: u32,
}

struct Segment {
    handle: ExtendedHandle,
    header: crate::chain::SectorHeader,
}

/// Reconstructs every sensor chain from the sectors [`crate::disk::DiskManager::open`]
/// found intact, then reports every quarantined file through `sink`.
pub(crate) fn recover(chain_store: &ChainStore, recovered: Vec<RecoveredSector>, quarantined: Vec<QuarantinedFile>, sink: &mut dyn EventSink) -> RecoveryReport {
    let mut segments: Vec<Segment> = Vec::new();

    for sector in &recovered {
        let slots = chain_store.store().disk_slots_per_sector();
        for slot in 0..slots {
            if !sector.header.slot_occupied(slot) {
                continue;
            }
            let handle = ExtendedHandle::from_disk_id(sector.base.raw() + slot as u32);
            match chain_store.read_header(handle) {
                Ok(header) => segments.push(Segment { handle, header }),
                Err(_) => {
                    warn!("slot {} of base {} failed to decode during recovery, dropping", slot, sector.base);
                }
            }
        }
    }

    let mut by_sensor: HashMap<u32, Vec<Segment>> = HashMap::new();
    for segment in segments {
        by_sensor.entry(segment.header.sensor_id).or_default().push(segment);
    }

    let mut report = RecoveryReport { files_quarantined: quarantined.len() as u32, ..Default::default() };

    for (sensor_id, segs) in by_sensor {
        let handles: std::collections::HashSet<ExtendedHandle> = segs.iter().map(|s| s.handle).collect();
        let mut has_incoming: std::collections::HashSet<ExtendedHandle> = std::collections::HashSet::new();
        for seg in &segs {
            if !seg.header.next.is_null() {
                has_incoming.insert(seg.header.next);
            }
        }
        let head = segs.iter().find(|s| !has_incoming.contains(&s.handle)).map(|s| s.handle);
        let tail = segs.iter().find(|s| s.header.next.is_null()).map(|s| s.handle);

        // A file whose segments don't resolve to one head and one tail (a
        // broken or ambiguous link graph) is left unlinked rather than
        // guessed at: its slots stay on disk and remain addressable through
        // the raw extended-sector API, they're just not attached to this
        // sensor's chain until an operator reconciles them.
        let (Some(head), Some(tail)) = (head, tail) else {
            warn!("sensor {} recovered segments do not form a single chain, skipping", sensor_id);
            continue;
        };
        if !handles.contains(&head) || !handles.contains(&tail) {
            continue;
        }

        let record_count: u64 = segs.iter().map(|s| (s.header.count - s.header.consumed) as u64).sum();
        let kind = segs[0].header.kind;

        chain_store.register_recovered_segment(sensor_id, head, tail, record_count, kind);
        report.sensors_recovered += 1;
        report.sectors_recovered += segs.len() as u32;
        report.records_recovered += record_count;
    }

    for file in &quarantined {
        sink.emit(Event::Quarantined { handle: file.handle, reason: file.reason });
    }

    info!(
        "recovery complete: {} sensors, {} sectors, {} live records, {} files quarantined",
        report.sensors_recovered, report.sectors_recovered, report.records_recovered, report.files_quarantined
    );
    report
}
