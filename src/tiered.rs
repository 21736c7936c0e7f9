//! Tiered RAM→disk spill controller: a small state machine
//! driven by repeated [`TieredController::tick`] calls, the way a
//! cooperative scheduler advances rather than blocking on its own thread.
//! No background thread is spawned — the caller decides the cadence.

use std::sync::Mutex;

use log::{debug, info};

use crate::chain::ChainStore;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::events::{Event, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Scanning,
    Migrating,
    Cancelling,
}

/// Sectors migrated per [`TieredController::tick`] call while `Migrating`.
/// Keeps any single tick bounded regardless of how much is queued.
const SECTORS_PER_TICK: u32 = 8;

struct Queued {
    sensor: u32,
}

struct Inner {
    state: ControllerState,
    cancel_requested: bool,
    queue: Vec<Queued>,
    queue_total: usize,
    progress: u8,
}

pub(crate) struct TieredController {
    inner: Mutex<Inner>,
}

impl TieredController {
    pub(crate) fn new() -> Self {
        TieredController {
            inner: Mutex::new(Inner {
                state: ControllerState::Idle,
                cancel_requested: false,
                queue: Vec::new(),
                queue_total: 0,
                progress: 0,
            }),
        }
    }

    pub(crate) fn state(&self) -> ControllerState {
        self.inner.lock().unwrap().state
    }

    pub fn flush_progress(&self) -> u8 {
        self.inner.lock().unwrap().progress
    }

    /// Requests the in-flight migration stop after its current sector. Safe
    /// to call from any state; a no-op if nothing is running.
    pub fn cancel_flush(&self) {
        self.inner.lock().unwrap().cancel_requested = true;
    }

    /// Advances the controller by one step, driving at most
    /// [`SECTORS_PER_TICK`] sector migrations. Returns the number of
    /// sectors actually migrated this tick.
    pub(crate) fn tick(&self, now_ms: u64, chain_store: &ChainStore, config: &StoreConfig, sink: &mut dyn EventSink) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();

        if inner.cancel_requested && inner.state != ControllerState::Idle {
            transition(&mut inner, ControllerState::Cancelling, sink);
            inner.queue.clear();
            inner.queue_total = 0;
            inner.progress = 0;
            inner.cancel_requested = false;
            transition(&mut inner, ControllerState::Idle, sink);
            return Ok(0);
        }

        match inner.state {
            ControllerState::Idle => {
                let usage = chain_store.sat().statistics().usage_percent();
                if usage >= config.high_water_percent {
                    transition(&mut inner, ControllerState::Scanning, sink);
                }
                Ok(0)
            }
            ControllerState::Scanning => {
                let mut candidates = chain_store.migration_candidates();
                candidates.sort_by_key(|(_, _, age)| *age);
                inner.queue = candidates.into_iter().map(|(sensor, _, _)| Queued { sensor }).collect();
                inner.queue_total = inner.queue.len();
                if inner.queue.is_empty() {
                    inner.progress = 101;
                    transition(&mut inner, ControllerState::Idle, sink);
                } else {
                    inner.progress = 0;
                    transition(&mut inner, ControllerState::Migrating, sink);
                }
                Ok(0)
            }
            ControllerState::Migrating => {
                let mut migrated = 0u32;
                let mut remaining_budget = SECTORS_PER_TICK;
                while remaining_budget > 0 {
                    let Some(Queued { sensor }) = inner.queue.pop() else { break };
                    let outcome = chain_store.migrate_prefix(sensor, remaining_budget, now_ms)?;
                    migrated += outcome.sectors_freed;
                    remaining_budget = remaining_budget.saturating_sub(outcome.sectors_freed.max(1));
                    if outcome.sectors_freed > 0 {
                        sink.emit(Event::MigrationCompleted { sensor, sectors_freed: outcome.sectors_freed });
                    }
                }

                let done = inner.queue_total.saturating_sub(inner.queue.len());
                inner.progress = if inner.queue_total == 0 { 100 } else { ((done * 100) / inner.queue_total) as u8 };

                let usage = chain_store.sat().statistics().usage_percent();
                if inner.queue.is_empty() || usage < config.low_water_percent {
                    inner.queue.clear();
                    // 101 marks the cycle fully complete, distinct from "100% of
                    // the scanned queue migrated but usage still above low water".
                    inner.progress = 101;
                    transition(&mut inner, ControllerState::Idle, sink);
                }
                Ok(migrated)
            }
            ControllerState::Cancelling => {
                transition(&mut inner, ControllerState::Idle, sink);
                Ok(0)
            }
        }
    }
}

fn transition(inner: &mut Inner, to: ControllerState, sink: &mut dyn EventSink) {
    let from = inner.state;
    if from == to {
        return;
    }
    debug!("tiered controller {:?} -> {:?}", from, to);
    inner.state = to;
    sink.emit(Event::ControllerStateChanged { from, to });
    if to == ControllerState::Idle {
        info!("tiered controller idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::disk::DiskManager;
    use crate::events::NullSink;
    use crate::extended::ExtendedStore;
    use crate::ram_pool::RamPool;
    use crate::record::Record;
    use crate::sat::Sat;

    fn harness(ram_sectors: u32, sector_size: usize) -> (tempfile::TempDir, StoreConfig, ChainStore) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path())
            .ram_sectors(ram_sectors)
            .sector_size(sector_size)
            .disk_sector_size(sector_size * 4)
            .high_water_percent(50)
            .low_water_percent(20);
        let sat = Sat::new(cfg.ram_sectors);
        let ram = RamPool::new(cfg.ram_sectors, cfg.sector_size);
        let (disk, _, _) = DiskManager::open(cfg.clone()).unwrap();
        let extended = ExtendedStore::new(ram, disk, cfg.sector_size);
        (dir, cfg.clone(), ChainStore::new(cfg.sector_size, sat, extended))
    }

    #[test]
    fn crosses_high_water_then_drains_to_low_water() {
        let (_dir, cfg, chain) = harness(8, 32);
        for i in 0..20u32 {
            chain.append(1, Record::Tsd(i)).unwrap();
        }
        let controller = TieredController::new();
        let mut sink = NullSink;
        assert_eq!(controller.state(), ControllerState::Idle);

        controller.tick(0, &chain, &cfg, &mut sink).unwrap();
        assert_eq!(controller.state(), ControllerState::Scanning);

        for _ in 0..10 {
            if controller.state() == ControllerState::Idle {
                break;
            }
            controller.tick(0, &chain, &cfg, &mut sink).unwrap();
        }
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(chain.sat().statistics().usage_percent() < cfg.high_water_percent);
        assert_eq!(controller.flush_progress(), 101);
    }

    #[test]
    fn cancel_returns_to_idle_promptly() {
        let (_dir, cfg, chain) = harness(8, 32);
        for i in 0..20u32 {
            chain.append(1, Record::Tsd(i)).unwrap();
        }
        let controller = TieredController::new();
        let mut sink = NullSink;
        controller.tick(0, &chain, &cfg, &mut sink).unwrap();
        controller.tick(0, &chain, &cfg, &mut sink).unwrap();
        assert_eq!(controller.state(), ControllerState::Migrating);

        controller.cancel_flush();
        controller.tick(0, &chain, &cfg, &mut sink).unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(controller.flush_progress(), 0);
    }
}
