//! Top-level store: wires the allocator, RAM pool, disk manager, chain
//! store, and tiered controller into the public API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use log::{info, warn};

use crate::chain::ChainStore;
use crate::config::StoreConfig;
use crate::disk::DiskManager;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink, NullSink};
use crate::extended::ExtendedStore;
use crate::handle::ExtendedHandle;
use crate::ram_pool::RamPool;
use crate::record::Record;
use crate::recovery::{self, RecoveryReport};
use crate::sat::Sat;
use crate::stats::{EngineStatistics, EngineStatusFlags};
use crate::tiered::TieredController;

/// Retries an append at most this many times, ticking the controller in
/// between, before giving up with [`crate::error::Error::NoSpace`]:
/// out-of-space is expected to trigger a migration pass and a retry,
/// not an immediate failure to the caller.
const APPEND_RETRY_TICKS: u32 = 4;

/// The tiered sector-chain storage engine.
///
/// One instance owns one `storage_root`; construct with [`Store::init`] and
/// call [`Store::shutdown`] (or just drop it — the `Drop` impl flushes
/// best-effort) when done.
pub struct Store<S: EventSink = NullSink> {
    config: StoreConfig,
    chain: ChainStore,
    controller: TieredController,
    sink: S,
    status: AtomicU8,
    clock_ms: AtomicU64,
    shut_down: std::sync::atomic::AtomicBool,
    /// Last RAM occupancy decile (0..=10) an [`Event::ThresholdCrossed`] was
    /// reported for, so repeated ticks at the same occupancy don't re-emit.
    last_threshold_decile: AtomicU8,
    /// Sensors quarantined after an invariant violation surfaced as
    /// [`Error::CorruptState`] in a release build. Writes to these sensors
    /// are rejected until an operator clears them.
    quarantined: Mutex<HashSet<u32>>,
    files_quarantined: AtomicU32,
}

impl Store<NullSink> {
    /// Initializes a store at `config.storage_root`, running crash recovery
    /// first. Uses a [`NullSink`] for events; call [`Store::init_with_sink`]
    /// to observe them.
    pub fn init(config: StoreConfig) -> Result<(Self, RecoveryReport)> {
        Self::init_with_sink(config, NullSink)
    }
}

impl<S: EventSink> Store<S> {
    pub fn init_with_sink(config: StoreConfig, mut sink: S) -> Result<(Self, RecoveryReport)> {
        config.validate()?;
        let sat = Sat::new(config.ram_sectors);
        let ram = RamPool::new(config.ram_sectors, config.sector_size);
        let (disk, recovered, quarantined) = DiskManager::open(config.clone())?;
        let extended = ExtendedStore::new(ram, disk, config.sector_size);
        let chain = ChainStore::new(config.sector_size, sat, extended);

        let report = recovery::recover(&chain, recovered, quarantined, &mut sink);
        info!(
            "store initialized at {}: {} sensors recovered, {} sectors, {} records",
            config.storage_root.display(),
            report.sensors_recovered,
            report.sectors_recovered,
            report.records_recovered
        );

        let status = if report.files_quarantined > 0 { EngineStatusFlags::IO_ERROR.bits() } else { 0 };

        let files_quarantined = report.files_quarantined;
        let store = Store {
            config,
            chain,
            controller: TieredController::new(),
            sink,
            status: AtomicU8::new(status),
            clock_ms: AtomicU64::new(0),
            shut_down: std::sync::atomic::AtomicBool::new(false),
            last_threshold_decile: AtomicU8::new(0),
            quarantined: Mutex::new(HashSet::new()),
            files_quarantined: AtomicU32::new(files_quarantined),
        };
        Ok((store, report))
    }

    /// Emits [`Event::ThresholdCrossed`] whenever RAM occupancy has moved
    /// into a new 10%-wide decile since the last call, in either direction.
    fn check_threshold_crossing(&mut self) {
        let percent = self.chain.sat().statistics().usage_percent();
        let decile = percent / 10;
        let previous = self.last_threshold_decile.swap(decile, Ordering::Relaxed);
        if decile != previous {
            self.sink.emit(Event::ThresholdCrossed { percent_used: percent });
        }
    }

    /// Turns an [`Error::CorruptState`] surfaced by the chain store into the
    /// spec's fail-stop/quarantine split: debug builds halt immediately,
    /// release builds quarantine the offending sensor and let the caller
    /// see the error instead of panicking.
    fn handle_corrupt(&mut self, sensor: u32, detail: &'static str) -> Error {
        if cfg!(debug_assertions) {
            panic!("corrupt allocator state for sensor {}: {}", sensor, detail);
        }
        if self.quarantined.lock().unwrap().insert(sensor) {
            self.sink.emit(Event::ChainQuarantined { sensor, detail });
        }
        Error::CorruptState { sensor: Some(sensor), detail }
    }

    fn is_quarantined(&self, sensor: u32) -> bool {
        self.quarantined.lock().unwrap().contains(&sensor)
    }

    /// Appends one record to `sensor`'s chain. On `NoSpace`, drives the
    /// tiered controller for a few ticks and retries before giving up.
    pub fn append_record(&mut self, sensor: u32, record: Record) -> Result<()> {
        if self.is_quarantined(sensor) {
            return Err(Error::CorruptState { sensor: Some(sensor), detail: "sensor quarantined after invariant violation" });
        }
        self.status.fetch_or(EngineStatusFlags::DIRTY.bits(), Ordering::Relaxed);
        let result = match self.chain.append(sensor, record) {
            Ok(()) => Ok(()),
            Err(crate::error::Error::NoSpace { .. }) => {
                for _ in 0..APPEND_RETRY_TICKS {
                    let now = self.clock_ms.load(Ordering::Relaxed);
                    self.controller.tick(now, &self.chain, &self.config, &mut self.sink)?;
                    if self.chain.append(sensor, record).is_ok() {
                        self.check_threshold_crossing();
                        return Ok(());
                    }
                }
                warn!("sensor {} out of space after {} migration ticks", sensor, APPEND_RETRY_TICKS);
                self.sink.emit(crate::events::Event::AllocationFailure { sensor: Some(sensor) });
                Err(crate::error::Error::NoSpace { sensor: Some(sensor) })
            }
            Err(Error::CorruptState { detail, .. }) => Err(self.handle_corrupt(sensor, detail)),
            Err(err) => Err(err),
        };
        self.check_threshold_crossing();
        result
    }

    /// Reads the oldest not-yet-erased record for `sensor` without
    /// consuming it, encoding it into `buf`.
    pub fn read_oldest(&self, sensor: u32, buf: &mut [u8]) -> Result<usize> {
        if self.is_quarantined(sensor) {
            return Err(Error::CorruptState { sensor: Some(sensor), detail: "sensor quarantined after invariant violation" });
        }
        let record = self.chain.peek_oldest(sensor)?;
        let size = record.kind().record_size();
        record.encode(&mut buf[..size]);
        Ok(size)
    }

    pub fn erase_oldest(&mut self, sensor: u32) -> Result<()> {
        if self.is_quarantined(sensor) {
            return Err(Error::CorruptState { sensor: Some(sensor), detail: "sensor quarantined after invariant violation" });
        }
        match self.chain.erase_oldest(sensor) {
            Err(Error::CorruptState { detail, .. }) => Err(self.handle_corrupt(sensor, detail)),
            other => {
                self.check_threshold_crossing();
                other
            }
        }
    }

    pub fn chain_length(&self, sensor: u32) -> u64 {
        self.chain.length(sensor)
    }

    /// Raw extended-sector read, bypassing the chain store.
    pub fn read(&self, handle: ExtendedHandle, offset: usize, length: usize, capacity: usize, buf: &mut [u8]) -> Result<()> {
        self.chain.store().read(handle, offset, length, capacity, buf)
    }

    /// Raw extended-sector write, bypassing the chain store.
    pub fn write(&mut self, handle: ExtendedHandle, offset: usize, length: usize, capacity: usize, buf: &[u8]) -> Result<()> {
        self.status.fetch_or(EngineStatusFlags::DIRTY.bits(), Ordering::Relaxed);
        self.chain.store().write(handle, offset, length, capacity, buf)
    }

    /// Allocates a bare RAM sector outside of chain bookkeeping.
    pub fn allocate(&mut self, sensor: Option<u32>) -> Result<ExtendedHandle> {
        let handle = self.chain.sat().allocate(sensor);
        if handle.is_null() {
            self.sink.emit(crate::events::Event::AllocationFailure { sensor });
            return Err(crate::error::Error::NoSpace { sensor });
        }
        Ok(handle)
    }

    /// Allocates a disk sector slot directly, bypassing the RAM tier and
    /// chain bookkeeping entirely. Unlike [`Store::allocate`], there is no
    /// bounded pool to exhaust: the disk file manager always creates a new
    /// bucketed file (or packs into the sensor's currently-open one) and
    /// only fails on a genuine I/O error.
    pub fn allocate_disk_sector(&mut self, sensor: u32) -> Result<ExtendedHandle> {
        let now_ms = self.clock_ms.load(Ordering::Relaxed);
        self.chain.store().disk().allocate_slot(sensor, crate::record::RecordKind::Tsd, now_ms)
    }

    /// Frees a bare sector previously obtained from [`Store::allocate`] or a
    /// disk sector handle. Chain-owned sectors must be released
    /// through [`Store::erase_oldest`] instead.
    pub fn free(&self, handle: ExtendedHandle) -> Result<()> {
        if handle.is_ram() {
            self.chain.sat().free(handle);
            self.chain.store().ram().zero(handle);
            Ok(())
        } else if handle.is_disk() {
            self.chain.store().disk().free_slot(handle)
        } else {
            Err(crate::error::Error::InvalidHandle { handle })
        }
    }

    /// Advances the tiered controller by one step and the engine's internal
    /// clock to `now_ms`. Callers drive this periodically;
    /// the engine never spawns its own thread.
    pub fn tick(&mut self, now_ms: u64) -> Result<u32> {
        self.clock_ms.store(now_ms, Ordering::Relaxed);
        let migrated = self.controller.tick(now_ms, &self.chain, &self.config, &mut self.sink)?;
        self.check_threshold_crossing();
        Ok(migrated)
    }

    /// Convenience over [`Store::tick`] for callers that don't already
    /// track their own wall clock.
    #[cfg(feature = "chrono")]
    pub fn tick_now(&mut self) -> Result<u32> {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.tick(now_ms)
    }

    pub fn cancel_flush(&self) {
        self.controller.cancel_flush();
    }

    /// Current flush cycle progress, `0..=101`: `101` means the cycle is
    /// fully complete (no RAM sectors remain queued for migration).
    pub fn flush_progress(&self) -> u8 {
        self.controller.flush_progress()
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            ram: self.chain.sat().statistics(),
            fragmentation: self.chain.sat().fragmentation(),
            controller_state: self.controller.state(),
            flush_progress: self.controller.flush_progress(),
            status: EngineStatusFlags::from_bits_truncate(self.status.load(Ordering::Relaxed)),
            quarantined_files: self.files_quarantined.load(Ordering::Relaxed),
            quarantined_chains: self.quarantined.lock().unwrap().len() as u32,
        }
    }

    /// Clears the dirty flag. There is nothing else to flush: every write
    /// already went through `fsync`/`sync_data` on the disk path, and the
    /// RAM pool is intentionally volatile. `flush` is accepted for API symmetry with stores that do
    /// buffer writes.
    pub fn shutdown(mut self, _flush: bool) -> Result<()> {
        self.status.fetch_and(!EngineStatusFlags::DIRTY.bits(), Ordering::Relaxed);
        self.shut_down.store(true, Ordering::Relaxed);
        info!("store at {} shut down cleanly", self.config.storage_root.display());
        Ok(())
    }
}

impl<S: EventSink> Drop for Store<S> {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Relaxed) {
            let dirty = self.status.load(Ordering::Relaxed) & EngineStatusFlags::DIRTY.bits() != 0;
            if dirty {
                warn!("store at {} dropped without a clean shutdown; unflushed RAM sectors are lost", self.config.storage_root.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfig::new(dir.path()).ram_sectors(16).sector_size(32).disk_sector_size(128)
    }

    #[test]
    fn append_read_erase_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, report) = Store::init(config(&dir)).unwrap();
        assert_eq!(report.sensors_recovered, 0);

        store.append_record(1, Record::Tsd(42)).unwrap();
        let mut buf = [0u8; 4];
        let n = store.read_oldest(1, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(buf), 42);
        store.erase_oldest(1).unwrap();
        assert_eq!(store.chain_length(1), 0);
    }

    #[test]
    fn spill_then_restart_recovers_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut store, _report) = Store::init(config(&dir)).unwrap();
            for i in 0..40u32 {
                store.append_record(1, Record::Tsd(i)).unwrap();
                store.tick(i as u64).unwrap();
            }
            store.shutdown(true).unwrap();
        }
        let (store, report) = Store::init(config(&dir)).unwrap();
        assert!(report.sensors_recovered >= 1);
        assert!(store.chain_length(1) > 0 || report.records_recovered > 0);
    }

    #[test]
    fn statistics_reports_usage() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _report) = Store::init(config(&dir)).unwrap();
        store.append_record(1, Record::Tsd(1)).unwrap();
        let stats = store.statistics();
        assert!(stats.ram.used >= 1);
    }

    #[test]
    fn threshold_crossing_events_fire_on_ram_growth() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let dir = tempfile::tempdir().unwrap();
        let events: Rc<RefCell<Vec<crate::events::Event>>> = Rc::new(RefCell::new(Vec::new()));
        let observed = events.clone();
        let sink = move |event: crate::events::Event| observed.borrow_mut().push(event);
        let (mut store, _report) = Store::init_with_sink(config(&dir), sink).unwrap();

        for i in 0..10u32 {
            store.append_record(1, Record::Tsd(i)).unwrap();
        }

        assert!(events.borrow().iter().any(|e| matches!(e, crate::events::Event::ThresholdCrossed { .. })));
    }

    #[test]
    fn corrupt_sector_header_halts_in_debug_builds() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _report) = Store::init(config(&dir)).unwrap();
        store.append_record(9, Record::Tsd(1)).unwrap();

        // Tamper with the head sector's record-kind tag byte (header offset
        // 10: sensor id(4) + next(4) + count(1) + consumed(1) + kind(1)) so
        // it no longer decodes to a known `RecordKind`.
        let head = ExtendedHandle::from_ram_index(1);
        store.write(head, 10, 1, 1, &[0xFFu8]).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| store.append_record(9, Record::Tsd(2))));
        assert!(result.is_err(), "a decoded invariant violation should fail-stop in a debug build");
    }

    #[test]
    fn allocate_disk_sector_bypasses_ram_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _report) = Store::init(config(&dir)).unwrap();

        let handle = store.allocate_disk_sector(5).unwrap();
        assert!(handle.is_disk());

        let payload = [0x7Au8; 16];
        store.write(handle, 0, 16, 16, &payload).unwrap();
        let mut out = [0u8; 16];
        store.read(handle, 0, 16, 16, &mut out).unwrap();
        assert_eq!(out, payload);

        assert_eq!(store.statistics().ram.used, 0, "disk allocation must not touch the RAM pool");
    }

    #[test]
    fn freeing_a_ram_sector_zeroes_its_header() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _report) = Store::init(config(&dir)).unwrap();

        let handle = store.allocate(Some(3)).unwrap();
        store.write(handle, 0, 12, 12, &[0xAAu8; 12]).unwrap();
        store.free(handle).unwrap();

        let mut out = [0u8; 12];
        store.read(handle, 0, 12, 12, &mut out).unwrap();
        assert_eq!(out, [0u8; 12], "a freed sector's header must read as zero");
    }
}
