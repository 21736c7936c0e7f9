use bitflags::bitflags;

use crate::sat::SatStatistics;
use crate::tiered::ControllerState;

bitflags! {
    /// Coarse health flags surfaced alongside [`EngineStatistics`].
    ///
    /// `DIRTY` is set once any record has been written since the last clean
    /// shutdown and cleared by [`crate::engine::Store::shutdown`].
    /// `IO_ERROR` latches on the first I/O failure and is never cleared
    /// automatically — an operator decides whether to keep serving reads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineStatusFlags: u8 {
        const DIRTY = 0b0000_0001;
        const IO_ERROR = 0b0000_0010;
    }
}

/// Snapshot of engine-wide health, assembled on demand. Cheap
/// enough to call from a polling loop; nothing here blocks on I/O.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatistics {
    pub ram: SatStatistics,
    pub fragmentation: f32,
    pub controller_state: ControllerState,
    pub flush_progress: u8,
    pub status: EngineStatusFlags,
    /// Disk files moved to the quarantine directory, either by recovery or
    /// by a later checksum mismatch.
    pub quarantined_files: u32,
    /// Sensor chains quarantined after an invariant violation in a release
    /// build. New writes to these sensors are rejected until an operator
    /// clears them.
    pub quarantined_chains: u32,
}
