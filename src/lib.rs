//! Tiered RAM/disk storage engine for time-series sensor samples and
//! events on resource-constrained gateways.
//!
//! Records accumulate in a bounded RAM pool organized as per-sensor
//! singly-linked sector chains (much like a FAT cluster chain); once RAM
//! pressure crosses a high water mark, a tiered controller spills the
//! oldest sectors to disk, where they are addressed through the same
//! handle space as their RAM counterparts. A crash-recovery pass rebuilds
//! every chain from disk alone on the next [`Store::init`].
//!
//! ```no_run
//! use sectorstore::{Record, Store, StoreConfig};
//!
//! # fn main() -> sectorstore::error::Result<()> {
//! let config = StoreConfig::new("/var/lib/sensors");
//! let (mut store, _recovery) = Store::init(config)?;
//! store.append_record(7, Record::Tsd(2048))?;
//! store.tick(0)?;
//! # Ok(())
//! # }
//! ```

mod chain;
mod config;
mod disk;
mod engine;
pub mod error;
mod events;
mod extended;
mod handle;
mod ram_pool;
mod record;
mod recovery;
mod sat;
mod stats;
mod tiered;

pub use config::StoreConfig;
pub use engine::Store;
pub use error::Error;
pub use events::{Event, EventSink, NullSink};
pub use handle::{ExtendedHandle, DISK_BASE};
pub use record::{Record, RecordKind};
pub use recovery::RecoveryReport;
pub use sat::SatStatistics;
pub use stats::{EngineStatistics, EngineStatusFlags};
pub use tiered::ControllerState;
