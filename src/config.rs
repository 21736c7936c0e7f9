use std::path::PathBuf;

/// Storage engine configuration.
///
/// Mirrors `fatfs::FsOptions`'s chained-setter shape: construct with
/// [`StoreConfig::new`] and override only the knobs that matter.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub(crate) ram_sectors: u32,
    pub(crate) sector_size: usize,
    pub(crate) disk_sector_size: usize,
    pub(crate) storage_root: PathBuf,
    pub(crate) high_water_percent: u8,
    pub(crate) low_water_percent: u8,
    pub(crate) fd_cache_size: usize,
    pub(crate) recovery_quarantine_dir: PathBuf,
    pub(crate) require_checksums: bool,
}

impl StoreConfig {
    /// Creates a configuration rooted at `storage_root` with the default
    /// knobs: 256 RAM sectors of 32 bytes, a 4096-byte disk sector,
    /// high/low water marks of 80%/60%, a 16-entry FD cache, and mandatory
    /// checksums.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let recovery_quarantine_dir = storage_root.join("history").join("corrupted");
        StoreConfig {
            ram_sectors: 256,
            sector_size: 32,
            disk_sector_size: 4096,
            storage_root,
            high_water_percent: 80,
            low_water_percent: 60,
            fd_cache_size: 16,
            recovery_quarantine_dir,
            require_checksums: true,
        }
    }

    pub fn ram_sectors(mut self, n: u32) -> Self {
        self.ram_sectors = n;
        self
    }

    pub fn sector_size(mut self, bytes: usize) -> Self {
        self.sector_size = bytes;
        self
    }

    pub fn disk_sector_size(mut self, bytes: usize) -> Self {
        self.disk_sector_size = bytes;
        self
    }

    pub fn high_water_percent(mut self, pct: u8) -> Self {
        self.high_water_percent = pct;
        self
    }

    pub fn low_water_percent(mut self, pct: u8) -> Self {
        self.low_water_percent = pct;
        self
    }

    pub fn fd_cache_size(mut self, n: usize) -> Self {
        self.fd_cache_size = n;
        self
    }

    pub fn recovery_quarantine_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recovery_quarantine_dir = dir.into();
        self
    }

    pub fn require_checksums(mut self, required: bool) -> Self {
        self.require_checksums = required;
        self
    }

    pub(crate) fn history_dir(&self) -> PathBuf {
        self.storage_root.join("history")
    }

    pub(crate) fn bucket_dir(&self, handle_id: u32) -> PathBuf {
        self.history_dir().join((handle_id % 10).to_string())
    }

    pub(crate) fn slots_per_disk_sector(&self) -> usize {
        self.disk_sector_size / self.sector_size
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.ram_sectors == 0 {
            return Err(crate::error::Error::CorruptState {
                sensor: None,
                detail: "ram_sectors must be non-zero",
            });
        }
        if self.disk_sector_size % self.sector_size != 0 {
            return Err(crate::error::Error::CorruptState {
                sensor: None,
                detail: "disk_sector_size must be a multiple of sector_size",
            });
        }
        if self.low_water_percent >= self.high_water_percent {
            return Err(crate::error::Error::CorruptState {
                sensor: None,
                detail: "low_water_percent must be below high_water_percent",
            });
        }
        if self.slots_per_disk_sector() > crate::disk::format::MAX_SLOTS_PER_SECTOR {
            return Err(crate::error::Error::CorruptState {
                sensor: None,
                detail: "disk_sector_size / sector_size exceeds the occupancy bitmap width",
            });
        }
        Ok(())
    }
}
