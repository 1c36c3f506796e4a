use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a disk.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Directory holding the shard files.
    pub dir: PathBuf,

    /// Number of byte-string columns per record, key included.
    pub arity: u16,

    /// Pending WAL entries above which writers flush inline (default: 8192)
    pub wal_high_water: usize,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to drain a batch of WAL entries into shards (default: 100ms)
    pub flush_interval: Duration,

    /// How often to top up the spare shard pool (default: 30s)
    pub preallocate_interval: Duration,

    /// How often to schedule an asynchronous msync of every shard (default: 10s)
    pub sync_interval: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./hypershard"),
            arity: 2,
            wal_high_water: 8192,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            preallocate_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(10),
        }
    }
}

impl DiskConfig {
    /// Create a new config with the given directory and arity
    pub fn new(dir: impl Into<PathBuf>, arity: u16) -> Self {
        Self {
            dir: dir.into(),
            arity,
            ..Default::default()
        }
    }

    /// Set the WAL high-water mark
    pub fn wal_high_water(mut self, entries: usize) -> Self {
        self.wal_high_water = entries;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl SchedulerConfig {
    /// Set the WAL drain interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the spare pool top-up interval
    pub fn preallocate_interval(mut self, interval: Duration) -> Self {
        self.preallocate_interval = interval;
        self
    }

    /// Set the async msync interval
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}
