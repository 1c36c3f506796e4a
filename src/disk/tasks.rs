use std::sync::Arc;
use std::time::Duration;

use super::Disk;
use crate::error::Result;
use crate::scheduler::BackgroundTask;

/// Periodically drains WAL batches into shards.
pub struct FlushTask {
    disk: Arc<Disk>,
}

impl FlushTask {
    pub fn new(disk: Arc<Disk>) -> Self {
        Self { disk }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "wal-flush"
    }

    fn interval(&self) -> Duration {
        self.disk.config().scheduler.flush_interval
    }

    async fn execute(&self) -> Result<()> {
        self.disk.flush()
    }
}

/// Periodically tops up the spare shard pool.
pub struct PreallocateTask {
    disk: Arc<Disk>,
}

impl PreallocateTask {
    pub fn new(disk: Arc<Disk>) -> Self {
        Self { disk }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for PreallocateTask {
    fn name(&self) -> &'static str {
        "preallocate"
    }

    fn interval(&self) -> Duration {
        self.disk.config().scheduler.preallocate_interval
    }

    async fn execute(&self) -> Result<()> {
        self.disk.preallocate()
    }
}

/// Periodically schedules an asynchronous msync of every shard.
pub struct AsyncTask {
    disk: Arc<Disk>,
}

impl AsyncTask {
    pub fn new(disk: Arc<Disk>) -> Self {
        Self { disk }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for AsyncTask {
    fn name(&self) -> &'static str {
        "async-msync"
    }

    fn interval(&self) -> Duration {
        self.disk.config().scheduler.sync_interval
    }

    async fn execute(&self) -> Result<()> {
        self.disk.async_sync()
    }
}
