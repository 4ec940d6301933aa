//! Shard ownership implementations.
//!
//! - **AllShards**: a single instance owns the whole keyspace.
//! - **LeaseShardOwnership**: one lease lock per shard; the instance owns the
//!   shards whose leases it currently holds.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ports::{Clock, LockStore, ShardOwnership, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct AllShards {
    shard_count: u32,
}

impl AllShards {
    pub fn new(shard_count: u32) -> Self {
        Self { shard_count }
    }
}

impl ShardOwnership for AllShards {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn owns(&self, _shard: u32) -> bool {
        true
    }
}

/// Lease-backed ownership over a candidate range of shards.
///
/// `owns` answers from the local map only. Each entry carries the deadline
/// of the lease as last taken or renewed (`now + ttl`, measured before the
/// store call), and an entry past its deadline no longer counts, whether or
/// not `refresh` managed to run. A shard whose renewal fails or errors is
/// dropped before anything else happens.
pub struct LeaseShardOwnership {
    locks: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    shard_count: u32,
    candidates: Range<u32>,
    ttl: Duration,
    /// shard -> local lease deadline (unix ms)
    owned: RwLock<BTreeMap<u32, i64>>,
}

impl LeaseShardOwnership {
    pub fn new(
        locks: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
        shard_count: u32,
        candidates: Range<u32>,
        ttl: Duration,
    ) -> Self {
        Self {
            locks,
            clock,
            instance_id: instance_id.into(),
            shard_count,
            candidates,
            ttl,
            owned: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn lock_key(shard: u32) -> String {
        format!("conductor/shard/{shard}")
    }

    pub fn owned_shards(&self) -> Vec<u32> {
        let now = self.clock.now_ms();
        self.owned
            .read()
            .iter()
            .filter(|&(_, &deadline)| deadline > now)
            .map(|(&shard, _)| shard)
            .collect()
    }

    fn deadline_from(&self, start_ms: i64) -> i64 {
        start_ms.saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX))
    }

    /// Renews held leases and tries to pick up free ones. Returns the number
    /// of shards owned afterwards.
    ///
    /// A store error on one shard does not stop the pass; the first one is
    /// returned once every candidate was visited.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let mut first_err = None;
        for shard in self.candidates.clone() {
            let key = Self::lock_key(shard);
            let held = self.owned.read().contains_key(&shard);
            let deadline = self.deadline_from(self.clock.now_ms());

            if held {
                match self.locks.renew_lock(&key, &self.instance_id, self.ttl).await {
                    Ok(true) => {
                        self.owned.write().insert(shard, deadline);
                        continue;
                    }
                    Ok(false) => {
                        self.owned.write().remove(&shard);
                        warn!(shard, instance_id = %self.instance_id, "shard lease lost");
                    }
                    Err(e) => {
                        self.owned.write().remove(&shard);
                        warn!(shard, instance_id = %self.instance_id, error = %e, "shard lease renewal failed");
                        first_err.get_or_insert(e);
                        continue;
                    }
                }
            }

            match self
                .locks
                .try_acquire_lock(&key, &self.instance_id, &self.instance_id, self.ttl)
                .await
            {
                Ok(true) => {
                    self.owned.write().insert(shard, deadline);
                    debug!(shard, instance_id = %self.instance_id, "shard lease acquired");
                }
                Ok(false) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(self.owned_shards().len()),
        }
    }

    /// Gives every held shard back.
    pub async fn release_all(&self) -> Result<(), StoreError> {
        let shards = std::mem::take(&mut *self.owned.write());
        for shard in shards.into_keys() {
            self.locks
                .release_lock(&Self::lock_key(shard), &self.instance_id)
                .await?;
        }
        Ok(())
    }

    /// Refreshes (and prunes dead lease rows) every `ttl / 3` until
    /// shutdown, then releases.
    pub fn spawn_refresher(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = (self.ttl / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                match self.refresh().await {
                    Ok(owned) => debug!(owned, "shard leases refreshed"),
                    Err(e) => warn!(error = %e, "shard lease refresh failed"),
                }
                match self.locks.cleanup_expired_locks().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "expired lease rows removed"),
                    Err(e) => warn!(error = %e, "lease cleanup failed"),
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            if let Err(e) = self.release_all().await {
                warn!(error = %e, "releasing shard leases failed");
            }
            info!(instance_id = %self.instance_id, "shard refresher stopped");
        })
    }
}

impl ShardOwnership for LeaseShardOwnership {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn owns(&self, shard: u32) -> bool {
        let now = self.clock.now_ms();
        self.owned
            .read()
            .get(&shard)
            .is_some_and(|&deadline| deadline > now)
    }
}
