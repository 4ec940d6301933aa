//! AppBuilder - store、サービス、バックグラウンドループを `App` に組み立てる
//!
//! # Fail-fast 設計
//! `build()` は何かを起動する前に設定を検証し、DB を開き、スキーマを作る。
//! 不正な設定や接続できない DB は起動時に一度だけ報告される。
//!
//! ```ignore
//! let app = AppBuilder::new(ConductorConfig::from_file("conductor.toml")?)
//!     .build()
//!     .await?;
//! app.start().await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::callback::{CallbackError, CallbackSender};
use super::config::{ConductorConfig, ConfigError};
use super::dispatcher::Dispatcher;
use super::matcher::WorkerMatcher;
use super::namespace::NamespaceService;
use super::task::TaskService;
use crate::impls::shard::{AllShards, LeaseShardOwnership};
use crate::impls::sqlite::{self, SqliteLockStore, SqliteNamespaceStore, SqliteTaskStore};
use crate::observability::EngineStatus;
use crate::ports::{
    Clock, IdGenerator, LockStore, ShardOwnership, StoreError, SystemClock, UlidGenerator,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("opening database: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

pub struct AppBuilder {
    config: ConductorConfig,
    clock: Option<Arc<dyn Clock>>,
    pool: Option<SqlitePool>,
}

impl AppBuilder {
    pub fn new(config: ConductorConfig) -> Self {
        Self {
            config,
            clock: None,
            pool: None,
        }
    }

    /// 省略時は実時間の clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// `database_url` に接続する代わりに既存の pool を使う。
    /// スキーマの作成は行う。
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub async fn build(self) -> Result<App, BuildError> {
        let config = self.config;
        config.validate()?;

        let pool = match self.pool {
            Some(pool) => {
                sqlite::init_schema(&pool).await?;
                pool
            }
            None => sqlite::connect(&config.database_url).await?,
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));

        let locks: Arc<dyn LockStore> = Arc::new(SqliteLockStore::new(pool.clone(), clock.clone()));
        let tasks = Arc::new(SqliteTaskStore::new(pool.clone()));
        let namespaces = Arc::new(NamespaceService::new(
            Arc::new(SqliteNamespaceStore::new(pool)),
            ids.clone(),
            clock.clone(),
            config.namespace_cache_ttl(),
        ));

        let (lease, shards) = match config.owned_shards {
            Some(range) => {
                let lease = Arc::new(LeaseShardOwnership::new(
                    locks.clone(),
                    clock.clone(),
                    config.instance_id.clone(),
                    config.shard_count,
                    range.into(),
                    config.lock_ttl(),
                ));
                let shards: Arc<dyn ShardOwnership> = lease.clone();
                (Some(lease), shards)
            }
            None => {
                let shards: Arc<dyn ShardOwnership> = Arc::new(AllShards::new(config.shard_count));
                (None, shards)
            }
        };

        let callbacks = CallbackSender::new(config.callback_timeout(), config.callback_retry())?;
        let service = Arc::new(TaskService::new(
            tasks.clone(),
            namespaces.clone(),
            ids,
            clock.clone(),
            Arc::new(WorkerMatcher::new()),
            callbacks,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            tasks,
            service.clone(),
            shards,
            clock,
            config.dispatcher(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(App {
            config,
            namespaces,
            tasks: service,
            dispatcher,
            locks,
            lease,
            shutdown_tx,
            refresher: Mutex::new(None),
        })
    }
}

/// ワイヤリング済みのエンジン。`start` まで何も動かない
pub struct App {
    pub config: ConductorConfig,
    pub namespaces: Arc<NamespaceService>,
    pub tasks: Arc<TaskService>,
    pub dispatcher: Arc<Dispatcher>,
    pub locks: Arc<dyn LockStore>,
    lease: Option<Arc<LeaseShardOwnership>>,
    shutdown_tx: watch::Sender<bool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    /// （設定があれば）shard の lease を取得し、dispatcher を起動する
    pub async fn start(&self) -> Result<(), StoreError> {
        if let Some(lease) = &self.lease {
            let owned = lease.refresh().await?;
            info!(instance_id = %self.config.instance_id, owned, "initial shard leases taken");
            let handle = lease.clone().spawn_refresher(self.shutdown_tx.subscribe());
            *self.refresher.lock() = Some(handle);
        }
        self.dispatcher.start();
        info!(instance_id = %self.config.instance_id, "conductor started");
        Ok(())
    }

    /// ループを止めてから shard の lease を返却する
    pub async fn shutdown(&self) {
        self.dispatcher.stop().await;
        let _ = self.shutdown_tx.send(true);
        let refresher = self.refresher.lock().take();
        if let Some(handle) = refresher {
            let _ = handle.await;
        }
        info!(instance_id = %self.config.instance_id, "conductor stopped");
    }

    pub fn owned_shards(&self) -> Vec<u32> {
        match &self.lease {
            Some(lease) => lease.owned_shards(),
            None => (0..self.config.shard_count).collect(),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            instance_id: self.config.instance_id.clone(),
            owned_shards: match &self.lease {
                Some(lease) => lease.owned_shards().len(),
                None => self.config.shard_count as usize,
            },
            cached_namespaces: self.namespaces.cached_len(),
            dispatcher: self.dispatcher.stats(),
        }
    }
}
