//! NamespaceService - namespace lookups behind a TTL cache.
//!
//! Task registration checks the namespace on every call, so reads are served
//! from memory whenever possible. Entries are keyed by id and by name; each
//! entry lives for the configured TTL plus or minus 10% so that a burst of
//! fills does not expire in lockstep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, instrument};

use crate::domain::{ConductorError, Namespace, NamespaceId};
use crate::ports::{Clock, IdGenerator, NamespaceStore, StoreError};

const JITTER: f64 = 0.1;

#[derive(Debug, Clone)]
struct Entry {
    namespace: Namespace,
    /// Unix millis.
    expires_at: i64,
}

#[derive(Default)]
struct Cache {
    by_id: HashMap<NamespaceId, Entry>,
    by_name: HashMap<String, Entry>,
}

pub struct NamespaceService {
    store: Arc<dyn NamespaceStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<Cache>,
}

impl NamespaceService {
    pub fn new(
        store: Arc<dyn NamespaceStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            ttl,
            cache: RwLock::new(Cache::default()),
        }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, name: &str) -> Result<Namespace, ConductorError> {
        if name.is_empty() {
            return Err(ConductorError::invalid("namespace name is empty"));
        }
        let namespace = Namespace {
            id: self.ids.generate_namespace_id(),
            name: name.to_string(),
            ctime: self.clock.now_ms(),
        };
        match self.store.create(&namespace).await {
            Ok(()) => {}
            Err(StoreError::Duplicate) => {
                return Err(ConductorError::NamespaceAlreadyExists(name.to_string()));
            }
            Err(e) => return Err(ConductorError::internal("create namespace", e)),
        }

        self.fill(&namespace);
        info!(namespace = %name, id = %namespace.id, "namespace created");
        Ok(namespace)
    }

    pub async fn get(&self, name: &str) -> Result<Namespace, ConductorError> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.cache.read().by_name.get(name) {
            if entry.expires_at > now {
                return Ok(entry.namespace.clone());
            }
        }

        let namespace = self.store.get_by_name(name).await.map_err(|e| match e {
            StoreError::NotFound => ConductorError::NamespaceNotFound(name.to_string()),
            e => ConductorError::internal("get namespace", e),
        })?;
        self.fill(&namespace);
        Ok(namespace)
    }

    pub async fn get_by_id(&self, id: NamespaceId) -> Result<Namespace, ConductorError> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.cache.read().by_id.get(&id) {
            if entry.expires_at > now {
                return Ok(entry.namespace.clone());
            }
        }

        let namespace = self.store.get_by_id(id).await.map_err(|e| match e {
            StoreError::NotFound => ConductorError::NamespaceNotFound(id.to_string()),
            e => ConductorError::internal("get namespace", e),
        })?;
        self.fill(&namespace);
        Ok(namespace)
    }

    /// Existence check used by task registration.
    pub async fn exists(&self, name: &str) -> Result<bool, ConductorError> {
        match self.get(name).await {
            Ok(_) => Ok(true),
            Err(ConductorError::NamespaceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete(&self, id: NamespaceId) -> Result<(), ConductorError> {
        let deleted = self
            .store
            .delete(id)
            .await
            .map_err(|e| ConductorError::internal("delete namespace", e))?;
        // Only once the row is gone.
        self.invalidate(id);
        if !deleted {
            return Err(ConductorError::NamespaceNotFound(id.to_string()));
        }
        info!("namespace deleted");
        Ok(())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().by_id.len()
    }

    fn fill(&self, namespace: &Namespace) {
        let entry = Entry {
            namespace: namespace.clone(),
            expires_at: self.clock.now_ms().saturating_add(jittered_ms(self.ttl)),
        };
        let mut cache = self.cache.write();
        // A rename would leave the old name pointing at this id.
        if let Some(previous) = cache.by_id.insert(namespace.id, entry.clone()) {
            if previous.namespace.name != namespace.name {
                cache.by_name.remove(&previous.namespace.name);
            }
        }
        cache.by_name.insert(namespace.name.clone(), entry);
    }

    fn invalidate(&self, id: NamespaceId) {
        let mut cache = self.cache.write();
        if let Some(entry) = cache.by_id.remove(&id) {
            cache.by_name.remove(&entry.namespace.name);
            debug!(namespace = %entry.namespace.name, "namespace evicted from cache");
        }
    }
}

fn jittered_ms(ttl: Duration) -> i64 {
    let base = ttl.as_millis() as f64;
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER..=JITTER);
    (base * factor) as i64
}
