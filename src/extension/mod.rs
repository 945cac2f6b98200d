//! Explicit, interface-based extension registry.
//!
//! Every cross-cutting capability (wire codec, load balancer, job store,
//! fail store, coordination backend) is resolved once by configuration
//! name through a typed [`ExtensionPoint`]. The binding table is populated
//! at startup by [`ExtensionRegistry::builder`]; there is no runtime
//! discovery. First resolution constructs and caches the instance for the
//! process lifetime; later resolutions return the same `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dispatch::balancer::{ConsistentHash, LeastAssignments, LoadBalancer, RoundRobin};
use crate::error::ExtensionError;
use crate::membership::memory::MemoryCoordination;
use crate::membership::CoordinationBackend;
use crate::remoting::codec::{Codec, JsonCodec};
use crate::store::fail::{FailStore, MemoryFailStore};
use crate::store::memory::MemoryJobStore;
use crate::store::JobStore;

/// Capability keys, used in error messages and configuration.
pub mod keys {
    pub const REMOTING_CODEC: &str = "remoting.codec";
    pub const LOADBALANCE: &str = "loadbalance";
    pub const JOB_QUEUE: &str = "job.queue";
    pub const FAIL_STORE: &str = "job.fail.store";
    pub const COORDINATION: &str = "coordination.client";
}

type Factory<T> =
    Box<dyn Fn() -> Result<Arc<T>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// A single capability with named bindings and a once-per-name cache.
pub struct ExtensionPoint<T: ?Sized + Send + Sync> {
    key: &'static str,
    factories: HashMap<String, Factory<T>>,
    cache: Mutex<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized + Send + Sync> ExtensionPoint<T> {
    pub fn new(key: &'static str) -> Self {
        Self {
            key,
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Register a binding. A later binding for the same name replaces the
    /// earlier one.
    pub fn bind<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Arc<T>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Resolve a binding by name. Idempotent for the process lifetime:
    /// the first call constructs, every later call returns the cached
    /// instance.
    pub fn resolve(&self, name: &str) -> Result<Arc<T>, ExtensionError> {
        {
            let cache = self.cache.lock().expect("extension cache poisoned");
            if let Some(instance) = cache.get(name) {
                return Ok(instance.clone());
            }
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ExtensionError::UnknownBinding {
                key: self.key,
                name: name.to_string(),
            })?;

        let instance = factory().map_err(|source| ExtensionError::Construction {
            key: self.key,
            name: name.to_string(),
            source,
        })?;

        let mut cache = self.cache.lock().expect("extension cache poisoned");
        // A concurrent resolver may have won the race; keep the first one.
        let entry = cache.entry(name.to_string()).or_insert(instance);
        tracing::debug!(key = self.key, name, "extension binding resolved");
        Ok(entry.clone())
    }

    pub fn binding_names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// The binding table for all capability keys, built once at startup and
/// passed explicitly to whatever needs it. No global state.
pub struct ExtensionRegistry {
    pub codecs: ExtensionPoint<dyn Codec>,
    pub balancers: ExtensionPoint<dyn LoadBalancer>,
    pub job_stores: ExtensionPoint<dyn JobStore>,
    pub fail_stores: ExtensionPoint<dyn FailStore>,
    pub coordination: ExtensionPoint<dyn CoordinationBackend>,
}

impl ExtensionRegistry {
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder {
            registry: ExtensionRegistry {
                codecs: ExtensionPoint::new(keys::REMOTING_CODEC),
                balancers: ExtensionPoint::new(keys::LOADBALANCE),
                job_stores: ExtensionPoint::new(keys::JOB_QUEUE),
                fail_stores: ExtensionPoint::new(keys::FAIL_STORE),
                coordination: ExtensionPoint::new(keys::COORDINATION),
            },
        }
    }

    /// Registry with the stock bindings: `json` codec, the three balancer
    /// policies, and the in-memory stores and coordination backend.
    pub fn with_defaults() -> Self {
        Self::builder()
            .bind_codec("json", || Ok(Arc::new(JsonCodec::default())))
            .bind_balancer("round-robin", || Ok(Arc::new(RoundRobin::default())))
            .bind_balancer("least-assignments", || {
                Ok(Arc::new(LeastAssignments::default()))
            })
            .bind_balancer("consistent-hash", || Ok(Arc::new(ConsistentHash::default())))
            .bind_job_store("memory", || Ok(Arc::new(MemoryJobStore::new())))
            .bind_fail_store("memory", || Ok(Arc::new(MemoryFailStore::new())))
            .bind_coordination("memory", || {
                Ok(Arc::new(MemoryCoordination::with_default_ttl()))
            })
            .build()
    }
}

pub struct ExtensionRegistryBuilder {
    registry: ExtensionRegistry,
}

impl ExtensionRegistryBuilder {
    pub fn bind_codec<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Codec>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.codecs.bind(name, factory);
        self
    }

    pub fn bind_balancer<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn LoadBalancer>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.balancers.bind(name, factory);
        self
    }

    pub fn bind_job_store<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.job_stores.bind(name, factory);
        self
    }

    pub fn bind_fail_store<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn FailStore>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.fail_stores.bind(name, factory);
        self
    }

    pub fn bind_coordination<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CoordinationBackend>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.coordination.bind(name, factory);
        self
    }

    pub fn build(self) -> ExtensionRegistry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_caches_first_instance() {
        let registry = ExtensionRegistry::with_defaults();
        let a = registry.codecs.resolve("json").unwrap();
        let b = registry.codecs.resolve("json").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unknown_binding_names_key_and_binding() {
        let registry = ExtensionRegistry::with_defaults();
        let err = registry.balancers.resolve("does-not-exist").err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("does-not-exist"));
        assert!(msg.contains(keys::LOADBALANCE));
    }

    #[test]
    fn construction_failure_carries_cause() {
        let registry = ExtensionRegistry::builder()
            .bind_codec("broken", || Err("missing native library".into()))
            .build();
        let err = registry.codecs.resolve("broken").err().unwrap();
        match err {
            ExtensionError::Construction { key, name, source } => {
                assert_eq!(key, keys::REMOTING_CODEC);
                assert_eq!(name, "broken");
                assert_eq!(source.to_string(), "missing native library");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn last_binding_wins() {
        let mut point: ExtensionPoint<dyn Codec> = ExtensionPoint::new(keys::REMOTING_CODEC);
        point.bind("json", || Ok(Arc::new(JsonCodec::default())));
        point.bind("json", || Ok(Arc::new(JsonCodec::default())));
        assert_eq!(point.binding_names().len(), 1);
        assert!(point.resolve("json").is_ok());
    }

    #[test]
    fn defaults_cover_all_stock_bindings() {
        let registry = ExtensionRegistry::with_defaults();
        assert!(registry.codecs.resolve("json").is_ok());
        assert!(registry.balancers.resolve("round-robin").is_ok());
        assert!(registry.balancers.resolve("least-assignments").is_ok());
        assert!(registry.balancers.resolve("consistent-hash").is_ok());
        assert!(registry.job_stores.resolve("memory").is_ok());
        assert!(registry.fail_stores.resolve("memory").is_ok());
        assert!(registry.coordination.resolve("memory").is_ok());
    }
}
