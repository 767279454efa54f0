//! Named provider registry.
//!
//! Holds eagerly registered instances and lazily registered factories. The
//! process entry point constructs one registry and passes it by reference;
//! there is no global instance.

use async_lock::{OnceCell, RwLock};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::provider::StorageProvider;
use super::result::{OperationError, OperationResult, OperationStatus};

/// Builds a provider on first request. Called again only if a previous
/// attempt failed.
pub type ProviderInit =
    Arc<dyn Fn() -> BoxFuture<'static, OperationResult<StorageProvider>> + Send + Sync>;

struct LazySlot {
    cell: OnceCell<Arc<StorageProvider>>,
    init: ProviderInit,
}

#[derive(Default)]
pub struct ProviderRegistry {
    instances: RwLock<HashMap<String, Arc<StorageProvider>>>,
    factories: RwLock<HashMap<String, Arc<LazySlot>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready provider. Replaces any pending factory for `name`.
    pub async fn register_instance(&self, name: impl Into<String>, provider: StorageProvider) -> Arc<StorageProvider> {
        let name = name.into();
        let provider = Arc::new(provider);
        self.factories.write().await.remove(&name);
        self.instances.write().await.insert(name.clone(), provider.clone());
        info!("Registered provider '{}'", name);
        provider
    }

    /// Register a factory invoked on the first `get(name)`.
    pub async fn register_factory(&self, name: impl Into<String>, init: ProviderInit) {
        let name = name.into();
        debug!("Registered lazy provider '{}'", name);
        self.factories.write().await.insert(
            name,
            Arc::new(LazySlot {
                cell: OnceCell::new(),
                init,
            }),
        );
    }

    /// Get a provider by name, constructing it from its factory on first
    /// use. Concurrent first requests share one construction.
    pub async fn get(&self, name: &str) -> OperationResult<Arc<StorageProvider>> {
        if let Some(provider) = self.instances.read().await.get(name) {
            return Ok(provider.clone());
        }

        let slot = self.factories.read().await.get(name).cloned().ok_or_else(|| {
            OperationError::new(
                OperationStatus::NotFound,
                "provider_not_registered",
                format!("No provider registered as '{}'", name),
            )
        })?;

        let provider = slot
            .cell
            .get_or_try_init(|| async {
                info!("Initializing provider '{}'", name);
                (slot.init)().await.map(Arc::new)
            })
            .await?
            .clone();

        // Promote only while the slot is still the registered one. A slot
        // replaced or evicted during init hands out its provider uncached.
        let mut factories = self.factories.write().await;
        if factories.get(name).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            factories.remove(name);
            let provider = self
                .instances
                .write()
                .await
                .entry(name.to_string())
                .or_insert(provider)
                .clone();
            return Ok(provider);
        }
        Ok(provider)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.instances.read().await.contains_key(name) || self.factories.read().await.contains_key(name)
    }

    /// Remove an instance or pending factory. Returns whether anything was
    /// registered under `name`.
    pub async fn unregister(&self, name: &str) -> bool {
        let instance = self.instances.write().await.remove(name).is_some();
        let factory = self.factories.write().await.remove(name).is_some();
        instance || factory
    }

    /// Unregister `name` and disconnect the provider if one was built.
    /// Callers still holding the old provider keep a usable handle.
    pub async fn evict(&self, name: &str) -> bool {
        let factory = self.factories.write().await.remove(name).is_some();
        let instance = self.instances.write().await.remove(name);
        let found = factory || instance.is_some();
        if let Some(provider) = instance {
            if let Err(e) = provider.disconnect().await {
                debug!("Disconnecting '{}' failed: {}", name, e.message());
            }
            debug!("Evicted provider '{}'", name);
        }
        found
    }

    /// Names of all instances and pending factories, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.extend(self.factories.read().await.keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    /// Disconnect every constructed provider.
    pub async fn disconnect_all(&self) {
        let providers: Vec<Arc<StorageProvider>> = self.instances.read().await.values().cloned().collect();
        for provider in providers {
            if let Err(e) = provider.disconnect().await {
                debug!("Disconnecting '{}' failed: {}", provider.name(), e.message());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::backends::memory::MemoryBackend;
    use crate::settings::EngineSettings;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn memory_provider(name: &str) -> StorageProvider {
        StorageProvider::new(name, Box::new(MemoryBackend::posix()), &EngineSettings::default())
    }

    fn counting_init(calls: Arc<AtomicUsize>) -> ProviderInit {
        Arc::new(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                smol::Timer::after(Duration::from_millis(20)).await;
                Ok(memory_provider("lazy"))
            }
            .boxed()
        })
    }

    #[test]
    fn test_unregistered_name_is_an_error() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            let err = registry.get("missing").await.unwrap_err();
            assert!(err.is_not_found());
            assert_eq!(err.code(), "provider_not_registered");
        });
    }

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            let calls = Arc::new(AtomicUsize::new(0));
            registry.register_factory("lazy", counting_init(calls.clone())).await;

            let results = futures::future::join_all((0..8).map(|_| registry.get("lazy"))).await;
            let first = results[0].as_ref().unwrap().clone();
            for result in &results {
                assert!(Arc::ptr_eq(result.as_ref().unwrap(), &first));
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            registry.get("lazy").await.unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_instance_replaces_pending_factory() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            let calls = Arc::new(AtomicUsize::new(0));
            registry.register_factory("data", counting_init(calls.clone())).await;
            let eager = registry.register_instance("data", memory_provider("eager")).await;

            let got = registry.get("data").await.unwrap();
            assert!(Arc::ptr_eq(&got, &eager));
            assert_eq!(got.name(), "eager");
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_failed_init_is_retried() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            let attempts = Arc::new(AtomicUsize::new(0));
            let counter = attempts.clone();
            let init: ProviderInit = Arc::new(move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(OperationError::connection_failed("keyring locked"))
                    } else {
                        Ok(memory_provider("flaky"))
                    }
                }
                .boxed()
            });
            registry.register_factory("flaky", init).await;

            assert!(registry.get("flaky").await.is_err());
            assert!(registry.get("flaky").await.is_ok());
            assert_eq!(attempts.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn test_names_and_unregister() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            registry.register_instance("b", memory_provider("b")).await;
            registry
                .register_factory("a", counting_init(Arc::new(AtomicUsize::new(0))))
                .await;
            assert_eq!(registry.names().await, vec!["a".to_string(), "b".to_string()]);

            assert!(registry.unregister("a").await);
            assert!(!registry.contains("a").await);
            assert!(!registry.unregister("a").await);
        });
    }

    #[test]
    fn test_evict_drops_built_instance() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            let calls = Arc::new(AtomicUsize::new(0));
            registry.register_factory("data", counting_init(calls.clone())).await;
            let first = registry.get("data").await.unwrap();

            assert!(registry.evict("data").await);
            assert!(!registry.contains("data").await);
            assert!(registry.get("data").await.is_err());

            registry.register_factory("data", counting_init(calls.clone())).await;
            let second = registry.get("data").await.unwrap();
            assert!(!Arc::ptr_eq(&first, &second));
            assert_eq!(calls.load(Ordering::SeqCst), 2);
            assert!(!registry.evict("missing").await);
        });
    }

    #[test]
    fn test_init_replaced_mid_flight_is_not_cached() {
        smol::block_on(async {
            let registry = ProviderRegistry::new();
            let calls = Arc::new(AtomicUsize::new(0));
            registry.register_factory("data", counting_init(calls.clone())).await;

            let (stale, ()) = futures::join!(registry.get("data"), async {
                smol::Timer::after(Duration::from_millis(5)).await;
                registry.register_instance("data", memory_provider("fresh")).await;
            });
            assert_eq!(stale.unwrap().name(), "lazy");
            assert_eq!(registry.get("data").await.unwrap().name(), "fresh");
        });
    }
}
