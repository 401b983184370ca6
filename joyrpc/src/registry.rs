use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use foldhash::fast::RandomState;
use tokio::sync::watch;

use crate::{
    error::Result,
    url::{Url, params},
};

/// Identity of one subscribable service: interface plus logical alias.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub interface: String,
    pub alias: String,
}

impl ServiceKey {
    #[must_use]
    pub fn new(interface: &str, alias: &str) -> Self {
        Self {
            interface: interface.to_string(),
            alias: alias.to_string(),
        }
    }

    /// Key of the service a url belongs to.
    #[must_use]
    pub fn of(url: &Url) -> Self {
        Self {
            interface: url.interface().to_string(),
            alias: url.string_param(params::ALIAS, ""),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.interface, self.alias)
    }
}

/// Versioned full provider list for one service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub version: u64,
    pub providers: Vec<Url>,
}

/// Versioned attribute overrides for one service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub overrides: BTreeMap<String, String>,
}

/// Discovery contract the runtime consumes.
///
/// Subscriptions are watch streams: a subscriber always observes the current
/// snapshot immediately and every later publish, with versions increasing
/// monotonically per service. Consumers filter duplicates by version, so a
/// backend may re-deliver the current snapshot after a reconnect.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    fn name(&self) -> &'static str;

    async fn register(&self, url: &Url) -> Result<()>;

    async fn deregister(&self, url: &Url) -> Result<()>;

    async fn subscribe_cluster(&self, key: &ServiceKey) -> Result<watch::Receiver<ClusterSnapshot>>;

    async fn subscribe_configure(&self, key: &ServiceKey)
    -> Result<watch::Receiver<ConfigSnapshot>>;
}

struct ServiceEntry {
    version: u64,
    providers: BTreeSet<Url>,
    cluster_tx: watch::Sender<ClusterSnapshot>,
    config_version: u64,
    config_tx: watch::Sender<ConfigSnapshot>,
}

impl Default for ServiceEntry {
    fn default() -> Self {
        Self {
            version: 0,
            providers: BTreeSet::new(),
            cluster_tx: watch::channel(ClusterSnapshot::default()).0,
            config_version: 0,
            config_tx: watch::channel(ConfigSnapshot::default()).0,
        }
    }
}

impl ServiceEntry {
    fn publish(&mut self) {
        self.version += 1;
        let snapshot = ClusterSnapshot {
            version: self.version,
            providers: self.providers.iter().cloned().collect(),
        };
        let _ = self.cluster_tx.send_replace(snapshot);
    }
}

/// In-memory reference implementation of the discovery contract.
///
/// Used by tests and single-process deployments; external backends plug in
/// through the same trait.
#[derive(Default)]
pub struct MemoryRegistry {
    services: Mutex<HashMap<ServiceKey, ServiceEntry, RandomState>>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current provider list, for assertions and operator tooling.
    #[must_use]
    pub fn providers(&self, key: &ServiceKey) -> Vec<Url> {
        self.with_entry(key, |entry| entry.providers.iter().cloned().collect())
    }

    /// Publishes attribute overrides on the configure stream.
    pub fn publish_configure(&self, key: &ServiceKey, overrides: BTreeMap<String, String>) {
        self.with_entry(key, |entry| {
            entry.config_version += 1;
            let snapshot = ConfigSnapshot {
                version: entry.config_version,
                overrides,
            };
            let _ = entry.config_tx.send_replace(snapshot);
        });
    }

    /// Re-delivers the current cluster snapshot without a version bump, the
    /// way a backend replays state after a reconnect.
    pub fn republish(&self, key: &ServiceKey) {
        self.with_entry(key, |entry| {
            let snapshot = ClusterSnapshot {
                version: entry.version,
                providers: entry.providers.iter().cloned().collect(),
            };
            let _ = entry.cluster_tx.send_replace(snapshot);
        });
    }

    fn with_entry<T>(&self, key: &ServiceKey, f: impl FnOnce(&mut ServiceEntry) -> T) -> T {
        let mut services = match self.services.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(services.entry(key.clone()).or_default())
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, url: &Url) -> Result<()> {
        let key = ServiceKey::of(url);
        self.with_entry(&key, |entry| {
            if entry.providers.insert(url.clone()) {
                entry.publish();
                tracing::info!("registered provider {url} for {key}");
            }
        });
        Ok(())
    }

    async fn deregister(&self, url: &Url) -> Result<()> {
        let key = ServiceKey::of(url);
        self.with_entry(&key, |entry| {
            if entry.providers.remove(url) {
                entry.publish();
                tracing::info!("deregistered provider {url} for {key}");
            }
        });
        Ok(())
    }

    async fn subscribe_cluster(&self, key: &ServiceKey) -> Result<watch::Receiver<ClusterSnapshot>> {
        Ok(self.with_entry(key, |entry| entry.cluster_tx.subscribe()))
    }

    async fn subscribe_configure(
        &self,
        key: &ServiceKey,
    ) -> Result<watch::Receiver<ConfigSnapshot>> {
        Ok(self.with_entry(key, |entry| entry.config_tx.subscribe()))
    }
}
