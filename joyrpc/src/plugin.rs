use std::{collections::HashMap, sync::{Arc, RwLock}, time::Duration};

use foldhash::fast::RandomState;

use crate::{
    codec::Codec,
    error::{Error, ErrorKind, Result},
    filter::{Filter, TraceFilter},
    health::Doctor,
    loadbalance::{LeastActive, LoadBalance, RoundRobin, WeightedRandom},
    registry::Registry,
};

type BalancerFactory = Box<dyn Fn() -> Arc<dyn LoadBalance> + Send + Sync>;

/// Named-extension table consumed at invoker-build time.
///
/// Constructed once at startup (usually via [`with_builtins`]) and passed by
/// reference; there is no hidden global, so parallel tests can each hold
/// their own registry. Stateful plugins register factories, everything else
/// registers shared instances.
///
/// [`with_builtins`]: PluginRegistry::with_builtins
#[derive(Default)]
pub struct PluginRegistry {
    codecs: RwLock<HashMap<String, Codec, RandomState>>,
    balancers: RwLock<HashMap<String, BalancerFactory, RandomState>>,
    filters: RwLock<HashMap<String, Arc<dyn Filter>, RandomState>>,
    registries: RwLock<HashMap<String, Arc<dyn Registry>, RandomState>>,
    doctors: RwLock<HashMap<String, Arc<dyn Doctor>, RandomState>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the in-tree extensions.
    #[must_use]
    pub fn with_builtins() -> Self {
        let plugins = Self::new();
        plugins.register_codec(Codec::Json);
        plugins.register_codec(Codec::MessagePack);
        plugins.register_balancer("roundrobin", || Arc::new(RoundRobin::default()));
        plugins.register_balancer("random", || Arc::new(WeightedRandom::default()));
        plugins.register_balancer("leastactive", || Arc::new(LeastActive));
        plugins.register_filter(Arc::new(TraceFilter::default()));
        plugins.register_filter(Arc::new(crate::filter::CacheFilter::new(
            Duration::from_secs(30),
        )));
        plugins
    }

    pub fn register_codec(&self, codec: Codec) {
        if let Ok(mut codecs) = self.codecs.write() {
            codecs.insert(codec.name().to_string(), codec);
        }
    }

    /// # Errors
    ///
    /// Fails with `Config` for an unknown codec name.
    pub fn codec(&self, name: &str) -> Result<Codec> {
        self.codecs
            .read()
            .ok()
            .and_then(|codecs| codecs.get(name).copied())
            .ok_or_else(|| Error::new(ErrorKind::Config, format!("unknown codec `{name}`")))
    }

    pub fn register_balancer<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn LoadBalance> + Send + Sync + 'static,
    {
        if let Ok(mut balancers) = self.balancers.write() {
            balancers.insert(name.to_string(), Box::new(factory));
        }
    }

    /// Fresh balancer instance, so counters stay scoped to one invoker.
    ///
    /// # Errors
    ///
    /// Fails with `Config` for an unknown balancer name.
    pub fn balancer(&self, name: &str) -> Result<Arc<dyn LoadBalance>> {
        self.balancers
            .read()
            .ok()
            .and_then(|balancers| balancers.get(name).map(|factory| factory()))
            .ok_or_else(|| {
                Error::new(ErrorKind::Config, format!("unknown load balancer `{name}`"))
            })
    }

    pub fn register_filter(&self, filter: Arc<dyn Filter>) {
        if let Ok(mut filters) = self.filters.write() {
            filters.insert(filter.name().to_string(), filter);
        }
    }

    /// Resolves filter names to instances; the chain orders them by priority.
    ///
    /// # Errors
    ///
    /// Fails with `Config` on the first unknown name.
    pub fn filters(&self, names: &[String]) -> Result<Vec<Arc<dyn Filter>>> {
        let filters = self
            .filters
            .read()
            .map_err(|_| Error::new(ErrorKind::Config, "plugin registry poisoned".to_string()))?;
        names
            .iter()
            .map(|name| {
                filters
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::new(ErrorKind::Config, format!("unknown filter `{name}`")))
            })
            .collect()
    }

    pub fn register_registry(&self, registry: Arc<dyn Registry>) {
        if let Ok(mut registries) = self.registries.write() {
            registries.insert(registry.name().to_string(), registry);
        }
    }

    /// # Errors
    ///
    /// Fails with `Config` for an unknown registry name.
    pub fn registry(&self, name: &str) -> Result<Arc<dyn Registry>> {
        self.registries
            .read()
            .ok()
            .and_then(|registries| registries.get(name).cloned())
            .ok_or_else(|| Error::new(ErrorKind::Config, format!("unknown registry `{name}`")))
    }

    pub fn register_doctor(&self, doctor: Arc<dyn Doctor>) {
        if let Ok(mut doctors) = self.doctors.write() {
            doctors.insert(doctor.name().to_string(), doctor);
        }
    }

    #[must_use]
    pub fn doctors(&self) -> Vec<Arc<dyn Doctor>> {
        self.doctors
            .read()
            .map(|doctors| doctors.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let plugins = PluginRegistry::with_builtins();
        assert_eq!(plugins.codec("json").unwrap(), Codec::Json);
        assert_eq!(plugins.codec("msgpack").unwrap(), Codec::MessagePack);
        assert_eq!(plugins.balancer("roundrobin").unwrap().name(), "roundrobin");
        assert_eq!(plugins.balancer("leastactive").unwrap().name(), "leastactive");

        let error = plugins.codec("xml").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Config);
        assert!(plugins.balancer("consistent").is_err());
    }

    #[test]
    fn test_balancer_factories_return_fresh_instances() {
        let plugins = PluginRegistry::with_builtins();
        let a = plugins.balancer("roundrobin").unwrap();
        let b = plugins.balancer("roundrobin").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_filter_resolution_preserves_request_order() {
        let plugins = PluginRegistry::with_builtins();
        let filters = plugins
            .filters(&["cache".to_string(), "trace".to_string()])
            .unwrap();
        assert_eq!(filters.len(), 2);
        assert!(plugins.filters(&["auth".to_string()]).is_err());
    }
}
