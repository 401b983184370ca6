use std::{collections::HashMap, time::Duration};

use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};

/// Per-method overrides applied by both invoker sides.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MethodOptions {
    /// Overrides the invoker-level call timeout.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Marks results of this method as cacheable.
    #[serde(default)]
    pub cache: bool,
    /// Requires non-empty arguments at dispatch time.
    #[serde(default)]
    pub validation: bool,
}

/// Published surface of one interface: method set plus per-method options.
/// Built once when the service is bound and immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescriptor {
    pub interface: String,
    methods: HashMap<String, MethodOptions, RandomState>,
}

impl InterfaceDescriptor {
    #[must_use]
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            methods: HashMap::default(),
        }
    }

    pub fn insert(&mut self, method: &str, options: MethodOptions) {
        self.methods.insert(method.to_string(), options);
    }

    #[must_use]
    pub fn get(&self, method: &str) -> Option<&MethodOptions> {
        self.methods.get(method)
    }

    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
