use std::collections::HashMap;
use std::sync::Arc;

use relayq_core::{Error, Result};

use crate::{Broker, MemoryBroker};

type Factory = Arc<dyn Fn(&str) -> Result<Arc<dyn Broker>> + Send + Sync>;

/// Maps broker URL schemes to driver constructors.
///
/// Each engine owns its registry; there is no process-wide state. The
/// `memory` scheme is pre-registered.
pub struct BrokerRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        let mut registry = BrokerRegistry {
            factories: HashMap::new(),
        };
        registry.register("memory", |_url| {
            Ok(Arc::new(MemoryBroker::new()) as Arc<dyn Broker>)
        });
        registry
    }
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver constructor for a URL scheme, replacing any
    /// existing one.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn Broker>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Arc::new(factory));
    }

    /// Resolve a broker URL to a driver instance.
    pub fn connect(&self, url: &str) -> Result<Arc<dyn Broker>> {
        let (scheme, _) = url.split_once("://").ok_or_else(|| {
            Error::Config(format!("broker url must look like scheme://…, got {:?}", url))
        })?;

        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::Config(format!("unknown broker type: {:?}", scheme)))?;

        factory(url)
    }
}
