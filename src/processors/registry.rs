//! Processor registry: named operations available to the API.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::processors::ItemProcessor;

/// Registry of available item processors, keyed by operation name.
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn ItemProcessor>>>,
}

impl ProcessorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a processor. A later registration replaces an earlier one
    /// with the same name.
    pub async fn register(&self, processor: Arc<dyn ItemProcessor>) {
        let name = processor.name().to_string();
        if self
            .processors
            .write()
            .await
            .insert(name.clone(), processor)
            .is_some()
        {
            tracing::warn!(operation = %name, "Replaced existing processor");
        }
        tracing::debug!("Registered processor: {}", name);
    }

    /// Register a processor (sync version for startup).
    pub fn register_sync(&self, processor: Arc<dyn ItemProcessor>) {
        let name = processor.name().to_string();
        if let Ok(mut processors) = self.processors.try_write() {
            processors.insert(name.clone(), processor);
            tracing::debug!("Registered processor: {}", name);
        }
    }

    /// Get a processor by operation name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn ItemProcessor>> {
        self.processors.read().await.get(name).cloned()
    }

    /// List `(name, description)` pairs, sorted by name.
    pub async fn list(&self) -> Vec<(String, String)> {
        let mut ops: Vec<(String, String)> = self
            .processors
            .read()
            .await
            .values()
            .map(|p| (p.name().to_string(), p.description().to_string()))
            .collect();
        ops.sort();
        ops
    }

    /// Get the number of registered processors.
    pub fn count(&self) -> usize {
        self.processors.try_read().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{FnProcessor, ItemOutcome};

    fn noop(name: &str) -> Arc<dyn ItemProcessor> {
        Arc::new(FnProcessor::new(name, |_item: String| async {
            Ok(ItemOutcome::ok())
        }))
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = ProcessorRegistry::new();
        registry.register_sync(noop("inspect"));
        registry.register(noop("convert")).await;

        assert_eq!(registry.count(), 2);
        assert!(registry.get("inspect").await.is_some());
        assert!(registry.get("missing").await.is_none());

        let names: Vec<String> = registry.list().await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["convert", "inspect"]);
    }
}
