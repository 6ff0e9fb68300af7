//! Agent driver registry -- a named collection of available agent drivers.
//!
//! Modeled directly on the teacher's `harness::registry::HarnessRegistry`:
//! same `register`/`get`/`list`/`len`/`is_empty` surface and the same
//! names-only `Debug` impl, with `Box<dyn Harness>` swapped for
//! `Arc<dyn AgentDriver>` since a driver is shared into the per-run
//! `RunCallbacks` wiring rather than owned exclusively by the registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::collaborators::AgentDriver;

/// A collection of registered [`AgentDriver`] implementations, keyed by
/// `agentType` name (spec.md §3 `WorkOrder.agentType`).
#[derive(Default)]
pub struct AgentDriverRegistry {
    drivers: HashMap<String, Arc<dyn AgentDriver>>,
}

impl AgentDriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under the name returned by [`AgentDriver::name`].
    /// Replaces and returns any driver previously registered under that
    /// name.
    pub fn register(&mut self, driver: Arc<dyn AgentDriver>) -> Option<Arc<dyn AgentDriver>> {
        let name = driver.name().to_string();
        self.drivers.insert(name, driver)
    }

    /// Look up a driver by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentDriver>> {
        self.drivers.get(name).cloned()
    }

    /// List the names of all registered drivers. Order is not guaranteed.
    pub fn list(&self) -> Vec<&str> {
        self.drivers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for AgentDriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AgentCapabilities, AgentRequest, AgentResult};
    use crate::streaming::EventSink;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct FakeDriver {
        driver_name: String,
    }

    #[async_trait]
    impl AgentDriver for FakeDriver {
        fn name(&self) -> &str {
            &self.driver_name
        }

        async fn execute(
            &self,
            _request: AgentRequest,
            _cancellation: CancellationToken,
            _on_event: EventSink,
        ) -> anyhow::Result<AgentResult> {
            Ok(AgentResult {
                exit_code: 0,
                success: true,
                stdout: String::new(),
                stderr: String::new(),
                session_id: None,
                duration_ms: 0,
                tokens: None,
                cost_usd: None,
            })
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn get_capabilities(&self) -> AgentCapabilities {
            AgentCapabilities::default()
        }
    }

    fn fake(name: &str) -> Arc<dyn AgentDriver> {
        Arc::new(FakeDriver { driver_name: name.to_string() })
    }

    #[test]
    fn registry_starts_empty() {
        let registry = AgentDriverRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_and_get() {
        let mut registry = AgentDriverRegistry::new();
        assert!(registry.register(fake("claude-code")).is_none());
        let driver = registry.get("claude-code");
        assert!(driver.is_some());
        assert_eq!(driver.unwrap().name(), "claude-code");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = AgentDriverRegistry::new();
        registry.register(fake("claude-code"));
        let old = registry.register(fake("claude-code"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = AgentDriverRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = AgentDriverRegistry::new();
        registry.register(fake("alpha"));
        registry.register(fake("beta"));
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = AgentDriverRegistry::new();
        registry.register(fake("claude-code"));
        let debug = format!("{registry:?}");
        assert!(debug.contains("claude-code"));
    }
}
