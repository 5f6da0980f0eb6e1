//! # Metrics of built-in agents.
//!
//! Every [`BuiltinAgent`] is a `prometheus` collector. [`AgentsCollector`]
//! merges the running built-in agents into one collector that a local scrape
//! endpoint registers with its `prometheus::Registry`.
//!
//! ## Rules
//! - The agent set changes at runtime, so the collector is unchecked:
//!   `desc()` is empty and families come from whatever runs at scrape time.
//! - `collect()` works on a snapshot and never waits for a reconciliation.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;

use crate::agents::BuiltinAgent;

/// Running built-in agents, as one metrics source.
#[derive(Clone, Default)]
pub struct AgentsCollector {
    agents: Arc<RwLock<BTreeMap<String, Arc<dyn BuiltinAgent>>>>,
}

impl AgentsCollector {
    pub(crate) fn insert(&self, agent_id: &str, agent: Arc<dyn BuiltinAgent>) {
        self.agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(agent_id.to_string(), agent);
    }

    pub(crate) fn remove(&self, agent_id: &str) {
        self.agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(agent_id);
    }

    /// Number of agents contributing metrics.
    pub fn agents_count(&self) -> usize {
        self.agents.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Collector for AgentsCollector {
    fn desc(&self) -> Vec<&Desc> {
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let agents: Vec<Arc<dyn BuiltinAgent>> = self
            .agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();

        agents.iter().flat_map(|agent| agent.collect()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prometheus::{IntCounter, Registry};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::events::AgentChange;

    struct Counting {
        scrapes: IntCounter,
    }

    impl Counting {
        fn new(name: &str) -> Self {
            Self {
                scrapes: IntCounter::new(name, "Scrapes seen.").unwrap(),
            }
        }
    }

    impl Collector for Counting {
        fn desc(&self) -> Vec<&Desc> {
            self.scrapes.desc()
        }

        fn collect(&self) -> Vec<MetricFamily> {
            self.scrapes.inc();
            self.scrapes.collect()
        }
    }

    #[async_trait]
    impl BuiltinAgent for Counting {
        async fn run(&self, _ctx: CancellationToken, _changes: mpsc::Sender<AgentChange>) {}
    }

    #[test]
    fn test_registry_sees_current_agents() {
        let agents = AgentsCollector::default();
        let registry = Registry::new();
        registry.register(Box::new(agents.clone())).unwrap();
        assert!(registry.gather().is_empty());

        agents.insert("a", Arc::new(Counting::new("a_scrapes_total")));
        agents.insert("b", Arc::new(Counting::new("b_scrapes_total")));
        assert_eq!(agents.agents_count(), 2);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert_eq!(names, vec!["a_scrapes_total", "b_scrapes_total"]);

        agents.remove("a");
        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "b_scrapes_total");
        // second scrape of b
        assert_eq!(families[0].get_metric()[0].get_counter().get_value(), 2.0);
    }
}
