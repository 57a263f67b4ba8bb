use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::VirtualClock;
use crate::event::EventBus;
use crate::message::NodeId;
use crate::net::Transport;
use crate::node::{Node, Process, Roster};

pub mod byzantine;
pub mod clocks;
pub mod demo;
pub mod two_generals;

/// Per-run configuration carried by `start_simulation`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub node_count: Option<usize>,
    pub speed: Option<f64>,
    pub step_mode: Option<bool>,
    pub traitor_count: Option<usize>,
    pub max_rounds: Option<u32>,
    pub drop_rate: Option<f64>,
}

/// Session-owned pieces a plugin wires its nodes into.
#[derive(Clone)]
pub struct Harness {
    pub roster: Roster,
    pub net: Transport,
    pub bus: EventBus,
    pub clock: VirtualClock,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn spawn_node(&self, id: impl Into<NodeId>, process: Box<dyn Process>) -> Arc<Mutex<Node>> {
        let node = Node::create(id, process, &self.net, &self.bus, &self.clock, &self.cancel);
        self.roster.insert(node.clone());
        node
    }
}

/// An algorithm plugged into the simulation substrate. Plugins compose the
/// node lifecycle by delegation: per-node behavior lives in `Process`
/// implementations, per-run state in the plugin value itself. Lifecycle
/// mutations (crash, recover) reach nodes through the shared roster.
pub trait Project: Send {
    fn name(&self) -> &'static str;

    fn roster(&self) -> &Roster;

    /// Called once after construction, before the engine starts ticking.
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    /// Per-node observable state, keyed by node id.
    fn state(
        &self,
    ) -> std::collections::BTreeMap<NodeId, serde_json::Map<String, serde_json::Value>> {
        self.roster().snapshots()
    }

    /// Plugin-specific queries (e.g. the clocks causality quiz) go through a
    /// downcast.
    fn as_any(&self) -> &dyn Any;
}

/// Resolves a project identifier to a constructed plugin. Identifiers without
/// an implementation (the extension slots) and unknown ids fall back to the
/// inert demo plugin.
pub fn build(
    project: &str,
    scenario: Option<&str>,
    config: &ProjectConfig,
    harness: &Harness,
) -> anyhow::Result<Box<dyn Project>> {
    match project {
        "two-generals" => two_generals::build(scenario, config, harness),
        "clocks" => clocks::build(scenario, config, harness),
        "byzantine" => byzantine::build(scenario, config, harness),
        other => {
            debug!(project = other, "no such project, using demo plugin");
            demo::build(config, harness)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Harness over a fresh substrate, for plugin unit tests.
    pub fn harness() -> Harness {
        let cancel = CancellationToken::new();
        let clock = VirtualClock::default();
        let bus = EventBus::new();
        let net = Transport::new(clock.clone(), cancel.clone());
        Harness {
            roster: Roster::default(),
            net,
            bus,
            clock,
            cancel,
        }
    }

    /// Drives every roster node once, roster order.
    pub fn tick_all(harness: &Harness) {
        harness.clock.advance(crate::engine::DEFAULT_TICK_RATE_MS);
        for node in harness.roster.handles() {
            node.lock().tick().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_project_resolves_to_demo() {
        let harness = testing::harness();
        let project = build("raft", None, &ProjectConfig::default(), &harness).unwrap();
        assert_eq!(project.name(), "demo");
        assert!(!project.roster().is_empty());
    }

    #[test]
    fn config_accepts_wire_field_names() {
        let config: ProjectConfig =
            serde_json::from_value(serde_json::json!({"nodeCount": 5, "stepMode": true}))
                .unwrap();
        assert_eq!(config.node_count, Some(5));
        assert_eq!(config.step_mode, Some(true));
        assert_eq!(config.speed, None);
    }
}
