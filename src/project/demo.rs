// Fallback plugin for project ids without an implementation. Nodes idle
// through their ticks so the engine, transport, and fault surfaces stay fully
// drivable from the outside
use std::any::Any;

use crate::node::{Process, Roster, TickCtx};

use super::{Harness, Project, ProjectConfig};

pub const DEFAULT_NODES: usize = 3;

struct Idle;

impl Process for Idle {
    fn on_tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()> {
        // drain at most one envelope so injected traffic does not pile up
        let _ = ctx.recv();
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("role".into(), "idle".into());
        data
    }
}

pub struct Demo {
    roster: Roster,
}

impl Project for Demo {
    fn name(&self) -> &'static str {
        "demo"
    }

    fn roster(&self) -> &Roster {
        &self.roster
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn build(config: &ProjectConfig, harness: &Harness) -> anyhow::Result<Box<dyn Project>> {
    let count = config.node_count.unwrap_or(DEFAULT_NODES).max(1);
    for index in 0..count {
        harness.spawn_node(format!("node-{index}"), Box::new(Idle));
    }
    Ok(Box::new(Demo {
        roster: harness.roster.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::testing::{harness, tick_all};

    #[test]
    fn demo_nodes_idle_but_stay_drivable() {
        let harness = harness();
        let project = build(
            &ProjectConfig {
                node_count: Some(5),
                ..ProjectConfig::default()
            },
            &harness,
        )
        .unwrap();
        assert_eq!(project.roster().len(), 5);
        for _ in 0..10 {
            tick_all(&harness);
        }
        assert!(project.roster().crash("node-2").unwrap());
        assert!(project.roster().recover("node-2").unwrap());
    }
}
