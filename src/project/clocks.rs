// Logical-clock playground. Every node keeps a scalar and a vector clock;
// each tick it either consumes a message or rolls for a local event or a
// send. The shared causal log records every action with its stamps and backs
// the causality quiz exposed through `Clocks::compare`
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::json;

use crate::clock::{self, Causality, LamportClock, VectorClock, VectorSnapshot};
use crate::event::EventKind;
use crate::message::NodeId;
use crate::node::{Process, Roster, TickCtx};

use super::{Harness, Project, ProjectConfig};

pub const DEFAULT_NODES: usize = 3;

/// Chance that an idle tick does anything at all; local event and send split
/// the remainder evenly.
const ACTIVITY: f64 = 0.3;

const MESSAGE: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalAction {
    Local,
    Send,
    Receive,
}

#[derive(Debug, Clone, Serialize)]
pub struct CausalEvent {
    pub id: u64,
    pub node: NodeId,
    pub action: CausalAction,
    pub lamport: u64,
    pub vector: VectorSnapshot,
}

/// Append-only record of every clock-relevant action in the run, shared by
/// all nodes of the plugin.
#[derive(Clone, Default)]
pub struct CausalLog {
    events: Arc<RwLock<Vec<CausalEvent>>>,
    seq: Arc<AtomicU64>,
}

impl CausalLog {
    fn record(
        &self,
        node: &str,
        action: CausalAction,
        lamport: u64,
        vector: VectorSnapshot,
    ) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.events.write().push(CausalEvent {
            id,
            node: node.to_string(),
            action,
            lamport,
            vector,
        });
        id
    }

    pub fn get(&self, id: u64) -> Option<CausalEvent> {
        self.events
            .read()
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }

    pub fn events(&self) -> Vec<CausalEvent> {
        self.events.read().clone()
    }

    /// First recorded action of the given kind at the given node.
    pub fn find(&self, node: &str, action: CausalAction) -> Option<CausalEvent> {
        self.events
            .read()
            .iter()
            .find(|event| event.node == node && event.action == action)
            .cloned()
    }
}

/// Quiz answer; `unknown` covers ids the log has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOutcome {
    Before,
    After,
    Concurrent,
    Equal,
    Unknown,
}

struct ClockNode {
    scalar: LamportClock,
    vector: VectorClock,
    peers: Vec<NodeId>,
    log: CausalLog,
}

impl ClockNode {
    fn new(id: &str, participants: &[NodeId], log: CausalLog) -> Self {
        Self {
            scalar: LamportClock::new(),
            vector: VectorClock::new(id.to_string(), participants.iter().cloned()),
            peers: participants
                .iter()
                .filter(|peer| peer.as_str() != id)
                .cloned()
                .collect(),
            log,
        }
    }

    fn stamp_data(&self, lamport: u64, vector: &VectorSnapshot, event_id: u64) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("lamport".into(), lamport.into());
        data.insert(
            "vector".into(),
            serde_json::to_value(vector).unwrap_or(serde_json::Value::Null),
        );
        data.insert("event_id".into(), event_id.into());
        data
    }
}

impl Process for ClockNode {
    fn on_tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()> {
        if let Some(envelope) = ctx.recv() {
            let lamport = self.scalar.update(envelope.lamport.unwrap_or(0));
            let vector = match &envelope.vector {
                Some(remote) => self.vector.merge(remote),
                None => self.vector.increment(),
            };
            let event_id = self.log.record(ctx.id(), CausalAction::Receive, lamport, vector.clone());
            let mut data = self.stamp_data(lamport, &vector, event_id);
            data.insert("node_id".into(), ctx.id().clone().into());
            data.insert("action".into(), "receive".into());
            ctx.emit(EventKind::ClockUpdate, data);
            return Ok(());
        }

        let roll = {
            let mut rng = rand::thread_rng();
            if rng.gen::<f64>() >= ACTIVITY {
                return Ok(());
            }
            if rng.gen_bool(0.5) {
                None
            } else {
                self.peers.choose(&mut rng).cloned()
            }
        };
        let lamport = self.scalar.tick();
        let vector = self.vector.increment();
        match roll {
            None => {
                let event_id = self.log.record(ctx.id(), CausalAction::Local, lamport, vector.clone());
                let mut data = self.stamp_data(lamport, &vector, event_id);
                data.insert("node_id".into(), ctx.id().clone().into());
                data.insert("action".into(), "local".into());
                ctx.emit(EventKind::ClockTick, data);
            }
            Some(peer) => {
                let event_id = self.log.record(ctx.id(), CausalAction::Send, lamport, vector.clone());
                ctx.send_stamped(
                    &peer,
                    MESSAGE,
                    json!({ "note": "clock sync" }).into(),
                    lamport,
                    vector.clone(),
                )?;
                let mut data = self.stamp_data(lamport, &vector, event_id);
                data.insert("node_id".into(), ctx.id().clone().into());
                data.insert("action".into(), "send".into());
                data.insert("to".into(), peer.into());
                ctx.emit(EventKind::ClockTick, data);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("clock".into(), self.scalar.read().into());
        data.insert(
            "vector".into(),
            serde_json::to_value(self.vector.read()).unwrap_or(serde_json::Value::Null),
        );
        data
    }
}

pub struct Clocks {
    roster: Roster,
    log: CausalLog,
}

impl Clocks {
    pub fn log(&self) -> &CausalLog {
        &self.log
    }

    /// Resolves the causal relation between two recorded events through the
    /// vector comparator.
    pub fn compare(&self, a: u64, b: u64) -> CompareOutcome {
        let (Some(a), Some(b)) = (self.log.get(a), self.log.get(b)) else {
            return CompareOutcome::Unknown;
        };
        match clock::compare(&a.vector, &b.vector) {
            Causality::Equal => CompareOutcome::Equal,
            Causality::Before => CompareOutcome::Before,
            Causality::After => CompareOutcome::After,
            Causality::Concurrent => CompareOutcome::Concurrent,
        }
    }
}

impl Project for Clocks {
    fn name(&self) -> &'static str {
        "clocks"
    }

    fn roster(&self) -> &Roster {
        &self.roster
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn build(
    _scenario: Option<&str>,
    config: &ProjectConfig,
    harness: &Harness,
) -> anyhow::Result<Box<dyn Project>> {
    let count = config.node_count.unwrap_or(DEFAULT_NODES).max(2);
    // ordering lesson, not a fault-tolerance one: latency but no loss
    harness.net.set_packet_loss(0.0);
    harness.net.set_latency(10, 50);

    let participants: Vec<NodeId> = (1..=count).map(|index| format!("node-{index}")).collect();
    let log = CausalLog::default();
    for id in &participants {
        harness.spawn_node(
            id.clone(),
            Box::new(ClockNode::new(id, &participants, log.clone())),
        );
    }
    Ok(Box::new(Clocks {
        roster: harness.roster.clone(),
        log,
    }))
}
