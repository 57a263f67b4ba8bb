// Byzantine generals, simplified oral-messages flavor. The commander
// broadcasts its order at round 0; lieutenants relay what they heard for f
// further rounds; everyone decides by majority once enough distinct senders
// have spoken. A traitor commander may send different orders to different
// lieutenants; a traitor lieutenant may flip what it relays; a silent node
// withholds. With n >= 3f + 1 honest nodes converge on the commander's
// order; at n = 3f they may never gather enough consistent votes
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::json;

use crate::event::EventKind;
use crate::message::NodeId;
use crate::node::{Process, Roster, TickCtx};

use super::{Harness, Project, ProjectConfig};

pub const DEFAULT_NODES: usize = 4;
pub const DEFAULT_TRAITORS: usize = 1;

const VOTE: &str = "vote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    Traitor,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Attack,
    Retreat,
}

impl Order {
    fn as_str(&self) -> &'static str {
        match self {
            Order::Attack => "attack",
            Order::Retreat => "retreat",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "retreat" => Order::Retreat,
            _ => Order::Attack,
        }
    }

    fn flipped(&self) -> Self {
        match self {
            Order::Attack => Order::Retreat,
            Order::Retreat => Order::Attack,
        }
    }
}

/// Run-level state shared by every general of one simulation.
struct RunState {
    initial: Order,
    honest: Vec<NodeId>,
    decisions: Mutex<FxHashMap<NodeId, Order>>,
    consensus: AtomicBool,
}

impl RunState {
    /// Records an honest decision and fires the consensus latch exactly once
    /// when every honest node has decided on one value.
    fn record(&self, node: &str, order: Order, ctx: &TickCtx<'_>) {
        if !self.honest.iter().any(|id| id == node) {
            return;
        }
        let agreed = {
            let mut decisions = self.decisions.lock();
            decisions.insert(node.to_string(), order);
            decisions.len() == self.honest.len()
                && decisions.values().all(|value| *value == order)
        };
        if agreed && !self.consensus.swap(true, Ordering::SeqCst) {
            let mut data = serde_json::Map::new();
            data.insert("value".into(), order.as_str().into());
            ctx.emit(EventKind::ConsensusReached, data);
        }
    }

    fn reached(&self) -> bool {
        self.consensus.load(Ordering::SeqCst)
    }
}

struct General {
    behavior: Behavior,
    commander: bool,
    lieutenants: Vec<NodeId>,
    total: usize,
    faulty: usize,
    run: Arc<RunState>,
    broadcast_done: bool,
    // first claimed order per sender
    votes: FxHashMap<NodeId, Order>,
    decision: Option<Order>,
}

impl General {
    fn majority(&self) -> Order {
        let attack = self
            .votes
            .values()
            .filter(|order| **order == Order::Attack)
            .count();
        let retreat = self.votes.len() - attack;
        // ties go to attack
        if retreat > attack {
            Order::Retreat
        } else {
            Order::Attack
        }
    }

    fn quorum(&self) -> usize {
        self.total.div_ceil(2)
    }

    fn broadcast_order(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()> {
        self.broadcast_done = true;
        if self.behavior == Behavior::Silent {
            return Ok(());
        }
        let mut first_order = None;
        for lieutenant in self.lieutenants.clone() {
            let order = if self.behavior == Behavior::Traitor {
                // a traitorous commander flips a coin per recipient
                if rand::thread_rng().gen_bool(0.5) {
                    self.run.initial
                } else {
                    self.run.initial.flipped()
                }
            } else {
                self.run.initial
            };
            match first_order {
                None => first_order = Some(order),
                Some(first) if first != order => {
                    let mut data = serde_json::Map::new();
                    data.insert("commander".into(), ctx.id().clone().into());
                    data.insert("recipient".into(), lieutenant.clone().into());
                    data.insert("value".into(), order.as_str().into());
                    ctx.emit(EventKind::ConflictDetected, data);
                }
                Some(_) => {}
            }
            self.cast_vote(ctx, &lieutenant, 0, order)?;
        }
        if self.behavior == Behavior::Honest {
            self.decision = Some(self.run.initial);
            self.run.record(ctx.id(), self.run.initial, ctx);
        }
        Ok(())
    }

    fn cast_vote(
        &self,
        ctx: &TickCtx<'_>,
        to: &str,
        round: u32,
        order: Order,
    ) -> anyhow::Result<()> {
        ctx.send(
            to,
            VOTE,
            json!({ "round": round, "value": order.as_str() }).into(),
        )?;
        let mut data = serde_json::Map::new();
        data.insert("from".into(), ctx.id().clone().into());
        data.insert("to".into(), to.into());
        data.insert("round".into(), round.into());
        data.insert("value".into(), order.as_str().into());
        ctx.emit(EventKind::VoteCast, data);
        Ok(())
    }
}

impl Process for General {
    fn on_tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()> {
        if self.commander {
            if !self.broadcast_done {
                self.broadcast_order(ctx)?;
            }
            return Ok(());
        }

        let Some(envelope) = ctx.recv() else {
            return Ok(());
        };
        if envelope.kind != VOTE {
            return Ok(());
        }
        let round = envelope
            .payload
            .get("round")
            .and_then(|value| value.as_u64())
            .unwrap_or(0) as u32;
        let order = Order::parse(
            envelope
                .payload
                .get("value")
                .and_then(|value| value.as_str())
                .unwrap_or("attack"),
        );
        self.votes.entry(envelope.from.clone()).or_insert(order);

        // relay rounds 1..=f
        if (round as usize) < self.faulty && self.behavior != Behavior::Silent {
            let relayed = if self.behavior == Behavior::Traitor && rand::thread_rng().gen_bool(0.5)
            {
                order.flipped()
            } else {
                order
            };
            let me = ctx.id().clone();
            for peer in self
                .lieutenants
                .clone()
                .into_iter()
                .filter(|peer| *peer != me && *peer != envelope.from)
            {
                self.cast_vote(ctx, &peer, round + 1, relayed)?;
            }
        }

        if self.decision.is_none() && self.votes.len() >= self.quorum() {
            let order = self.majority();
            self.decision = Some(order);
            self.run.record(ctx.id(), order, ctx);
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert(
            "role".into(),
            if self.commander { "commander" } else { "lieutenant" }.into(),
        );
        data.insert(
            "decision".into(),
            self.decision
                .map(|order| order.as_str().into())
                .unwrap_or(serde_json::Value::Null),
        );
        data.insert("votes_gathered".into(), self.votes.len().into());
        data
    }

    fn status(&self) -> Option<&'static str> {
        // faulty generals report byzantine externally while running inside
        match self.behavior {
            Behavior::Honest => None,
            Behavior::Traitor | Behavior::Silent => Some("byzantine"),
        }
    }
}

pub struct Byzantine {
    roster: Roster,
    run: Arc<RunState>,
}

impl Byzantine {
    pub fn consensus_reached(&self) -> bool {
        self.run.reached()
    }
}

impl Project for Byzantine {
    fn name(&self) -> &'static str {
        "byzantine"
    }

    fn roster(&self) -> &Roster {
        &self.roster
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn build(
    scenario: Option<&str>,
    config: &ProjectConfig,
    harness: &Harness,
) -> anyhow::Result<Box<dyn Project>> {
    let count = match scenario {
        Some("3f_fail") => 3,
        _ => config.node_count.unwrap_or(DEFAULT_NODES),
    }
    .max(2);
    let faulty = config.traitor_count.unwrap_or(DEFAULT_TRAITORS).min(count - 1);
    harness.net.set_packet_loss(0.0);
    harness.net.set_latency(10, 50);

    let ids: Vec<NodeId> = (0..count).map(|index| format!("node-{index}")).collect();
    let behaviors = assign_behaviors(scenario, &ids, faulty);
    let honest: Vec<NodeId> = ids
        .iter()
        .zip(&behaviors)
        .filter(|(_, behavior)| **behavior == Behavior::Honest)
        .map(|(id, _)| id.clone())
        .collect();
    let run = Arc::new(RunState {
        initial: Order::Attack,
        honest,
        decisions: Mutex::new(FxHashMap::default()),
        consensus: AtomicBool::new(false),
    });

    for (index, id) in ids.iter().enumerate() {
        let lieutenants: Vec<NodeId> = ids
            .iter()
            .filter(|peer| peer.as_str() != "node-0" && *peer != id)
            .cloned()
            .collect();
        harness.spawn_node(
            id.clone(),
            Box::new(General {
                behavior: behaviors[index],
                commander: index == 0,
                lieutenants,
                total: count,
                faulty,
                run: run.clone(),
                broadcast_done: false,
                votes: FxHashMap::default(),
                decision: None,
            }),
        );
    }
    Ok(Box::new(Byzantine {
        roster: harness.roster.clone(),
        run,
    }))
}

/// Commander is node 0 and honest unless the scenario says otherwise; the
/// faulty subset is drawn from the lieutenants at random. At n = 3f the
/// faulty node withholds instead of flipping, which starves the quorum.
fn assign_behaviors(scenario: Option<&str>, ids: &[NodeId], faulty: usize) -> Vec<Behavior> {
    let mut behaviors = vec![Behavior::Honest; ids.len()];
    match scenario {
        Some("commander_traitor") => behaviors[0] = Behavior::Traitor,
        Some("3f_fail") => {
            if behaviors.len() > 1 {
                behaviors[1] = Behavior::Silent;
            }
        }
        _ => {
            let mut lieutenants: Vec<usize> = (1..ids.len()).collect();
            lieutenants.shuffle(&mut rand::thread_rng());
            for index in lieutenants.into_iter().take(faulty) {
                behaviors[index] = Behavior::Traitor;
            }
        }
    }
    behaviors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::testing::{harness, tick_all};

    fn run_until_settled(harness: &Harness, ticks: usize) {
        harness.net.set_latency(0, 0); // inline delivery for determinism
        for _ in 0..ticks {
            tick_all(harness);
        }
    }

    fn project_as_byzantine(project: &dyn Project) -> &Byzantine {
        project.as_any().downcast_ref::<Byzantine>().unwrap()
    }

    #[test]
    fn honest_commander_reaches_consensus_once() {
        let harness = harness();
        let events = std::sync::Arc::new(parking_lot::Mutex::new(0));
        let count = events.clone();
        harness.bus.add_listener(move |event| {
            if event.kind == EventKind::ConsensusReached {
                *count.lock() += 1;
            }
        });
        let project = build(None, &ProjectConfig::default(), &harness).unwrap();
        run_until_settled(&harness, 60);

        let byzantine = project_as_byzantine(project.as_ref());
        assert!(byzantine.consensus_reached());
        assert_eq!(*events.lock(), 1);

        let state = project.state();
        for (id, node) in &state {
            if node["status"] == "byzantine" {
                continue;
            }
            assert_eq!(node["decision"], "attack", "honest {id} disagrees");
        }
    }

    #[test]
    fn three_generals_with_one_fault_stall() {
        let harness = harness();
        let project = build(Some("3f_fail"), &ProjectConfig::default(), &harness).unwrap();
        run_until_settled(&harness, 120);

        let byzantine = project_as_byzantine(project.as_ref());
        assert!(!byzantine.consensus_reached());
    }

    #[test]
    fn traitor_commander_reports_byzantine_but_stays_running() {
        let harness = harness();
        let project = build(
            Some("commander_traitor"),
            &ProjectConfig::default(),
            &harness,
        )
        .unwrap();
        let state = project.state();
        assert_eq!(state["node-0"]["status"], "byzantine");
        let commander = harness.roster.get("node-0").unwrap();
        assert_eq!(
            commander.lock().shell().lifecycle(),
            crate::node::Lifecycle::Running
        );
    }

    #[test]
    fn divergent_commander_orders_emit_conflicts() {
        // a traitor commander flips coins; across repeats a divergence shows
        // up with overwhelming probability
        let mut conflicts = 0;
        for _ in 0..12 {
            let harness = harness();
            let seen = std::sync::Arc::new(parking_lot::Mutex::new(0));
            let count = seen.clone();
            harness.bus.add_listener(move |event| {
                if event.kind == EventKind::ConflictDetected {
                    *count.lock() += 1;
                }
            });
            let _project = build(
                Some("commander_traitor"),
                &ProjectConfig {
                    node_count: Some(5),
                    ..ProjectConfig::default()
                },
                &harness,
            )
            .unwrap();
            run_until_settled(&harness, 4);
            conflicts += *seen.lock();
        }
        assert!(conflicts > 0);
    }
}
