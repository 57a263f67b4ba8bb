// Two Generals over an unreliable link. The commander proposes its decision
// until the round cap; the responder acks; the commander acks the ack. Each
// completed exchange step raises both certainties by a fixed step toward a
// cap strictly below 100: no number of acknowledgements closes the gap
use std::any::Any;

use serde_json::json;

use crate::node::{Process, Roster, TickCtx};

use super::{Harness, Project, ProjectConfig};

pub const COMMANDER: &str = "commander";
pub const RESPONDER: &str = "responder";

pub const DEFAULT_LOSS: f64 = 0.3;
pub const HIGH_LOSS: f64 = 0.5;
pub const DEFAULT_MAX_ROUNDS: u32 = 10;

const CERTAINTY_STEP: u32 = 20;
const CERTAINTY_CAP: u32 = 80;

const PROPOSAL: &str = "proposal";
const ACK: &str = "ack";
const ACK_ACK: &str = "ack_ack";

struct Commander {
    decision: &'static str,
    pending_ack: bool,
    rounds: u32,
    max_rounds: u32,
    certainty: u32,
    messages_sent: u64,
    messages_acked: u64,
}

impl Commander {
    fn new(max_rounds: u32) -> Self {
        Self {
            decision: "attack",
            pending_ack: true,
            rounds: 0,
            max_rounds,
            certainty: 0,
            messages_sent: 0,
            messages_acked: 0,
        }
    }
}

impl Process for Commander {
    fn on_tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()> {
        if let Some(envelope) = ctx.recv() {
            if envelope.kind == ACK {
                self.messages_acked += 1;
                self.certainty = (self.certainty + CERTAINTY_STEP).min(CERTAINTY_CAP);
                ctx.send(RESPONDER, ACK_ACK, json!({ "decision": self.decision }).into())?;
                self.messages_sent += 1;
            }
        }
        if self.pending_ack && self.rounds < self.max_rounds {
            ctx.send(RESPONDER, PROPOSAL, json!({ "decision": self.decision }).into())?;
            self.rounds += 1;
            self.messages_sent += 1;
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("role".into(), "commander".into());
        data.insert("decision".into(), self.decision.into());
        data.insert("certainty".into(), self.certainty.into());
        data.insert("pending_ack".into(), self.pending_ack.into());
        data.insert("rounds".into(), self.rounds.into());
        data.insert("messages_sent".into(), self.messages_sent.into());
        data.insert("messages_acked".into(), self.messages_acked.into());
        data
    }
}

struct Responder {
    decision: Option<String>,
    certainty: u32,
    acks_sent: u64,
}

impl Responder {
    fn new() -> Self {
        Self {
            decision: None,
            certainty: 0,
            acks_sent: 0,
        }
    }
}

impl Process for Responder {
    fn on_tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()> {
        let Some(envelope) = ctx.recv() else {
            return Ok(());
        };
        match envelope.kind.as_str() {
            PROPOSAL => {
                let decision = envelope
                    .payload
                    .get("decision")
                    .and_then(|value| value.as_str())
                    .unwrap_or("attack")
                    .to_string();
                ctx.send(COMMANDER, ACK, json!({ "decision": decision }).into())?;
                self.decision = Some(decision);
                self.certainty = (self.certainty + CERTAINTY_STEP).min(CERTAINTY_CAP);
                self.acks_sent += 1;
            }
            ACK_ACK => {
                self.certainty = (self.certainty + CERTAINTY_STEP).min(CERTAINTY_CAP);
            }
            _ => {}
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("role".into(), "responder".into());
        data.insert(
            "decision".into(),
            self.decision.clone().map(Into::into).unwrap_or(serde_json::Value::Null),
        );
        data.insert("certainty".into(), self.certainty.into());
        data.insert("acks_sent".into(), self.acks_sent.into());
        data
    }
}

pub struct TwoGenerals {
    roster: Roster,
}

impl Project for TwoGenerals {
    fn name(&self) -> &'static str {
        "two-generals"
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
    let loss = config.drop_rate.unwrap_or(match scenario {
        Some("no_loss") => 0.0,
        Some("high_loss") => HIGH_LOSS,
        _ => DEFAULT_LOSS,
    });
    harness.net.set_packet_loss(loss);
    harness.net.set_latency(10, 40);

    let max_rounds = config.max_rounds.unwrap_or(DEFAULT_MAX_ROUNDS);
    harness.spawn_node(COMMANDER, Box::new(Commander::new(max_rounds)));
    harness.spawn_node(RESPONDER, Box::new(Responder::new()));
    Ok(Box::new(TwoGenerals {
        roster: harness.roster.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::testing::{harness, tick_all};

    fn number(state: &serde_json::Map<String, serde_json::Value>, key: &str) -> u64 {
        state[key].as_u64().unwrap()
    }

    #[test]
    fn lossless_run_converges_below_full_certainty() {
        let harness = harness();
        let project = build(Some("no_loss"), &ProjectConfig::default(), &harness).unwrap();
        harness.net.set_latency(0, 0); // deliver inline for determinism

        for _ in 0..40 {
            tick_all(&harness);
        }
        let state = project.state();
        let commander = &state[COMMANDER];
        let responder = &state[RESPONDER];
        assert_eq!(commander["decision"], "attack");
        assert_eq!(responder["decision"], "attack");
        assert!(number(commander, "certainty") < 100);
        assert!(number(responder, "certainty") < 100);
        assert_eq!(number(commander, "certainty"), 80);
    }

    #[test]
    fn commander_stops_proposing_at_round_cap() {
        let harness = harness();
        let project = build(None, &ProjectConfig::default(), &harness).unwrap();
        // total loss: every proposal vanishes, rounds still cap
        harness.net.set_packet_loss(1.0);
        harness.net.set_latency(0, 0);
        for _ in 0..30 {
            tick_all(&harness);
        }
        let state = project.state();
        assert_eq!(number(&state[COMMANDER], "rounds"), u64::from(DEFAULT_MAX_ROUNDS));
        assert_eq!(number(&state[COMMANDER], "messages_acked"), 0);
        assert!(
            number(&state[COMMANDER], "messages_sent")
                > number(&state[COMMANDER], "messages_acked")
        );
    }

    #[test]
    fn scenarios_pick_their_loss_rates() {
        for (scenario, expected) in [
            (Some("no_loss"), 0.0),
            (Some("high_loss"), HIGH_LOSS),
            (None, DEFAULT_LOSS),
        ] {
            let harness = harness();
            build(scenario, &ProjectConfig::default(), &harness).unwrap();
            assert_eq!(harness.net.packet_loss(), expected);
        }
    }
}
