use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::VirtualClock;
use crate::event::{Event, EventBus, EventKind};
use crate::message::NodeId;
use crate::net::Transport;
use crate::node::Roster;

/// Scheduler wake cadence.
const SCHEDULER_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    Crash {
        node: NodeId,
    },
    Partition {
        from: NodeId,
        to: NodeId,
        #[serde(default)]
        bidirectional: bool,
    },
    Delay {
        min: u64,
        max: u64,
    },
}

/// A fault to execute `after` virtual milliseconds from scheduling time. A
/// nonzero `duration` pairs it with an automatic reversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    #[serde(flatten)]
    pub fault: Fault,
    #[serde(default)]
    pub after: u64,
    #[serde(default)]
    pub duration: u64,
}

enum Undo {
    Recover(NodeId),
    Heal {
        from: NodeId,
        to: NodeId,
        bidirectional: bool,
    },
    Latency(u64, u64),
}

struct Active {
    id: u64,
    undo: Undo,
}

enum Action {
    Apply(u64, Fault),
    Revert(u64),
}

struct Entry {
    due: u64,
    action: Action,
}

struct Inner {
    roster: Roster,
    net: Transport,
    bus: EventBus,
    clock: VirtualClock,
    cancel: tokio_util::sync::CancellationToken,
    active: Mutex<Vec<Active>>,
    queue: Mutex<Vec<Entry>>,
    seq: AtomicU64,
}

/// Coordinates crash, partition, and delay faults, immediately or on
/// virtual-time schedules. Partitions are purely a link property and never
/// touch node state; crashes keep node identity and drop queued work.
#[derive(Clone)]
pub struct FaultInjector {
    inner: Arc<Inner>,
}

impl FaultInjector {
    pub fn new(
        roster: Roster,
        net: Transport,
        bus: EventBus,
        clock: VirtualClock,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        let injector = Self {
            inner: Arc::new(Inner {
                roster,
                net,
                bus,
                clock,
                cancel,
                active: Mutex::new(Vec::new()),
                queue: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
            }),
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = injector.inner.clone();
            handle.spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(SCHEDULER_TICK) => inner.poll(),
                    }
                }
            });
        }
        injector
    }

    pub fn inject_crash(&self, node: &str) -> anyhow::Result<()> {
        if !self.inner.roster.crash(node)? {
            return Ok(()); // already crashed
        }
        info!(%node, "crash injected");
        self.inner.active.lock().push(Active {
            id: self.inner.next_id(),
            undo: Undo::Recover(node.to_string()),
        });
        self.inner.publish(
            Event::new(EventKind::NodeCrashed, self.inner.clock.now()).with("node_id", node),
        );
        Ok(())
    }

    pub fn recover_node(&self, node: &str) -> anyhow::Result<()> {
        if !self.inner.roster.recover(node)? {
            return Ok(()); // not crashed
        }
        info!(%node, "node recovered");
        self.inner
            .active
            .lock()
            .retain(|failure| !matches!(&failure.undo, Undo::Recover(id) if id == node));
        self.inner.publish(
            Event::new(EventKind::NodeRecovered, self.inner.clock.now()).with("node_id", node),
        );
        Ok(())
    }

    pub fn inject_partition(&self, from: &str, to: &str, bidirectional: bool) -> anyhow::Result<()> {
        self.require_node(from)?;
        self.require_node(to)?;
        if bidirectional {
            self.inner.net.create_bidirectional_partition(from, to);
        } else {
            self.inner.net.set_partition(from, to, true);
        }
        info!(%from, %to, bidirectional, "partition injected");
        self.inner.active.lock().push(Active {
            id: self.inner.next_id(),
            undo: Undo::Heal {
                from: from.to_string(),
                to: to.to_string(),
                bidirectional,
            },
        });
        self.inner.publish(
            Event::new(EventKind::PartitionCreated, self.inner.clock.now())
                .with("from", from)
                .with("to", to)
                .with("bidirectional", bidirectional),
        );
        Ok(())
    }

    pub fn heal_partition(&self, from: &str, to: &str, bidirectional: bool) -> anyhow::Result<()> {
        self.require_node(from)?;
        self.require_node(to)?;
        self.inner.heal(from, to, bidirectional);
        self.inner.active.lock().retain(|failure| {
            !matches!(&failure.undo, Undo::Heal { from: f, to: t, .. } if f == from && t == to)
        });
        Ok(())
    }

    /// Enqueues the failure's execute entry and, for a bounded failure, its
    /// paired recovery entry.
    pub fn schedule_failure(&self, failure: Failure) {
        let id = self.inner.next_id();
        let now = self.inner.clock.now();
        {
            let mut queue = self.inner.queue.lock();
            queue.push(Entry {
                due: now + failure.after,
                action: Action::Apply(id, failure.fault.clone()),
            });
            if failure.duration > 0 {
                queue.push(Entry {
                    due: now + failure.after + failure.duration,
                    action: Action::Revert(id),
                });
            }
        }
        self.inner.publish(
            Event::new(EventKind::FailureScheduled, now)
                .with(
                    "failure",
                    serde_json::to_value(&failure).unwrap_or(serde_json::Value::Null),
                )
                .with("at", now + failure.after),
        );
    }

    /// Reverses every still-active failure and drops anything still queued.
    pub fn clear_all(&self) {
        self.inner.queue.lock().clear();
        let drained: Vec<Active> = std::mem::take(&mut *self.inner.active.lock());
        for failure in drained {
            self.inner.apply_undo(failure.undo)
        }
        self.inner.net.clear_all_partitions();
    }

    /// Applies every entry whose execute time has passed. Driven by the
    /// background scheduler; public so tests can run the clock by hand.
    pub fn poll(&self) {
        self.inner.poll()
    }

    fn require_node(&self, id: &str) -> anyhow::Result<()> {
        if self.inner.roster.get(id).is_none() {
            anyhow::bail!("unknown node {id}")
        }
        Ok(())
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event)
    }

    fn poll(&self) {
        let now = self.clock.now();
        let mut due = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            queue.retain_mut(|entry| {
                if entry.due <= now {
                    due.push(Entry {
                        due: entry.due,
                        action: std::mem::replace(&mut entry.action, Action::Revert(0)),
                    });
                    false
                } else {
                    true
                }
            });
            due
        };
        due.sort_by_key(|entry| entry.due);
        for entry in due {
            match entry.action {
                Action::Apply(id, fault) => self.apply(id, fault),
                Action::Revert(id) => self.revert(id),
            }
        }
    }

    fn apply(&self, id: u64, fault: Fault) {
        debug!(?id, "scheduled fault fires");
        match fault {
            Fault::Crash { node } => {
                match self.roster.crash(&node) {
                    Ok(true) => {
                        self.active.lock().push(Active {
                            id,
                            undo: Undo::Recover(node.clone()),
                        });
                        self.publish(
                            Event::new(EventKind::NodeCrashed, self.clock.now())
                                .with("node_id", node),
                        );
                    }
                    Ok(false) => {}
                    Err(err) => debug!(%err, "scheduled crash skipped"),
                }
            }
            Fault::Partition {
                from,
                to,
                bidirectional,
            } => {
                if bidirectional {
                    self.net.create_bidirectional_partition(&from, &to);
                } else {
                    self.net.set_partition(&from, &to, true);
                }
                self.active.lock().push(Active {
                    id,
                    undo: Undo::Heal {
                        from: from.clone(),
                        to: to.clone(),
                        bidirectional,
                    },
                });
                self.publish(
                    Event::new(EventKind::PartitionCreated, self.clock.now())
                        .with("from", from)
                        .with("to", to)
                        .with("bidirectional", bidirectional),
                );
            }
            Fault::Delay { min, max } => {
                let (previous_min, previous_max) = self.net.latency();
                self.net.set_latency(min, max);
                self.active.lock().push(Active {
                    id,
                    undo: Undo::Latency(previous_min, previous_max),
                });
            }
        }
    }

    fn revert(&self, id: u64) {
        let undo = {
            let mut active = self.active.lock();
            let position = active.iter().position(|failure| failure.id == id);
            position.map(|index| active.remove(index).undo)
        };
        if let Some(undo) = undo {
            self.apply_undo(undo)
        }
    }

    fn apply_undo(&self, undo: Undo) {
        match undo {
            Undo::Recover(node) => {
                if matches!(self.roster.recover(&node), Ok(true)) {
                    self.publish(
                        Event::new(EventKind::NodeRecovered, self.clock.now())
                            .with("node_id", node),
                    );
                }
            }
            Undo::Heal {
                from,
                to,
                bidirectional,
            } => self.heal(&from, &to, bidirectional),
            Undo::Latency(min, max) => self.net.set_latency(min, max),
        }
    }

    fn heal(&self, from: &str, to: &str, bidirectional: bool) {
        self.net.heal_partition(from, to);
        if bidirectional {
            self.net.heal_partition(to, from);
        }
        info!(%from, %to, bidirectional, "partition healed");
        self.publish(
            Event::new(EventKind::PartitionHealed, self.clock.now())
                .with("from", from)
                .with("to", to)
                .with("bidirectional", bidirectional),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, Process, TickCtx};
    use tokio_util::sync::CancellationToken;

    struct Idle;

    impl Process for Idle {
        fn on_tick(&mut self, _: &mut TickCtx<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        injector: FaultInjector,
        roster: Roster,
        net: Transport,
        clock: VirtualClock,
        bus: EventBus,
    }

    fn fixture(nodes: &[&str]) -> Fixture {
        let cancel = CancellationToken::new();
        let clock = VirtualClock::default();
        let bus = EventBus::new();
        let net = Transport::new(clock.clone(), cancel.clone());
        let roster = Roster::default();
        for id in nodes {
            roster.insert(Node::create(*id, Box::new(Idle), &net, &bus, &clock, &cancel));
        }
        let injector = FaultInjector::new(
            roster.clone(),
            net.clone(),
            bus.clone(),
            clock.clone(),
            cancel,
        );
        Fixture {
            injector,
            roster,
            net,
            clock,
            bus,
        }
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let fx = fixture(&["a"]);
        assert!(fx.injector.inject_crash("ghost").is_err());
        assert!(fx.injector.inject_partition("a", "ghost", true).is_err());
    }

    #[test]
    fn crash_then_recover_round_trips() {
        let fx = fixture(&["a"]);
        fx.injector.inject_crash("a").unwrap();
        let node = fx.roster.get("a").unwrap();
        assert_eq!(
            node.lock().shell().lifecycle(),
            crate::node::Lifecycle::Crashed
        );
        fx.injector.recover_node("a").unwrap();
        assert_eq!(
            node.lock().shell().lifecycle(),
            crate::node::Lifecycle::Running
        );
        // idempotent on both edges
        fx.injector.recover_node("a").unwrap();
    }

    #[test]
    fn scheduled_crash_fires_and_reverts_on_duration() {
        let fx = fixture(&["a"]);
        fx.injector.schedule_failure(Failure {
            fault: Fault::Crash { node: "a".into() },
            after: 100,
            duration: 200,
        });

        fx.injector.poll();
        let node = fx.roster.get("a").unwrap();
        assert_eq!(
            node.lock().shell().lifecycle(),
            crate::node::Lifecycle::Running
        );

        fx.clock.advance(100);
        fx.injector.poll();
        assert_eq!(
            node.lock().shell().lifecycle(),
            crate::node::Lifecycle::Crashed
        );

        fx.clock.advance(200);
        fx.injector.poll();
        assert_eq!(
            node.lock().shell().lifecycle(),
            crate::node::Lifecycle::Running
        );
    }

    #[test]
    fn scheduled_delay_restores_previous_window() {
        let fx = fixture(&["a"]);
        fx.net.set_latency(5, 10);
        fx.injector.schedule_failure(Failure {
            fault: Fault::Delay { min: 200, max: 400 },
            after: 0,
            duration: 50,
        });
        fx.injector.poll();
        assert_eq!(fx.net.latency(), (200, 400));
        fx.clock.advance(50);
        fx.injector.poll();
        assert_eq!(fx.net.latency(), (5, 10));
    }

    #[test]
    fn clear_all_reverses_everything_in_one_pass() {
        let fx = fixture(&["a", "b"]);
        fx.injector.inject_crash("a").unwrap();
        fx.injector.inject_partition("a", "b", true).unwrap();
        fx.injector.clear_all();

        let node = fx.roster.get("a").unwrap();
        assert_eq!(
            node.lock().shell().lifecycle(),
            crate::node::Lifecycle::Running
        );
        assert!(!fx.net.is_partitioned("a", "b"));
        assert!(!fx.net.is_partitioned("b", "a"));
    }

    #[test]
    fn partition_events_carry_both_orderings() {
        let fx = fixture(&["a", "b"]);
        fx.bus.start_recording();
        fx.injector.inject_partition("a", "b", true).unwrap();
        fx.injector.heal_partition("a", "b", true).unwrap();
        let captured = fx.bus.stop_recording();
        let kinds: Vec<_> = captured.iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::PartitionCreated, EventKind::PartitionHealed]
        );
        assert!(!fx.net.is_partitioned("a", "b"));
    }
}
