use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::VectorSnapshot;
use crate::engine::VirtualClock;
use crate::event::{Event, EventBus, EventKind};
use crate::message::{Envelope, NodeId, Payload};
use crate::net::Transport;

/// Reference inbox bound. Overflow fails the enqueue silently; callers must
/// not depend on capacity.
pub const INBOX_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Running,
    Crashed,
    Partitioned,
    Byzantine,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Running => "running",
            Lifecycle::Crashed => "crashed",
            Lifecycle::Partitioned => "partitioned",
            Lifecycle::Byzantine => "byzantine",
        }
    }
}

/// Identity plus the primitives every algorithm node shares: lifecycle state,
/// bounded inbox, transport and bus handles, cancellation. Any state other
/// than running silently discards inbound envelopes and produces no outbound
/// ones.
pub struct Shell {
    pub id: NodeId,
    lifecycle: RwLock<Lifecycle>,
    inbox: ArrayQueue<Envelope>,
    net: Transport,
    bus: EventBus,
    clock: VirtualClock,
    cancel: CancellationToken,
}

impl Shell {
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Transport delivery handler. Enqueues only while running; a full inbox
    /// drops the envelope silently.
    pub fn deliver(&self, envelope: Envelope) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.lifecycle() != Lifecycle::Running {
            debug!(node = %self.id, state = self.lifecycle().as_str(), "inbound discarded");
            return;
        }
        let mut data = envelope.summary();
        if let Some(received_at) = envelope.received_at {
            data.insert("received_at".into(), received_at.into());
        }
        if self.inbox.push(envelope).is_err() {
            debug!(node = %self.id, "inbox full, envelope dropped");
            return;
        }
        self.bus
            .publish(Event::new(EventKind::MessageReceived, self.now()).with_data(data));
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.inbox.pop()
    }

    /// Constructs an envelope and hands it to the transport. No-op unless
    /// running.
    pub fn send(
        &self,
        to: &str,
        kind: &str,
        payload: Payload,
        lamport: Option<u64>,
        vector: Option<VectorSnapshot>,
    ) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() || self.lifecycle() != Lifecycle::Running {
            return Ok(());
        }
        let mut envelope =
            Envelope::new(self.net.next_id(), self.id.clone(), to, kind, payload, self.now());
        envelope.lamport = lamport;
        envelope.vector = vector;
        self.bus
            .publish(Event::new(EventKind::MessageSent, self.now()).with_data(envelope.summary()));
        self.net.send(envelope);
        Ok(())
    }

    /// Idempotent. Crashing discards whatever was queued but not processed.
    pub fn crash(&self) -> bool {
        let previous = {
            let mut lifecycle = self.lifecycle.write();
            match *lifecycle {
                Lifecycle::Crashed => return false,
                previous => {
                    *lifecycle = Lifecycle::Crashed;
                    previous
                }
            }
        };
        while self.inbox.pop().is_some() {}
        self.state_changed(previous, Lifecycle::Crashed);
        true
    }

    /// Idempotent; only a crashed node recovers. Identity and subscriptions
    /// survive the round trip.
    pub fn recover(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle.write();
            if *lifecycle != Lifecycle::Crashed {
                return false;
            }
            *lifecycle = Lifecycle::Running;
        }
        self.state_changed(Lifecycle::Crashed, Lifecycle::Running);
        true
    }

    pub fn set_partitioned(&self, partitioned: bool) -> bool {
        let (previous, next) = {
            let mut lifecycle = self.lifecycle.write();
            match (*lifecycle, partitioned) {
                (Lifecycle::Running, true) => {
                    *lifecycle = Lifecycle::Partitioned;
                    (Lifecycle::Running, Lifecycle::Partitioned)
                }
                (Lifecycle::Partitioned, false) => {
                    *lifecycle = Lifecycle::Running;
                    (Lifecycle::Partitioned, Lifecycle::Running)
                }
                _ => return false,
            }
        };
        self.state_changed(previous, next);
        true
    }

    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.write();
        *lifecycle = Lifecycle::Running;
    }

    pub fn stop(&self) {
        self.cancel.cancel()
    }

    fn state_changed(&self, previous: Lifecycle, next: Lifecycle) {
        self.bus.publish(
            Event::new(EventKind::NodeStateChanged, self.now())
                .with("node_id", self.id.clone())
                .with("previous", previous.as_str())
                .with("state", next.as_str()),
        );
    }
}

/// One scheduling quantum of plugin work. At most one inbox pop, then zero or
/// more sends.
pub struct TickCtx<'a> {
    shell: &'a Shell,
    popped: bool,
}

impl TickCtx<'_> {
    pub fn id(&self) -> &NodeId {
        &self.shell.id
    }

    pub fn now(&self) -> u64 {
        self.shell.now()
    }

    pub fn recv(&mut self) -> Option<Envelope> {
        if self.popped {
            return None;
        }
        self.popped = true;
        self.shell.try_recv()
    }

    pub fn send(&self, to: &str, kind: &str, payload: Payload) -> anyhow::Result<()> {
        self.shell.send(to, kind, payload, None, None)
    }

    pub fn send_stamped(
        &self,
        to: &str,
        kind: &str,
        payload: Payload,
        lamport: u64,
        vector: VectorSnapshot,
    ) -> anyhow::Result<()> {
        self.shell.send(to, kind, payload, Some(lamport), Some(vector))
    }

    pub fn emit(&self, kind: EventKind, data: serde_json::Map<String, serde_json::Value>) {
        self.shell
            .bus
            .publish(Event::new(kind, self.now()).with_data(data))
    }
}

/// Algorithm hook plugged into the lifecycle shell. The shell enforces that
/// crashed nodes neither tick nor send; implementations only describe the
/// running behavior.
pub trait Process: Send {
    fn on_tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<()>;

    /// Human-readable state fields for observers.
    fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// External status label override (a traitor reports `byzantine` while
    /// remaining running internally).
    fn status(&self) -> Option<&'static str> {
        None
    }
}

pub struct Node {
    shell: Arc<Shell>,
    process: Box<dyn Process>,
}

impl Node {
    /// Builds the shell, registers its delivery handler with the transport,
    /// and wraps it for the roster.
    pub fn create(
        id: impl Into<NodeId>,
        process: Box<dyn Process>,
        net: &Transport,
        bus: &EventBus,
        clock: &VirtualClock,
        parent: &CancellationToken,
    ) -> Arc<Mutex<Node>> {
        let id = id.into();
        let shell = Arc::new(Shell {
            id: id.clone(),
            lifecycle: RwLock::new(Lifecycle::Running),
            inbox: ArrayQueue::new(INBOX_CAPACITY),
            net: net.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
            cancel: parent.child_token(),
        });
        let delivery = shell.clone();
        net.register(id, move |envelope| delivery.deliver(envelope));
        Arc::new(Mutex::new(Node {
            shell,
            process,
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.shell.id
    }

    pub fn shell(&self) -> &Arc<Shell> {
        &self.shell
    }

    /// One scheduling quantum. Crashed, partitioned, and stopped nodes treat
    /// this as a no-op.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        if self.shell.cancel.is_cancelled() || self.shell.lifecycle() != Lifecycle::Running {
            return Ok(());
        }
        let mut ctx = TickCtx {
            shell: &self.shell,
            popped: false,
        };
        self.process.on_tick(&mut ctx)
    }

    pub fn status(&self) -> &'static str {
        self.process
            .status()
            .unwrap_or_else(|| self.shell.lifecycle().as_str())
    }

    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut data = serde_json::Map::new();
        data.insert("status".into(), self.status().into());
        data.extend(self.process.snapshot());
        data
    }
}

/// Id-keyed registry of a session's nodes. All back-references between
/// components resolve through this lookup.
#[derive(Clone, Default)]
pub struct Roster {
    nodes: Arc<RwLock<Vec<Arc<Mutex<Node>>>>>,
    index: Arc<RwLock<FxHashMap<NodeId, Arc<Mutex<Node>>>>>,
}

impl Roster {
    pub fn insert(&self, node: Arc<Mutex<Node>>) {
        let id = node.lock().id().clone();
        self.nodes.write().push(node.clone());
        self.index.write().insert(id, node);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Node>>> {
        self.index.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .iter()
            .map(|node| node.lock().id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Registration-order handles; the caller iterates without holding the
    /// roster lock.
    pub fn handles(&self) -> Vec<Arc<Mutex<Node>>> {
        self.nodes.read().clone()
    }

    pub fn crash(&self, id: &str) -> anyhow::Result<bool> {
        let node = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown node {id}"))?;
        let shell = node.lock().shell().clone();
        Ok(shell.crash())
    }

    pub fn recover(&self, id: &str) -> anyhow::Result<bool> {
        let node = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("unknown node {id}"))?;
        let shell = node.lock().shell().clone();
        Ok(shell.recover())
    }

    pub fn snapshots(&self) -> std::collections::BTreeMap<NodeId, serde_json::Map<String, serde_json::Value>> {
        self.handles()
            .into_iter()
            .map(|node| {
                let node = node.lock();
                (node.id().clone(), node.snapshot())
            })
            .collect()
    }
}
