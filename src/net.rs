// In-memory network shared by every node of a session. By definition this is
// a one-way unreliable link: no completion notification reaches the sender,
// loss and partitions short-circuit before delivery, and concurrent delayed
// deliveries may reorder arbitrarily. There is no FIFO guarantee between any
// pair of nodes; protocols that need ordering build it on top
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::VirtualClock;
use crate::message::{Envelope, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NetworkPartition,
    PacketLoss,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NetworkPartition => "network_partition",
            DropReason::PacketLoss => "packet_loss",
        }
    }
}

type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;
type DropHook = Arc<dyn Fn(&Envelope, DropReason) + Send + Sync>;

struct Inner {
    handlers: RwLock<FxHashMap<NodeId, Handler>>,
    // directed pairs; a bidirectional partition stores both orderings
    partitions: RwLock<FxHashSet<(NodeId, NodeId)>>,
    latency: RwLock<(u64, u64)>,
    loss: RwLock<f64>,
    drop_hook: RwLock<Option<DropHook>>,
    // deterministic loss draws for tests; None means thread rng
    loss_rng: Mutex<Option<StdRng>>,
    seq: AtomicU64,
    clock: VirtualClock,
    cancel: CancellationToken,
}

/// Reconfigurable in-memory transport: per-node delivery handlers, a directed
/// partition matrix, stochastic loss, and a uniform per-delivery latency
/// window. `send` never blocks the caller; delivery runs on a detached task.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(clock: VirtualClock, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(FxHashMap::default()),
                partitions: RwLock::new(FxHashSet::default()),
                latency: RwLock::new((0, 0)),
                loss: RwLock::new(0.0),
                drop_hook: RwLock::new(None),
                loss_rng: Mutex::new(None),
                seq: AtomicU64::new(0),
                clock,
                cancel,
            }),
        }
    }

    /// Session-unique envelope id.
    pub fn next_id(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, id: impl Into<NodeId>, handler: impl Fn(Envelope) + Send + Sync + 'static) {
        self.inner
            .handlers
            .write()
            .insert(id.into(), Arc::new(handler));
    }

    pub fn unregister(&self, id: &str) {
        self.inner.handlers.write().remove(id);
    }

    pub fn on_drop(&self, hook: impl Fn(&Envelope, DropReason) + Send + Sync + 'static) {
        *self.inner.drop_hook.write() = Some(Arc::new(hook));
    }

    /// Latency window in real milliseconds, sampled uniformly per delivery.
    pub fn set_latency(&self, min: u64, max: u64) {
        *self.inner.latency.write() = if min <= max { (min, max) } else { (max, min) };
    }

    pub fn latency(&self) -> (u64, u64) {
        *self.inner.latency.read()
    }

    /// Clamped to [0, 1].
    pub fn set_packet_loss(&self, probability: f64) {
        *self.inner.loss.write() = probability.clamp(0.0, 1.0);
    }

    pub fn packet_loss(&self) -> f64 {
        *self.inner.loss.read()
    }

    pub fn seed_loss(&self, seed: u64) {
        *self.inner.loss_rng.lock() = Some(StdRng::seed_from_u64(seed));
    }

    pub fn set_partition(&self, from: &str, to: &str, enabled: bool) {
        let pair = (from.to_string(), to.to_string());
        let mut partitions = self.inner.partitions.write();
        if enabled {
            partitions.insert(pair);
        } else {
            partitions.remove(&pair);
        }
    }

    pub fn create_bidirectional_partition(&self, a: &str, b: &str) {
        self.set_partition(a, b, true);
        self.set_partition(b, a, true);
    }

    pub fn heal_partition(&self, from: &str, to: &str) {
        self.set_partition(from, to, false);
    }

    pub fn clear_all_partitions(&self) {
        self.inner.partitions.write().clear();
    }

    pub fn is_partitioned(&self, from: &str, to: &str) -> bool {
        self.inner
            .partitions
            .read()
            .contains(&(from.to_string(), to.to_string()))
    }

    /// Best-effort send. Partition and loss short-circuit through the drop
    /// hook; an unregistered destination is silently ignored; otherwise the
    /// envelope is delivered after a sampled delay on a detached task.
    pub fn send(&self, envelope: Envelope) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if self.is_partitioned(&envelope.from, &envelope.to) {
            self.observe_drop(&envelope, DropReason::NetworkPartition);
            return;
        }
        let loss = *self.inner.loss.read();
        if loss > 0.0 && self.draw() < loss {
            self.observe_drop(&envelope, DropReason::PacketLoss);
            return;
        }
        if !self.inner.handlers.read().contains_key(&envelope.to) {
            debug!(to = %envelope.to, "no delivery handler registered");
            return;
        }
        let (min, max) = *self.inner.latency.read();
        let delay = if max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(min..=max)
        };
        let inner = self.inner.clone();
        if delay == 0 {
            deliver(&inner, envelope);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => deliver(&inner, envelope),
                    }
                });
            }
            // no runtime to defer on; degrade to immediate delivery
            Err(_) => deliver(&self.inner, envelope),
        }
    }

    fn draw(&self) -> f64 {
        let mut rng = self.inner.loss_rng.lock();
        match rng.as_mut() {
            Some(rng) => rng.gen(),
            None => rand::thread_rng().gen(),
        }
    }

    fn observe_drop(&self, envelope: &Envelope, reason: DropReason) {
        debug!(
            from = %envelope.from,
            to = %envelope.to,
            reason = reason.as_str(),
            "message dropped"
        );
        let hook = self.inner.drop_hook.read().clone();
        if let Some(hook) = hook {
            hook(envelope, reason)
        }
    }
}

fn deliver(inner: &Arc<Inner>, mut envelope: Envelope) {
    if inner.cancel.is_cancelled() {
        return;
    }
    // partitions applied mid-flight still take effect at delivery time
    if inner
        .partitions
        .read()
        .contains(&(envelope.from.clone(), envelope.to.clone()))
    {
        return;
    }
    let handler = inner.handlers.read().get(&envelope.to).cloned();
    if let Some(handler) = handler {
        envelope.received_at = Some(inner.clock.now());
        handler(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use std::sync::atomic::AtomicUsize;

    fn envelope(net: &Transport, from: &str, to: &str) -> Envelope {
        Envelope::new(net.next_id(), from, to, "ping", Payload::default(), 0)
    }

    fn transport() -> Transport {
        Transport::new(VirtualClock::default(), CancellationToken::new())
    }

    #[test]
    fn partition_blocks_delivery_regardless_of_loss() {
        let net = transport();
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = delivered.clone();
        net.register("b", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        let drops = Arc::new(Mutex::new(Vec::new()));
        let log = drops.clone();
        net.on_drop(move |_, reason| log.lock().push(reason));

        net.set_partition("a", "b", true);
        net.set_packet_loss(0.0);
        for _ in 0..20 {
            net.send(envelope(&net, "a", "b"));
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert!(drops.lock().iter().all(|r| *r == DropReason::NetworkPartition));

        // reverse direction unaffected
        let reverse = Arc::new(AtomicUsize::new(0));
        let count = reverse.clone();
        net.register("a", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        net.send(envelope(&net, "b", "a"));
        assert_eq!(reverse.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn total_loss_drops_everything() {
        let net = transport();
        net.register("b", |_| panic!("delivered through loss"));
        let drops = Arc::new(AtomicUsize::new(0));
        let count = drops.clone();
        net.on_drop(move |_, reason| {
            assert_eq!(reason, DropReason::PacketLoss);
            count.fetch_add(1, Ordering::SeqCst);
        });
        net.set_packet_loss(1.0);
        for _ in 0..10 {
            net.send(envelope(&net, "a", "b"));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn loss_probability_is_clamped() {
        let net = transport();
        net.set_packet_loss(37.5);
        assert_eq!(net.packet_loss(), 1.0);
        net.set_packet_loss(-2.0);
        assert_eq!(net.packet_loss(), 0.0);
    }

    #[test]
    fn delivery_fills_receive_timestamp() {
        let clock = VirtualClock::default();
        clock.advance(250);
        let net = Transport::new(clock, CancellationToken::new());
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        net.register("b", move |env| {
            *slot.lock() = Some(env);
        });
        net.send(envelope(&net, "a", "b"));
        let env = seen.lock().take().unwrap();
        assert_eq!(env.received_at, Some(250));
        assert!(env.received_at.unwrap() >= env.sent_at);
    }

    #[test]
    fn closed_transport_is_a_no_op() {
        let cancel = CancellationToken::new();
        let net = Transport::new(VirtualClock::default(), cancel.clone());
        net.register("b", |_| panic!("delivered after close"));
        cancel.cancel();
        net.send(envelope(&net, "a", "b"));
    }

    #[test]
    fn unregistered_destination_is_best_effort() {
        let net = transport();
        // neither panics nor invokes the drop hook
        net.on_drop(|_, _| panic!("drop hook for missing handler"));
        net.send(envelope(&net, "a", "ghost"));
    }

    #[test]
    fn heal_restores_symmetric_delivery() {
        let net = transport();
        let delivered = Arc::new(AtomicUsize::new(0));
        for id in ["a", "b"] {
            let count = delivered.clone();
            net.register(id, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        net.create_bidirectional_partition("a", "b");
        net.send(envelope(&net, "a", "b"));
        net.send(envelope(&net, "b", "a"));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        net.heal_partition("a", "b");
        net.heal_partition("b", "a");
        net.send(envelope(&net, "a", "b"));
        net.send(envelope(&net, "b", "a"));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn envelope_ids_are_unique() {
        let net = transport();
        let first = net.next_id();
        let second = net.next_id();
        assert_ne!(first, second);
    }
}
