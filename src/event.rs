use std::fmt::Debug;
use std::sync::{Arc, Weak};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

impl<N: Into<M>, M> SendEvent<N> for UnboundedSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        UnboundedSender::send(self, event.into()).map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

#[derive(Debug)]
pub struct Void; // for testing

impl<M> SendEvent<M> for Void {
    fn send(&mut self, _: M) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything observable that happens inside a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageReceived,
    MessageDropped,
    NodeStateChanged,
    NodeCrashed,
    NodeRecovered,
    PartitionCreated,
    PartitionHealed,
    LeaderElected,
    VoteRequested,
    VoteCast,
    ConsensusReached,
    ConflictDetected,
    LogAppended,
    LogCommitted,
    TransactionStarted,
    TransactionPrepared,
    TransactionCommitted,
    TransactionAborted,
    ClockTick,
    ClockMerge,
    ClockUpdate,
    SimulationPaused,
    SimulationResumed,
    FailureScheduled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageSent => "message_sent",
            EventKind::MessageReceived => "message_received",
            EventKind::MessageDropped => "message_dropped",
            EventKind::NodeStateChanged => "node_state_changed",
            EventKind::NodeCrashed => "node_crashed",
            EventKind::NodeRecovered => "node_recovered",
            EventKind::PartitionCreated => "partition_created",
            EventKind::PartitionHealed => "partition_healed",
            EventKind::LeaderElected => "leader_elected",
            EventKind::VoteRequested => "vote_requested",
            EventKind::VoteCast => "vote_cast",
            EventKind::ConsensusReached => "consensus_reached",
            EventKind::ConflictDetected => "conflict_detected",
            EventKind::LogAppended => "log_appended",
            EventKind::LogCommitted => "log_committed",
            EventKind::TransactionStarted => "transaction_started",
            EventKind::TransactionPrepared => "transaction_prepared",
            EventKind::TransactionCommitted => "transaction_committed",
            EventKind::TransactionAborted => "transaction_aborted",
            EventKind::ClockTick => "clock_tick",
            EventKind::ClockMerge => "clock_merge",
            EventKind::ClockUpdate => "clock_update",
            EventKind::SimulationPaused => "simulation_paused",
            EventKind::SimulationResumed => "simulation_resumed",
            EventKind::FailureScheduled => "failure_scheduled",
        }
    }
}

/// Typed event: kind, virtual timestamp, free-form data map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub time: u64,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind, time: u64) -> Self {
        Self {
            kind,
            time,
            data: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.data.extend(data);
        self
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct BusState {
    listeners: RwLock<Vec<Listener>>,
    taps: RwLock<Vec<Weak<ArrayQueue<Event>>>>,
    recording: Mutex<Option<Vec<Event>>>,
}

/// Fan-out bus for simulation events. Two subscription styles: function
/// listeners dispatched off the publisher's path in publication order, and
/// pull-style bounded buffers that drop on overflow. Neither style can block
/// a publisher; the bus is not a durable log.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<BusState>,
    // ordered listener dispatch detached from publishers; None outside a
    // runtime, where listeners run inline
    pipe: Option<UnboundedSender<Event>>,
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("detached", &self.pipe.is_some())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let state = Arc::new(BusState::default());
        let pipe = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Event>();
            let state = Arc::downgrade(&state);
            handle.spawn(async move {
                while let Some(event) = receiver.recv().await {
                    let Some(state) = state.upgrade() else {
                        break;
                    };
                    dispatch(&state, &event);
                }
            });
            sender
        });
        Self { state, pipe }
    }

    pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.state.listeners.write().push(Arc::new(listener));
    }

    /// Pull-style subscription with a bounded buffer. Events published while
    /// the buffer is full are dropped for this subscriber only.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        let queue = Arc::new(ArrayQueue::new(capacity));
        self.state.taps.write().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn publish(&self, event: Event) {
        {
            let mut recording = self.state.recording.lock();
            if let Some(buffer) = recording.as_mut() {
                buffer.push(event.clone());
            }
        }
        {
            let mut taps = self.state.taps.write();
            taps.retain(|tap| match tap.upgrade() {
                Some(queue) => {
                    // full buffer: drop for this subscriber, keep the run alive
                    let _ = queue.push(event.clone());
                    true
                }
                None => false,
            });
        }
        match &self.pipe {
            Some(pipe) => {
                // dispatcher gone means the bus is shutting down; losing the
                // listener invocation is fine
                let _ = SendEvent::send(&mut pipe.clone(), event);
            }
            None => dispatch(&self.state, &event),
        }
    }

    pub fn start_recording(&self) {
        let mut recording = self.state.recording.lock();
        if recording.is_none() {
            *recording = Some(Vec::new());
        }
    }

    /// Returns the captured buffer and clears it.
    pub fn stop_recording(&self) -> Vec<Event> {
        self.state.recording.lock().take().unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(state: &BusState, event: &Event) {
    // snapshot under the read lock, invoke with no lock held
    let listeners = state.listeners.read().clone();
    for listener in listeners {
        listener(event)
    }
}

pub struct Subscription {
    queue: Arc<ArrayQueue<Event>>,
}

impl Subscription {
    pub fn try_next(&self) -> Option<Event> {
        self.queue.pop()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }
}

/// Deterministic iterator over a recorded buffer.
#[derive(Debug)]
pub struct Replay {
    events: Vec<Event>,
    position: usize,
}

impl Replay {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            position: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.position < self.events.len()
    }

    pub fn next(&mut self) -> Option<&Event> {
        let event = self.events.get(self.position)?;
        self.position += 1;
        Some(event)
    }

    pub fn reset(&mut self) {
        self.position = 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_observe_publication_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.add_listener(move |event| log.lock().push(event.time));
        for time in 0..5 {
            bus.publish(Event::new(EventKind::ClockTick, time));
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_pull_buffer_drops_newest() {
        let bus = EventBus::new();
        let tap = bus.subscribe(2);
        for time in 0..5 {
            bus.publish(Event::new(EventKind::ClockTick, time));
        }
        let drained: Vec<_> = tap.drain().into_iter().map(|event| event.time).collect();
        assert_eq!(drained, vec![0, 1]);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let tap = bus.subscribe(8);
        drop(tap);
        bus.publish(Event::new(EventKind::ClockTick, 0));
        assert!(bus.state.taps.read().is_empty());
    }

    #[test]
    fn recording_replays_identically() {
        let bus = EventBus::new();
        bus.start_recording();
        bus.publish(Event::new(EventKind::MessageSent, 1).with("from", "a"));
        bus.publish(Event::new(EventKind::MessageReceived, 2).with("to", "b"));
        let captured = bus.stop_recording();
        assert_eq!(captured.len(), 2);

        let mut replay = Replay::new(captured.clone());
        let mut first_pass = Vec::new();
        while let Some(event) = replay.next() {
            first_pass.push((event.kind, event.time));
        }
        replay.reset();
        let mut second_pass = Vec::new();
        while replay.has_next() {
            let event = replay.next().unwrap();
            second_pass.push((event.kind, event.time));
        }
        assert_eq!(first_pass, second_pass);
        // cleared after stop
        assert!(bus.stop_recording().is_empty());
    }

    #[test]
    fn stop_without_start_is_empty() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventKind::ClockTick, 0));
        assert!(bus.stop_recording().is_empty());
    }

    #[test]
    fn void_sink_accepts_everything() {
        let mut void = Void;
        assert!(SendEvent::send(&mut void, Event::new(EventKind::ClockTick, 0)).is_ok());
    }

    #[test]
    fn listener_count_is_per_event() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Event::new(EventKind::NodeCrashed, 3));
        bus.publish(Event::new(EventKind::NodeRecovered, 4));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
