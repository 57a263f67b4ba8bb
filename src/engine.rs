use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{Event, EventBus, EventKind};
use crate::node::Roster;

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;
/// Virtual milliseconds added per tick, and the realtime cadence at 1.0x.
pub const DEFAULT_TICK_RATE_MS: u64 = 100;

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Monotone virtual clock owned by the engine and read by everything else.
/// Independent of the wall clock; one tick advances it by the tick rate.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock(Arc<AtomicU64>);

impl VirtualClock {
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn advance(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Realtime,
    Step,
    Paused,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Realtime => "realtime",
            Mode::Step => "step",
            Mode::Paused => "paused",
        }
    }
}

struct Inner {
    clock: VirtualClock,
    roster: Roster,
    bus: EventBus,
    tick_rate: u64,
    // mode to return to after a pause
    base_mode: Mode,
    mode: RwLock<Mode>,
    speed: RwLock<f64>,
    started: AtomicBool,
    cancel: tokio_util::sync::CancellationToken,
}

/// Owns virtual time and the tick loop. Realtime mode fires every
/// `tick_rate / speed` wall milliseconds; step mode advances only on explicit
/// step calls; paused mode idles. Every firing advances virtual time by one
/// tick rate and calls `tick` once on every registered node, in no guaranteed
/// order between nodes.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        clock: VirtualClock,
        roster: Roster,
        bus: EventBus,
        cancel: tokio_util::sync::CancellationToken,
        tick_rate: u64,
        speed: f64,
        step_mode: bool,
    ) -> Self {
        let base_mode = if step_mode { Mode::Step } else { Mode::Realtime };
        Self {
            inner: Arc::new(Inner {
                clock,
                roster,
                bus,
                tick_rate: tick_rate.max(1),
                base_mode,
                mode: RwLock::new(base_mode),
                speed: RwLock::new(speed.clamp(MIN_SPEED, MAX_SPEED)),
                started: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// Brings every registered node into running state and begins the loop.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for node in self.inner.roster.handles() {
            node.lock().shell().start();
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(run(inner));
        }
    }

    /// Cancels the loop and stops every node. Idempotent; no further ticks
    /// happen after this returns.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        for node in self.inner.roster.handles() {
            node.lock().shell().stop();
        }
    }

    pub fn pause(&self) -> bool {
        {
            let mut mode = self.inner.mode.write();
            if *mode == Mode::Paused {
                return false;
            }
            *mode = Mode::Paused;
        }
        self.inner
            .bus
            .publish(Event::new(EventKind::SimulationPaused, self.now()));
        true
    }

    pub fn resume(&self) -> bool {
        {
            let mut mode = self.inner.mode.write();
            if *mode != Mode::Paused {
                return false;
            }
            *mode = self.inner.base_mode;
        }
        self.inner
            .bus
            .publish(Event::new(EventKind::SimulationResumed, self.now()));
        true
    }

    /// Advances `count` ticks immediately, regardless of mode.
    pub fn step(&self, count: usize) {
        for _ in 0..count {
            self.inner.tick_once()
        }
    }

    /// Clamps to [0.1, 10.0] and returns the applied value.
    pub fn set_speed(&self, speed: f64) -> f64 {
        let clamped = speed.clamp(MIN_SPEED, MAX_SPEED);
        *self.inner.speed.write() = clamped;
        debug!(speed = clamped, "speed applied");
        clamped
    }

    pub fn speed(&self) -> f64 {
        *self.inner.speed.read()
    }

    pub fn mode(&self) -> Mode {
        *self.inner.mode.read()
    }

    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    pub fn tick_rate(&self) -> u64 {
        self.inner.tick_rate
    }

    pub fn running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }
}

impl Inner {
    /// One quantum: advance virtual time, then fan out without holding the
    /// roster lock across any node's tick.
    fn tick_once(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.clock.advance(self.tick_rate);
        for node in self.roster.handles() {
            let result = node.lock().tick();
            if let Err(err) = result {
                warn!(%err, "node tick failed");
            }
        }
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let (mode, wait) = {
            let mode = *inner.mode.read();
            let speed = *inner.speed.read();
            (
                mode,
                Duration::from_millis(inner.tick_rate).div_f64(speed),
            )
        };
        match mode {
            Mode::Realtime => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => inner.tick_once(),
                }
            }
            // step ticks arrive through Engine::step; just watch for mode
            // changes and cancellation
            Mode::Step | Mode::Paused => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
    debug!("engine loop exited");
}
