use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{Engine, Mode, VirtualClock, DEFAULT_TICK_RATE_MS};
use crate::event::{Event, EventBus, EventKind};
use crate::fault::FaultInjector;
use crate::message::NodeId;
use crate::net::Transport;
use crate::node::Roster;
use crate::project::{self, Harness, Project, ProjectConfig};

/// Bounded timeline tail kept per session; oldest entries fall off first.
pub const TIMELINE_CAP: usize = 100;
/// Per-subscriber frame buffer; overflow drops frames for that subscriber.
pub const SUBSCRIBER_BUFFER: usize = 256;
/// Cadence of the unconditional state snapshots.
const SNAPSHOT_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Client commands of the session protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    StartSimulation {
        project: String,
        #[serde(default)]
        scenario: Option<String>,
        #[serde(default)]
        config: ProjectConfig,
    },
    PauseSimulation,
    ResumeSimulation,
    StopSimulation,
    StepForward,
    SetSpeed {
        speed: f64,
    },
    InjectCrash {
        node_id: NodeId,
    },
    RecoverNode {
        node_id: NodeId,
    },
    InjectPartition {
        from: NodeId,
        to: NodeId,
        #[serde(default)]
        bidirectional: bool,
    },
    HealPartition {
        from: NodeId,
        to: NodeId,
        #[serde(default)]
        bidirectional: bool,
    },
    GetState,
}

impl Command {
    /// Error code attached when handling this command fails.
    pub fn error_code(&self) -> &'static str {
        match self {
            Command::StartSimulation { .. } => "start_failed",
            Command::InjectCrash { .. }
            | Command::RecoverNode { .. }
            | Command::InjectPartition { .. }
            | Command::HealPartition { .. } => "invalid_target",
            _ => "command_failed",
        }
    }
}

/// Full observable state answered to `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub virtual_time: u64,
    pub mode: Mode,
    pub speed: f64,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub nodes: BTreeMap<NodeId, serde_json::Map<String, serde_json::Value>>,
    pub timeline: Vec<Event>,
}

/// One server-to-client frame.
#[derive(Debug, Clone)]
pub enum Frame {
    State(StateSnapshot),
    Timeline(Event),
    Mirror(&'static str, Event),
    Error {
        code: &'static str,
        message: String,
    },
}

impl Frame {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Frame::State(state) => {
                let mut value = serde_json::to_value(state).unwrap_or(json!({}));
                value["type"] = "simulation_state".into();
                value
            }
            Frame::Timeline(event) => json!({ "type": "timeline_event", "event": event }),
            Frame::Mirror(kind, event) => {
                json!({ "type": kind, "time": event.time, "data": event.data })
            }
            Frame::Error { code, message } => {
                json!({ "type": "error", "code": code, "message": message })
            }
        }
    }
}

/// Typed mirror for event kinds the client renders directly.
fn mirror(event: &Event) -> Option<Frame> {
    let kind = match event.kind {
        EventKind::MessageSent => "message_sent",
        EventKind::MessageReceived => "message_received",
        EventKind::MessageDropped => "message_dropped",
        EventKind::NodeStateChanged | EventKind::NodeCrashed | EventKind::NodeRecovered => {
            "node_state_update"
        }
        EventKind::LeaderElected => "leader_elected",
        EventKind::ConsensusReached => "consensus_reached",
        EventKind::TransactionStarted
        | EventKind::TransactionPrepared
        | EventKind::TransactionCommitted
        | EventKind::TransactionAborted => "transaction_state",
        EventKind::ClockUpdate => "clock_update",
        _ => return None,
    };
    Some(Frame::Mirror(kind, event.clone()))
}

struct Run {
    project_id: String,
    scenario: Option<String>,
    engine: Engine,
    injector: FaultInjector,
    project: Box<dyn Project>,
    cancel: CancellationToken,
}

/// Per-connection facade over one simulation: owns engine, transport, plugin,
/// injector, the bounded timeline, and the subscriber set. Starting a new
/// simulation tears the previous one down first.
pub struct Session {
    run: Option<Run>,
    timeline: Arc<RwLock<VecDeque<Event>>>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Frame>>>>,
    timeline_cap: usize,
}

impl Session {
    pub fn new() -> Self {
        Self {
            run: None,
            timeline: Arc::new(RwLock::new(VecDeque::new())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            timeline_cap: TIMELINE_CAP,
        }
    }

    /// New observers receive the current snapshot immediately, then the live
    /// stream. The trimmed timeline prefix is gone for good.
    pub fn subscribe(&self) -> mpsc::Receiver<Frame> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let _ = sender.try_send(Frame::State(self.snapshot()));
        self.subscribers.write().push(sender);
        receiver
    }

    pub fn broadcast(&self, frame: Frame) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|subscriber| match subscriber.try_send(frame.clone()) {
            Ok(()) => true,
            // liveness over completeness: full buffers lose this frame
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn handle(&mut self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::StartSimulation {
                project,
                scenario,
                config,
            } => self.start(&project, scenario, config),
            Command::PauseSimulation => {
                self.pause();
                Ok(())
            }
            Command::ResumeSimulation => {
                self.resume();
                Ok(())
            }
            Command::StopSimulation => {
                self.stop();
                self.broadcast_state();
                Ok(())
            }
            Command::StepForward => {
                self.step(1);
                Ok(())
            }
            Command::SetSpeed { speed } => {
                self.set_speed(speed);
                Ok(())
            }
            Command::InjectCrash { node_id } => self.crash_node(&node_id),
            Command::RecoverNode { node_id } => self.recover_node(&node_id),
            Command::InjectPartition {
                from,
                to,
                bidirectional,
            } => self.inject_partition(&from, &to, bidirectional),
            Command::HealPartition {
                from,
                to,
                bidirectional,
            } => self.heal_partition(&from, &to, bidirectional),
            Command::GetState => {
                self.broadcast_state();
                Ok(())
            }
        }
    }

    /// Builds a fresh engine, transport, injector, and plugin, wires the drop
    /// hook and the timeline fan-out, and starts ticking. A plugin that fails
    /// to construct leaves no half-started state behind.
    pub fn start(
        &mut self,
        project: &str,
        scenario: Option<String>,
        config: ProjectConfig,
    ) -> anyhow::Result<()> {
        self.stop();
        self.timeline.write().clear();

        let cancel = CancellationToken::new();
        let clock = VirtualClock::default();
        let bus = EventBus::new();
        let net = Transport::new(clock.clone(), cancel.clone());
        {
            let bus = bus.clone();
            let clock = clock.clone();
            net.on_drop(move |envelope, reason| {
                bus.publish(
                    Event::new(EventKind::MessageDropped, clock.now())
                        .with_data(envelope.summary())
                        .with("reason", reason.as_str()),
                )
            });
        }

        let roster = Roster::default();
        let harness = Harness {
            roster: roster.clone(),
            net: net.clone(),
            bus: bus.clone(),
            clock: clock.clone(),
            cancel: cancel.clone(),
        };
        let mut plugin = match project::build(project, scenario.as_deref(), &config, &harness) {
            Ok(plugin) => plugin,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };

        let engine = Engine::new(
            clock.clone(),
            roster.clone(),
            bus.clone(),
            cancel.clone(),
            DEFAULT_TICK_RATE_MS,
            config.speed.unwrap_or(1.0),
            config.step_mode.unwrap_or(false),
        );
        let injector = FaultInjector::new(
            roster.clone(),
            net,
            bus.clone(),
            clock,
            cancel.clone(),
        );

        // periodic snapshots on top of the on-demand ones, so observers that
        // miss individual events still converge
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let subscribers = self.subscribers.clone();
            let timeline = self.timeline.clone();
            let engine = engine.clone();
            let roster = roster.clone();
            let project_id = project.to_string();
            let scenario = scenario.clone();
            let cancel = cancel.clone();
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(SNAPSHOT_PERIOD);
                ticker.tick().await; // first tick completes immediately
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let snapshot = StateSnapshot {
                        virtual_time: engine.now(),
                        mode: engine.mode(),
                        speed: engine.speed(),
                        running: engine.running(),
                        project: Some(project_id.clone()),
                        scenario: scenario.clone(),
                        nodes: roster.snapshots(),
                        timeline: timeline.read().iter().cloned().collect(),
                    };
                    let mut subscribers = subscribers.write();
                    subscribers.retain(|subscriber| {
                        !matches!(
                            subscriber.try_send(Frame::State(snapshot.clone())),
                            Err(mpsc::error::TrySendError::Closed(_))
                        )
                    });
                }
            });
        }

        // every published event lands in the bounded timeline and fans out
        // to subscribers as a timeline_event plus its typed mirror
        {
            let timeline = self.timeline.clone();
            let subscribers = self.subscribers.clone();
            let cap = self.timeline_cap;
            let cancel = cancel.clone();
            bus.add_listener(move |event| {
                if cancel.is_cancelled() {
                    return;
                }
                {
                    let mut timeline = timeline.write();
                    if timeline.len() == cap {
                        timeline.pop_front();
                    }
                    timeline.push_back(event.clone());
                }
                let mut frames = vec![Frame::Timeline(event.clone())];
                frames.extend(mirror(event));
                let mut subscribers = subscribers.write();
                subscribers.retain(|subscriber| {
                    frames.iter().all(|frame| {
                        !matches!(
                            subscriber.try_send(frame.clone()),
                            Err(mpsc::error::TrySendError::Closed(_))
                        )
                    })
                });
            });
        }

        if let Err(err) = plugin.start() {
            cancel.cancel();
            return Err(err);
        }
        engine.start();
        info!(project, ?scenario, "simulation started");

        self.run = Some(Run {
            project_id: project.to_string(),
            scenario,
            engine,
            injector,
            project: plugin,
            cancel,
        });
        self.broadcast_state();
        Ok(())
    }

    /// Tears down the current run. Safe to call with none active.
    pub fn stop(&mut self) {
        if let Some(mut run) = self.run.take() {
            run.project.stop();
            run.engine.stop();
            run.cancel.cancel();
            info!(project = %run.project_id, "simulation stopped");
        }
    }

    pub fn pause(&mut self) {
        if let Some(run) = &self.run {
            run.engine.pause();
            self.broadcast_state();
        }
    }

    pub fn resume(&mut self) {
        if let Some(run) = &self.run {
            run.engine.resume();
            self.broadcast_state();
        }
    }

    pub fn step(&mut self, count: usize) {
        if let Some(run) = &self.run {
            run.engine.step(count);
            run.injector.poll();
            self.broadcast_state();
        }
    }

    pub fn set_speed(&mut self, speed: f64) {
        if let Some(run) = &self.run {
            let applied = run.engine.set_speed(speed);
            debug!(requested = speed, applied, "speed change");
            self.broadcast_state();
        }
    }

    pub fn crash_node(&mut self, node: &str) -> anyhow::Result<()> {
        let run = self.active()?;
        run.injector.inject_crash(node)?;
        self.broadcast_state();
        Ok(())
    }

    pub fn recover_node(&mut self, node: &str) -> anyhow::Result<()> {
        let run = self.active()?;
        run.injector.recover_node(node)?;
        self.broadcast_state();
        Ok(())
    }

    pub fn inject_partition(
        &mut self,
        from: &str,
        to: &str,
        bidirectional: bool,
    ) -> anyhow::Result<()> {
        let run = self.active()?;
        run.injector.inject_partition(from, to, bidirectional)?;
        self.broadcast_state();
        Ok(())
    }

    pub fn heal_partition(
        &mut self,
        from: &str,
        to: &str,
        bidirectional: bool,
    ) -> anyhow::Result<()> {
        let run = self.active()?;
        run.injector.heal_partition(from, to, bidirectional)?;
        self.broadcast_state();
        Ok(())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let timeline = self.timeline.read().iter().cloned().collect();
        match &self.run {
            Some(run) => StateSnapshot {
                virtual_time: run.engine.now(),
                mode: run.engine.mode(),
                speed: run.engine.speed(),
                running: run.engine.running(),
                project: Some(run.project_id.clone()),
                scenario: run.scenario.clone(),
                nodes: run.project.state(),
                timeline,
            },
            None => StateSnapshot {
                virtual_time: 0,
                mode: Mode::Paused,
                speed: 1.0,
                running: false,
                project: None,
                scenario: None,
                nodes: BTreeMap::new(),
                timeline,
            },
        }
    }

    pub fn broadcast_state(&self) {
        self.broadcast(Frame::State(self.snapshot()))
    }

    fn active(&self) -> anyhow::Result<&Run> {
        self.run
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no active simulation"))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop()
    }
}
