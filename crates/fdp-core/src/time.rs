// SPDX-License-Identifier: Apache-2.0
//! Distributed time: wall-clock, PLL-slaved, and lockstep controllers.
//!
//! Every controller implements the same small contract — advance once per
//! frame, expose its [`GlobalTime`] state, accept a seeded state — which is
//! what makes the future-barrier mode switch possible: all peers keep
//! running until their frame counter reaches an agreed barrier frame, then
//! each swaps its controller locally via `get_current_state`/`seed_state`.
//! No peer ever rewinds; late arrivals swap immediately and catch up.
//!
//! The continuous slave steers toward the master's timeline with a
//! proportional phase-locked loop (small gain, ~1% of the error per frame)
//! and never snaps; a snap would be a visible discontinuity.
//!
//! Transport is abstract: controllers exchange [`TimeMessage`]s through a
//! [`TimeTransport`], and the embedder decides what carries them. A
//! loopback pair is provided for tests and single-process sessions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::ident::NodeId;

/// Singleton component published by the host once per frame.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
pub struct GlobalTime {
    /// Frame counter; monotonically non-decreasing across mode switches.
    pub frame: u64,
    /// Cumulative simulation time in seconds.
    pub sim_time: f64,
    /// This frame's delta in seconds.
    pub delta: f32,
    /// Simulation speed multiplier.
    pub time_scale: f32,
    /// Nonzero while paused. Stored as a word to stay blittable.
    pub paused: u32,
    /// Explicit padding; keeps the layout free of implicit holes.
    pub _pad: u32,
}

impl GlobalTime {
    /// Whether the simulation is paused.
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused != 0
    }
}

/// Controller flavor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeMode {
    /// Local wall clock with a time scale; no peers.
    Standalone,
    /// Wall clock, broadcasting pulses for slaves to follow.
    ContinuousMaster,
    /// Follows a master's pulses via a proportional PLL.
    ContinuousSlave,
    /// Deterministic lockstep; issues frame orders and collects acks.
    LockstepMaster,
    /// Deterministic lockstep; executes on received frame orders.
    LockstepSlave,
}

/// Master → slaves wall-clock beacon (1 Hz plus on-change).
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TimePulse {
    /// Master's wall-clock seconds at emission (session-relative).
    pub wall_time: f64,
    /// Master's simulation time at emission.
    pub sim_time: f64,
    /// Master's time scale.
    pub scale: f32,
    /// Master's pause flag.
    pub paused: bool,
}

/// Lockstep master → slaves: execute one frame.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct FrameOrder {
    /// Frame to execute.
    pub frame_id: u64,
    /// Fixed delta for that frame.
    pub fixed_delta: f32,
}

/// Lockstep slave → master: frame executed.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct FrameAck {
    /// Acknowledged frame.
    pub frame_id: u64,
    /// Acknowledging node.
    pub node: NodeId,
}

/// Coordinator → all peers: swap controllers at a future barrier frame.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SwitchTimeMode {
    /// Mode every peer swaps to.
    pub target: TimeMode,
    /// Frame at which the swap happens; peers already past it swap
    /// immediately.
    pub barrier_frame: u64,
    /// Pause flag seeded into the new controller.
    pub paused: bool,
}

/// Wire messages exchanged between time controllers.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TimeMessage {
    /// Continuous-mode beacon.
    Pulse(TimePulse),
    /// Lockstep frame order.
    Order(FrameOrder),
    /// Lockstep frame acknowledgement.
    Ack(FrameAck),
    /// Future-barrier mode switch.
    Switch(SwitchTimeMode),
}

/// Message carrier between peers. The core never names a concrete
/// transport; embedders bridge this onto whatever they have.
pub trait TimeTransport: Send {
    /// Sends to all peers (broadcast semantics).
    fn send(&mut self, msg: TimeMessage);

    /// Non-blocking receive.
    fn try_recv(&mut self) -> Option<TimeMessage>;
}

/// Transport for standalone sessions: sends vanish, receives never arrive.
#[derive(Default)]
pub struct NullTransport;

impl TimeTransport for NullTransport {
    fn send(&mut self, _msg: TimeMessage) {}

    fn try_recv(&mut self) -> Option<TimeMessage> {
        None
    }
}

/// In-process transport end, for tests and single-process sessions.
pub struct LoopbackTransport {
    tx: Sender<TimeMessage>,
    rx: Receiver<TimeMessage>,
}

impl LoopbackTransport {
    /// Creates a connected pair: what one end sends, the other receives.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (
            Self { tx: a_tx, rx: b_rx },
            Self { tx: b_tx, rx: a_rx },
        )
    }
}

impl TimeTransport for LoopbackTransport {
    fn send(&mut self, msg: TimeMessage) {
        let _ = self.tx.send(msg);
    }

    fn try_recv(&mut self) -> Option<TimeMessage> {
        self.rx.try_recv().ok()
    }
}

/// Per-frame time step contract shared by all controllers.
pub trait TimeController: Send {
    /// This controller's flavor.
    fn mode(&self) -> TimeMode;

    /// Advances one frame, exchanging messages as the mode requires, and
    /// returns the updated state.
    fn advance(&mut self, transport: &mut dyn TimeTransport) -> GlobalTime;

    /// Current state, for transfer into a successor controller.
    fn get_current_state(&self) -> GlobalTime;

    /// Adopts a predecessor's state. Wall-clock anchors reset to now; the
    /// frame counter and simulation time carry over without discontinuity.
    fn seed_state(&mut self, state: GlobalTime);

    /// Adjusts the time scale (where the mode supports it).
    fn set_time_scale(&mut self, scale: f32) {
        let _ = scale;
    }

    /// Pauses or resumes (where the mode supports it).
    fn set_paused(&mut self, paused: bool) {
        let _ = paused;
    }
}

/// Session-level configuration shared by the controllers.
#[derive(Clone, Debug)]
pub struct TimeConfig {
    /// This node's id.
    pub node: NodeId,
    /// Lockstep peers expected to ack (masters only).
    pub peers: Vec<NodeId>,
    /// Fixed delta for lockstep frames.
    pub fixed_delta: f32,
    /// How long a lockstep master waits for acks before warning and
    /// proceeding.
    pub ack_timeout: Duration,
    /// How long a lockstep slave waits for an order before emitting a
    /// zero-delta frame.
    pub order_timeout: Duration,
    /// Barrier lookahead for coordinator-driven mode switches.
    pub lookahead_frames: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            node: NodeId::LOCAL,
            peers: Vec::new(),
            fixed_delta: 1.0 / 60.0,
            ack_timeout: Duration::from_millis(100),
            order_timeout: Duration::from_millis(250),
            lookahead_frames: 10,
        }
    }
}

const PULSE_INTERVAL: Duration = Duration::from_secs(1);
const PLL_GAIN: f64 = 0.01;
const POLL_SLEEP: Duration = Duration::from_micros(200);

// ── standalone / continuous master ──────────────────────────────────

/// Local wall-clock source with a scale; doubles as the continuous master
/// when constructed in broadcast mode.
pub struct WallClockController {
    state: GlobalTime,
    last_wall: Instant,
    session_start: Instant,
    broadcast: bool,
    last_pulse: Option<Instant>,
    dirty: bool,
}

impl WallClockController {
    /// Standalone controller (no pulses).
    #[must_use]
    pub fn standalone() -> Self {
        Self::with_broadcast(false)
    }

    /// Continuous master: standalone plus 1 Hz / on-change pulses.
    #[must_use]
    pub fn master() -> Self {
        Self::with_broadcast(true)
    }

    fn with_broadcast(broadcast: bool) -> Self {
        let now = Instant::now();
        Self {
            state: GlobalTime {
                frame: 0,
                sim_time: 0.0,
                delta: 0.0,
                time_scale: 1.0,
                paused: 0,
                _pad: 0,
            },
            last_wall: now,
            session_start: now,
            broadcast,
            last_pulse: None,
            dirty: false,
        }
    }
}

impl TimeController for WallClockController {
    fn mode(&self) -> TimeMode {
        if self.broadcast {
            TimeMode::ContinuousMaster
        } else {
            TimeMode::Standalone
        }
    }

    fn advance(&mut self, transport: &mut dyn TimeTransport) -> GlobalTime {
        let now = Instant::now();
        let wall_delta = now.duration_since(self.last_wall).as_secs_f64();
        self.last_wall = now;

        let delta = if self.state.is_paused() {
            0.0
        } else {
            wall_delta * f64::from(self.state.time_scale)
        };
        self.state.sim_time += delta;
        self.state.delta = delta as f32;
        self.state.frame += 1;

        if self.broadcast {
            let due = self
                .last_pulse
                .is_none_or(|at| now.duration_since(at) >= PULSE_INTERVAL);
            if due || self.dirty {
                transport.send(TimeMessage::Pulse(TimePulse {
                    wall_time: now.duration_since(self.session_start).as_secs_f64(),
                    sim_time: self.state.sim_time,
                    scale: self.state.time_scale,
                    paused: self.state.is_paused(),
                }));
                self.last_pulse = Some(now);
                self.dirty = false;
            }
        }
        self.state
    }

    fn get_current_state(&self) -> GlobalTime {
        self.state
    }

    fn seed_state(&mut self, state: GlobalTime) {
        self.state = state;
        let now = Instant::now();
        self.last_wall = now;
        self.session_start = now;
        self.dirty = true;
    }

    fn set_time_scale(&mut self, scale: f32) {
        self.state.time_scale = scale.max(0.0);
        self.dirty = true;
    }

    fn set_paused(&mut self, paused: bool) {
        self.state.paused = u32::from(paused);
        self.dirty = true;
    }
}

// ── continuous slave (PLL) ──────────────────────────────────────────

struct PulseAnchor {
    sim_time: f64,
    received: Instant,
    scale: f64,
    paused: bool,
}

/// Follows a continuous master by steering its local delta toward the
/// master's extrapolated timeline. Convergence is gradual: a fraction
/// ([`PLL_GAIN`]) of the phase error is absorbed each frame, so the local
/// clock bends instead of jumping.
pub struct PllSlaveController {
    state: GlobalTime,
    last_wall: Instant,
    anchor: Option<PulseAnchor>,
}

impl PllSlaveController {
    /// Creates a slave with no anchor yet; it free-runs at scale 1 until
    /// the first pulse arrives.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: GlobalTime {
                frame: 0,
                sim_time: 0.0,
                delta: 0.0,
                time_scale: 1.0,
                paused: 0,
                _pad: 0,
            },
            last_wall: Instant::now(),
            anchor: None,
        }
    }
}

impl Default for PllSlaveController {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeController for PllSlaveController {
    fn mode(&self) -> TimeMode {
        TimeMode::ContinuousSlave
    }

    fn advance(&mut self, transport: &mut dyn TimeTransport) -> GlobalTime {
        while let Some(msg) = transport.try_recv() {
            if let TimeMessage::Pulse(pulse) = msg {
                self.state.time_scale = pulse.scale;
                self.state.paused = u32::from(pulse.paused);
                self.anchor = Some(PulseAnchor {
                    sim_time: pulse.sim_time,
                    received: Instant::now(),
                    scale: f64::from(pulse.scale),
                    paused: pulse.paused,
                });
            }
        }

        let now = Instant::now();
        let wall_delta = now.duration_since(self.last_wall).as_secs_f64();
        self.last_wall = now;

        let mut delta = if self.state.is_paused() {
            0.0
        } else {
            wall_delta * f64::from(self.state.time_scale)
        };

        if let Some(anchor) = &self.anchor {
            if !anchor.paused {
                // Extrapolate the master's timeline to now and absorb a
                // small fraction of the phase error. Never snap.
                let target =
                    anchor.sim_time + now.duration_since(anchor.received).as_secs_f64() * anchor.scale;
                let error = target - (self.state.sim_time + delta);
                delta += error * PLL_GAIN;
                delta = delta.max(0.0);
            }
        }

        self.state.sim_time += delta;
        self.state.delta = delta as f32;
        self.state.frame += 1;
        self.state
    }

    fn get_current_state(&self) -> GlobalTime {
        self.state
    }

    fn seed_state(&mut self, state: GlobalTime) {
        self.state = state;
        self.last_wall = Instant::now();
        self.anchor = None;
    }
}

// ── deterministic lockstep ──────────────────────────────────────────

/// Lockstep master: one frame order per advance, acks collected before the
/// next. Missing acks warn after the timeout; progress is never blocked
/// past it.
pub struct LockstepMasterController {
    state: GlobalTime,
    config: TimeConfig,
    outstanding: Vec<NodeId>,
    order_sent: Option<Instant>,
}

impl LockstepMasterController {
    /// Creates a master over the configured peer set.
    #[must_use]
    pub fn new(config: TimeConfig) -> Self {
        Self {
            state: GlobalTime {
                frame: 0,
                sim_time: 0.0,
                delta: config.fixed_delta,
                time_scale: 1.0,
                paused: 0,
                _pad: 0,
            },
            config,
            outstanding: Vec::new(),
            order_sent: None,
        }
    }

    fn wait_for_acks(&mut self, transport: &mut dyn TimeTransport) {
        let Some(sent_at) = self.order_sent else {
            return;
        };
        let deadline = sent_at + self.config.ack_timeout;
        loop {
            while let Some(msg) = transport.try_recv() {
                if let TimeMessage::Ack(ack) = msg {
                    if ack.frame_id == self.state.frame {
                        self.outstanding.retain(|&n| n != ack.node);
                    }
                }
            }
            if self.outstanding.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    frame = self.state.frame,
                    missing = ?self.outstanding,
                    "lockstep ack timeout; proceeding without stragglers"
                );
                return;
            }
            std::thread::sleep(POLL_SLEEP);
        }
    }
}

impl TimeController for LockstepMasterController {
    fn mode(&self) -> TimeMode {
        TimeMode::LockstepMaster
    }

    fn advance(&mut self, transport: &mut dyn TimeTransport) -> GlobalTime {
        self.wait_for_acks(transport);

        self.state.frame += 1;
        let delta = if self.state.is_paused() {
            0.0
        } else {
            f64::from(self.config.fixed_delta)
        };
        self.state.sim_time += delta;
        self.state.delta = delta as f32;

        transport.send(TimeMessage::Order(FrameOrder {
            frame_id: self.state.frame,
            fixed_delta: self.state.delta,
        }));
        self.outstanding = self.config.peers.clone();
        self.order_sent = Some(Instant::now());
        self.state
    }

    fn get_current_state(&self) -> GlobalTime {
        self.state
    }

    fn seed_state(&mut self, state: GlobalTime) {
        self.state = state;
        self.outstanding.clear();
        self.order_sent = None;
    }

    fn set_paused(&mut self, paused: bool) {
        self.state.paused = u32::from(paused);
    }
}

/// Lockstep slave: blocks until the master's order arrives, executes with
/// the fixed delta, and acks.
pub struct LockstepSlaveController {
    state: GlobalTime,
    config: TimeConfig,
}

impl LockstepSlaveController {
    /// Creates a slave.
    #[must_use]
    pub fn new(config: TimeConfig) -> Self {
        Self {
            state: GlobalTime {
                frame: 0,
                sim_time: 0.0,
                delta: 0.0,
                time_scale: 1.0,
                paused: 0,
                _pad: 0,
            },
            config,
        }
    }
}

impl TimeController for LockstepSlaveController {
    fn mode(&self) -> TimeMode {
        TimeMode::LockstepSlave
    }

    fn advance(&mut self, transport: &mut dyn TimeTransport) -> GlobalTime {
        let deadline = Instant::now() + self.config.order_timeout;
        let order = loop {
            if let Some(msg) = transport.try_recv() {
                if let TimeMessage::Order(order) = msg {
                    break Some(order);
                }
                continue;
            }
            if Instant::now() >= deadline {
                break None;
            }
            std::thread::sleep(POLL_SLEEP);
        };

        match order {
            Some(order) => {
                self.state.frame = order.frame_id;
                self.state.delta = order.fixed_delta;
                self.state.sim_time += f64::from(order.fixed_delta);
                transport.send(TimeMessage::Ack(FrameAck {
                    frame_id: order.frame_id,
                    node: self.config.node,
                }));
            }
            None => {
                debug!(
                    frame = self.state.frame,
                    "no frame order within timeout; idling one frame"
                );
                self.state.delta = 0.0;
            }
        }
        self.state
    }

    fn get_current_state(&self) -> GlobalTime {
        self.state
    }

    fn seed_state(&mut self, state: GlobalTime) {
        self.state = state;
    }
}

// ── director: active controller + future-barrier switching ──────────

/// Owns the active controller, the transport, and the barrier-switch
/// protocol.
pub struct TimeDirector {
    controller: Box<dyn TimeController>,
    transport: Box<dyn TimeTransport>,
    config: TimeConfig,
    pending: Option<SwitchTimeMode>,
    inbox: VecDeque<TimeMessage>,
}

impl TimeDirector {
    /// Creates a director around an initial controller and transport.
    #[must_use]
    pub fn new(
        controller: Box<dyn TimeController>,
        transport: Box<dyn TimeTransport>,
        config: TimeConfig,
    ) -> Self {
        Self {
            controller,
            transport,
            config,
            pending: None,
            inbox: VecDeque::new(),
        }
    }

    /// Standalone convenience: wall clock, null transport.
    #[must_use]
    pub fn standalone() -> Self {
        Self::new(
            Box::new(WallClockController::standalone()),
            Box::new(NullTransport),
            TimeConfig::default(),
        )
    }

    /// Active controller mode.
    #[must_use]
    pub fn mode(&self) -> TimeMode {
        self.controller.mode()
    }

    /// Current time state without advancing.
    #[must_use]
    pub fn current(&self) -> GlobalTime {
        self.controller.get_current_state()
    }

    /// Adjusts the time scale on the active controller.
    pub fn set_time_scale(&mut self, scale: f32) {
        self.controller.set_time_scale(scale);
    }

    /// Coordinator entry point: schedule a mode switch at
    /// `current_frame + lookahead` and tell every peer.
    pub fn request_switch(&mut self, target: TimeMode, paused: bool) -> u64 {
        let barrier_frame =
            self.controller.get_current_state().frame + self.config.lookahead_frames;
        let switch = SwitchTimeMode {
            target,
            barrier_frame,
            paused,
        };
        self.transport.send(TimeMessage::Switch(switch));
        self.pending = Some(switch);
        barrier_frame
    }

    /// Advances one frame: drains switch messages, steps the active
    /// controller, and performs any due barrier swap.
    pub fn advance(&mut self) -> GlobalTime {
        // Intercept switch announcements; everything else is the
        // controller's business.
        while let Some(msg) = self.transport.try_recv() {
            if let TimeMessage::Switch(switch) = msg {
                self.pending = Some(switch);
            } else {
                self.inbox.push_back(msg);
            }
        }

        let state = {
            let mut routed = RoutedTransport {
                inner: self.transport.as_mut(),
                inbox: &mut self.inbox,
                pending: &mut self.pending,
            };
            self.controller.advance(&mut routed)
        };

        if let Some(switch) = self.pending {
            // Peers past the barrier swap immediately (catch-up); nobody
            // ever rewinds.
            if state.frame >= switch.barrier_frame {
                self.swap_controller(switch);
            }
        }
        self.controller.get_current_state()
    }

    fn swap_controller(&mut self, switch: SwitchTimeMode) {
        let mut state = self.controller.get_current_state();
        state.paused = u32::from(switch.paused);
        debug!(
            from = ?self.controller.mode(),
            to = ?switch.target,
            frame = state.frame,
            "time controller swap at barrier"
        );
        let mut next = build_controller(switch.target, &self.config);
        next.seed_state(state);
        self.controller = next;
        self.pending = None;
    }
}

/// Builds a controller of the given mode from shared session config.
#[must_use]
pub fn build_controller(mode: TimeMode, config: &TimeConfig) -> Box<dyn TimeController> {
    match mode {
        TimeMode::Standalone => Box::new(WallClockController::standalone()),
        TimeMode::ContinuousMaster => Box::new(WallClockController::master()),
        TimeMode::ContinuousSlave => Box::new(PllSlaveController::new()),
        TimeMode::LockstepMaster => Box::new(LockstepMasterController::new(config.clone())),
        TimeMode::LockstepSlave => Box::new(LockstepSlaveController::new(config.clone())),
    }
}

struct RoutedTransport<'a> {
    inner: &'a mut dyn TimeTransport,
    inbox: &'a mut VecDeque<TimeMessage>,
    pending: &'a mut Option<SwitchTimeMode>,
}

impl TimeTransport for RoutedTransport<'_> {
    fn send(&mut self, msg: TimeMessage) {
        self.inner.send(msg);
    }

    fn try_recv(&mut self) -> Option<TimeMessage> {
        loop {
            let msg = self
                .inbox
                .pop_front()
                .or_else(|| self.inner.try_recv())?;
            if let TimeMessage::Switch(switch) = msg {
                *self.pending = Some(switch);
                continue;
            }
            return Some(msg);
        }
    }
}
