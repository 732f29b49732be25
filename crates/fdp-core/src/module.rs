// SPDX-License-Identifier: Apache-2.0
//! Modules: execution policies, reactive triggers, circuit breakers.
//!
//! A module is a subsystem with a per-frame body and a policy describing
//! where and how often that body runs. The host owns the policy machinery;
//! the module only declares it. Fault containment is per module: a breaker
//! trips after `failure_threshold` consecutive faults and the host skips
//! the module until the breaker's reset timeout admits a half-open trial.

use std::any::TypeId;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cmd::CommandBuffer;
use crate::mask::ComponentMask;
use crate::schedule::Schedule;
use crate::store::EntityStore;
use crate::time::GlobalTime;

/// Where a module body executes and what view it gets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ExecutionMode {
    /// Main thread, direct live view; blocks the frame.
    Synchronous,
    /// Worker thread against the full replica; the main thread joins
    /// before continuing the frame.
    FrameSynced,
    /// Worker thread against an on-demand pooled replica; the main thread
    /// does not wait, and the lease may span frames.
    Asynchronous,
}

/// Which replica strategy feeds the module's view. Must match the mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataStrategy {
    /// Live store access (synchronous only).
    Direct,
    /// Persistent double-buffered replica (frame-synced only).
    FullReplica,
    /// Pooled, convoy-shared replica (asynchronous only).
    OnDemand,
}

/// Reactive scheduling condition, evaluated every frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trigger {
    /// Run whenever the frequency admits it.
    Always,
    /// Alias of `Always` kept for configuration symmetry: the frequency
    /// alone gates the module.
    Interval,
    /// Run only in frames where an event of the given type is current.
    OnEvent(TypeId),
    /// Run only when the watched component changed since the module's
    /// last dispatch.
    OnComponentChange(TypeId),
}

impl Trigger {
    /// Watches event type `T`.
    #[must_use]
    pub fn on_event<T: Send + Sync + 'static>() -> Self {
        Self::OnEvent(TypeId::of::<T>())
    }

    /// Watches component type `T` for changes.
    #[must_use]
    pub fn on_component_change<T: Send + Sync + 'static>() -> Self {
        Self::OnComponentChange(TypeId::of::<T>())
    }
}

/// Policy mismatch found at registration.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Mode and data strategy disagree (e.g. asynchronous + direct view).
    #[error("data strategy {strategy:?} does not match mode {mode:?}")]
    StrategyMismatch {
        /// Declared mode.
        mode: ExecutionMode,
        /// Declared strategy.
        strategy: DataStrategy,
    },
}

/// Per-module execution configuration.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionPolicy {
    /// Where the body runs.
    pub mode: ExecutionMode,
    /// Which replica feeds it.
    pub data_strategy: DataStrategy,
    /// Activation frequency; 0 and 60 both mean every frame, otherwise the
    /// frame interval is `60 / frequency_hz`.
    pub frequency_hz: u32,
    /// Reactive condition layered on top of the frequency.
    pub trigger: Trigger,
    /// Runtime budget; exceeding it abandons the worker and counts a fault.
    pub max_runtime_ms: u64,
    /// Consecutive faults before the breaker opens.
    pub failure_threshold: u32,
    /// Open-state dwell before a half-open trial run.
    pub reset_timeout_ms: u64,
    /// Components the module needs in its replica; `None` means all
    /// snapshotable components.
    pub required_components: Option<ComponentMask>,
}

impl ExecutionPolicy {
    fn base(mode: ExecutionMode, data_strategy: DataStrategy) -> Self {
        Self {
            mode,
            data_strategy,
            frequency_hz: 0,
            trigger: Trigger::Always,
            max_runtime_ms: 100,
            failure_threshold: 3,
            reset_timeout_ms: 5_000,
            required_components: None,
        }
    }

    /// Main-thread module with a direct live view.
    #[must_use]
    pub fn synchronous() -> Self {
        Self::base(ExecutionMode::Synchronous, DataStrategy::Direct)
    }

    /// Worker module against the full replica, joined every frame.
    #[must_use]
    pub fn frame_synced() -> Self {
        Self::base(ExecutionMode::FrameSynced, DataStrategy::FullReplica)
    }

    /// Fire-and-forget worker module against a pooled replica.
    #[must_use]
    pub fn asynchronous() -> Self {
        Self::base(ExecutionMode::Asynchronous, DataStrategy::OnDemand)
    }

    /// Sets the activation frequency.
    #[must_use]
    pub fn with_frequency(mut self, hz: u32) -> Self {
        self.frequency_hz = hz;
        self
    }

    /// Sets the reactive trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the runtime budget in milliseconds.
    #[must_use]
    pub fn with_max_runtime_ms(mut self, ms: u64) -> Self {
        self.max_runtime_ms = ms;
        self
    }

    /// Sets the breaker's consecutive-fault threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, faults: u32) -> Self {
        self.failure_threshold = faults;
        self
    }

    /// Sets the breaker's open-state dwell in milliseconds.
    #[must_use]
    pub fn with_reset_timeout_ms(mut self, ms: u64) -> Self {
        self.reset_timeout_ms = ms;
        self
    }

    /// Narrows the replica mask to the given components.
    #[must_use]
    pub fn with_required_components(mut self, mask: ComponentMask) -> Self {
        self.required_components = Some(mask);
        self
    }

    /// Frames between activations (1 = every frame).
    #[must_use]
    pub fn frame_interval(&self) -> u64 {
        match self.frequency_hz {
            0 | 60 => 1,
            hz => u64::from((60 / hz).max(1)),
        }
    }

    /// Rejects mode/strategy disagreements. The strategy is implied by the
    /// mode; a mismatch is a configuration error, not a runtime choice.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let ok = matches!(
            (self.mode, self.data_strategy),
            (ExecutionMode::Synchronous, DataStrategy::Direct)
                | (ExecutionMode::FrameSynced, DataStrategy::FullReplica)
                | (ExecutionMode::Asynchronous, DataStrategy::OnDemand)
        );
        if ok {
            Ok(())
        } else {
            Err(PolicyError::StrategyMismatch {
                mode: self.mode,
                strategy: self.data_strategy,
            })
        }
    }
}

/// Failure returned by a module body.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Body-level failure with a reason.
    #[error("module failed: {0}")]
    Failed(String),
    /// A direct store operation failed inside a synchronous body.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// The world as a module body sees it.
pub enum WorldView<'a> {
    /// Direct live access (synchronous modules only).
    Live(&'a mut EntityStore),
    /// Read-only replica (frame-synced and asynchronous modules).
    Replica(&'a EntityStore),
}

impl WorldView<'_> {
    /// Read access, whichever side this is.
    #[must_use]
    pub fn read(&self) -> &EntityStore {
        match self {
            WorldView::Live(store) => store,
            WorldView::Replica(store) => store,
        }
    }

    /// Mutable live access; `None` on a replica view.
    pub fn live_mut(&mut self) -> Option<&mut EntityStore> {
        match self {
            WorldView::Live(store) => Some(store),
            WorldView::Replica(_) => None,
        }
    }
}

/// Everything a module body receives for one activation.
pub struct ModuleCtx<'a> {
    /// The world view matching the module's data strategy.
    pub world: WorldView<'a>,
    /// The module's command buffer; the only write path off the main
    /// thread.
    pub commands: &'a mut CommandBuffer,
    /// Frame time published by the host.
    pub time: GlobalTime,
    /// Current frame number.
    pub frame: u64,
}

/// A platform module: per-frame body plus optional system registration.
pub trait Module: Send + 'static {
    /// Stable human-readable name, used in logs and stats.
    fn name(&self) -> &'static str;

    /// Execution policy. Read once at registration.
    fn policy(&self) -> ExecutionPolicy;

    /// Per-activation body.
    fn tick(&mut self, ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError>;

    /// Hook for contributing main-thread systems to the scheduler.
    fn register_systems(&mut self, schedule: &mut Schedule) {
        let _ = schedule;
    }
}

/// Breaker position.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakerState {
    /// Healthy; runs admitted.
    Closed,
    /// Tripped; runs skipped until the reset timeout elapses.
    Open,
    /// One trial run admitted; its outcome decides Closed vs Open.
    HalfOpen,
}

/// What counted as a fault, for stats and logs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultKind {
    /// The body returned an error (or a system under it faulted).
    Error,
    /// The body exceeded its runtime budget and was abandoned.
    Timeout,
    /// Command-buffer playback failed and was charged here.
    Playback,
}

/// Per-module fault controller: Closed → Open → HalfOpen → Closed.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_faults: u32,
    threshold: u32,
    reset_timeout: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker from policy limits.
    #[must_use]
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_faults: 0,
            threshold: threshold.max(1),
            reset_timeout,
            opened_at: None,
        }
    }

    /// Current position.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a run is admitted now. An Open breaker whose reset timeout
    /// has elapsed moves to HalfOpen and admits one trial.
    pub fn allow_run(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.reset_timeout);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful run, closing the breaker.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_faults = 0;
        self.opened_at = None;
    }

    /// Records a fault; returns true if this fault opened the breaker.
    pub fn record_fault(&mut self, now: Instant) -> bool {
        self.consecutive_faults += 1;
        let opens = self.state == BreakerState::HalfOpen
            || self.consecutive_faults >= self.threshold;
        if opens {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
        }
        opens
    }
}

/// Per-module host-side counters.
#[derive(Clone, Copy, Default, Debug)]
pub struct ModuleStats {
    /// Completed activations.
    pub runs: u64,
    /// Faults of any kind.
    pub faults: u64,
    /// Runtime-budget faults among them.
    pub timeouts: u64,
    /// Frames skipped with an open breaker.
    pub breaker_skips: u64,
    /// Total body wall time.
    pub total_runtime: Duration,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn policy_validation_rejects_mismatches() {
        let mut policy = ExecutionPolicy::asynchronous();
        assert!(policy.validate().is_ok());
        policy.data_strategy = DataStrategy::Direct;
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::StrategyMismatch { .. })
        ));
    }

    #[test]
    fn frame_interval_from_frequency() {
        assert_eq!(ExecutionPolicy::synchronous().frame_interval(), 1);
        assert_eq!(
            ExecutionPolicy::synchronous().with_frequency(60).frame_interval(),
            1
        );
        assert_eq!(
            ExecutionPolicy::synchronous().with_frequency(30).frame_interval(),
            2
        );
        assert_eq!(
            ExecutionPolicy::synchronous().with_frequency(1).frame_interval(),
            60
        );
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        assert!(breaker.allow_run(now));

        assert!(!breaker.record_fault(now));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.record_fault(now));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_run(now));

        // Reset timeout elapses: one half-open trial.
        let later = now + Duration::from_millis(60);
        assert!(breaker.allow_run(later));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Trial failure snaps straight back to Open.
        assert!(breaker.record_fault(later));
        assert_eq!(breaker.state(), BreakerState::Open);

        // Next trial succeeds and closes.
        let much_later = later + Duration::from_millis(60);
        assert!(breaker.allow_run(much_later));
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
