// SPDX-License-Identifier: Apache-2.0
//! The module host: per-frame orchestration of everything else.
//!
//! Frame anatomy (main thread unless noted):
//!
//! 1. Advance the time director; publish the `GlobalTime` singleton.
//! 2. `store.tick()` — the only global-version increment of the frame.
//! 3. Scheduler phases Input and BeforeSync against the live store, then
//!    synchronous module bodies (direct live view).
//! 4. Refresh the full replica; dispatch selected frame-synced modules on
//!    workers; join them all (timeout ⇒ abandon + fault).
//! 5. Harvest finished asynchronous runs (leases may span frames), then
//!    dispatch newly selected ones against convoy-shared pooled replicas.
//!    No waiting.
//! 6. Swap event buffers; play back every harvested command buffer in
//!    module-registration order; step the lifecycle manager.
//! 7. Scheduler phases Simulation, PostSimulation, Export.
//! 8. Close the frame; end-of-frame invariants are debug-asserted.
//!
//! Module faults (errors, panics, timeouts, playback failures) never abort
//! the loop: they are counted, logged, and fed to the module's circuit
//! breaker, which skips the module until its reset timeout admits a trial.
//! Only core programmer errors (`VersionMisuse`, a cyclic schedule) abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, warn};

use crate::cmd::CommandBuffer;
use crate::component::{ComponentRegistry, DataPolicy, PolyRegistry, RegistryError};
use crate::ident::{ComponentTypeId, ModuleId};
use crate::lifecycle::{LifecycleConfig, LifecycleManager, LifecycleStats};
use crate::module::{
    BreakerState, CircuitBreaker, ExecutionMode, ExecutionPolicy, FaultKind, Module, ModuleCtx,
    ModuleStats, PolicyError, Trigger, WorldView,
};
use crate::schedule::{panic_message, Phase, Schedule, ScheduleError, SystemProfile};
use crate::snapshot::{ConvoyKey, SnapshotHandle, SnapshotManager};
use crate::store::{EntityStore, StoreError};
use crate::time::{GlobalTime, TimeConfig, TimeController, TimeDirector, TimeTransport};
use crate::workers::{default_worker_count, WorkerPool};

/// Component id reserved for the `GlobalTime` singleton.
pub const GLOBAL_TIME_COMPONENT: ComponentTypeId = ComponentTypeId(255);

/// Host construction and frame-level errors. Everything here is a
/// programmer/configuration error; module faults never surface through
/// this type.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Store-level programmer error (stale handle on a direct call,
    /// version misuse).
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Schedule build failure (duplicate names, cycles).
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    /// Component registration failure during host construction.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Module policy mismatch at registration.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Host-level configuration knobs.
#[derive(Clone, Debug, Default)]
pub struct HostConfig {
    /// Worker pool size; `None` defers to `FDP_WORKERS` / parallelism.
    pub workers: Option<usize>,
    /// Snapshot pool warm capacity; `None` defers to `FDP_SNAPSHOT_WARM`.
    pub snapshot_warm: Option<usize>,
    /// Lifecycle hand-shake timeouts.
    pub lifecycle: LifecycleConfig,
    /// Time/session configuration.
    pub time: TimeConfig,
}

/// Host-level counters.
#[derive(Clone, Copy, Default, Debug)]
pub struct HostStats {
    /// Frames completed.
    pub frames: u64,
    /// Command playback failures (charged to their modules as well).
    pub playback_errors: u64,
    /// Scheduler phase aborts.
    pub system_faults: u64,
}

enum ModuleSlot {
    Idle(Box<dyn Module>),
    Running,
}

struct RunResult {
    module: Box<dyn Module>,
    buffer: CommandBuffer,
    lease: Option<SnapshotHandle>,
    outcome: Result<(), String>,
    elapsed: Duration,
}

struct PendingRun {
    rx: Receiver<RunResult>,
    started: Instant,
    abandoned: bool,
}

struct ModuleEntry {
    id: ModuleId,
    name: &'static str,
    policy: ExecutionPolicy,
    breaker: CircuitBreaker,
    stats: ModuleStats,
    slot: ModuleSlot,
    buffer: Option<CommandBuffer>,
    pending: Option<PendingRun>,
    last_run_version: u32,
}

/// Builder for [`ModuleHost`]; mirrors the store's schema-fixed-at-creation
/// rule by consuming the registry.
pub struct HostBuilder {
    registry: ComponentRegistry,
    config: HostConfig,
    modules: Vec<(Box<dyn Module>, bool)>,
    controller: Option<(Box<dyn TimeController>, Box<dyn TimeTransport>)>,
}

impl HostBuilder {
    /// Starts a builder over an application-defined component schema.
    #[must_use]
    pub fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry,
            config: HostConfig::default(),
            modules: Vec::new(),
            controller: None,
        }
    }

    /// Replaces the host configuration.
    #[must_use]
    pub fn with_config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a module.
    #[must_use]
    pub fn with_module(mut self, module: Box<dyn Module>) -> Self {
        self.modules.push((module, false));
        self
    }

    /// Adds a module that also participates in lifecycle hand-shakes
    /// (its ACK gates every construction and destruction).
    #[must_use]
    pub fn with_lifecycle_participant(mut self, module: Box<dyn Module>) -> Self {
        self.modules.push((module, true));
        self
    }

    /// Installs a non-default time controller and transport.
    #[must_use]
    pub fn with_time(
        mut self,
        controller: Box<dyn TimeController>,
        transport: Box<dyn TimeTransport>,
    ) -> Self {
        self.controller = Some((controller, transport));
        self
    }

    /// Builds the host: registers `GlobalTime`, fixes the schema, wires
    /// modules, and resolves the schedule. Schedule cycles fail here.
    pub fn build(mut self) -> Result<ModuleHost, HostError> {
        self.registry.register_pod::<GlobalTime>(
            GLOBAL_TIME_COMPONENT,
            "global_time",
            DataPolicy::Snapshot,
        )?;
        let registry = Arc::new(self.registry);

        let warm = self.config.snapshot_warm.unwrap_or_else(|| {
            std::env::var("FDP_SNAPSHOT_WARM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        });
        let workers = self.config.workers.unwrap_or_else(default_worker_count);

        let store = EntityStore::new(registry.clone());
        let mut snapshots = SnapshotManager::new(registry.clone(), warm);
        let mut schedule = Schedule::new();
        let mut elm = LifecycleManager::new(self.config.lifecycle);
        let mut entries = Vec::new();
        let mut system_owners: Vec<(&'static str, ModuleId)> = Vec::new();

        for (ix, (mut module, participates)) in self.modules.into_iter().enumerate() {
            let id = ModuleId(ix as u16);
            let policy = module.policy();
            policy.validate()?;

            let before = schedule.system_names().len();
            module.register_systems(&mut schedule);
            let after = schedule.system_names();
            for name in after.into_iter().skip(before) {
                system_owners.push((name, id));
            }

            if policy.mode == ExecutionMode::Asynchronous {
                let required = policy
                    .required_components
                    .unwrap_or_else(|| registry.snapshotable_mask());
                snapshots.join_convoy(
                    ConvoyKey {
                        frequency_hz: policy.frequency_hz,
                        mode: policy.mode,
                    },
                    required,
                );
            }
            if participates {
                elm.register_participant(id);
            }

            entries.push(ModuleEntry {
                id,
                name: module.name(),
                policy,
                breaker: CircuitBreaker::new(
                    policy.failure_threshold,
                    Duration::from_millis(policy.reset_timeout_ms),
                ),
                stats: ModuleStats::default(),
                slot: ModuleSlot::Idle(module),
                buffer: Some(CommandBuffer::new(id, registry.clone())),
                pending: None,
                last_run_version: 0,
            });
        }

        schedule.build()?;

        let time = match self.controller {
            Some((controller, transport)) => {
                TimeDirector::new(controller, transport, self.config.time.clone())
            }
            None => TimeDirector::standalone(),
        };

        Ok(ModuleHost {
            store,
            registry,
            poly: PolyRegistry::new(),
            schedule,
            snapshots,
            elm,
            time,
            pool: WorkerPool::new(workers),
            modules: entries,
            system_owners,
            frame: 0,
            current_time: GlobalTime {
                frame: 0,
                sim_time: 0.0,
                delta: 0.0,
                time_scale: 1.0,
                paused: 0,
                _pad: 0,
            },
            stats: HostStats::default(),
            harvest: Vec::new(),
        })
    }
}

/// The per-frame orchestrator.
pub struct ModuleHost {
    store: EntityStore,
    registry: Arc<ComponentRegistry>,
    poly: PolyRegistry,
    schedule: Schedule,
    snapshots: SnapshotManager,
    elm: LifecycleManager,
    time: TimeDirector,
    pool: WorkerPool,
    modules: Vec<ModuleEntry>,
    system_owners: Vec<(&'static str, ModuleId)>,
    frame: u64,
    current_time: GlobalTime,
    stats: HostStats,
    harvest: Vec<(usize, CommandBuffer)>,
}

impl ModuleHost {
    /// Starts a builder.
    #[must_use]
    pub fn builder(registry: ComponentRegistry) -> HostBuilder {
        HostBuilder::new(registry)
    }

    /// The live store.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Mutable live store access (main thread, between frames).
    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    /// The shared component schema.
    #[must_use]
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Polymorphic serialization registry (recorder, command codec).
    pub fn poly_mut(&mut self) -> &mut PolyRegistry {
        &mut self.poly
    }

    /// Read access to the polymorphic registry.
    #[must_use]
    pub fn poly(&self) -> &PolyRegistry {
        &self.poly
    }

    /// The lifecycle manager.
    pub fn lifecycle_mut(&mut self) -> &mut LifecycleManager {
        &mut self.elm
    }

    /// Lifecycle counters.
    #[must_use]
    pub fn lifecycle_stats(&self) -> LifecycleStats {
        self.elm.stats()
    }

    /// Starts the construction hand-shake for `entity` at the current
    /// frame.
    pub fn begin_construction(
        &mut self,
        entity: crate::ident::Entity,
        type_id: u32,
    ) -> Result<(), StoreError> {
        self.elm
            .begin_construction(&mut self.store, entity, type_id, self.frame)
    }

    /// Starts the destruction hand-shake for `entity` at the current frame.
    pub fn begin_destruction(
        &mut self,
        entity: crate::ident::Entity,
        reason: crate::lifecycle::DestructionReason,
    ) -> Result<(), StoreError> {
        self.elm
            .begin_destruction(&mut self.store, entity, reason, self.frame)
    }

    /// Materializes an out-of-order network entity in Ghost state.
    pub fn create_ghost(&mut self, entity: crate::ident::Entity) -> Result<(), StoreError> {
        self.elm.create_ghost(&mut self.store, entity, self.frame)
    }

    /// The snapshot manager (pool and convoy statistics).
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// The time director (mode switches, scale changes).
    pub fn time_mut(&mut self) -> &mut TimeDirector {
        &mut self.time
    }

    /// Completed frame count.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Host counters.
    #[must_use]
    pub fn stats(&self) -> HostStats {
        self.stats
    }

    /// Scheduler profiling data.
    #[must_use]
    pub fn profiles(&self) -> &[SystemProfile] {
        self.schedule.profiles()
    }

    /// Per-module counters, in registration order.
    #[must_use]
    pub fn module_stats(&self) -> Vec<(&'static str, ModuleStats, BreakerState)> {
        self.modules
            .iter()
            .map(|m| (m.name, m.stats, m.breaker.state()))
            .collect()
    }

    /// Runs one complete frame. Returns the frame's time state.
    pub fn run_frame(&mut self) -> Result<GlobalTime, HostError> {
        // 1. Time first: everything in the frame sees one consistent stamp.
        let time = self.time.advance();
        self.frame = time.frame;
        self.current_time = time;

        // 2. Exactly one version increment, before any mutation.
        self.store.tick()?;
        self.store.set_singleton(time)?;

        // 3. Main-thread phases, then synchronous module bodies.
        self.execute_phase(Phase::Input, time.delta);
        self.execute_phase(Phase::BeforeSync, time.delta);
        self.run_synchronous_modules();

        // 4. Frame-synced modules: replicate, dispatch, join.
        self.run_frame_synced_modules();

        // 5. Background completions (asynchronous leases spanning frames,
        //    abandoned stragglers), then newly selected asynchronous runs.
        self.harvest_background_completions();
        self.dispatch_async_modules();

        // 6. Event flip, ordered playback, lifecycle step.
        self.store.events_mut().swap_buffers();
        self.play_back_harvest();
        self.elm.update(&mut self.store, self.frame);

        // 7. Remaining main-thread phases.
        self.execute_phase(Phase::Simulation, time.delta);
        self.execute_phase(Phase::PostSimulation, time.delta);
        self.execute_phase(Phase::Export, time.delta);

        // 8. Close out.
        debug_assert!(self.store.events().pending_is_empty());
        self.store.end_frame();
        self.stats.frames += 1;
        Ok(time)
    }

    fn execute_phase(&mut self, phase: Phase, delta: f32) {
        match self.schedule.execute_phase(phase, &mut self.store, delta) {
            Ok(()) => {}
            Err(ScheduleError::SystemFault { system, reason }) => {
                self.stats.system_faults += 1;
                let owner = self
                    .system_owners
                    .iter()
                    .find(|(name, _)| *name == system)
                    .map(|(_, id)| *id);
                if let Some(owner) = owner {
                    self.charge_fault(owner, FaultKind::Error);
                } else {
                    warn!(system, %reason, "system fault outside any module");
                }
            }
            Err(err) => {
                // Build errors cannot occur here (build ran in the
                // builder); log and continue.
                warn!(%err, "phase execution error");
            }
        }
    }

    fn charge_fault(&mut self, module: ModuleId, kind: FaultKind) {
        let Some(entry) = self.modules.iter_mut().find(|m| m.id == module) else {
            return;
        };
        entry.stats.faults += 1;
        if kind == FaultKind::Timeout {
            entry.stats.timeouts += 1;
        }
        if entry.breaker.record_fault(Instant::now()) {
            warn!(module = entry.name, ?kind, "circuit breaker opened");
        }
    }

    /// Frequency + trigger + breaker gate, evaluated every frame.
    fn is_selected(&mut self, ix: usize) -> bool {
        let frame = self.frame;
        let entry = &mut self.modules[ix];
        if !matches!(entry.slot, ModuleSlot::Idle(_)) {
            return false;
        }
        if frame % entry.policy.frame_interval() != 0 {
            return false;
        }
        let triggered = match entry.policy.trigger {
            Trigger::Always | Trigger::Interval => true,
            Trigger::OnEvent(type_id) => self.store.events().has_event_dyn(type_id),
            Trigger::OnComponentChange(type_id) => self
                .registry
                .id_of_dyn(type_id)
                .is_some_and(|id| {
                    self.store
                        .has_component_changed_id(id, entry.last_run_version)
                }),
        };
        if !triggered {
            return false;
        }
        if !entry.breaker.allow_run(Instant::now()) {
            entry.stats.breaker_skips += 1;
            return false;
        }
        true
    }

    fn run_synchronous_modules(&mut self) {
        for ix in 0..self.modules.len() {
            if self.modules[ix].policy.mode != ExecutionMode::Synchronous
                || !self.is_selected(ix)
            {
                continue;
            }
            let entry = &mut self.modules[ix];
            let ModuleSlot::Idle(mut module) =
                std::mem::replace(&mut entry.slot, ModuleSlot::Running)
            else {
                continue;
            };
            let Some(mut buffer) = entry.buffer.take() else {
                entry.slot = ModuleSlot::Idle(module);
                continue;
            };
            entry.last_run_version = self.store.global_version();
            let time = self.current_time;
            let frame = self.frame;

            let started = Instant::now();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut ctx = ModuleCtx {
                    world: WorldView::Live(&mut self.store),
                    commands: &mut buffer,
                    time,
                    frame,
                };
                module.tick(&mut ctx)
            }));
            let elapsed = started.elapsed();

            let entry = &mut self.modules[ix];
            entry.slot = ModuleSlot::Idle(module);
            let entry_id = entry.id;
            match outcome {
                Ok(Ok(())) => {
                    entry.stats.runs += 1;
                    entry.stats.total_runtime += elapsed;
                    entry.breaker.record_success();
                    self.harvest.push((ix, buffer));
                }
                Ok(Err(err)) => {
                    warn!(module = entry.name, %err, "synchronous module error");
                    buffer.clear();
                    entry.buffer = Some(buffer);
                    self.charge_fault(entry_id, FaultKind::Error);
                }
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!(module = entry.name, %reason, "synchronous module panicked");
                    buffer.clear();
                    entry.buffer = Some(buffer);
                    self.charge_fault(entry_id, FaultKind::Error);
                }
            }
        }
    }

    fn dispatch_background(&mut self, ix: usize, lease: SnapshotHandle) {
        let entry = &mut self.modules[ix];
        let ModuleSlot::Idle(mut module) =
            std::mem::replace(&mut entry.slot, ModuleSlot::Running)
        else {
            self.snapshots.release(lease);
            return;
        };
        let Some(mut buffer) = entry.buffer.take() else {
            entry.slot = ModuleSlot::Idle(module);
            self.snapshots.release(lease);
            return;
        };
        entry.last_run_version = self.store.global_version();
        let time = self.current_time;
        let frame = self.frame;

        let (tx, rx) = bounded(1);
        self.pool.spawn(move || {
            let started = Instant::now();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut ctx = ModuleCtx {
                    world: WorldView::Replica(lease.store()),
                    commands: &mut buffer,
                    time,
                    frame,
                };
                module.tick(&mut ctx)
            }));
            let outcome = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(payload) => Err(panic_message(payload.as_ref())),
            };
            let _ = tx.send(RunResult {
                module,
                buffer,
                lease: Some(lease),
                outcome,
                elapsed: started.elapsed(),
            });
        });
        self.modules[ix].pending = Some(PendingRun {
            rx,
            started: Instant::now(),
            abandoned: false,
        });
    }

    fn run_frame_synced_modules(&mut self) {
        let selected: Vec<usize> = (0..self.modules.len())
            .filter(|&ix| {
                self.modules[ix].policy.mode == ExecutionMode::FrameSynced && self.is_selected(ix)
            })
            .collect();
        if selected.is_empty() {
            return;
        }

        self.snapshots
            .refresh_full(&self.store, &self.store.snapshotable_mask());
        for &ix in &selected {
            let policy = self.modules[ix].policy;
            let Some(lease) = self.snapshots.acquire(&policy, &self.store, self.frame) else {
                continue;
            };
            self.dispatch_background(ix, lease);
        }

        // Join every frame-synced worker; a budget overrun abandons the
        // run (the worker finishes on its own, its writes are discarded).
        for &ix in &selected {
            let budget = Duration::from_millis(self.modules[ix].policy.max_runtime_ms);
            let Some(pending) = self.modules[ix].pending.take() else {
                continue;
            };
            let waited = pending.started.elapsed();
            let remaining = budget.saturating_sub(waited);
            match pending.rx.recv_timeout(remaining) {
                Ok(result) => self.settle_run(ix, result, false),
                Err(_) => {
                    warn!(
                        module = self.modules[ix].name,
                        "frame-synced module exceeded budget; abandoned"
                    );
                    self.modules[ix].pending = Some(PendingRun {
                        abandoned: true,
                        ..pending
                    });
                    self.charge_fault(self.modules[ix].id, FaultKind::Timeout);
                }
            }
        }
    }

    fn dispatch_async_modules(&mut self) {
        for ix in 0..self.modules.len() {
            if self.modules[ix].policy.mode != ExecutionMode::Asynchronous
                || !self.is_selected(ix)
            {
                continue;
            }
            let policy = self.modules[ix].policy;
            let Some(lease) = self.snapshots.acquire(&policy, &self.store, self.frame) else {
                continue;
            };
            self.dispatch_background(ix, lease);
        }
    }

    fn harvest_background_completions(&mut self) {
        for ix in 0..self.modules.len() {
            let Some(pending) = self.modules[ix].pending.take() else {
                continue;
            };
            match pending.rx.try_recv() {
                Ok(result) => {
                    let abandoned = pending.abandoned;
                    self.settle_run(ix, result, abandoned);
                }
                Err(_) => {
                    let mut pending = pending;
                    let budget =
                        Duration::from_millis(self.modules[ix].policy.max_runtime_ms);
                    if !pending.abandoned && pending.started.elapsed() > budget {
                        warn!(
                            module = self.modules[ix].name,
                            "asynchronous module exceeded budget; abandoned"
                        );
                        pending.abandoned = true;
                        self.charge_fault(self.modules[ix].id, FaultKind::Timeout);
                    }
                    self.modules[ix].pending = Some(pending);
                }
            }
        }
    }

    fn settle_run(&mut self, ix: usize, result: RunResult, abandoned: bool) {
        let RunResult {
            module,
            mut buffer,
            lease,
            outcome,
            elapsed,
        } = result;
        if let Some(lease) = lease {
            self.snapshots.release(lease);
        }
        let entry = &mut self.modules[ix];
        entry.slot = ModuleSlot::Idle(module);
        if abandoned {
            // Writes produced after the join are discarded; the fault was
            // already charged when the run was abandoned.
            debug!(module = entry.name, "abandoned run completed; writes discarded");
            buffer.clear();
            entry.buffer = Some(buffer);
            return;
        }
        let entry_id = entry.id;
        match outcome {
            Ok(()) => {
                entry.stats.runs += 1;
                entry.stats.total_runtime += elapsed;
                entry.breaker.record_success();
                self.harvest.push((ix, buffer));
            }
            Err(reason) => {
                warn!(module = entry.name, %reason, "background module fault");
                buffer.clear();
                entry.buffer = Some(buffer);
                self.charge_fault(entry_id, FaultKind::Error);
            }
        }
    }

    fn play_back_harvest(&mut self) {
        let mut harvest = std::mem::take(&mut self.harvest);
        // Playback order is (frame, module registration order, record
        // index); the sort restores registration order across the mixed
        // sync/frame-synced/async harvest.
        harvest.sort_by_key(|(ix, _)| *ix);
        for (ix, mut buffer) in harvest {
            match buffer.play_back(&mut self.store) {
                Ok(applied) => {
                    if applied > 0 {
                        debug!(
                            module = self.modules[ix].name,
                            applied, "command buffer applied"
                        );
                    }
                }
                Err(err) => {
                    warn!(module = self.modules[ix].name, %err, "playback error");
                    self.stats.playback_errors += 1;
                    self.charge_fault(self.modules[ix].id, FaultKind::Playback);
                }
            }
            self.modules[ix].buffer = Some(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::module::ModuleError;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingModule {
        policy: ExecutionPolicy,
        runs: Arc<AtomicU64>,
    }

    impl Module for CountingModule {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn policy(&self) -> ExecutionPolicy {
            self.policy
        }
        fn tick(&mut self, _ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingModule {
        policy: ExecutionPolicy,
    }

    impl Module for FailingModule {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn policy(&self) -> ExecutionPolicy {
            self.policy
        }
        fn tick(&mut self, _ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError> {
            Err(ModuleError::Failed("always".into()))
        }
    }

    #[test]
    fn synchronous_module_runs_every_frame() {
        let runs = Arc::new(AtomicU64::new(0));
        let mut host = ModuleHost::builder(ComponentRegistry::new())
            .with_module(Box::new(CountingModule {
                policy: ExecutionPolicy::synchronous(),
                runs: runs.clone(),
            }))
            .build()
            .unwrap();
        for _ in 0..3 {
            host.run_frame().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(host.stats().frames, 3);
    }

    #[test]
    fn frequency_gates_activation() {
        let runs = Arc::new(AtomicU64::new(0));
        let mut host = ModuleHost::builder(ComponentRegistry::new())
            .with_module(Box::new(CountingModule {
                policy: ExecutionPolicy::synchronous().with_frequency(30),
                runs: runs.clone(),
            }))
            .build()
            .unwrap();
        for _ in 0..6 {
            host.run_frame().unwrap();
        }
        // Interval 2: frames 2, 4, 6.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn breaker_opens_and_skips_failing_module() {
        let mut host = ModuleHost::builder(ComponentRegistry::new())
            .with_module(Box::new(FailingModule {
                policy: ExecutionPolicy::synchronous()
                    .with_failure_threshold(2)
                    .with_reset_timeout_ms(60_000),
            }))
            .build()
            .unwrap();
        for _ in 0..5 {
            host.run_frame().unwrap();
        }
        let (_, stats, state) = host.module_stats()[0];
        assert_eq!(stats.faults, 2);
        assert_eq!(state, BreakerState::Open);
        assert_eq!(stats.breaker_skips, 3);
    }

    #[test]
    fn global_time_singleton_is_published() {
        let mut host = ModuleHost::builder(ComponentRegistry::new())
            .build()
            .unwrap();
        host.run_frame().unwrap();
        let time = host.store().get_singleton::<GlobalTime>().unwrap().unwrap();
        assert_eq!(time.frame, 1);
    }
}
