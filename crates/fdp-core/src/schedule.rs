// SPDX-License-Identifier: Apache-2.0
//! Phase-ordered, dependency-sorted system execution.
//!
//! Ordering invariant:
//! - Phases run in a fixed total order per frame:
//!   Input → BeforeSync → Simulation → PostSimulation → Export.
//! - Within a phase, units are ordered by their declared run-after /
//!   run-before relations via Kahn's algorithm; ties break by registration
//!   index, so the order is total and stable across runs.
//! - Cross-phase relations are silently ignored; phase order alone fixes
//!   their relative position.
//! - A cycle is a fatal build error naming the members, never a runtime
//!   surprise.
//!
//! A *unit* is either a single system or a flattened group: the group's
//! relations apply to the unit as a whole, and its children execute in
//! declared order.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::error;

use crate::store::EntityStore;

/// The five fixed frame phases, in execution order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Phase {
    /// Input ingestion; first to run.
    Input,
    /// Pre-replica work; runs before snapshots are cut.
    BeforeSync,
    /// Core simulation; runs after command-buffer playback.
    Simulation,
    /// Post-simulation reconciliation.
    PostSimulation,
    /// Export/egress; last to run.
    Export,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 5] = [
        Self::Input,
        Self::BeforeSync,
        Self::Simulation,
        Self::PostSimulation,
        Self::Export,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            Self::Input => 0,
            Self::BeforeSync => 1,
            Self::Simulation => 2,
            Self::PostSimulation => 3,
            Self::Export => 4,
        }
    }
}

/// Failure returned by a system body.
#[derive(Debug, Error)]
pub enum SystemError {
    /// System-level failure with a reason.
    #[error("{0}")]
    Failed(String),
    /// A direct store operation failed.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Scheduler build/run errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The per-phase relation graph is cyclic. Fatal at build time.
    #[error("cycle in schedule involving {0:?}")]
    CycleInSchedule(Vec<&'static str>),
    /// Two units registered the same name (relations would be ambiguous).
    #[error("duplicate system name '{0}'")]
    DuplicateName(&'static str),
    /// `execute_phase` before `build`.
    #[error("schedule executed before build")]
    NotBuilt,
    /// A system returned an error or panicked; the phase is aborted.
    #[error("system '{system}' faulted: {reason}")]
    SystemFault {
        /// Faulting system name.
        system: &'static str,
        /// Error or panic message.
        reason: String,
    },
}

/// A main-thread simulation step.
///
/// Systems declare a phase and optional ordering relations against peer
/// system (or group) names. Relations referencing another phase are
/// ignored.
pub trait System: Send + 'static {
    /// Stable name, referenced by peer relations.
    fn name(&self) -> &'static str;

    /// The phase this system belongs to.
    fn phase(&self) -> Phase;

    /// Peers that must run before this system.
    fn run_after(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Peers that must run after this system.
    fn run_before(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Executes one step against the live store.
    fn run(&mut self, store: &mut EntityStore, delta: f32) -> Result<(), SystemError>;
}

/// A named group of systems scheduled as one unit.
///
/// The group's relations order the whole unit; children keep their declared
/// order inside it (registration index is the tie-break).
pub struct SystemGroup {
    name: &'static str,
    phase: Phase,
    after: Vec<&'static str>,
    before: Vec<&'static str>,
    systems: Vec<Box<dyn System>>,
}

impl SystemGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new(name: &'static str, phase: Phase) -> Self {
        Self {
            name,
            phase,
            after: Vec::new(),
            before: Vec::new(),
            systems: Vec::new(),
        }
    }

    /// Orders the group after `peer`.
    #[must_use]
    pub fn after(mut self, peer: &'static str) -> Self {
        self.after.push(peer);
        self
    }

    /// Orders the group before `peer`.
    #[must_use]
    pub fn before(mut self, peer: &'static str) -> Self {
        self.before.push(peer);
        self
    }

    /// Appends a child system (declared order is execution order).
    #[must_use]
    pub fn with_system(mut self, system: Box<dyn System>) -> Self {
        self.systems.push(system);
        self
    }
}

struct Unit {
    name: &'static str,
    phase: Phase,
    after: Vec<&'static str>,
    before: Vec<&'static str>,
    systems: Vec<Box<dyn System>>,
}

/// Per-system execution counters.
#[derive(Clone, Copy, Debug)]
pub struct SystemProfile {
    /// System name.
    pub name: &'static str,
    /// Owning phase.
    pub phase: Phase,
    /// Completed runs.
    pub runs: u64,
    /// Accumulated wall time.
    pub total: Duration,
}

/// The scheduler: registration, deterministic ordering, execution.
#[derive(Default)]
pub struct Schedule {
    units: Vec<Unit>,
    order: Option<[Vec<usize>; 5]>,
    profiles: Vec<SystemProfile>,
}

impl Schedule {
    /// Creates an empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single system as its own unit.
    pub fn add_system(&mut self, system: Box<dyn System>) {
        self.order = None;
        self.units.push(Unit {
            name: system.name(),
            phase: system.phase(),
            after: system.run_after(),
            before: system.run_before(),
            systems: vec![system],
        });
    }

    /// Registers a group as one unit.
    pub fn add_group(&mut self, group: SystemGroup) {
        self.order = None;
        self.units.push(Unit {
            name: group.name,
            phase: group.phase,
            after: group.after,
            before: group.before,
            systems: group.systems,
        });
    }

    /// Resolves per-phase execution order. Must be called after the last
    /// registration and before the first `execute_phase`.
    pub fn build(&mut self) -> Result<(), ScheduleError> {
        for (i, unit) in self.units.iter().enumerate() {
            for other in &self.units[i + 1..] {
                if other.name == unit.name {
                    return Err(ScheduleError::DuplicateName(unit.name));
                }
            }
        }

        let mut order: [Vec<usize>; 5] = Default::default();
        for phase in Phase::ALL {
            order[phase.index()] = self.sort_phase(phase)?;
        }

        self.profiles = self
            .units
            .iter()
            .flat_map(|unit| {
                unit.systems.iter().map(|system| SystemProfile {
                    name: system.name(),
                    phase: unit.phase,
                    runs: 0,
                    total: Duration::ZERO,
                })
            })
            .collect();
        self.order = Some(order);
        Ok(())
    }

    /// Kahn's algorithm over one phase; ready ties resolved by registration
    /// index so the result is deterministic.
    fn sort_phase(&self, phase: Phase) -> Result<Vec<usize>, ScheduleError> {
        let members: Vec<usize> = (0..self.units.len())
            .filter(|&i| self.units[i].phase == phase)
            .collect();
        let position = |name: &str| -> Option<usize> {
            members
                .iter()
                .position(|&i| self.units[i].name == name)
        };

        let n = members.len();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        let add_edge = |edges: &mut Vec<Vec<usize>>, indegree: &mut Vec<usize>, from: usize, to: usize| {
            if !edges[from].contains(&to) {
                edges[from].push(to);
                indegree[to] += 1;
            }
        };

        for (local, &unit_ix) in members.iter().enumerate() {
            let unit = &self.units[unit_ix];
            for peer in &unit.after {
                // Cross-phase (or unknown) references are ignored by design.
                if let Some(from) = position(peer) {
                    add_edge(&mut edges, &mut indegree, from, local);
                }
            }
            for peer in &unit.before {
                if let Some(to) = position(peer) {
                    add_edge(&mut edges, &mut indegree, local, to);
                }
            }
        }

        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(n);
        while !ready.is_empty() {
            // Registration-index tie-break: members[] is in registration
            // order, so the smallest local index wins.
            let next = ready
                .iter()
                .copied()
                .min()
                .unwrap_or(0);
            ready.retain(|&i| i != next);
            sorted.push(members[next]);
            for &to in &edges[next] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.push(to);
                }
            }
        }

        if sorted.len() != n {
            let stuck: Vec<&'static str> = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.units[members[i]].name)
                .collect();
            return Err(ScheduleError::CycleInSchedule(stuck));
        }
        Ok(sorted)
    }

    /// Runs every system of `phase` in resolved order against the live
    /// store. A system error or panic aborts the phase with `SystemFault`.
    pub fn execute_phase(
        &mut self,
        phase: Phase,
        store: &mut EntityStore,
        delta: f32,
    ) -> Result<(), ScheduleError> {
        let order = self.order.as_ref().ok_or(ScheduleError::NotBuilt)?;
        let unit_ids = order[phase.index()].clone();

        for unit_ix in unit_ids {
            let unit = &mut self.units[unit_ix];
            for system in &mut unit.systems {
                let name = system.name();
                let started = Instant::now();
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    system.run(store, delta)
                }));
                let elapsed = started.elapsed();
                if let Some(profile) = self
                    .profiles
                    .iter_mut()
                    .find(|p| p.name == name)
                {
                    profile.runs += 1;
                    profile.total += elapsed;
                }
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(system = name, %err, "system error; aborting phase");
                        return Err(ScheduleError::SystemFault {
                            system: name,
                            reason: err.to_string(),
                        });
                    }
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        error!(system = name, %reason, "system panicked; aborting phase");
                        return Err(ScheduleError::SystemFault {
                            system: name,
                            reason,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Per-system execution counters, in registration order.
    #[must_use]
    pub fn profiles(&self) -> &[SystemProfile] {
        &self.profiles
    }

    /// Flattened system names in registration order. The host snapshots
    /// this around each module's `register_systems` call to learn which
    /// module owns which system (fault attribution).
    #[must_use]
    pub fn system_names(&self) -> Vec<&'static str> {
        self.units
            .iter()
            .flat_map(|unit| unit.systems.iter().map(|system| system.name()))
            .collect()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| String::from("panic with non-string payload"))
        },
        |s| String::from(*s),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Arc;

    use super::*;
    use crate::component::ComponentRegistry;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(ComponentRegistry::new()))
    }

    struct Probe {
        name: &'static str,
        phase: Phase,
        after: Vec<&'static str>,
        before: Vec<&'static str>,
        log: std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl System for Probe {
        fn name(&self) -> &'static str {
            self.name
        }
        fn phase(&self) -> Phase {
            self.phase
        }
        fn run_after(&self) -> Vec<&'static str> {
            self.after.clone()
        }
        fn run_before(&self) -> Vec<&'static str> {
            self.before.clone()
        }
        fn run(&mut self, _store: &mut EntityStore, _delta: f32) -> Result<(), SystemError> {
            self.log.lock().map_err(|_| SystemError::Failed("poisoned".into()))?.push(self.name);
            Ok(())
        }
    }

    fn probe(
        name: &'static str,
        phase: Phase,
        after: &[&'static str],
        before: &[&'static str],
        log: &std::sync::Arc<std::sync::Mutex<Vec<&'static str>>>,
    ) -> Box<dyn System> {
        Box::new(Probe {
            name,
            phase,
            after: after.to_vec(),
            before: before.to_vec(),
            log: log.clone(),
        })
    }

    #[test]
    fn relations_order_within_phase() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(probe("c", Phase::Simulation, &["b"], &[], &log));
        schedule.add_system(probe("a", Phase::Simulation, &[], &["b"], &log));
        schedule.add_system(probe("b", Phase::Simulation, &[], &[], &log));
        schedule.build().unwrap();

        let mut store = store();
        schedule
            .execute_phase(Phase::Simulation, &mut store, 0.016)
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn registration_index_breaks_ties() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(probe("second", Phase::Input, &[], &[], &log));
        schedule.add_system(probe("first", Phase::Input, &[], &[], &log));
        schedule.build().unwrap();

        let mut store = store();
        schedule
            .execute_phase(Phase::Input, &mut store, 0.016)
            .unwrap();
        // No relations: registration order is the total order.
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn cycle_is_fatal_at_build_and_names_both() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(probe("sys_a", Phase::Simulation, &["sys_b"], &[], &log));
        schedule.add_system(probe("sys_b", Phase::Simulation, &["sys_a"], &[], &log));
        let err = schedule.build().unwrap_err();
        match err {
            ScheduleError::CycleInSchedule(names) => {
                assert!(names.contains(&"sys_a"));
                assert!(names.contains(&"sys_b"));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn cross_phase_relations_are_ignored() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_system(probe("exporter", Phase::Export, &["ingest"], &[], &log));
        schedule.add_system(probe("ingest", Phase::Input, &["exporter"], &[], &log));
        // Would be a cycle if cross-phase edges counted.
        schedule.build().unwrap();
    }

    #[test]
    fn group_children_run_in_declared_order() {
        let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut schedule = Schedule::new();
        schedule.add_group(
            SystemGroup::new("movement", Phase::Simulation)
                .before("cleanup")
                .with_system(probe("steer", Phase::Simulation, &[], &[], &log))
                .with_system(probe("integrate", Phase::Simulation, &[], &[], &log)),
        );
        schedule.add_system(probe("cleanup", Phase::Simulation, &[], &[], &log));
        schedule.build().unwrap();

        let mut store = store();
        schedule
            .execute_phase(Phase::Simulation, &mut store, 0.016)
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["steer", "integrate", "cleanup"]);
    }

    struct Panicky;
    impl System for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }
        fn phase(&self) -> Phase {
            Phase::Simulation
        }
        fn run(&mut self, _store: &mut EntityStore, _delta: f32) -> Result<(), SystemError> {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_system_aborts_phase_with_fault() {
        let mut schedule = Schedule::new();
        schedule.add_system(Box::new(Panicky));
        schedule.build().unwrap();
        let mut store = store();
        let err = schedule
            .execute_phase(Phase::Simulation, &mut store, 0.016)
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::SystemFault { system: "panicky", .. }
        ));
        assert_eq!(schedule.profiles()[0].runs, 1);
    }
}
