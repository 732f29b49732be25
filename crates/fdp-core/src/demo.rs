// SPDX-License-Identifier: Apache-2.0
//! Motion demo: the smallest complete world the runtime can host.
//!
//! Two pod components, one Simulation-phase integrator, and an
//! asynchronous audit module. The CLI uses this world for `record`,
//! `replay`, and `bench`; the end-to-end tests use it as their fixture.

use bytemuck::{Pod, Zeroable};

use crate::component::{ComponentRegistry, DataPolicy, RegistryError};
use crate::ident::ComponentTypeId;
use crate::mask::ComponentMask;
use crate::module::{ExecutionPolicy, Module, ModuleCtx, ModuleError};
use crate::schedule::{Phase, Schedule, System, SystemError};
use crate::store::EntityStore;

/// Component id for [`Position`].
pub const POSITION_COMPONENT: ComponentTypeId = ComponentTypeId(0);
/// Component id for [`Velocity`].
pub const VELOCITY_COMPONENT: ComponentTypeId = ComponentTypeId(1);

/// World-space position.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
}

/// Per-step velocity.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
pub struct Velocity {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
}

/// Registers the demo components at their stable ids.
pub fn register_demo_components(registry: &mut ComponentRegistry) -> Result<(), RegistryError> {
    registry.register_pod::<Position>(POSITION_COMPONENT, "position", DataPolicy::Snapshot)?;
    registry.register_pod::<Velocity>(VELOCITY_COMPONENT, "velocity", DataPolicy::Snapshot)?;
    Ok(())
}

/// Spawns `count` entities on a line, each drifting along +X one unit per
/// step.
pub fn spawn_drifters(store: &mut EntityStore, count: u32) {
    for i in 0..count {
        let e = store.create_entity();
        let base = i as f32;
        if store
            .add_component(e, Position { x: base, y: base, z: 0.0 })
            .and_then(|()| store.add_component(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }))
            .is_err()
        {
            break;
        }
    }
}

/// Fixed-step Euler integrator over `(Position, Velocity)`.
pub struct MotionSystem {
    /// Distance scale applied to velocity each run (1.0 = one full step).
    pub step: f32,
}

impl System for MotionSystem {
    fn name(&self) -> &'static str {
        "integrate_motion"
    }

    fn phase(&self) -> Phase {
        Phase::Simulation
    }

    fn run(&mut self, store: &mut EntityStore, _delta: f32) -> Result<(), SystemError> {
        let moving = store
            .query()
            .with::<Position>()
            .with::<Velocity>()
            .build()?;
        for entity in moving.iter() {
            let (Some(pos), Some(vel)) = (
                store.get_component::<Position>(entity)?,
                store.get_component::<Velocity>(entity)?,
            ) else {
                continue;
            };
            store.set_component(
                entity,
                Position {
                    x: pos.x + vel.x * self.step,
                    y: pos.y + vel.y * self.step,
                    z: pos.z + vel.z * self.step,
                },
            )?;
        }
        Ok(())
    }
}

/// Synchronous module contributing the integrator to the schedule.
pub struct MotionModule;

impl Module for MotionModule {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::synchronous()
    }

    fn register_systems(&mut self, schedule: &mut Schedule) {
        schedule.add_system(Box::new(MotionSystem { step: 1.0 }));
    }

    fn tick(&mut self, _ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Asynchronous audit: counts moving entities in its pooled replica.
/// Exists to keep the background path honest in benches and samples.
pub struct MotionAuditModule {
    observed: u64,
}

impl MotionAuditModule {
    /// Creates an audit module with an empty tally.
    #[must_use]
    pub fn new() -> Self {
        Self { observed: 0 }
    }

    /// Entities observed moving across all activations.
    #[must_use]
    pub fn observed(&self) -> u64 {
        self.observed
    }
}

impl Default for MotionAuditModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for MotionAuditModule {
    fn name(&self) -> &'static str {
        "motion_audit"
    }

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::asynchronous()
            .with_frequency(30)
            .with_required_components(ComponentMask::from_ids(&[
                POSITION_COMPONENT,
                VELOCITY_COMPONENT,
            ]))
    }

    fn tick(&mut self, ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError> {
        let replica = ctx.world.read();
        let moving = replica
            .query()
            .with::<Position>()
            .with::<Velocity>()
            .build()
            .map_err(ModuleError::Store)?;
        self.observed += moving.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Arc;

    use super::*;

    #[test]
    fn integrator_moves_entities_one_step() {
        let mut registry = ComponentRegistry::new();
        register_demo_components(&mut registry).unwrap();
        let mut store = EntityStore::new(Arc::new(registry));
        store.tick().unwrap();

        let e1 = store.create_entity();
        store.add_component(e1, Position { x: 1.0, y: 1.0, z: 1.0 }).unwrap();
        store.add_component(e1, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();

        let mut system = MotionSystem { step: 1.0 };
        system.run(&mut store, 1.0).unwrap();

        assert_eq!(
            store.get_component::<Position>(e1).unwrap(),
            Some(Position { x: 2.0, y: 1.0, z: 1.0 })
        );
    }
}
