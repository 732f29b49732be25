// SPDX-License-Identifier: Apache-2.0
//! Host-level lifecycle hand-shake: acks through command buffers, timeout
//! destruction, and query invisibility throughout.
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytemuck::{Pod, Zeroable};
use fdp_core::{
    ComponentRegistry, ComponentTypeId, ConstructionAck, ConstructionOrder, DataPolicy,
    ExecutionPolicy, LifecycleConfig, LifecycleState, Module, ModuleCtx, ModuleError,
    ModuleHost, ModuleId,
};

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Hull {
    integrity: u32,
}

/// Acks every construction order it observes, through its command buffer.
struct Acker {
    own_id: ModuleId,
}

impl Module for Acker {
    fn name(&self) -> &'static str {
        "acker"
    }
    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::synchronous()
    }
    fn tick(&mut self, ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError> {
        let orders: Vec<ConstructionOrder> = ctx
            .world
            .read()
            .events()
            .read::<ConstructionOrder>()
            .copied()
            .collect();
        for order in orders {
            ctx.commands.publish_event(ConstructionAck {
                entity: order.entity,
                module: self.own_id,
                success: true,
            });
        }
        Ok(())
    }
}

/// Registered as a participant, never acks anything.
struct Silent;

impl Module for Silent {
    fn name(&self) -> &'static str {
        "silent"
    }
    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::synchronous()
    }
    fn tick(&mut self, _ctx: &mut ModuleCtx<'_>) -> Result<(), ModuleError> {
        Ok(())
    }
}

fn registry() -> ComponentRegistry {
    let mut reg = ComponentRegistry::new();
    reg.register_pod::<Hull>(ComponentTypeId(0), "hull", DataPolicy::Snapshot)
        .unwrap();
    reg
}

fn host_with_timeout(frames: u64) -> ModuleHost {
    let config = fdp_core::HostConfig {
        lifecycle: LifecycleConfig {
            construction_timeout_frames: frames,
            ..LifecycleConfig::default()
        },
        ..fdp_core::HostConfig::default()
    };
    ModuleHost::builder(registry())
        .with_config(config)
        .with_lifecycle_participant(Box::new(Acker { own_id: ModuleId(0) }))
        .with_lifecycle_participant(Box::new(Silent))
        .build()
        .unwrap()
}

#[test]
fn one_silent_participant_times_out_and_destroys() {
    let mut host = host_with_timeout(5);

    let store = host.store_mut();
    store.tick().unwrap();
    let e = store.create_with_lifecycle(LifecycleState::Constructing);
    store.add_component(e, Hull { integrity: 100 }).unwrap();
    store.end_frame();
    host.begin_construction(e, 7).unwrap();

    for frame in 1..=4 {
        host.run_frame().unwrap();
        assert!(host.store().is_alive(e), "destroyed early at frame {frame}");
        // Never visible to default queries while the hand-shake hangs.
        let visible = host.store().query().with::<Hull>().build().unwrap();
        assert_eq!(visible.len(), 0, "constructing entity leaked at frame {frame}");
    }

    host.run_frame().unwrap();
    assert!(!host.store().is_alive(e));
    let stats = host.lifecycle_stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.destroyed, 1);
    assert_eq!(stats.constructed, 0);
}

#[test]
fn full_ack_set_activates_entity() {
    // Both participants ack: two acker modules with their registration
    // ids.
    let mut host = ModuleHost::builder(registry())
        .with_lifecycle_participant(Box::new(Acker { own_id: ModuleId(0) }))
        .with_lifecycle_participant(Box::new(Acker { own_id: ModuleId(1) }))
        .build()
        .unwrap();

    let store = host.store_mut();
    store.tick().unwrap();
    let e = store.create_with_lifecycle(LifecycleState::Constructing);
    store.add_component(e, Hull { integrity: 100 }).unwrap();
    store.end_frame();
    host.begin_construction(e, 7).unwrap();

    // Frame 1 swaps the order in; frame 2 the modules see it and ack (the
    // acks play back and resolve within frame 2).
    host.run_frame().unwrap();
    assert_eq!(
        host.store().lifecycle(e).unwrap(),
        LifecycleState::Constructing
    );
    host.run_frame().unwrap();
    assert_eq!(host.store().lifecycle(e).unwrap(), LifecycleState::Active);
    assert_eq!(host.lifecycle_stats().constructed, 1);

    let visible = host.store().query().with::<Hull>().build().unwrap();
    assert_eq!(visible.iter().collect::<Vec<_>>(), vec![e]);
}
