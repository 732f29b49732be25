// SPDX-License-Identifier: Apache-2.0
//! Property tests over the universal invariants.
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};

use fdp_core::{
    CommandBuffer, ComponentRegistry, ComponentTypeId, DataPolicy, EntityStore, LifecycleState,
    ModuleId, PolyRegistry, RecordingReader, RecordingWriter,
};

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Health {
    hp: u32,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
struct Scratch {
    n: u32,
}

fn registry() -> Arc<ComponentRegistry> {
    let mut reg = ComponentRegistry::new();
    reg.register_pod::<Health>(ComponentTypeId(0), "health", DataPolicy::Snapshot)
        .unwrap();
    reg.register_pod::<Scratch>(ComponentTypeId(1), "scratch", DataPolicy::Transient)
        .unwrap();
    Arc::new(reg)
}

#[test]
fn version_increments_exactly_once_per_frame() {
    let mut store = EntityStore::new(registry());
    let mut last = store.global_version();
    for _ in 0..100 {
        let v = store.tick().unwrap();
        assert_eq!(v, last + 1);
        assert!(store.tick().is_err());
        last = v;
        store.end_frame();
    }
}

proptest! {
    /// `has_component_changed(v_{f-1})` is true iff a set/add on the type
    /// happened in frame f.
    #[test]
    fn change_detection_soundness(writes in proptest::collection::vec(
        proptest::option::of(0u32..4), 1..40,
    )) {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let entities: Vec<_> = (0..4).map(|_| store.create_entity()).collect();
        for e in &entities {
            store.add_component(*e, Health { hp: 0 }).unwrap();
        }
        store.end_frame();

        for (f, write) in writes.iter().enumerate() {
            let before = store.global_version();
            store.tick().unwrap();
            if let Some(target) = write {
                store
                    .set_component(entities[*target as usize], Health { hp: f as u32 })
                    .unwrap();
            }
            prop_assert_eq!(
                store.has_component_changed::<Health>(before).unwrap(),
                write.is_some()
            );
            store.end_frame();
        }
    }

    /// Default queries never yield Constructing, TearDown, or Ghost
    /// entities.
    #[test]
    fn default_query_yields_only_active(states in proptest::collection::vec(0u8..4, 1..32)) {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let mut expected = Vec::new();
        for (i, state) in states.iter().enumerate() {
            let lifecycle = LifecycleState::from_byte(*state).unwrap();
            let e = store.create_with_lifecycle(lifecycle);
            store.add_component(e, Health { hp: i as u32 }).unwrap();
            if lifecycle == LifecycleState::Active {
                expected.push(e);
            }
        }
        let seen: Vec<_> = store
            .query()
            .with::<Health>()
            .build()
            .unwrap()
            .iter()
            .collect();
        prop_assert_eq!(seen, expected);
    }

    /// Transient components never appear in a replica, whatever else the
    /// entity carries.
    #[test]
    fn transient_components_excluded_from_replicas(count in 1u32..16) {
        let registry = registry();
        let mut live = EntityStore::new(registry.clone());
        live.tick().unwrap();
        let mut entities = Vec::new();
        for i in 0..count {
            let e = live.create_entity();
            live.add_component(e, Health { hp: i }).unwrap();
            live.add_component(e, Scratch { n: i }).unwrap();
            entities.push(e);
        }

        let mut replica = EntityStore::new(registry);
        replica.sync_from(&live, &live.snapshotable_mask(), 0);
        for e in entities {
            prop_assert_eq!(
                replica.get_component::<Health>(e).unwrap(),
                live.get_component::<Health>(e).unwrap()
            );
            prop_assert!(!replica.has_component::<Scratch>(e).unwrap());
        }
    }

    /// A failing op stops playback at that op: everything before applied,
    /// nothing after, and membership bits still imply readable data.
    #[test]
    fn command_playback_is_prefix_atomic(poison_at in 0usize..6, tail_len in 0usize..4) {
        let registry = registry();
        let mut store = EntityStore::new(registry.clone());
        store.tick().unwrap();
        let dead = store.create_entity();
        store.destroy_entity(dead).unwrap();

        let mut buf = CommandBuffer::new(ModuleId(0), registry);
        let mut staged = Vec::new();
        for i in 0..poison_at {
            let e = buf.create_entity();
            buf.add_component(e, Health { hp: i as u32 }).unwrap();
            staged.push(e);
        }
        // The poisoned op references a dead entity.
        buf.add_component(dead, Health { hp: 999 }).unwrap();
        for _ in 0..tail_len {
            let e = buf.create_entity();
            buf.add_component(e, Health { hp: 0 }).unwrap();
        }

        prop_assert!(buf.play_back(&mut store).is_err());

        // Exactly the prefix landed.
        let live = store.query().with::<Health>().build().unwrap();
        prop_assert_eq!(live.len(), poison_at);
        for e in live.iter() {
            prop_assert!(store.get_component::<Health>(e).unwrap().is_some());
        }
    }
}

// Pinned seed so a regression reproduces identically across machines; see
// PROPTEST_SEED to explore locally.
#[test]
fn recording_round_trip_matches_source() {
    const SEED_BYTES: [u8; 32] = [
        0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(PropConfig::default(), rng);

    // Per frame, per entity: maybe set Health to a fresh value.
    let frames = proptest::collection::vec(
        proptest::collection::vec(proptest::option::of(0u32..1_000_000), 4),
        1..12,
    );

    runner
        .run(&frames, |frames| {
            let registry = registry();
            let poly = PolyRegistry::new();
            let mut live = EntityStore::new(registry.clone());
            live.tick().unwrap();
            let entities: Vec<_> = (0..4).map(|_| live.create_entity()).collect();
            for e in &entities {
                live.add_component(*e, Health { hp: 0 }).unwrap();
            }

            let mut recording = Vec::new();
            let mut writer = RecordingWriter::create(&mut recording, registry.clone()).unwrap();
            writer.capture_keyframe(&live, &poly).unwrap();
            live.end_frame();

            for frame in &frames {
                live.tick().unwrap();
                let baseline = writer.baseline_version();
                for (e, write) in entities.iter().zip(frame) {
                    if let Some(hp) = write {
                        live.set_component(*e, Health { hp: *hp }).unwrap();
                    }
                }
                writer.capture_delta(&live, baseline, &poly).unwrap();
                live.end_frame();
            }
            writer.close().unwrap();

            let mut replica = EntityStore::new(registry);
            let mut reader = RecordingReader::open(std::io::Cursor::new(&recording)).unwrap();
            while reader.read_next_frame(&mut replica, &poly).unwrap() {}

            for e in &entities {
                prop_assert_eq!(
                    replica.get_component::<Health>(*e).unwrap(),
                    live.get_component::<Health>(*e).unwrap()
                );
            }
            Ok(())
        })
        .unwrap();
}
