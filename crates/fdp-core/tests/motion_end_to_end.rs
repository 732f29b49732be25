// SPDX-License-Identifier: Apache-2.0
//! End-to-end: integrate motion under the host, record, replay, compare.
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use fdp_core::demo::{register_demo_components, MotionModule, Position, Velocity};
use fdp_core::{
    ComponentRegistry, EntityStore, ModuleHost, RecordingReader, RecordingWriter,
};

#[test]
fn two_components_one_frame_then_exact_replay() {
    let mut registry = ComponentRegistry::new();
    register_demo_components(&mut registry).unwrap();
    let mut host = ModuleHost::builder(registry)
        .with_module(Box::new(MotionModule))
        .build()
        .unwrap();

    let store = host.store_mut();
    store.tick().unwrap();
    let e1 = store.create_entity();
    let e2 = store.create_entity();
    store.add_component(e1, Position { x: 1.0, y: 1.0, z: 1.0 }).unwrap();
    store.add_component(e1, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
    store.add_component(e2, Position { x: 2.0, y: 2.0, z: 2.0 }).unwrap();
    store.add_component(e2, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
    store.end_frame();

    host.run_frame().unwrap();

    assert_eq!(
        host.store().get_component::<Position>(e1).unwrap(),
        Some(Position { x: 2.0, y: 1.0, z: 1.0 })
    );
    assert_eq!(
        host.store().get_component::<Position>(e2).unwrap(),
        Some(Position { x: 3.0, y: 2.0, z: 2.0 })
    );

    // Capture a keyframe and replay it into an empty store sharing the
    // schema.
    let mut recording = Vec::new();
    let mut writer = RecordingWriter::create(&mut recording, host.registry().clone()).unwrap();
    writer.capture_keyframe(host.store(), host.poly()).unwrap();
    writer.close().unwrap();

    let mut replica = EntityStore::new(host.registry().clone());
    let mut reader = RecordingReader::open(std::io::Cursor::new(&recording)).unwrap();
    assert!(reader.read_next_frame(&mut replica, host.poly()).unwrap());
    assert!(!reader.read_next_frame(&mut replica, host.poly()).unwrap());

    assert_eq!(
        replica.get_component::<Position>(e1).unwrap(),
        Some(Position { x: 2.0, y: 1.0, z: 1.0 })
    );
    assert_eq!(
        replica.get_component::<Position>(e2).unwrap(),
        Some(Position { x: 3.0, y: 2.0, z: 2.0 })
    );

    // A keyframe cut from the replica is byte-identical to one cut from
    // the source, once each frame's tick stamp is masked out (the replica
    // runs its own version counter).
    let source_frame = keyframe_bytes(host.store(), &host);
    let replica_frame = keyframe_bytes(&replica, &host);
    assert_eq!(source_frame, replica_frame);
}

fn keyframe_bytes(store: &EntityStore, host: &ModuleHost) -> Vec<u8> {
    const HEADER_LEN: usize = 6 + 4 + 8;
    let mut buf = Vec::new();
    let mut writer = RecordingWriter::create(&mut buf, host.registry().clone()).unwrap();
    writer.capture_keyframe(store, host.poly()).unwrap();
    writer.close().unwrap();
    let mut frame = buf[HEADER_LEN..].to_vec();
    // kind byte, then the u32 tick stamp.
    frame[1..5].fill(0);
    frame
}

#[test]
fn multi_frame_run_replays_frame_by_frame() {
    let mut registry = ComponentRegistry::new();
    register_demo_components(&mut registry).unwrap();
    let mut host = ModuleHost::builder(registry)
        .with_module(Box::new(MotionModule))
        .build()
        .unwrap();

    let store = host.store_mut();
    store.tick().unwrap();
    let e = store.create_entity();
    store.add_component(e, Position { x: 0.0, y: 0.0, z: 0.0 }).unwrap();
    store.add_component(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
    store.end_frame();

    let mut recording = Vec::new();
    let mut writer = RecordingWriter::create(&mut recording, host.registry().clone()).unwrap();
    writer.capture_keyframe(host.store(), host.poly()).unwrap();

    for _ in 0..5 {
        let baseline = writer.baseline_version();
        host.run_frame().unwrap();
        writer
            .capture_delta(host.store(), baseline, host.poly())
            .unwrap();
    }
    writer.close().unwrap();

    let mut replica = EntityStore::new(host.registry().clone());
    let mut reader = RecordingReader::open(std::io::Cursor::new(&recording)).unwrap();
    while reader.read_next_frame(&mut replica, host.poly()).unwrap() {}

    assert_eq!(
        replica.get_component::<Position>(e).unwrap(),
        Some(Position { x: 5.0, y: 0.0, z: 0.0 })
    );
    assert_eq!(
        replica.get_component::<Position>(e).unwrap(),
        host.store().get_component::<Position>(e).unwrap()
    );
}
