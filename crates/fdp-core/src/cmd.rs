// SPDX-License-Identifier: Apache-2.0
//! Command buffers: deferred structural changes with ordered playback.
//!
//! Background modules never touch the live store; they record operations
//! into a per-module buffer that the host plays back single-threaded on the
//! main thread, in the order recorded, after background work has joined.
//! Synchronous modules may use a buffer too (played back the same frame).
//!
//! Entities created through a buffer get a *staged* handle (generation 0,
//! buffer-local index). Playback materializes the real entity and rewrites
//! every later reference to the staged handle inside the same buffer.
//! Entities arriving with foreign-assigned handles (network creation) use
//! [`CommandBuffer::create_entity_at`] instead.
//!
//! The wire layout of a record is stable and little-endian:
//! op tag (u8), entity index (u32) + generation (u32), then per-op fields —
//! component id (u8) and payload length (u32) where applicable. Managed
//! payloads and events carry a 16-bit polymorphic type id ahead of their
//! CBOR bytes.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::component::{
    ComponentKind, ComponentRegistry, ManagedComponent, PolyError, PolyRegistry,
};
use crate::ident::{ComponentTypeId, Entity, ModuleId, PolyTypeId};
use crate::store::{EntityStore, LifecycleState, StoreError};

/// Op tags, byte-stable per the record layout.
const OP_CREATE: u8 = 0;
const OP_DESTROY: u8 = 1;
const OP_ADD: u8 = 2;
const OP_REMOVE: u8 = 3;
const OP_SET: u8 = 4;
const OP_EVENT: u8 = 5;
const OP_LIFECYCLE: u8 = 6;

/// Payload of an add/set record.
pub enum OpPayload {
    /// Raw pod bytes, exactly one element long.
    Pod(Bytes),
    /// Boxed managed value, deep-copied/encoded on demand.
    Managed(Box<dyn ManagedComponent>),
}

/// One deferred operation.
pub enum CommandOp {
    /// Materialize an entity. Staged handles (generation 0) allocate fresh
    /// rows; concrete handles materialize at their exact slot.
    CreateEntity {
        /// Staged or foreign-assigned handle.
        entity: Entity,
    },
    /// Destroy an entity.
    DestroyEntity {
        /// Target handle.
        entity: Entity,
    },
    /// Add (upsert) a component.
    AddComponent {
        /// Target handle.
        entity: Entity,
        /// Component id.
        id: ComponentTypeId,
        /// Component value.
        payload: OpPayload,
    },
    /// Remove a component, sanitizing its slot.
    RemoveComponent {
        /// Target handle.
        entity: Entity,
        /// Component id.
        id: ComponentTypeId,
    },
    /// Overwrite a component that must already be present.
    SetComponent {
        /// Target handle.
        entity: Entity,
        /// Component id.
        id: ComponentTypeId,
        /// Component value.
        payload: OpPayload,
    },
    /// Publish an event onto the bus at playback.
    PublishEvent {
        /// Boxed event value.
        event: Box<dyn ManagedComponent>,
    },
    /// Set an entity's lifecycle state.
    SetLifecycle {
        /// Target handle.
        entity: Entity,
        /// New state.
        state: LifecycleState,
    },
}

/// Playback failure. Charged to the producing module by the host; the store
/// remains consistent (each op applies fully or not at all).
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// A recorded op referenced an entity that is no longer live.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A staged handle was referenced before its `CreateEntity` op.
    #[error("staged entity {0:?} referenced before creation")]
    UnresolvedStaged(Entity),
    /// `SetComponent` on an entity that does not carry the component.
    #[error("set on missing component {id:?} of {entity:?}")]
    SetMissing {
        /// Target handle.
        entity: Entity,
        /// Component id.
        id: ComponentTypeId,
    },
}

/// Encode/decode failure for the stable record layout.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Stream ended inside a record.
    #[error("truncated command record")]
    Truncated,
    /// Unknown op tag byte.
    #[error("unknown command op tag {0}")]
    UnknownOp(u8),
    /// Component id not present in the registry.
    #[error("unknown component id {0} in command record")]
    UnknownComponent(u8),
    /// Lifecycle byte out of range.
    #[error("invalid lifecycle byte {0}")]
    InvalidLifecycle(u8),
    /// Managed/event payload had no registered polymorphic codec.
    #[error(transparent)]
    Poly(#[from] PolyError),
}

/// Per-module, append-only log of deferred operations.
pub struct CommandBuffer {
    owner: ModuleId,
    registry: Arc<ComponentRegistry>,
    ops: Vec<CommandOp>,
    next_staged: u32,
}

impl CommandBuffer {
    /// Creates an empty buffer owned by `owner`.
    #[must_use]
    pub fn new(owner: ModuleId, registry: Arc<ComponentRegistry>) -> Self {
        Self {
            owner,
            registry,
            ops: Vec::new(),
            next_staged: 0,
        }
    }

    /// The module this buffer's faults are charged to.
    #[must_use]
    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    /// Number of recorded ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the buffer holds no ops.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drops all recorded ops (abandoned-worker discard path).
    pub fn clear(&mut self) {
        self.ops.clear();
        self.next_staged = 0;
    }

    /// Records an entity creation, returning a staged handle valid within
    /// this buffer for later ops.
    pub fn create_entity(&mut self) -> Entity {
        let staged = Entity::new(self.next_staged, 0);
        self.next_staged += 1;
        self.ops.push(CommandOp::CreateEntity { entity: staged });
        staged
    }

    /// Records creation at a foreign-assigned handle (network arrival).
    pub fn create_entity_at(&mut self, entity: Entity) {
        self.ops.push(CommandOp::CreateEntity { entity });
    }

    /// Records an entity destruction.
    pub fn destroy_entity(&mut self, entity: Entity) {
        self.ops.push(CommandOp::DestroyEntity { entity });
    }

    fn resolve_id<T: 'static>(&self) -> Result<ComponentTypeId, StoreError> {
        self.registry
            .id_of::<T>()
            .ok_or(StoreError::UnknownType(std::any::type_name::<T>()))
    }

    /// Records a pod component add (upsert at playback).
    pub fn add_component<T: bytemuck::Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), StoreError> {
        let id = self.resolve_id::<T>()?;
        self.ops.push(CommandOp::AddComponent {
            entity,
            id,
            payload: OpPayload::Pod(Bytes::copy_from_slice(bytemuck::bytes_of(&value))),
        });
        Ok(())
    }

    /// Records a pod component overwrite (presence required at playback).
    pub fn set_component<T: bytemuck::Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), StoreError> {
        let id = self.resolve_id::<T>()?;
        self.ops.push(CommandOp::SetComponent {
            entity,
            id,
            payload: OpPayload::Pod(Bytes::copy_from_slice(bytemuck::bytes_of(&value))),
        });
        Ok(())
    }

    /// Records a managed component add.
    pub fn add_managed<T: ManagedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), StoreError> {
        let id = self.resolve_id::<T>()?;
        self.ops.push(CommandOp::AddComponent {
            entity,
            id,
            payload: OpPayload::Managed(Box::new(value)),
        });
        Ok(())
    }

    /// Records a component removal.
    pub fn remove_component<T: Send + Sync + 'static>(
        &mut self,
        entity: Entity,
    ) -> Result<(), StoreError> {
        let id = self.resolve_id::<T>()?;
        self.ops.push(CommandOp::RemoveComponent { entity, id });
        Ok(())
    }

    /// Records an event publication. This is the only thread-safe publish
    /// path from within a module body.
    pub fn publish_event<T: Clone + Send + Sync + 'static>(&mut self, event: T) {
        self.ops.push(CommandOp::PublishEvent {
            event: Box::new(event),
        });
    }

    /// Records a lifecycle transition.
    pub fn set_lifecycle(&mut self, entity: Entity, state: LifecycleState) {
        self.ops.push(CommandOp::SetLifecycle { entity, state });
    }

    // ── playback ────────────────────────────────────────────────────

    /// Applies all recorded ops to `store` in recording order, draining the
    /// buffer. Stops at the first failing op; remaining ops are discarded
    /// (the fault is charged to the owner, and half-played partial state is
    /// bounded to fully-applied ops).
    pub fn play_back(&mut self, store: &mut EntityStore) -> Result<usize, PlaybackError> {
        let ops = std::mem::take(&mut self.ops);
        self.next_staged = 0;
        let mut staged: rustc_hash::FxHashMap<u32, Entity> = rustc_hash::FxHashMap::default();
        let mut applied = 0usize;

        let resolve = |staged: &rustc_hash::FxHashMap<u32, Entity>,
                       entity: Entity|
         -> Result<Entity, PlaybackError> {
            if entity.generation == 0 {
                staged
                    .get(&entity.index)
                    .copied()
                    .ok_or(PlaybackError::UnresolvedStaged(entity))
            } else {
                Ok(entity)
            }
        };

        for op in ops {
            match op {
                CommandOp::CreateEntity { entity } => {
                    if entity.generation == 0 {
                        let real = store.create_entity();
                        staged.insert(entity.index, real);
                    } else {
                        store.spawn_at(entity, LifecycleState::Active)?;
                    }
                }
                CommandOp::DestroyEntity { entity } => {
                    let entity = resolve(&staged, entity)?;
                    store.destroy_entity(entity)?;
                }
                CommandOp::AddComponent {
                    entity,
                    id,
                    payload,
                } => {
                    let entity = resolve(&staged, entity)?;
                    Self::apply_payload(store, entity, id, payload)?;
                }
                CommandOp::SetComponent {
                    entity,
                    id,
                    payload,
                } => {
                    let entity = resolve(&staged, entity)?;
                    let present = store
                        .slot(entity.index)
                        .is_some_and(|slot| slot.mask.contains(id));
                    if !present {
                        return Err(PlaybackError::SetMissing { entity, id });
                    }
                    Self::apply_payload(store, entity, id, payload)?;
                }
                CommandOp::RemoveComponent { entity, id } => {
                    let entity = resolve(&staged, entity)?;
                    store.remove_component_id(entity, id)?;
                }
                CommandOp::PublishEvent { event } => {
                    store.events_mut().publish_boxed(event);
                }
                CommandOp::SetLifecycle { entity, state } => {
                    let entity = resolve(&staged, entity)?;
                    store.set_lifecycle(entity, state)?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_payload(
        store: &mut EntityStore,
        entity: Entity,
        id: ComponentTypeId,
        payload: OpPayload,
    ) -> Result<(), PlaybackError> {
        match payload {
            OpPayload::Pod(bytes) => store.apply_component_bytes(entity, id, &bytes)?,
            OpPayload::Managed(value) => store.apply_managed_boxed(entity, id, value)?,
        }
        Ok(())
    }

    // ── stable record codec ─────────────────────────────────────────

    /// Encodes the buffered ops into the stable record layout.
    pub fn encode(&self, poly: &PolyRegistry) -> Result<Bytes, CodecError> {
        let mut out = Vec::new();
        for op in &self.ops {
            encode_op(op, poly, &mut out)?;
        }
        Ok(Bytes::from(out))
    }

    /// Decodes a record stream into a fresh buffer.
    pub fn decode(
        bytes: &[u8],
        owner: ModuleId,
        registry: Arc<ComponentRegistry>,
        poly: &PolyRegistry,
    ) -> Result<Self, CodecError> {
        let mut ops = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let (op, read) = decode_op(&bytes[cursor..], &registry, poly)?;
            ops.push(op);
            cursor += read;
        }
        Ok(Self {
            owner,
            registry,
            ops,
            next_staged: 0,
        })
    }
}

fn put_entity(entity: Entity, out: &mut Vec<u8>) {
    out.extend_from_slice(&entity.index.to_le_bytes());
    out.extend_from_slice(&entity.generation.to_le_bytes());
}

fn encode_payload(
    id: ComponentTypeId,
    payload: &OpPayload,
    poly: &PolyRegistry,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    out.push(id.0);
    match payload {
        OpPayload::Pod(bytes) => {
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        OpPayload::Managed(value) => {
            let mut body = Vec::new();
            let poly_id = poly.encode(value.as_ref(), &mut body)?;
            out.extend_from_slice(&((body.len() + 2) as u32).to_le_bytes());
            out.extend_from_slice(&poly_id.0.to_le_bytes());
            out.extend_from_slice(&body);
        }
    }
    Ok(())
}

fn encode_op(op: &CommandOp, poly: &PolyRegistry, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match op {
        CommandOp::CreateEntity { entity } => {
            out.push(OP_CREATE);
            put_entity(*entity, out);
        }
        CommandOp::DestroyEntity { entity } => {
            out.push(OP_DESTROY);
            put_entity(*entity, out);
        }
        CommandOp::AddComponent {
            entity,
            id,
            payload,
        } => {
            out.push(OP_ADD);
            put_entity(*entity, out);
            encode_payload(*id, payload, poly, out)?;
        }
        CommandOp::RemoveComponent { entity, id } => {
            out.push(OP_REMOVE);
            put_entity(*entity, out);
            out.push(id.0);
        }
        CommandOp::SetComponent {
            entity,
            id,
            payload,
        } => {
            out.push(OP_SET);
            put_entity(*entity, out);
            encode_payload(*id, payload, poly, out)?;
        }
        CommandOp::PublishEvent { event } => {
            out.push(OP_EVENT);
            put_entity(Entity::NULL, out);
            let mut body = Vec::new();
            let poly_id = poly.encode(event.as_ref(), &mut body)?;
            out.extend_from_slice(&poly_id.0.to_le_bytes());
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
        }
        CommandOp::SetLifecycle { entity, state } => {
            out.push(OP_LIFECYCLE);
            put_entity(*entity, out);
            out.push(*state as u8);
        }
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.bytes.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn entity(&mut self) -> Result<Entity, CodecError> {
        let index = self.u32()?;
        let generation = self.u32()?;
        Ok(Entity::new(index, generation))
    }
}

fn decode_payload(
    reader: &mut Reader<'_>,
    id: ComponentTypeId,
    registry: &ComponentRegistry,
    poly: &PolyRegistry,
) -> Result<OpPayload, CodecError> {
    let info = registry
        .info(id)
        .ok_or(CodecError::UnknownComponent(id.0))?;
    let len = reader.u32()? as usize;
    let body = reader.take(len)?;
    match info.kind {
        ComponentKind::Pod { .. } => Ok(OpPayload::Pod(Bytes::copy_from_slice(body))),
        ComponentKind::Managed => {
            if body.len() < 2 {
                return Err(CodecError::Truncated);
            }
            let poly_id = PolyTypeId(u16::from_le_bytes([body[0], body[1]]));
            let value = poly.decode(poly_id, &body[2..])?;
            Ok(OpPayload::Managed(value))
        }
    }
}

fn decode_op(
    bytes: &[u8],
    registry: &ComponentRegistry,
    poly: &PolyRegistry,
) -> Result<(CommandOp, usize), CodecError> {
    let mut reader = Reader { bytes, pos: 0 };
    let tag = reader.u8()?;
    let entity = reader.entity()?;
    let op = match tag {
        OP_CREATE => CommandOp::CreateEntity { entity },
        OP_DESTROY => CommandOp::DestroyEntity { entity },
        OP_ADD => {
            let id = ComponentTypeId(reader.u8()?);
            let payload = decode_payload(&mut reader, id, registry, poly)?;
            CommandOp::AddComponent {
                entity,
                id,
                payload,
            }
        }
        OP_REMOVE => {
            let id = ComponentTypeId(reader.u8()?);
            if registry.info(id).is_none() {
                return Err(CodecError::UnknownComponent(id.0));
            }
            CommandOp::RemoveComponent { entity, id }
        }
        OP_SET => {
            let id = ComponentTypeId(reader.u8()?);
            let payload = decode_payload(&mut reader, id, registry, poly)?;
            CommandOp::SetComponent {
                entity,
                id,
                payload,
            }
        }
        OP_EVENT => {
            let poly_id = PolyTypeId(reader.u16()?);
            let len = reader.u32()? as usize;
            let body = reader.take(len)?;
            let event = poly.decode(poly_id, body)?;
            CommandOp::PublishEvent { event }
        }
        OP_LIFECYCLE => {
            let byte = reader.u8()?;
            let state =
                LifecycleState::from_byte(byte).ok_or(CodecError::InvalidLifecycle(byte))?;
            CommandOp::SetLifecycle { entity, state }
        }
        other => return Err(CodecError::UnknownOp(other)),
    };
    Ok((op, reader.pos))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use bytemuck::{Pod, Zeroable};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::component::DataPolicy;

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Hp {
        value: u32,
    }

    #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
    struct Tag {
        label: String,
    }

    fn registry() -> Arc<ComponentRegistry> {
        let mut reg = ComponentRegistry::new();
        reg.register_pod::<Hp>(ComponentTypeId(0), "hp", DataPolicy::Snapshot)
            .unwrap();
        reg.register_managed::<Tag>(ComponentTypeId(1), "tag", DataPolicy::SnapshotViaClone)
            .unwrap();
        Arc::new(reg)
    }

    #[test]
    fn staged_create_then_component_ops_resolve() {
        let registry = registry();
        let mut store = EntityStore::new(registry.clone());
        store.tick().unwrap();

        let mut buf = CommandBuffer::new(ModuleId(0), registry);
        let staged = buf.create_entity();
        assert_eq!(staged.generation, 0);
        buf.add_component(staged, Hp { value: 5 }).unwrap();
        buf.add_managed(staged, Tag { label: "x".into() }).unwrap();

        let applied = buf.play_back(&mut store).unwrap();
        assert_eq!(applied, 3);
        assert!(buf.is_empty());

        let q = store.query().with::<Hp>().build().unwrap();
        let e = q.iter().next().unwrap();
        assert_eq!(store.get_component::<Hp>(e).unwrap(), Some(Hp { value: 5 }));
        assert_eq!(
            store.get_managed::<Tag>(e).unwrap().unwrap().label,
            "x"
        );
    }

    #[test]
    fn playback_to_dead_entity_is_playback_error() {
        let registry = registry();
        let mut store = EntityStore::new(registry.clone());
        store.tick().unwrap();
        let e = store.create_entity();
        store.destroy_entity(e).unwrap();

        let mut buf = CommandBuffer::new(ModuleId(1), registry);
        buf.add_component(e, Hp { value: 1 }).unwrap();
        assert!(matches!(
            buf.play_back(&mut store),
            Err(PlaybackError::Store(StoreError::StaleEntity(_)))
        ));
        // The failing playback drained the buffer either way.
        assert!(buf.is_empty());
    }

    #[test]
    fn set_without_presence_fails_playback() {
        let registry = registry();
        let mut store = EntityStore::new(registry.clone());
        store.tick().unwrap();
        let e = store.create_entity();

        let mut buf = CommandBuffer::new(ModuleId(0), registry);
        buf.set_component(e, Hp { value: 3 }).unwrap();
        assert!(matches!(
            buf.play_back(&mut store),
            Err(PlaybackError::SetMissing { .. })
        ));
    }

    #[test]
    fn record_codec_round_trips() {
        let registry = registry();
        let mut poly = PolyRegistry::new();
        poly.register::<Tag>(PolyTypeId(1)).unwrap();

        let mut buf = CommandBuffer::new(ModuleId(2), registry.clone());
        let staged = buf.create_entity();
        buf.add_component(staged, Hp { value: 9 }).unwrap();
        buf.add_managed(staged, Tag { label: "net".into() }).unwrap();
        buf.set_lifecycle(staged, LifecycleState::Constructing);
        buf.destroy_entity(Entity::new(7, 3));

        let encoded = buf.encode(&poly).unwrap();
        let decoded =
            CommandBuffer::decode(&encoded, ModuleId(2), registry, &poly).unwrap();
        assert_eq!(decoded.len(), 5);

        let re_encoded = decoded.encode(&poly).unwrap();
        assert_eq!(encoded, re_encoded);
    }

    #[test]
    fn event_codec_requires_poly_registration() {
        let registry = registry();
        let poly = PolyRegistry::new();
        let mut buf = CommandBuffer::new(ModuleId(0), registry);
        buf.publish_event(Tag { label: "e".into() });
        assert!(matches!(
            buf.encode(&poly),
            Err(CodecError::Poly(PolyError::Unregistered(_)))
        ));
    }

    #[test]
    fn truncated_stream_is_detected() {
        let registry = registry();
        let mut poly = PolyRegistry::new();
        poly.register::<Tag>(PolyTypeId(1)).unwrap();
        let mut buf = CommandBuffer::new(ModuleId(0), registry.clone());
        buf.add_component(Entity::new(1, 1), Hp { value: 2 }).unwrap();
        let encoded = buf.encode(&poly).unwrap();
        let cut = &encoded[..encoded.len() - 2];
        assert!(matches!(
            CommandBuffer::decode(cut, ModuleId(0), registry, &poly),
            Err(CodecError::Truncated)
        ));
    }
}
