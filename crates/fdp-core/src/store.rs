// SPDX-License-Identifier: Apache-2.0
//! The entity store: slots, lifecycle gating, columns, versions, events.
//!
//! The store owns entity slots (generation + lifecycle byte + membership
//! mask), one column per registered component type, the frame-local event
//! bus, and the global change-detection version. The same type serves as
//! the live world and as replica storage; replicas are ordinary stores
//! populated by [`sync_from`](EntityStore::sync_from) and never ticked.
//!
//! Threading: all mutation happens on the main thread. Background modules
//! read replicas and defer writes through command buffers.
//!
//! Invariants
//! - `tick()` runs at most once per frame, strictly before any mutation of
//!   that frame; a second call without [`end_frame`](EntityStore::end_frame)
//!   is `VersionMisuse`.
//! - Every membership bit corresponds to data in the matching column, and
//!   destroying an entity zero-fills its pod slots (no byte of a dead
//!   entity ever leaks into a replica or recording).
//! - Chunk versions never exceed the global version.

use std::sync::Arc;

use bytemuck::Pod;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::column::{ManagedColumn, PodColumn};
use crate::component::{ComponentKind, ComponentRegistry, DataPolicy, ManagedComponent};
use crate::event::EventBus;
use crate::ident::{ComponentTypeId, Entity, NodeId, PartKey};
use crate::mask::ComponentMask;
use crate::query::QueryBuilder;

/// Per-entity lifecycle state, gating default query visibility.
///
/// Discriminants are stable: they are the byte written by the `SetLifecycle`
/// command record.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LifecycleState {
    /// Multi-party construction in progress; hidden from default queries.
    Constructing = 0,
    /// Fully constructed; visible to default queries.
    Active = 1,
    /// Multi-party destruction in progress; hidden from default queries.
    TearDown = 2,
    /// Created from an out-of-order component payload before its
    /// construction metadata arrived; hidden from default queries.
    Ghost = 3,
}

impl LifecycleState {
    /// Decodes a lifecycle byte from a command record.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Constructing),
            1 => Some(Self::Active),
            2 => Some(Self::TearDown),
            3 => Some(Self::Ghost),
            _ => None,
        }
    }
}

/// Errors from direct store operations. These are programmer errors: they
/// indicate a stale handle, a schema hole, or a misused frame protocol, and
/// are never retried.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The handle's generation no longer matches the slot.
    #[error("stale entity handle {0:?}")]
    StaleEntity(Entity),
    /// No component registered under this id / Rust type.
    #[error("unknown component type: {0}")]
    UnknownType(&'static str),
    /// `tick()` called twice within one frame.
    #[error("tick() called twice in one frame")]
    VersionMisuse,
    /// `spawn_at` target slot is held by a different live entity.
    #[error("slot occupied: cannot materialize {0:?}")]
    SlotOccupied(Entity),
    /// Pod accessor used on a managed column or vice versa.
    #[error("component '{0}' has a different storage kind")]
    WrongKind(&'static str),
    /// `set_component` on an entity that does not carry the component.
    #[error("entity {0:?} does not carry component '{1}'")]
    MissingComponent(Entity, &'static str),
}

#[derive(Clone)]
pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) alive: bool,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) mask: ComponentMask,
}

impl Slot {
    fn free(generation: u32) -> Self {
        Self {
            generation,
            alive: false,
            lifecycle: LifecycleState::Active,
            mask: ComponentMask::EMPTY,
        }
    }
}

/// Ownership record for a networked entity: which node has authority over
/// the whole entity, and optionally over individual descriptor parts.
#[derive(Clone, Debug, Default)]
pub struct OwnershipRecord {
    /// Node holding primary authority.
    pub primary_owner: NodeId,
    partial: FxHashMap<PartKey, NodeId>,
}

impl OwnershipRecord {
    /// Creates a record with the given primary owner and no partial owners.
    #[must_use]
    pub fn new(primary_owner: NodeId) -> Self {
        Self {
            primary_owner,
            partial: FxHashMap::default(),
        }
    }

    /// Assigns authority over one `(descriptor_type, instance_id)` part.
    pub fn set_part_owner(&mut self, key: PartKey, owner: NodeId) {
        self.partial.insert(key, owner);
    }

    /// Owner of a part: the partial entry if present, else the primary.
    #[must_use]
    pub fn part_owner(&self, key: PartKey) -> NodeId {
        self.partial.get(&key).copied().unwrap_or(self.primary_owner)
    }
}

enum ColumnStorage {
    Pod(PodColumn),
    Managed(ManagedColumn),
}

/// Archetype-free, column-oriented entity/component store.
pub struct EntityStore {
    registry: Arc<ComponentRegistry>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    columns: Vec<Option<ColumnStorage>>,
    events: EventBus,
    global_version: u32,
    frame_open: bool,
    destroyed_log: Vec<Entity>,
    ownership: FxHashMap<u32, OwnershipRecord>,
    local_node: NodeId,
    singleton: Entity,
}

impl EntityStore {
    /// Creates a store over a fixed component schema. A reserved singleton
    /// row (index 0) is materialized immediately; singleton components such
    /// as `GlobalTime` live there.
    #[must_use]
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        let mut columns: Vec<Option<ColumnStorage>> = Vec::with_capacity(256);
        for _ in 0..256 {
            columns.push(None);
        }
        for info in registry.iter() {
            let storage = match info.kind {
                ComponentKind::Pod { size } => ColumnStorage::Pod(PodColumn::new(size)),
                ComponentKind::Managed => ColumnStorage::Managed(ManagedColumn::new()),
            };
            columns[info.id.index()] = Some(storage);
        }
        let mut store = Self {
            registry,
            slots: Vec::new(),
            free: Vec::new(),
            columns,
            events: EventBus::new(),
            // Version 0 is the "never written" sentinel on chunks; real
            // writes, including pre-frame population, must stamp above it.
            global_version: 1,
            frame_open: false,
            destroyed_log: Vec::new(),
            ownership: FxHashMap::default(),
            local_node: NodeId::LOCAL,
            singleton: Entity::NULL,
        };
        store.singleton = store.create_entity();
        store
    }

    /// The schema this store (and every replica of it) was built over.
    #[must_use]
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// The reserved singleton entity.
    #[must_use]
    pub fn singleton_entity(&self) -> Entity {
        self.singleton
    }

    // ── frame protocol ──────────────────────────────────────────────

    /// Advances the global version by one. Must run exactly once per frame,
    /// before any mutation of that frame. Data is untouched.
    pub fn tick(&mut self) -> Result<u32, StoreError> {
        if self.frame_open {
            return Err(StoreError::VersionMisuse);
        }
        self.frame_open = true;
        self.global_version += 1;
        self.destroyed_log.clear();
        self.events.begin_frame();
        Ok(self.global_version)
    }

    /// Closes the frame opened by [`tick`](Self::tick).
    pub fn end_frame(&mut self) {
        self.frame_open = false;
    }

    /// Current global change-detection version.
    #[inline]
    #[must_use]
    pub fn global_version(&self) -> u32 {
        self.global_version
    }

    // ── entity lifecycle ────────────────────────────────────────────

    /// Creates a fresh Active entity, reusing a free slot if one exists.
    pub fn create_entity(&mut self) -> Entity {
        self.create_with_lifecycle(LifecycleState::Active)
    }

    /// Creates a fresh entity in the given lifecycle state. The lifecycle
    /// manager stages `Constructing` and `Ghost` entities through this.
    pub fn create_with_lifecycle(&mut self, lifecycle: LifecycleState) -> Entity {
        let index = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            // Filler slots from spawn_at growth (and a wrapped counter)
            // sit at generation 0, which is the null sentinel.
            if slot.generation == 0 {
                slot.generation = 1;
            }
            slot.alive = true;
            slot.lifecycle = lifecycle;
            slot.mask = ComponentMask::EMPTY;
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 1,
                alive: true,
                lifecycle,
                mask: ComponentMask::EMPTY,
            });
            index
        };
        Entity::new(index, self.slots[index as usize].generation)
    }

    /// Materializes an entity at an exact `(index, generation)`.
    ///
    /// Replay and out-of-order network arrival need rows at foreign-chosen
    /// handles. Growing the slot array as needed; a call that targets a slot
    /// already holding the same live handle is a no-op. A slot held by a
    /// different live generation fails with `SlotOccupied`.
    pub fn spawn_at(
        &mut self,
        entity: Entity,
        lifecycle: LifecycleState,
    ) -> Result<(), StoreError> {
        if entity.is_null() {
            return Err(StoreError::StaleEntity(entity));
        }
        let index = entity.index as usize;
        while self.slots.len() <= index {
            let new_index = self.slots.len() as u32;
            self.slots.push(Slot::free(0));
            self.free.push(new_index);
        }
        let slot = &mut self.slots[index];
        if slot.alive {
            if slot.generation == entity.generation {
                return Ok(());
            }
            return Err(StoreError::SlotOccupied(Entity::new(
                entity.index,
                slot.generation,
            )));
        }
        self.free.retain(|&ix| ix != entity.index);
        slot.generation = entity.generation;
        slot.alive = true;
        slot.lifecycle = lifecycle;
        slot.mask = ComponentMask::EMPTY;
        Ok(())
    }

    /// Destroys an entity: zero-fills its pod slots, drops its managed
    /// values, clears ownership, bumps the generation, and frees the slot.
    /// The original handle is appended to the frame's destruction log.
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.check_alive(entity)?;
        let version = self.global_version;
        let mask = self.slots[entity.index as usize].mask;
        for id in mask.iter() {
            self.sanitize_slot(id, entity.index, version);
        }
        self.ownership.remove(&entity.index);
        let slot = &mut self.slots[entity.index as usize];
        slot.alive = false;
        slot.mask = ComponentMask::EMPTY;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(entity.index);
        self.destroyed_log.push(entity);
        Ok(())
    }

    fn sanitize_slot(&mut self, id: ComponentTypeId, index: u32, version: u32) {
        match &mut self.columns[id.index()] {
            Some(ColumnStorage::Pod(col)) => col.zero(index, version),
            Some(ColumnStorage::Managed(col)) => {
                col.remove(index, version);
            }
            None => {}
        }
    }

    /// Returns whether `entity` resolves to a live slot.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        !entity.is_null()
            && self
                .slots
                .get(entity.index as usize)
                .is_some_and(|s| s.alive && s.generation == entity.generation)
    }

    fn check_alive(&self, entity: Entity) -> Result<(), StoreError> {
        if self.is_alive(entity) {
            Ok(())
        } else {
            Err(StoreError::StaleEntity(entity))
        }
    }

    /// Reads an entity's lifecycle state.
    pub fn lifecycle(&self, entity: Entity) -> Result<LifecycleState, StoreError> {
        self.check_alive(entity)?;
        Ok(self.slots[entity.index as usize].lifecycle)
    }

    /// Sets an entity's lifecycle state.
    pub fn set_lifecycle(
        &mut self,
        entity: Entity,
        lifecycle: LifecycleState,
    ) -> Result<(), StoreError> {
        self.check_alive(entity)?;
        self.slots[entity.index as usize].lifecycle = lifecycle;
        Ok(())
    }

    /// Number of live entities (the reserved singleton row included).
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.slots.iter().filter(|s| s.alive).count()
    }

    /// Drains the handles destroyed since the last `tick()`. The recorder
    /// consumes this as the frame's destruction log.
    #[must_use]
    pub fn destroyed_this_frame(&self) -> &[Entity] {
        &self.destroyed_log
    }

    // ── typed component access ──────────────────────────────────────

    fn expect_id<T: 'static>(&self) -> Result<ComponentTypeId, StoreError> {
        self.registry
            .id_of::<T>()
            .ok_or(StoreError::UnknownType(std::any::type_name::<T>()))
    }

    /// Adds (or replaces) a pod component on `entity`.
    pub fn add_component<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        self.write_pod(id, entity.index, bytemuck::bytes_of(&value))?;
        self.slots[entity.index as usize].mask.set(id);
        Ok(())
    }

    /// Overwrites a pod component that must already be present.
    pub fn set_component<T: Pod + Send + Sync + 'static>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        if !self.slots[entity.index as usize].mask.contains(id) {
            return Err(StoreError::MissingComponent(
                entity,
                std::any::type_name::<T>(),
            ));
        }
        self.write_pod(id, entity.index, bytemuck::bytes_of(&value))
    }

    /// Removes a component (pod or managed), sanitizing its slot.
    pub fn remove_component<T: Send + Sync + 'static>(
        &mut self,
        entity: Entity,
    ) -> Result<bool, StoreError> {
        let id = self.expect_id::<T>()?;
        self.remove_component_id(entity, id)
    }

    /// Id-keyed variant of [`remove_component`](Self::remove_component).
    pub fn remove_component_id(
        &mut self,
        entity: Entity,
        id: ComponentTypeId,
    ) -> Result<bool, StoreError> {
        self.check_alive(entity)?;
        if self.registry.info(id).is_none() {
            return Err(StoreError::UnknownType("unregistered component id"));
        }
        let slot = &mut self.slots[entity.index as usize];
        if !slot.mask.contains(id) {
            return Ok(false);
        }
        slot.mask.clear(id);
        let version = self.global_version;
        self.sanitize_slot(id, entity.index, version);
        Ok(true)
    }

    /// Copies out a pod component, `Ok(None)` if absent.
    pub fn get_component<T: Pod + Send + Sync + 'static>(
        &self,
        entity: Entity,
    ) -> Result<Option<T>, StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        if !self.slots[entity.index as usize].mask.contains(id) {
            return Ok(None);
        }
        let Some(ColumnStorage::Pod(col)) = &self.columns[id.index()] else {
            return Err(StoreError::WrongKind(std::any::type_name::<T>()));
        };
        let value = col
            .read(entity.index)
            .map_or_else(T::zeroed, bytemuck::pod_read_unaligned::<T>);
        Ok(Some(value))
    }

    /// Whether `entity` carries component `T`.
    pub fn has_component<T: Send + Sync + 'static>(
        &self,
        entity: Entity,
    ) -> Result<bool, StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        Ok(self.slots[entity.index as usize].mask.contains(id))
    }

    /// Adds (or replaces) a managed component on `entity`.
    pub fn add_managed<T: ManagedComponent>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<(), StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        let version = self.global_version;
        let Some(ColumnStorage::Managed(col)) = &mut self.columns[id.index()] else {
            return Err(StoreError::WrongKind(std::any::type_name::<T>()));
        };
        col.insert(entity.index, Box::new(value), version);
        self.slots[entity.index as usize].mask.set(id);
        Ok(())
    }

    /// Borrows a managed component, `Ok(None)` if absent.
    pub fn get_managed<T: ManagedComponent>(
        &self,
        entity: Entity,
    ) -> Result<Option<&T>, StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        let Some(ColumnStorage::Managed(col)) = &self.columns[id.index()] else {
            return Err(StoreError::WrongKind(std::any::type_name::<T>()));
        };
        Ok(col
            .get(entity.index)
            .and_then(|v| v.as_any().downcast_ref::<T>()))
    }

    /// Mutably borrows a managed component, stamping the write. `Ok(None)`
    /// if absent.
    pub fn get_managed_mut<T: ManagedComponent>(
        &mut self,
        entity: Entity,
    ) -> Result<Option<&mut T>, StoreError> {
        let id = self.expect_id::<T>()?;
        self.check_alive(entity)?;
        let version = self.global_version;
        let Some(ColumnStorage::Managed(col)) = &mut self.columns[id.index()] else {
            return Err(StoreError::WrongKind(std::any::type_name::<T>()));
        };
        if col.get(entity.index).is_none() {
            return Ok(None);
        }
        col.touch(entity.index, version);
        Ok(col
            .get_mut(entity.index)
            .and_then(|v| v.as_any_mut().downcast_mut::<T>()))
    }

    // ── raw (id-keyed) access, used by playback, sync, and recording ─

    pub(crate) fn write_pod(
        &mut self,
        id: ComponentTypeId,
        index: u32,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let version = self.global_version;
        let Some(ColumnStorage::Pod(col)) = &mut self.columns[id.index()] else {
            return Err(StoreError::WrongKind("raw pod write"));
        };
        if data.len() != col.elem_size() {
            return Err(StoreError::WrongKind("pod payload size mismatch"));
        }
        col.write(index, data, version);
        Ok(())
    }

    /// Adds a component to `entity` from raw bytes (pod) or a boxed value
    /// (managed). Command playback and recording replay route through this.
    pub(crate) fn apply_component_bytes(
        &mut self,
        entity: Entity,
        id: ComponentTypeId,
        data: &[u8],
    ) -> Result<(), StoreError> {
        self.check_alive(entity)?;
        if self.registry.info(id).is_none() {
            return Err(StoreError::UnknownType("unregistered component id"));
        }
        self.write_pod(id, entity.index, data)?;
        self.slots[entity.index as usize].mask.set(id);
        Ok(())
    }

    /// Managed-kind counterpart of
    /// [`apply_component_bytes`](Self::apply_component_bytes).
    pub(crate) fn apply_managed_boxed(
        &mut self,
        entity: Entity,
        id: ComponentTypeId,
        value: Box<dyn ManagedComponent>,
    ) -> Result<(), StoreError> {
        self.check_alive(entity)?;
        let version = self.global_version;
        let Some(ColumnStorage::Managed(col)) = &mut self.columns[id.index()] else {
            return Err(StoreError::WrongKind("managed payload on pod column"));
        };
        col.insert(entity.index, value, version);
        self.slots[entity.index as usize].mask.set(id);
        Ok(())
    }

    pub(crate) fn read_pod_raw(&self, id: ComponentTypeId, index: u32) -> Option<&[u8]> {
        match &self.columns[id.index()] {
            Some(ColumnStorage::Pod(col)) => col.read(index),
            _ => None,
        }
    }

    pub(crate) fn managed_column(&self, id: ComponentTypeId) -> Option<&ManagedColumn> {
        match &self.columns[id.index()] {
            Some(ColumnStorage::Managed(col)) => Some(col),
            _ => None,
        }
    }

    pub(crate) fn pod_column(&self, id: ComponentTypeId) -> Option<&PodColumn> {
        match &self.columns[id.index()] {
            Some(ColumnStorage::Pod(col)) => Some(col),
            _ => None,
        }
    }

    pub(crate) fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    pub(crate) fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    // ── change detection ────────────────────────────────────────────

    /// Strict per-chunk scan: whether any chunk of `T`'s column was written
    /// after `since_version`.
    pub fn has_component_changed<T: Send + Sync + 'static>(
        &self,
        since_version: u32,
    ) -> Result<bool, StoreError> {
        let id = self.expect_id::<T>()?;
        Ok(self.has_component_changed_id(id, since_version))
    }

    /// Id-keyed variant of
    /// [`has_component_changed`](Self::has_component_changed).
    #[must_use]
    pub fn has_component_changed_id(&self, id: ComponentTypeId, since_version: u32) -> bool {
        match &self.columns[id.index()] {
            Some(ColumnStorage::Pod(col)) => col.changed_since(since_version),
            Some(ColumnStorage::Managed(col)) => col.changed_since(since_version),
            None => false,
        }
    }

    /// Union of bits for components whose policy admits them to replicas.
    #[must_use]
    pub fn snapshotable_mask(&self) -> ComponentMask {
        self.registry.snapshotable_mask()
    }

    // ── queries ─────────────────────────────────────────────────────

    /// Starts a fluent query. Default visibility is Active entities only.
    #[must_use]
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    // ── events ──────────────────────────────────────────────────────

    /// Read access to the event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Write access to the event bus (main thread only).
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    // ── singletons ──────────────────────────────────────────────────

    /// Writes a singleton component (a component on the reserved row).
    pub fn set_singleton<T: Pod + Send + Sync + 'static>(
        &mut self,
        value: T,
    ) -> Result<(), StoreError> {
        let singleton = self.singleton;
        self.add_component(singleton, value)
    }

    /// Reads a singleton component.
    pub fn get_singleton<T: Pod + Send + Sync + 'static>(
        &self,
    ) -> Result<Option<T>, StoreError> {
        self.get_component(self.singleton)
    }

    // ── ownership ───────────────────────────────────────────────────

    /// Sets the node id this store considers "local" for ownership checks.
    pub fn set_local_node(&mut self, node: NodeId) {
        self.local_node = node;
    }

    /// The node id this store considers local.
    #[must_use]
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Installs (or replaces) the ownership record for `entity`.
    pub fn set_ownership(
        &mut self,
        entity: Entity,
        record: OwnershipRecord,
    ) -> Result<(), StoreError> {
        self.check_alive(entity)?;
        self.ownership.insert(entity.index, record);
        Ok(())
    }

    /// Borrows the ownership record for `entity`, if any. Entities without
    /// a record are locally owned by convention.
    #[must_use]
    pub fn ownership(&self, entity: Entity) -> Option<&OwnershipRecord> {
        if !self.is_alive(entity) {
            return None;
        }
        self.ownership.get(&entity.index)
    }

    /// Whether the local node holds primary authority over `entity`.
    #[must_use]
    pub fn is_owned(&self, entity: Entity) -> bool {
        self.ownership(entity)
            .map_or(true, |rec| rec.primary_owner == self.local_node)
    }

    /// Whether the local node holds authority over one part of `entity`,
    /// falling back to the primary owner when no partial entry exists.
    #[must_use]
    pub fn is_owned_part(&self, entity: Entity, key: PartKey) -> bool {
        self.ownership(entity)
            .map_or(true, |rec| rec.part_owner(key) == self.local_node)
    }

    // ── replica machinery ───────────────────────────────────────────

    /// Populates this store from `src`, copying only columns selected by
    /// `mask` (intersected with the snapshotable mask) and only chunks
    /// written after `since_version`. Entity slots, lifecycle bytes, and
    /// ownership are copied wholesale; events are not.
    ///
    /// Pass `since_version = 0` for a full populate (pooled replicas);
    /// persistent double buffers pass their own previously-synced version
    /// to skip clean chunks.
    pub fn sync_from(&mut self, src: &Self, mask: &ComponentMask, since_version: u32) {
        debug_assert!(
            Arc::ptr_eq(&self.registry, &src.registry),
            "replica sync across schemas"
        );
        let copy_mask = mask.intersection(&src.snapshotable_mask());

        self.slots.clear();
        self.slots.extend(src.slots.iter().map(|slot| {
            let mut copy = slot.clone();
            copy.mask = copy.mask.intersection(&copy_mask);
            copy
        }));
        self.free.clear();
        self.free.extend_from_slice(&src.free);
        self.ownership = src.ownership.clone();
        self.local_node = src.local_node;
        self.singleton = src.singleton;
        // Current events ride along (deep copy) so background modules can
        // observe lifecycle orders; pending never crosses the boundary.
        self.events.clone_current_from(&src.events);

        for id in copy_mask.iter() {
            match (&mut self.columns[id.index()], &src.columns[id.index()]) {
                (Some(ColumnStorage::Pod(dst)), Some(ColumnStorage::Pod(s))) => {
                    dst.sync_changed_from(s, since_version);
                }
                (Some(ColumnStorage::Managed(dst)), Some(ColumnStorage::Managed(s))) => {
                    dst.clone_all_from(s);
                }
                _ => {}
            }
        }
        self.global_version = src.global_version;
    }

    /// Clears entity state while retaining column buffer capacity. Pooled
    /// replica stores are reset this way between leases.
    pub fn clear_retaining_capacity(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.ownership.clear();
        self.destroyed_log.clear();
        self.events.clear();
        self.global_version = 0;
        self.frame_open = false;
        for column in self.columns.iter_mut().flatten() {
            match column {
                ColumnStorage::Pod(col) => col.reset_versions(),
                ColumnStorage::Managed(col) => col.reset(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Health {
        hp: u32,
    }

    #[derive(Clone, PartialEq, Debug)]
    struct Route {
        hops: Vec<u16>,
    }

    fn registry() -> Arc<ComponentRegistry> {
        let mut reg = ComponentRegistry::new();
        reg.register_pod::<Health>(ComponentTypeId(0), "health", DataPolicy::Snapshot)
            .unwrap();
        reg.register_managed::<Route>(
            ComponentTypeId(1),
            "route",
            DataPolicy::SnapshotViaClone,
        )
        .unwrap();
        Arc::new(reg)
    }

    #[test]
    fn stale_handle_is_rejected_after_destroy() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let e = store.create_entity();
        store.add_component(e, Health { hp: 10 }).unwrap();
        store.destroy_entity(e).unwrap();
        assert!(matches!(
            store.get_component::<Health>(e),
            Err(StoreError::StaleEntity(_))
        ));
        // Slot reuse issues a different generation.
        let reused = store.create_entity();
        assert_eq!(reused.index, e.index);
        assert_ne!(reused.generation, e.generation);
    }

    #[test]
    fn destroy_sanitizes_component_bytes() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let e = store.create_entity();
        store.add_component(e, Health { hp: 0x5A5A_5A5A }).unwrap();
        let id = ComponentTypeId(0);
        store.destroy_entity(e).unwrap();
        let raw = store.read_pod_raw(id, e.index).unwrap();
        assert!(raw.iter().all(|&b| b == 0));
        assert_eq!(store.destroyed_this_frame(), &[e]);
    }

    #[test]
    fn double_tick_is_version_misuse() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        assert!(matches!(store.tick(), Err(StoreError::VersionMisuse)));
        store.end_frame();
        assert!(store.tick().is_ok());
    }

    #[test]
    fn set_requires_presence_add_upserts() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let e = store.create_entity();
        assert!(matches!(
            store.set_component(e, Health { hp: 1 }),
            Err(StoreError::MissingComponent(..))
        ));
        store.add_component(e, Health { hp: 1 }).unwrap();
        store.set_component(e, Health { hp: 2 }).unwrap();
        assert_eq!(
            store.get_component::<Health>(e).unwrap(),
            Some(Health { hp: 2 })
        );
    }

    #[test]
    fn unregistered_type_is_unknown() {
        let store = EntityStore::new(registry());
        let e = Entity::new(0, 1);
        assert!(matches!(
            store.get_component::<u64>(e),
            Err(StoreError::UnknownType(_))
        ));
    }

    #[test]
    fn spawn_at_materializes_exact_handle() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let foreign = Entity::new(40, 7);
        store.spawn_at(foreign, LifecycleState::Ghost).unwrap();
        assert!(store.is_alive(foreign));
        assert_eq!(store.lifecycle(foreign).unwrap(), LifecycleState::Ghost);
        // Idempotent for the same handle.
        store.spawn_at(foreign, LifecycleState::Ghost).unwrap();
        // A different generation in the same slot is occupied.
        assert!(matches!(
            store.spawn_at(Entity::new(40, 9), LifecycleState::Active),
            Err(StoreError::SlotOccupied(_))
        ));
    }

    #[test]
    fn managed_round_trip_and_mutation_stamps_version() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        let e = store.create_entity();
        store
            .add_managed(e, Route { hops: vec![1, 2] })
            .unwrap();
        store.end_frame();
        let baseline = store.global_version();
        store.tick().unwrap();
        store
            .get_managed_mut::<Route>(e)
            .unwrap()
            .unwrap()
            .hops
            .push(3);
        assert!(store.has_component_changed::<Route>(baseline).unwrap());
        assert_eq!(
            store.get_managed::<Route>(e).unwrap().unwrap().hops,
            vec![1, 2, 3]
        );
    }

    #[test]
    fn ownership_falls_back_to_primary() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        store.set_local_node(NodeId(2));
        let e = store.create_entity();
        let mut rec = OwnershipRecord::new(NodeId(1));
        rec.set_part_owner(PartKey::new(5, 0), NodeId(2));
        store.set_ownership(e, rec).unwrap();
        assert!(!store.is_owned(e));
        assert!(store.is_owned_part(e, PartKey::new(5, 0)));
        assert!(!store.is_owned_part(e, PartKey::new(6, 0)));
        // No record at all means local authority.
        let lone = store.create_entity();
        assert!(store.is_owned(lone));
    }

    #[test]
    fn singleton_lives_on_reserved_row() {
        let mut store = EntityStore::new(registry());
        store.tick().unwrap();
        store.set_singleton(Health { hp: 60 }).unwrap();
        assert_eq!(
            store.get_singleton::<Health>().unwrap(),
            Some(Health { hp: 60 })
        );
        assert_eq!(store.singleton_entity().index, 0);
    }
}
