// SPDX-License-Identifier: Apache-2.0
//! Component type registration: stable ids, storage kinds, data policies.
//!
//! A store's component schema is fixed at creation. Each type gets a stable
//! 8-bit [`ComponentTypeId`] (also its recording tag and mask bit) and a
//! [`DataPolicy`] deciding whether replicas and recordings carry it.
//!
//! Two storage kinds exist:
//! - **Pod** — blittable plain data ([`bytemuck::Pod`]), stored in chunked
//!   byte columns and copied byte-exactly into replicas and recordings.
//! - **Managed** — reference types stored boxed in a side store. They enter
//!   replicas only under [`DataPolicy::SnapshotViaClone`] (deep copy) and
//!   default to [`DataPolicy::Transient`] otherwise.
//!
//! Registries are shared between a live store and all of its replicas via
//! `Arc`; a replica never re-registers.

use std::any::{Any, TypeId};

use bytemuck::Pod;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::ident::{ComponentTypeId, PolyTypeId};
use crate::mask::ComponentMask;

/// How a component participates in replicas and recordings.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataPolicy {
    /// Byte-copied into every replica and recording. Default for pod types.
    Snapshot,
    /// Deep-cloned into replicas and CBOR-encoded into recordings. Opt-in
    /// for managed types.
    SnapshotViaClone,
    /// Excluded from every non-live store and every recording. Default for
    /// managed types without an explicit policy.
    Transient,
}

/// Storage kind of a registered component.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ComponentKind {
    /// Blittable plain data stored in chunked columns.
    Pod {
        /// Size of one element in bytes.
        size: usize,
    },
    /// Boxed reference type stored in the managed side store.
    Managed,
}

/// Reference-typed component value, stored boxed.
///
/// Blanket-implemented for every `Clone + Send + Sync + 'static` type, so
/// plain structs qualify without ceremony. The clone hook is what
/// [`DataPolicy::SnapshotViaClone`] uses to materialize replica copies.
pub trait ManagedComponent: Any + Send + Sync {
    /// Deep-copies the value for replica materialization.
    fn clone_managed(&self) -> Box<dyn ManagedComponent + 'static>;

    /// Upcasts to [`Any`] for typed downcast reads.
    fn as_any(&self) -> &dyn Any;

    /// Upcasts to mutable [`Any`] for typed downcast writes.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Clone + Send + Sync + 'static> ManagedComponent for T {
    fn clone_managed(&self) -> Box<dyn ManagedComponent + 'static> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registration record for one component type.
#[derive(Clone, Copy, Debug)]
pub struct ComponentInfo {
    /// Stable 8-bit id; mask bit and recording tag.
    pub id: ComponentTypeId,
    /// Human-readable name, used in errors and diagnostics.
    pub name: &'static str,
    /// Storage kind.
    pub kind: ComponentKind,
    /// Replica/recording participation.
    pub policy: DataPolicy,
    rust_type: TypeId,
}

/// Errors from component registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two registrations claimed the same 8-bit id.
    #[error("component id {0} already registered as '{1}'")]
    DuplicateComponentId(u8, &'static str),
    /// The same Rust type was registered twice.
    #[error("component type '{0}' already registered")]
    TypeAlreadyRegistered(&'static str),
    /// The policy does not fit the storage kind (e.g. `SnapshotViaClone`
    /// on a pod type, or `Snapshot` on a managed type).
    #[error("policy {policy:?} is invalid for {kind:?} component '{name}'")]
    InvalidPolicy {
        /// Offending component name.
        name: &'static str,
        /// Storage kind being registered.
        kind: ComponentKind,
        /// Rejected policy.
        policy: DataPolicy,
    },
}

/// Immutable-after-build schema: id assignments, kinds, policies.
#[derive(Debug)]
pub struct ComponentRegistry {
    infos: Vec<Option<ComponentInfo>>,
    by_type: FxHashMap<TypeId, ComponentTypeId>,
    snapshot_mask: ComponentMask,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            infos: vec![None; 256],
            by_type: FxHashMap::default(),
            snapshot_mask: ComponentMask::new(),
        }
    }

    /// Registers a blittable component type under `id`.
    ///
    /// Valid policies are [`DataPolicy::Snapshot`] (the default choice for
    /// plain data) and [`DataPolicy::Transient`].
    pub fn register_pod<T: Pod + Send + Sync + 'static>(
        &mut self,
        id: ComponentTypeId,
        name: &'static str,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId, RegistryError> {
        let kind = ComponentKind::Pod {
            size: std::mem::size_of::<T>(),
        };
        if policy == DataPolicy::SnapshotViaClone {
            return Err(RegistryError::InvalidPolicy { name, kind, policy });
        }
        self.insert::<T>(id, name, kind, policy)
    }

    /// Registers a managed (reference) component type under `id`.
    ///
    /// Valid policies are [`DataPolicy::SnapshotViaClone`] (opt-in deep
    /// copy) and [`DataPolicy::Transient`]. Managed types that skip policy
    /// annotation should be registered Transient; that is the platform
    /// default for mutable reference types, not an error.
    pub fn register_managed<T: ManagedComponent>(
        &mut self,
        id: ComponentTypeId,
        name: &'static str,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId, RegistryError> {
        let kind = ComponentKind::Managed;
        if policy == DataPolicy::Snapshot {
            return Err(RegistryError::InvalidPolicy { name, kind, policy });
        }
        self.insert::<T>(id, name, kind, policy)
    }

    fn insert<T: 'static>(
        &mut self,
        id: ComponentTypeId,
        name: &'static str,
        kind: ComponentKind,
        policy: DataPolicy,
    ) -> Result<ComponentTypeId, RegistryError> {
        if let Some(existing) = &self.infos[id.index()] {
            return Err(RegistryError::DuplicateComponentId(id.0, existing.name));
        }
        let rust_type = TypeId::of::<T>();
        if self.by_type.contains_key(&rust_type) {
            return Err(RegistryError::TypeAlreadyRegistered(name));
        }
        let info = ComponentInfo {
            id,
            name,
            kind,
            policy,
            rust_type,
        };
        self.infos[id.index()] = Some(info);
        self.by_type.insert(rust_type, id);
        if policy != DataPolicy::Transient {
            self.snapshot_mask.set(id);
        }
        Ok(id)
    }

    /// Looks up the registration record for `id`.
    #[inline]
    #[must_use]
    pub fn info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos[id.index()].as_ref()
    }

    /// Looks up the component id assigned to Rust type `T`.
    #[inline]
    #[must_use]
    pub fn id_of<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Dynamic-typed variant of [`id_of`](Self::id_of); reactive triggers
    /// resolve their watched component through this.
    #[inline]
    #[must_use]
    pub fn id_of_dyn(&self, rust_type: TypeId) -> Option<ComponentTypeId> {
        self.by_type.get(&rust_type).copied()
    }

    /// Union of bits for components whose policy is `Snapshot` or
    /// `SnapshotViaClone`. Transient components are never in this mask.
    #[inline]
    #[must_use]
    pub fn snapshotable_mask(&self) -> ComponentMask {
        self.snapshot_mask
    }

    /// Iterates registered component infos in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter().filter_map(Option::as_ref)
    }

    /// Returns whether the stored Rust type for `id` is `T`.
    ///
    /// Typed accessors use this to reject mismatched downcasts before
    /// touching column bytes.
    #[inline]
    #[must_use]
    pub fn is_rust_type<T: 'static>(&self, id: ComponentTypeId) -> bool {
        self.info(id)
            .is_some_and(|info| info.rust_type == TypeId::of::<T>())
    }
}

/// Errors from polymorphic encode/decode.
#[derive(Debug, Error)]
pub enum PolyError {
    /// The concrete type was never registered with a stable id.
    #[error("unregistered polymorphic type: {0}")]
    Unregistered(&'static str),
    /// Two registrations claimed the same 16-bit id.
    #[error("polymorphic id {0:?} already registered")]
    DuplicateId(PolyTypeId),
    /// No decoder registered for an id found in a byte stream.
    #[error("unknown polymorphic id {0:?} in stream")]
    UnknownId(PolyTypeId),
    /// CBOR encode failure.
    #[error("polymorphic encode failed: {0}")]
    Encode(String),
    /// CBOR decode failure.
    #[error("polymorphic decode failed: {0}")]
    Decode(String),
}

#[derive(Clone, Copy)]
struct PolyCodec {
    id: PolyTypeId,
    encode: fn(&dyn ManagedComponent, &mut Vec<u8>) -> Result<(), PolyError>,
    decode: fn(&[u8]) -> Result<Box<dyn ManagedComponent>, PolyError>,
}

/// Stable-id registry for reference types crossing a byte boundary.
///
/// Managed components (and events riding command records) are CBOR-encoded;
/// the concrete type behind the box must be registered here with a stable
/// 16-bit id before anything serializes it. Serialization of an
/// unregistered type is an error, not a silent skip.
#[derive(Default)]
pub struct PolyRegistry {
    by_rust: FxHashMap<TypeId, PolyCodec>,
    by_id: FxHashMap<PolyTypeId, PolyCodec>,
}

impl PolyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers concrete type `T` under `id`.
    pub fn register<T>(&mut self, id: PolyTypeId) -> Result<(), PolyError>
    where
        T: ManagedComponent + Serialize + DeserializeOwned,
    {
        if self.by_id.contains_key(&id) {
            return Err(PolyError::DuplicateId(id));
        }
        let codec = PolyCodec {
            id,
            encode: encode_cbor::<T>,
            decode: decode_cbor::<T>,
        };
        self.by_rust.insert(TypeId::of::<T>(), codec);
        self.by_id.insert(id, codec);
        Ok(())
    }

    /// Encodes `value` as `(id, cbor-bytes)`. The value's dynamic type must
    /// be registered.
    pub fn encode(
        &self,
        value: &dyn ManagedComponent,
        out: &mut Vec<u8>,
    ) -> Result<PolyTypeId, PolyError> {
        let codec = self
            .by_rust
            .get(&value.as_any().type_id())
            .ok_or(PolyError::Unregistered("<dynamic managed value>"))?;
        (codec.encode)(value, out)?;
        Ok(codec.id)
    }

    /// Decodes a value previously encoded under `id`.
    pub fn decode(
        &self,
        id: PolyTypeId,
        bytes: &[u8],
    ) -> Result<Box<dyn ManagedComponent>, PolyError> {
        let codec = self.by_id.get(&id).ok_or(PolyError::UnknownId(id))?;
        (codec.decode)(bytes)
    }

    /// Whether the dynamic type of `value` is registered.
    #[must_use]
    pub fn is_registered(&self, value: &dyn ManagedComponent) -> bool {
        self.by_rust.contains_key(&value.as_any().type_id())
    }
}

fn encode_cbor<T: ManagedComponent + Serialize>(
    value: &dyn ManagedComponent,
    out: &mut Vec<u8>,
) -> Result<(), PolyError> {
    let typed = value
        .as_any()
        .downcast_ref::<T>()
        .ok_or(PolyError::Unregistered(std::any::type_name::<T>()))?;
    ciborium::ser::into_writer(typed, out).map_err(|e| PolyError::Encode(e.to_string()))
}

fn decode_cbor<T: ManagedComponent + DeserializeOwned>(
    bytes: &[u8],
) -> Result<Box<dyn ManagedComponent>, PolyError> {
    let typed: T =
        ciborium::de::from_reader(bytes).map_err(|e| PolyError::Decode(e.to_string()))?;
    Ok(Box::new(typed))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Clone)]
    struct Path {
        waypoints: Vec<u32>,
    }

    #[test]
    fn pod_registration_enters_snapshot_mask() {
        let mut reg = ComponentRegistry::new();
        let id = reg
            .register_pod::<Pos>(ComponentTypeId(3), "pos", DataPolicy::Snapshot)
            .unwrap();
        assert_eq!(reg.id_of::<Pos>(), Some(id));
        assert!(reg.snapshotable_mask().contains(id));
        assert!(matches!(
            reg.info(id).unwrap().kind,
            ComponentKind::Pod { size: 8 }
        ));
    }

    #[test]
    fn transient_managed_stays_out_of_snapshot_mask() {
        let mut reg = ComponentRegistry::new();
        let id = reg
            .register_managed::<Path>(ComponentTypeId(9), "path", DataPolicy::Transient)
            .unwrap();
        assert!(!reg.snapshotable_mask().contains(id));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut reg = ComponentRegistry::new();
        reg.register_pod::<Pos>(ComponentTypeId(1), "pos", DataPolicy::Snapshot)
            .unwrap();
        let err = reg
            .register_managed::<Path>(ComponentTypeId(1), "path", DataPolicy::Transient)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateComponentId(1, "pos")));
    }

    #[test]
    fn pod_cannot_opt_into_clone_policy() {
        let mut reg = ComponentRegistry::new();
        let err = reg
            .register_pod::<Pos>(ComponentTypeId(0), "pos", DataPolicy::SnapshotViaClone)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPolicy { .. }));
    }

    #[test]
    fn poly_round_trip_and_unregistered_failure() {
        use serde::{Deserialize, Serialize};

        #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
        struct Waypoints {
            ids: Vec<u32>,
        }

        let mut poly = PolyRegistry::new();
        poly.register::<Waypoints>(PolyTypeId(7)).unwrap();

        let value = Waypoints { ids: vec![4, 5] };
        let mut buf = Vec::new();
        let id = poly.encode(&value, &mut buf).unwrap();
        assert_eq!(id, PolyTypeId(7));

        let decoded = poly.decode(id, &buf).unwrap();
        let decoded = decoded.as_any().downcast_ref::<Waypoints>().unwrap();
        assert_eq!(decoded, &value);

        let stranger = String::from("not registered");
        let mut sink = Vec::new();
        assert!(matches!(
            poly.encode(&stranger, &mut sink),
            Err(PolyError::Unregistered(_))
        ));
        assert!(matches!(
            poly.decode(PolyTypeId(9), &buf),
            Err(PolyError::UnknownId(_))
        ));
    }

    #[test]
    fn managed_clone_hook_deep_copies() {
        let original = Path {
            waypoints: vec![1, 2, 3],
        };
        let boxed: Box<dyn ManagedComponent> = Box::new(original);
        let copy = boxed.clone_managed();
        let copy = copy.as_any().downcast_ref::<Path>().unwrap();
        assert_eq!(copy.waypoints, vec![1, 2, 3]);
    }
}
