// SPDX-License-Identifier: Apache-2.0
//! Identifier types for entities, component types, modules, and nodes.
//!
//! All identifiers are small, `Copy`, and strongly typed. Wrappers exist to
//! prevent accidental mixing: an entity index is not a module id, and a
//! component type id is not a polymorphic serialization id, even though all
//! of them are "just integers" on the wire.

use bytemuck::{Pod, Zeroable};

/// Opaque handle to a row in an [`EntityStore`](crate::store::EntityStore).
///
/// An entity is a `(index, generation)` pair packed into 64 bits. The
/// generation increments every time the slot is destroyed, so a stale handle
/// held across a destroy/reuse cycle stops resolving instead of silently
/// aliasing the new occupant. A zero generation denotes the null entity.
///
/// Handles are meaningful only against the store (or a replica of the store)
/// that issued them.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Pod, Zeroable)]
pub struct Entity {
    /// Row index into the store's slot array.
    pub index: u32,
    /// Slot generation at the time the handle was issued.
    pub generation: u32,
}

impl Entity {
    /// The null entity: index 0, generation 0. Never resolves.
    pub const NULL: Self = Self {
        index: 0,
        generation: 0,
    };

    /// Creates a handle from its parts.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns true for the null handle (zero generation).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.generation == 0
    }

    /// Packs the handle into a single u64 as `(generation << 32) | index`.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpacks a handle previously produced by [`to_bits`](Self::to_bits).
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: (bits & 0xFFFF_FFFF) as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

/// Stable 8-bit component type identifier, assigned at registration.
///
/// At most 256 distinct component types may be registered per store; the id
/// doubles as the bit position in a [`ComponentMask`](crate::mask::ComponentMask)
/// and as the on-disk component tag in recordings.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ComponentTypeId(pub u8);

impl ComponentTypeId {
    /// Returns the id as a column index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier for a registered module, assigned by the host at registration
/// in ascending order. Command-buffer playback and convoy bookkeeping key off
/// this id.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ModuleId(pub u16);

/// Identifier for a node (process) in a distributed session.
///
/// Node 0 is conventionally the coordinator/master. Single-node embeddings
/// use [`NodeId::LOCAL`] throughout.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct NodeId(pub u16);

impl NodeId {
    /// The local node in a standalone (non-networked) session.
    pub const LOCAL: Self = Self(0);
}

/// Stable 16-bit identifier for a concrete type behind an interface-typed
/// (polymorphic) managed component field.
///
/// Registered before serialization; recordings that reach an unregistered
/// concrete type fail with
/// [`RecordingError::UnregisteredPolymorphicType`](crate::recorder::RecordingError::UnregisteredPolymorphicType).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PolyTypeId(pub u16);

/// Packed key for a partial-ownership record: `(descriptor_type, instance_id)`
/// in the high and low 32 bits respectively.
///
/// Ownership checks are dictionary lookups on this key, falling back to the
/// entity's primary owner when absent.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PartKey(pub u64);

impl PartKey {
    /// Packs a descriptor type and instance id into a key.
    #[inline]
    #[must_use]
    pub const fn new(descriptor_type: u32, instance_id: u32) -> Self {
        Self(((descriptor_type as u64) << 32) | instance_id as u64)
    }

    /// Returns the descriptor-type half of the key.
    #[inline]
    #[must_use]
    pub const fn descriptor_type(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the instance-id half of the key.
    #[inline]
    #[must_use]
    pub const fn instance_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn entity_bits_round_trip() {
        let e = Entity::new(0xDEAD_BEEF, 0x0123_4567);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
    }

    #[test]
    fn null_entity_is_zero_generation() {
        assert!(Entity::NULL.is_null());
        assert!(Entity::new(42, 0).is_null());
        assert!(!Entity::new(42, 1).is_null());
    }

    #[test]
    fn part_key_packs_halves() {
        let key = PartKey::new(7, 99);
        assert_eq!(key.descriptor_type(), 7);
        assert_eq!(key.instance_id(), 99);
    }
}
