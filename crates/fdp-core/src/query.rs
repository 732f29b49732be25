// SPDX-License-Identifier: Apache-2.0
//! Fluent entity selection over a store.
//!
//! A query materializes its entity set eagerly at [`QueryBuilder::build`]:
//! the result is a finite, frame-stable sequence in ascending entity-index
//! order (column layout order, never hash order), safe to iterate while the
//! caller goes on to mutate the store through direct APIs.
//!
//! Default visibility excludes Constructing, TearDown, and Ghost entities;
//! [`QueryBuilder::with_lifecycle`] selects exactly one state and
//! [`QueryBuilder::include_all`] lifts the filter entirely.

use crate::ident::{ComponentTypeId, Entity};
use crate::mask::ComponentMask;
use crate::store::{EntityStore, LifecycleState, StoreError};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LifecycleFilter {
    ActiveOnly,
    Exactly(LifecycleState),
    All,
}

/// Builder for an entity selection. Obtained from
/// [`EntityStore::query`].
pub struct QueryBuilder<'a> {
    store: &'a EntityStore,
    with: ComponentMask,
    without: ComponentMask,
    lifecycle: LifecycleFilter,
    error: Option<StoreError>,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(store: &'a EntityStore) -> Self {
        Self {
            store,
            with: ComponentMask::EMPTY,
            without: ComponentMask::EMPTY,
            lifecycle: LifecycleFilter::ActiveOnly,
            error: None,
        }
    }

    fn resolve<T: Send + Sync + 'static>(&mut self) -> Option<ComponentTypeId> {
        match self.store.registry().id_of::<T>() {
            Some(id) => Some(id),
            None => {
                self.error
                    .get_or_insert(StoreError::UnknownType(std::any::type_name::<T>()));
                None
            }
        }
    }

    /// Requires component `T` to be present.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self) -> Self {
        if let Some(id) = self.resolve::<T>() {
            self.with.set(id);
        }
        self
    }

    /// Requires component `T` to be absent.
    #[must_use]
    pub fn without<T: Send + Sync + 'static>(mut self) -> Self {
        if let Some(id) = self.resolve::<T>() {
            self.without.set(id);
        }
        self
    }

    /// Id-keyed variant of [`with`](Self::with).
    #[must_use]
    pub fn with_id(mut self, id: ComponentTypeId) -> Self {
        self.with.set(id);
        self
    }

    /// Selects exactly one lifecycle state instead of the default
    /// Active-only visibility.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecycleState) -> Self {
        self.lifecycle = LifecycleFilter::Exactly(lifecycle);
        self
    }

    /// Lifts the lifecycle filter: every live entity qualifies.
    #[must_use]
    pub fn include_all(mut self) -> Self {
        self.lifecycle = LifecycleFilter::All;
        self
    }

    /// Materializes the selection. Referencing an unregistered component
    /// type fails with `UnknownType`.
    pub fn build(self) -> Result<Query, StoreError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut entities = Vec::new();
        for index in 0..self.store.slot_count() {
            let Some(slot) = self.store.slot(index) else {
                continue;
            };
            if !slot.alive {
                continue;
            }
            let visible = match self.lifecycle {
                LifecycleFilter::ActiveOnly => slot.lifecycle == LifecycleState::Active,
                LifecycleFilter::Exactly(state) => slot.lifecycle == state,
                LifecycleFilter::All => true,
            };
            if !visible {
                continue;
            }
            if !slot.mask.contains_all(&self.with) {
                continue;
            }
            if slot.mask.intersects(&self.without) {
                continue;
            }
            entities.push(Entity::new(index, slot.generation));
        }
        Ok(Query { entities })
    }
}

/// A materialized, frame-stable entity selection.
#[derive(Debug)]
pub struct Query {
    entities: Vec<Entity>,
}

impl Query {
    /// Iterates the selected entities in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter().copied()
    }

    /// Number of selected entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the selection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl IntoIterator for Query {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_iter()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Arc;

    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::component::{ComponentRegistry, DataPolicy};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Marker {
        _pad: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Other {
        _pad: u32,
    }

    fn store() -> EntityStore {
        let mut reg = ComponentRegistry::new();
        reg.register_pod::<Marker>(ComponentTypeId(0), "marker", DataPolicy::Snapshot)
            .unwrap();
        reg.register_pod::<Other>(ComponentTypeId(1), "other", DataPolicy::Snapshot)
            .unwrap();
        EntityStore::new(Arc::new(reg))
    }

    #[test]
    fn default_query_excludes_non_active_lifecycles() {
        let mut store = store();
        store.tick().unwrap();
        let active = store.create_entity();
        let constructing = store.create_with_lifecycle(LifecycleState::Constructing);
        let ghost = store.create_with_lifecycle(LifecycleState::Ghost);
        for e in [active, constructing, ghost] {
            store.add_component(e, Marker { _pad: 0 }).unwrap();
        }

        let q = store.query().with::<Marker>().build().unwrap();
        let seen: Vec<Entity> = q.iter().collect();
        assert_eq!(seen, vec![active]);

        let ghosts = store
            .query()
            .with::<Marker>()
            .with_lifecycle(LifecycleState::Ghost)
            .build()
            .unwrap();
        assert_eq!(ghosts.iter().collect::<Vec<_>>(), vec![ghost]);

        let all = store.query().with::<Marker>().include_all().build().unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn without_filters_and_order_is_ascending() {
        let mut store = store();
        store.tick().unwrap();
        let a = store.create_entity();
        let b = store.create_entity();
        store.add_component(a, Marker { _pad: 0 }).unwrap();
        store.add_component(b, Marker { _pad: 0 }).unwrap();
        store.add_component(b, Other { _pad: 0 }).unwrap();

        let q = store
            .query()
            .with::<Marker>()
            .without::<Other>()
            .build()
            .unwrap();
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![a]);

        let both = store.query().with::<Marker>().build().unwrap();
        let indices: Vec<u32> = both.iter().map(|e| e.index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn unknown_type_surfaces_at_build() {
        let store = store();
        let err = store.query().with::<u64>().build().unwrap_err();
        assert!(matches!(err, StoreError::UnknownType(_)));
    }
}
