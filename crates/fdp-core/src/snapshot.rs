// SPDX-License-Identifier: Apache-2.0
//! Snapshot machinery: pooled stores, the full-replica double buffer, and
//! convoy-shared on-demand replicas.
//!
//! Two replica strategies serve background modules:
//!
//! - **Full replica** — two long-lived stores behind a double buffer. Each
//!   frame the back buffer is refreshed from the live store (changed chunks
//!   only, per-chunk versions skip clean ones) and flipped to the front.
//!   Frame-synced modules read the front: a consistent, one-frame-old view.
//! - **On-demand pooled** — a store leased from the free list, populated
//!   with the union of the requesting convoy's required-component masks,
//!   and returned after the last lease of the activation drops.
//!
//! A *convoy* is the set of modules sharing `(frequency_hz, mode)`. One
//! snapshot is synced per convoy activation, on the first acquire of that
//! frame; a reference count tracks leases.
//!
//! Sync happens on the main thread while no module is running; workers see
//! replicas strictly read-only. A replica still leased by an abandoned
//! worker is never handed back to the pool — the pool allocates a
//! replacement and the straggler's copy dies with its last `Arc`.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::component::ComponentRegistry;
use crate::mask::ComponentMask;
use crate::module::{ExecutionMode, ExecutionPolicy};
use crate::store::EntityStore;

/// Free list of reusable replica stores. Released stores keep their column
/// buffer capacity; re-population overwrites, it does not reallocate.
pub struct SnapshotPool {
    registry: Arc<ComponentRegistry>,
    free: Vec<EntityStore>,
    created: usize,
}

impl SnapshotPool {
    /// Creates a pool over the live store's schema, pre-warming `warm`
    /// stores.
    #[must_use]
    pub fn new(registry: Arc<ComponentRegistry>, warm: usize) -> Self {
        let mut pool = Self {
            registry,
            free: Vec::new(),
            created: 0,
        };
        for _ in 0..warm {
            let store = pool.fresh();
            pool.free.push(store);
        }
        pool
    }

    fn fresh(&mut self) -> EntityStore {
        self.created += 1;
        EntityStore::new(self.registry.clone())
    }

    /// Takes a store from the free list, growing the pool if it is empty.
    /// Growth is benign and never blocks.
    pub fn acquire(&mut self) -> EntityStore {
        if let Some(store) = self.free.pop() {
            store
        } else {
            debug!(created = self.created + 1, "snapshot pool grew");
            self.fresh()
        }
    }

    /// Clears a store (retaining capacity) and returns it to the free list.
    pub fn release(&mut self, mut store: EntityStore) {
        store.clear_retaining_capacity();
        self.free.push(store);
    }

    /// Stores currently available without allocation.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Stores ever allocated by this pool.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created
    }
}

/// Convoy grouping key: modules sharing both fields share one snapshot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConvoyKey {
    /// Declared activation frequency.
    pub frequency_hz: u32,
    /// Declared execution mode.
    pub mode: ExecutionMode,
}

struct ConvoyState {
    mask: ComponentMask,
    store: Option<Arc<EntityStore>>,
    leases: u32,
    synced_frame: Option<u64>,
}

/// Outcome of a full-replica refresh.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefreshOutcome {
    /// The back buffer was refreshed and flipped to the front.
    Synced,
    /// The back buffer is still leased (abandoned worker); readers keep the
    /// previous front. Benign, reported for stats.
    Behind,
}

/// Lease on a replica store. Returned to the manager via
/// [`SnapshotManager::release`]; dropping without releasing merely delays
/// reuse of the underlying store.
pub struct SnapshotHandle {
    store: Arc<EntityStore>,
    key: Option<ConvoyKey>,
}

impl SnapshotHandle {
    /// Read access to the replica.
    #[must_use]
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Global version the replica was synced at.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.store.global_version()
    }
}

/// Owner of both replica strategies and the convoy-sharing policy.
pub struct SnapshotManager {
    pool: SnapshotPool,
    full: [Option<Arc<EntityStore>>; 2],
    full_front: usize,
    full_synced_version: [u32; 2],
    convoys: FxHashMap<ConvoyKey, ConvoyState>,
    behind_count: u64,
}

impl SnapshotManager {
    /// Creates the manager: a pre-warmed pool plus the two full-replica
    /// buffers.
    #[must_use]
    pub fn new(registry: Arc<ComponentRegistry>, warm: usize) -> Self {
        let full = [
            Some(Arc::new(EntityStore::new(registry.clone()))),
            Some(Arc::new(EntityStore::new(registry.clone()))),
        ];
        Self {
            pool: SnapshotPool::new(registry, warm),
            full,
            full_front: 0,
            full_synced_version: [0, 0],
            convoys: FxHashMap::default(),
            behind_count: 0,
        }
    }

    /// The pool, for stats.
    #[must_use]
    pub fn pool(&self) -> &SnapshotPool {
        &self.pool
    }

    /// Times the full replica could not flip because a stale lease pinned
    /// the back buffer.
    #[must_use]
    pub fn behind_count(&self) -> u64 {
        self.behind_count
    }

    // ── full replica (persistent double buffer) ─────────────────────

    /// Refreshes the back buffer from `live` using `mask` (intersected with
    /// the snapshotable mask) and flips it to the front.
    pub fn refresh_full(&mut self, live: &EntityStore, mask: &ComponentMask) -> RefreshOutcome {
        let back = 1 - self.full_front;
        let Some(slot) = self.full[back].as_mut() else {
            self.behind_count += 1;
            return RefreshOutcome::Behind;
        };
        match Arc::get_mut(slot) {
            Some(store) => {
                store.sync_from(live, mask, self.full_synced_version[back]);
                self.full_synced_version[back] = live.global_version();
                self.full_front = back;
                RefreshOutcome::Synced
            }
            None => {
                // An abandoned frame-synced worker still reads the back
                // buffer; publishing the stale front again beats blocking.
                warn!("full replica back buffer still leased; serving stale front");
                self.behind_count += 1;
                RefreshOutcome::Behind
            }
        }
    }

    /// Leases the front (most recently synced) full replica.
    #[must_use]
    pub fn acquire_full(&self) -> SnapshotHandle {
        let store = self.full[self.full_front]
            .as_ref()
            .map_or_else(unreachable_full, Arc::clone);
        SnapshotHandle { store, key: None }
    }

    // ── on-demand pooled replicas (convoys) ─────────────────────────

    /// Adds a module's required-component set to its convoy. Called once
    /// per module at registration; the convoy mask is the running union.
    pub fn join_convoy(&mut self, key: ConvoyKey, required: ComponentMask) {
        let state = self.convoys.entry(key).or_insert_with(|| ConvoyState {
            mask: ComponentMask::EMPTY,
            store: None,
            leases: 0,
            synced_frame: None,
        });
        state.mask = state.mask.union(&required);
    }

    /// Leases the convoy's shared snapshot for this frame, syncing it
    /// lazily on the first acquire of the activation.
    pub fn acquire_convoy(
        &mut self,
        key: ConvoyKey,
        live: &EntityStore,
        frame: u64,
    ) -> SnapshotHandle {
        let state = self.convoys.entry(key).or_insert_with(|| ConvoyState {
            mask: live.snapshotable_mask(),
            store: None,
            leases: 0,
            synced_frame: None,
        });

        let needs_sync = state.synced_frame != Some(frame);
        if needs_sync {
            // Re-sync in place when the previous activation fully released;
            // otherwise lease a fresh store and let stragglers keep theirs.
            let reusable = state
                .store
                .as_mut()
                .is_some_and(|arc| Arc::get_mut(arc).is_some());
            if !reusable {
                if state.store.is_some() {
                    debug!(?key, "convoy snapshot still leased; allocating replacement");
                }
                state.store = Some(Arc::new(self.pool.acquire()));
            }
            if let Some(arc) = state.store.as_mut() {
                if let Some(store) = Arc::get_mut(arc) {
                    store.sync_from(live, &state.mask, 0);
                }
            }
            state.synced_frame = Some(frame);
        }

        state.leases += 1;
        let store = state
            .store
            .as_ref()
            .map_or_else(unreachable_full, Arc::clone);
        SnapshotHandle {
            store,
            key: Some(key),
        }
    }

    /// Policy-keyed lease: the full-replica front for frame-synced
    /// modules, the convoy store for asynchronous ones. Synchronous
    /// modules read the live store directly and get no lease.
    pub fn acquire(
        &mut self,
        policy: &ExecutionPolicy,
        live: &EntityStore,
        frame: u64,
    ) -> Option<SnapshotHandle> {
        match policy.mode {
            ExecutionMode::Synchronous => None,
            ExecutionMode::FrameSynced => Some(self.acquire_full()),
            ExecutionMode::Asynchronous => Some(self.acquire_convoy(
                ConvoyKey {
                    frequency_hz: policy.frequency_hz,
                    mode: policy.mode,
                },
                live,
                frame,
            )),
        }
    }

    /// Returns a lease. When a convoy activation's last lease drops, the
    /// underlying store goes back to the pool (unless a straggler pins it).
    pub fn release(&mut self, handle: SnapshotHandle) {
        let SnapshotHandle { store, key } = handle;
        drop(store);
        let Some(key) = key else {
            return; // full-replica leases are refcounted by the Arc alone
        };
        let Some(state) = self.convoys.get_mut(&key) else {
            return;
        };
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            if let Some(arc) = state.store.take() {
                match Arc::try_unwrap(arc) {
                    Ok(store) => self.pool.release(store),
                    Err(pinned) => {
                        // Straggler still reading; it owns the store now.
                        state.store = Some(pinned);
                    }
                }
            }
            state.synced_frame = None;
        }
    }

    /// Convoy count, for stats.
    #[must_use]
    pub fn convoy_count(&self) -> usize {
        self.convoys.len()
    }
}

// The two full buffers are constructed in `new` and only ever swapped or
// refreshed; an empty slot cannot be observed through the public API.
fn unreachable_full() -> Arc<EntityStore> {
    debug_assert!(false, "full replica buffer missing");
    Arc::new(EntityStore::new(Arc::new(ComponentRegistry::new())))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::component::DataPolicy;
    use crate::ident::ComponentTypeId;

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Pos {
        x: f32,
    }

    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Debug, Pod, Zeroable)]
    struct Scratch {
        n: u32,
    }

    fn live_store() -> EntityStore {
        let mut reg = ComponentRegistry::new();
        reg.register_pod::<Pos>(ComponentTypeId(0), "pos", DataPolicy::Snapshot)
            .unwrap();
        reg.register_pod::<Scratch>(ComponentTypeId(1), "scratch", DataPolicy::Transient)
            .unwrap();
        EntityStore::new(Arc::new(reg))
    }

    #[test]
    fn full_replica_is_one_frame_behind() {
        let mut live = live_store();
        let mut mgr = SnapshotManager::new(live.registry().clone(), 0);

        live.tick().unwrap();
        let e = live.create_entity();
        live.add_component(e, Pos { x: 1.0 }).unwrap();
        mgr.refresh_full(&live, &live.snapshotable_mask());
        live.end_frame();

        live.tick().unwrap();
        live.set_component(e, Pos { x: 2.0 }).unwrap();

        // The front still shows the value from the refresh point.
        let lease = mgr.acquire_full();
        assert_eq!(
            lease.store().get_component::<Pos>(e).unwrap(),
            Some(Pos { x: 1.0 })
        );
        mgr.release(lease);

        mgr.refresh_full(&live, &live.snapshotable_mask());
        let lease = mgr.acquire_full();
        assert_eq!(
            lease.store().get_component::<Pos>(e).unwrap(),
            Some(Pos { x: 2.0 })
        );
        mgr.release(lease);
    }

    #[test]
    fn transient_components_never_reach_replicas() {
        let mut live = live_store();
        let mut mgr = SnapshotManager::new(live.registry().clone(), 1);

        live.tick().unwrap();
        let e = live.create_entity();
        live.add_component(e, Pos { x: 3.0 }).unwrap();
        live.add_component(e, Scratch { n: 9 }).unwrap();

        let key = ConvoyKey {
            frequency_hz: 0,
            mode: ExecutionMode::Asynchronous,
        };
        let lease = mgr.acquire_convoy(key, &live, 1);
        assert_eq!(
            lease.store().get_component::<Pos>(e).unwrap(),
            Some(Pos { x: 3.0 })
        );
        assert!(!lease.store().has_component::<Scratch>(e).unwrap());
        mgr.release(lease);
    }

    #[test]
    fn convoy_shares_one_store_per_activation() {
        let mut live = live_store();
        let mut mgr = SnapshotManager::new(live.registry().clone(), 1);
        live.tick().unwrap();
        let e = live.create_entity();
        live.add_component(e, Pos { x: 1.0 }).unwrap();

        let key = ConvoyKey {
            frequency_hz: 30,
            mode: ExecutionMode::Asynchronous,
        };
        mgr.join_convoy(key, ComponentMask::from_ids(&[ComponentTypeId(0)]));

        let a = mgr.acquire_convoy(key, &live, 1);
        // Mutate after the first acquire: the second lease of the same
        // activation must observe the already-synced copy.
        live.set_component(e, Pos { x: 99.0 }).unwrap();
        let b = mgr.acquire_convoy(key, &live, 1);
        assert!(std::ptr::eq(a.store() as *const _, b.store() as *const _));
        assert_eq!(
            b.store().get_component::<Pos>(e).unwrap(),
            Some(Pos { x: 1.0 })
        );

        mgr.release(a);
        assert_eq!(mgr.pool().available(), 0);
        mgr.release(b);
        // Last release of the activation returns the store to the pool.
        assert_eq!(mgr.pool().available(), 1);

        // Next frame re-syncs and sees the new value.
        let c = mgr.acquire_convoy(key, &live, 2);
        assert_eq!(
            c.store().get_component::<Pos>(e).unwrap(),
            Some(Pos { x: 99.0 })
        );
        mgr.release(c);
    }

    #[test]
    fn pool_grows_instead_of_blocking() {
        let live = live_store();
        let mut mgr = SnapshotManager::new(live.registry().clone(), 0);
        let key_a = ConvoyKey {
            frequency_hz: 0,
            mode: ExecutionMode::Asynchronous,
        };
        let key_b = ConvoyKey {
            frequency_hz: 10,
            mode: ExecutionMode::Asynchronous,
        };
        let a = mgr.acquire_convoy(key_a, &live, 1);
        let b = mgr.acquire_convoy(key_b, &live, 1);
        assert_eq!(mgr.pool().created(), 2);
        mgr.release(a);
        mgr.release(b);
        assert_eq!(mgr.pool().available(), 2);
    }
}
