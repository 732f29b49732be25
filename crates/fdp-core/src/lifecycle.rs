// SPDX-License-Identifier: Apache-2.0
//! Entity lifecycle manager: multi-party construction and destruction.
//!
//! Construction and destruction are hand-shakes, not single calls. The
//! manager publishes an order event, collects per-module acknowledgements
//! from the bus, and only transitions the entity once *every* registered
//! participant has acked successfully. A NACK destroys immediately; a
//! configurable frame-count timeout destroys (or force-destroys) stragglers.
//!
//! The pending ledger is append-only per entity: acks accumulate, they are
//! never retracted. Entities are keyed by packed handle so a slot reused
//! under a new generation can never inherit a predecessor's acks.
//!
//! Ghost admission covers out-of-order transport: a component payload that
//! arrives before its construction metadata materializes the entity in
//! Ghost (hidden) state; the metadata's later arrival promotes it to
//! Constructing with its components intact.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::ident::{Entity, ModuleId};
use crate::store::{EntityStore, LifecycleState, StoreError};

/// Why an entity is being destroyed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DestructionReason {
    /// Normal teardown request.
    Requested,
    /// Construction NACKed or timed out.
    ConstructionFailed,
    /// Destruction hand-shake timed out; destruction was forced.
    Timeout,
}

/// Published when construction of an entity begins.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ConstructionOrder {
    /// Entity under construction.
    pub entity: Entity,
    /// Application-level descriptor type for the entity.
    pub type_id: u32,
}

/// Per-module response to a [`ConstructionOrder`].
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ConstructionAck {
    /// Entity under construction.
    pub entity: Entity,
    /// Acknowledging module.
    pub module: ModuleId,
    /// False aborts the construction immediately.
    pub success: bool,
}

/// Published when destruction of an entity begins.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct DestructionOrder {
    /// Entity being torn down.
    pub entity: Entity,
    /// Why.
    pub reason: DestructionReason,
}

/// Per-module response to a [`DestructionOrder`].
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct DestructionAck {
    /// Entity being torn down.
    pub entity: Entity,
    /// Acknowledging module.
    pub module: ModuleId,
}

/// Frame-count timeouts for the hand-shakes.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleConfig {
    /// Frames a construction may wait for its acks.
    pub construction_timeout_frames: u64,
    /// Frames a destruction may wait before being forced.
    pub destruction_timeout_frames: u64,
    /// Frames a ghost may wait for its construction metadata.
    pub ghost_timeout_frames: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            construction_timeout_frames: 300,
            destruction_timeout_frames: 300,
            ghost_timeout_frames: 300,
        }
    }
}

/// Monitoring counters.
#[derive(Clone, Copy, Default, Debug)]
pub struct LifecycleStats {
    /// Hand-shakes currently in flight.
    pub pending: usize,
    /// Entities that reached Active through the hand-shake.
    pub constructed: u64,
    /// Entities destroyed through the manager (any reason).
    pub destroyed: u64,
    /// Hand-shakes resolved by timeout.
    pub timeouts: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PendingKind {
    Construct,
    Destruct,
}

struct PendingEntry {
    entity: Entity,
    kind: PendingKind,
    started_frame: u64,
    acks: FxHashSet<ModuleId>,
}

/// The lifecycle manager. Driven by the host on the main thread, once per
/// frame, after command-buffer playback (so acks recorded by background
/// modules are already on the bus).
pub struct LifecycleManager {
    participants: Vec<ModuleId>,
    config: LifecycleConfig,
    // BTreeMap: timeout processing iterates in handle order, keeping
    // destruction order deterministic across runs.
    pending: BTreeMap<u64, PendingEntry>,
    ghosts: BTreeMap<u64, u64>,
    stats: LifecycleStats,
}

impl LifecycleManager {
    /// Creates a manager with no participants (hand-shakes resolve on the
    /// next update) and default timeouts.
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            participants: Vec::new(),
            config,
            pending: BTreeMap::new(),
            ghosts: BTreeMap::new(),
            stats: LifecycleStats::default(),
        }
    }

    /// Registers a module whose ACK every hand-shake must collect.
    pub fn register_participant(&mut self, module: ModuleId) {
        if !self.participants.contains(&module) {
            self.participants.push(module);
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            pending: self.pending.len(),
            ..self.stats
        }
    }

    /// Begins the construction hand-shake for `entity`.
    ///
    /// The entity enters (or stays in) Constructing and a
    /// [`ConstructionOrder`] is published. A Ghost entity is promoted here:
    /// its components survive, only the state changes.
    pub fn begin_construction(
        &mut self,
        store: &mut EntityStore,
        entity: Entity,
        type_id: u32,
        frame: u64,
    ) -> Result<(), StoreError> {
        if store.lifecycle(entity)? == LifecycleState::Ghost {
            self.ghosts.remove(&entity.to_bits());
            debug!(?entity, "ghost promoted to constructing");
        }
        store.set_lifecycle(entity, LifecycleState::Constructing)?;
        store
            .events_mut()
            .publish(ConstructionOrder { entity, type_id });
        self.pending.insert(
            entity.to_bits(),
            PendingEntry {
                entity,
                kind: PendingKind::Construct,
                started_frame: frame,
                acks: FxHashSet::default(),
            },
        );
        Ok(())
    }

    /// Begins the destruction hand-shake for `entity`.
    pub fn begin_destruction(
        &mut self,
        store: &mut EntityStore,
        entity: Entity,
        reason: DestructionReason,
        frame: u64,
    ) -> Result<(), StoreError> {
        store.set_lifecycle(entity, LifecycleState::TearDown)?;
        store
            .events_mut()
            .publish(DestructionOrder { entity, reason });
        self.pending.insert(
            entity.to_bits(),
            PendingEntry {
                entity,
                kind: PendingKind::Destruct,
                started_frame: frame,
                acks: FxHashSet::default(),
            },
        );
        Ok(())
    }

    /// Materializes `entity` in Ghost state (component payload arrived
    /// before construction metadata).
    pub fn create_ghost(
        &mut self,
        store: &mut EntityStore,
        entity: Entity,
        frame: u64,
    ) -> Result<(), StoreError> {
        store.spawn_at(entity, LifecycleState::Ghost)?;
        self.ghosts.insert(entity.to_bits(), frame);
        Ok(())
    }

    /// One lifecycle step: consume this frame's acks, resolve completed
    /// hand-shakes, and expire stragglers and stale ghosts.
    pub fn update(&mut self, store: &mut EntityStore, frame: u64) {
        self.collect_acks(store);
        self.resolve_pending(store, frame);
        self.expire_ghosts(store, frame);
    }

    fn collect_acks(&mut self, store: &mut EntityStore) {
        let construction_acks: Vec<ConstructionAck> =
            store.events().read::<ConstructionAck>().copied().collect();
        let destruction_acks: Vec<DestructionAck> =
            store.events().read::<DestructionAck>().copied().collect();

        for ack in construction_acks {
            let Some(entry) = self.pending.get_mut(&ack.entity.to_bits()) else {
                continue;
            };
            if entry.kind != PendingKind::Construct {
                continue;
            }
            if ack.success {
                entry.acks.insert(ack.module);
            } else {
                // NACK: abort immediately.
                warn!(entity = ?ack.entity, module = ?ack.module, "construction nack");
                self.pending.remove(&ack.entity.to_bits());
                self.destroy(store, ack.entity);
            }
        }

        for ack in destruction_acks {
            if let Some(entry) = self.pending.get_mut(&ack.entity.to_bits()) {
                if entry.kind == PendingKind::Destruct {
                    entry.acks.insert(ack.module);
                }
            }
        }
    }

    fn resolve_pending(&mut self, store: &mut EntityStore, frame: u64) {
        let mut completed = Vec::new();
        let mut expired = Vec::new();

        for (key, entry) in &self.pending {
            if !store.is_alive(entry.entity) {
                completed.push((*key, None));
                continue;
            }
            let all_acked = self
                .participants
                .iter()
                .all(|module| entry.acks.contains(module));
            if all_acked {
                completed.push((*key, Some((entry.entity, entry.kind))));
                continue;
            }
            let timeout = match entry.kind {
                PendingKind::Construct => self.config.construction_timeout_frames,
                PendingKind::Destruct => self.config.destruction_timeout_frames,
            };
            if frame.saturating_sub(entry.started_frame) >= timeout {
                expired.push((*key, entry.entity, entry.kind));
            }
        }

        for (key, resolution) in completed {
            self.pending.remove(&key);
            match resolution {
                Some((entity, PendingKind::Construct)) => {
                    if store.set_lifecycle(entity, LifecycleState::Active).is_ok() {
                        self.stats.constructed += 1;
                    }
                }
                Some((entity, PendingKind::Destruct)) => {
                    self.destroy(store, entity);
                }
                None => {}
            }
        }

        for (key, entity, kind) in expired {
            self.pending.remove(&key);
            self.stats.timeouts += 1;
            match kind {
                PendingKind::Construct => {
                    warn!(?entity, "construction timed out; destroying");
                }
                PendingKind::Destruct => {
                    warn!(?entity, "destruction acks missing; forcing destroy");
                }
            }
            self.destroy(store, entity);
        }
    }

    fn expire_ghosts(&mut self, store: &mut EntityStore, frame: u64) {
        let timeout = self.config.ghost_timeout_frames;
        let stale: Vec<(u64, Entity)> = self
            .ghosts
            .iter()
            .filter(|(_, &created)| frame.saturating_sub(created) >= timeout)
            .map(|(&key, _)| (key, Entity::from_bits(key)))
            .collect();
        for (key, entity) in stale {
            self.ghosts.remove(&key);
            self.stats.timeouts += 1;
            warn!(?entity, "ghost expired without construction metadata");
            self.destroy(store, entity);
        }
    }

    fn destroy(&mut self, store: &mut EntityStore, entity: Entity) {
        if store.destroy_entity(entity).is_ok() {
            self.stats.destroyed += 1;
        }
    }
}
