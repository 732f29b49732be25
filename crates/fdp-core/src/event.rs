// SPDX-License-Identifier: Apache-2.0
//! Frame-local double-buffered event bus.
//!
//! Two buffers per event type: writers append to *pending*, readers consume
//! *current*. [`EventBus::swap_buffers`] flips them once per frame on the
//! main thread, after background modules have joined; pending is empty
//! afterwards. An active-type set makes "any event of type `T` this frame"
//! an O(1) query, which is what reactive module triggers poll.
//!
//! Publishes that happen *after* the frame's swap (command-buffer playback,
//! Simulation-and-later phases) are routed straight into the current buffer:
//! they stay visible for the rest of the frame and are dropped at the next
//! swap. This is what lets a lifecycle ACK recorded by a background module
//! be observed in the same frame it is played back, and it keeps the
//! end-of-frame invariant that pending is empty.
//!
//! Events are `Clone + Send + Sync + 'static` values stored boxed. Clone
//! matters: replica sync deep-copies the current buffer so background
//! modules can observe lifecycle orders through their snapshots. Events
//! published from module bodies travel through command buffers; direct
//! publishing is a main-thread-only affair.

use std::any::TypeId;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::component::ManagedComponent;

struct EventQueue {
    pending: Vec<Box<dyn ManagedComponent>>,
    current: Vec<Box<dyn ManagedComponent>>,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            current: Vec::new(),
        }
    }
}

/// Double-buffered, frame-local event streams, one per event type.
#[derive(Default)]
pub struct EventBus {
    queues: FxHashMap<TypeId, EventQueue>,
    active: FxHashSet<TypeId>,
    swapped: bool,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the swap latch at the top of a frame. The store calls this
    /// from `tick()`.
    pub(crate) fn begin_frame(&mut self) {
        self.swapped = false;
    }

    /// Publishes `event`: into pending before this frame's swap, into
    /// current (immediately visible) after it.
    pub fn publish<T: Clone + Send + Sync + 'static>(&mut self, event: T) {
        self.publish_boxed(Box::new(event));
    }

    /// Appends an already-boxed event under its dynamic type. Command-buffer
    /// playback re-publishes recorded events through this.
    pub fn publish_boxed(&mut self, event: Box<dyn ManagedComponent>) {
        let type_id = event.as_any().type_id();
        let queue = self.queues.entry(type_id).or_insert_with(EventQueue::new);
        if self.swapped {
            queue.current.push(event);
            self.active.insert(type_id);
        } else {
            queue.pending.push(event);
        }
    }

    /// Reads this frame's events of type `T` in publication order.
    pub fn read<T: Send + Sync + 'static>(&self) -> impl Iterator<Item = &T> + '_ {
        self.queues
            .get(&TypeId::of::<T>())
            .into_iter()
            .flat_map(|q| q.current.iter())
            .filter_map(|e| {
                let e: &(dyn ManagedComponent + 'static) = &**e;
                e.as_any().downcast_ref::<T>()
            })
    }

    /// O(1): whether any event of type `T` is current this frame.
    #[must_use]
    pub fn has_event<T: Send + Sync + 'static>(&self) -> bool {
        self.active.contains(&TypeId::of::<T>())
    }

    /// Dynamic-typed variant of [`has_event`](Self::has_event).
    #[must_use]
    pub fn has_event_dyn(&self, type_id: TypeId) -> bool {
        self.active.contains(&type_id)
    }

    /// Flips pending into current for every queue and rebuilds the
    /// active-type set. Pending is empty afterwards; last frame's current
    /// events are dropped. Later publishes in the same frame land directly
    /// in current until the next [`begin_frame`](Self::begin_frame).
    pub fn swap_buffers(&mut self) {
        self.active.clear();
        for (type_id, queue) in &mut self.queues {
            queue.current.clear();
            std::mem::swap(&mut queue.pending, &mut queue.current);
            if !queue.current.is_empty() {
                self.active.insert(*type_id);
            }
        }
        self.swapped = true;
    }

    /// Replaces this bus's current buffers with deep copies of `src`'s.
    /// Replica sync uses this so background modules observe the live
    /// frame's events (orders, acks) through their snapshot.
    pub(crate) fn clone_current_from(&mut self, src: &Self) {
        self.queues.clear();
        self.active.clear();
        for (type_id, queue) in &src.queues {
            if queue.current.is_empty() {
                continue;
            }
            let copy = EventQueue {
                pending: Vec::new(),
                current: queue
                    .current
                    .iter()
                    .map(|e| {
                        let e: &(dyn ManagedComponent + 'static) = &**e;
                        e.clone_managed()
                    })
                    .collect(),
            };
            self.queues.insert(*type_id, copy);
            self.active.insert(*type_id);
        }
    }

    /// Drops every buffered event. Pooled replica stores are cleared this
    /// way on release.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.active.clear();
        self.swapped = false;
    }

    /// True iff no pending event exists in any queue. This is the
    /// end-of-frame invariant the host asserts.
    #[must_use]
    pub fn pending_is_empty(&self) -> bool {
        self.queues.values().all(|q| q.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[derive(Clone, PartialEq, Debug)]
    struct Spawned(u32);

    #[derive(Clone)]
    struct Unrelated;

    #[test]
    fn pending_events_invisible_until_swap() {
        let mut bus = EventBus::new();
        bus.publish(Spawned(1));
        assert!(!bus.has_event::<Spawned>());
        assert_eq!(bus.read::<Spawned>().count(), 0);

        bus.swap_buffers();
        assert!(bus.has_event::<Spawned>());
        let seen: Vec<&Spawned> = bus.read::<Spawned>().collect();
        assert_eq!(seen, vec![&Spawned(1)]);
        assert!(bus.pending_is_empty());
    }

    #[test]
    fn swap_drops_last_frames_events() {
        let mut bus = EventBus::new();
        bus.publish(Spawned(1));
        bus.swap_buffers();
        bus.begin_frame();
        bus.publish(Spawned(2));
        bus.swap_buffers();
        let seen: Vec<u32> = bus.read::<Spawned>().map(|e| e.0).collect();
        assert_eq!(seen, vec![2]);
        bus.begin_frame();
        bus.swap_buffers();
        assert!(!bus.has_event::<Spawned>());
    }

    #[test]
    fn active_set_tracks_types_independently() {
        let mut bus = EventBus::new();
        bus.publish(Spawned(9));
        bus.publish(Unrelated);
        bus.swap_buffers();
        assert!(bus.has_event::<Spawned>());
        assert!(bus.has_event::<Unrelated>());
        assert!(!bus.has_event::<String>());
    }

    #[test]
    fn post_swap_publish_is_visible_same_frame() {
        let mut bus = EventBus::new();
        bus.begin_frame();
        bus.swap_buffers();
        bus.publish(Spawned(3));
        assert!(bus.has_event::<Spawned>());
        assert!(bus.pending_is_empty());

        // Next frame's swap drops it.
        bus.begin_frame();
        bus.swap_buffers();
        assert!(!bus.has_event::<Spawned>());
    }

    #[test]
    fn clone_current_deep_copies_visible_events() {
        let mut bus = EventBus::new();
        bus.publish(Spawned(5));
        bus.swap_buffers();

        let mut replica = EventBus::new();
        replica.clone_current_from(&bus);
        assert!(replica.has_event::<Spawned>());
        assert_eq!(replica.read::<Spawned>().next(), Some(&Spawned(5)));
        // Pending never crosses the sync boundary.
        assert!(replica.pending_is_empty());
    }
}
