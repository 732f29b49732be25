// SPDX-License-Identifier: Apache-2.0
//! Chunked component columns with per-chunk change versions.
//!
//! A pod column is a dense byte array keyed by entity index, physically
//! divided into fixed-size chunks of [`CHUNK_ENTITIES`] slots. Each chunk
//! carries one 32-bit version: every write stamps the containing chunk with
//! the store's current global version, and change detection is a strict
//! `chunk_version > since` scan. Reads never touch versions.
//!
//! The managed column is the side store for boxed reference components. It
//! keeps the same chunk-version bookkeeping so change detection and delta
//! recording treat both kinds uniformly.
//!
//! Invariants
//! - `chunk_version <= global_version` at all times.
//! - A zero-fill (sanitation on destroy) is a write and stamps the chunk.
//! - Chunk byte buffers are allocated once and reused; replica sync copies
//!   over them, it never reallocates.

use rustc_hash::FxHashMap;

use crate::component::ManagedComponent;

/// Number of entity slots per chunk (~16 K, the cache-locality target).
pub const CHUNK_ENTITIES: usize = 16 * 1024;

/// Returns the chunk index holding `entity_index`.
#[inline]
#[must_use]
pub const fn chunk_of(entity_index: u32) -> usize {
    entity_index as usize / CHUNK_ENTITIES
}

struct PodChunk {
    bytes: Box<[u8]>,
    version: u32,
}

impl PodChunk {
    fn new(elem_size: usize) -> Self {
        Self {
            bytes: vec![0u8; elem_size * CHUNK_ENTITIES].into_boxed_slice(),
            version: 0,
        }
    }
}

/// Dense, chunked storage for one blittable component type.
pub struct PodColumn {
    elem_size: usize,
    chunks: Vec<PodChunk>,
}

impl PodColumn {
    /// Creates an empty column for elements of `elem_size` bytes.
    #[must_use]
    pub fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            chunks: Vec::new(),
        }
    }

    /// Element size in bytes.
    #[inline]
    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of allocated chunks.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Version of chunk `ix`, or 0 if not yet allocated.
    #[inline]
    #[must_use]
    pub fn chunk_version(&self, ix: usize) -> u32 {
        self.chunks.get(ix).map_or(0, |c| c.version)
    }

    fn ensure_chunk(&mut self, ix: usize) {
        while self.chunks.len() <= ix {
            self.chunks.push(PodChunk::new(self.elem_size));
        }
    }

    #[inline]
    fn slot_range(&self, entity_index: u32) -> std::ops::Range<usize> {
        let offset = (entity_index as usize % CHUNK_ENTITIES) * self.elem_size;
        offset..offset + self.elem_size
    }

    /// Copies `data` into the slot for `entity_index`, stamping the chunk
    /// with `version`. `data` must be exactly one element long.
    pub fn write(&mut self, entity_index: u32, data: &[u8], version: u32) {
        debug_assert_eq!(data.len(), self.elem_size);
        let chunk_ix = chunk_of(entity_index);
        self.ensure_chunk(chunk_ix);
        let range = self.slot_range(entity_index);
        let chunk = &mut self.chunks[chunk_ix];
        chunk.bytes[range].copy_from_slice(data);
        chunk.version = version;
    }

    /// Zero-fills the slot for `entity_index` (destroy sanitation) and
    /// stamps the chunk. A no-op on never-allocated chunks: absent bytes
    /// are already zero by definition.
    pub fn zero(&mut self, entity_index: u32, version: u32) {
        let chunk_ix = chunk_of(entity_index);
        if chunk_ix >= self.chunks.len() {
            return;
        }
        let range = self.slot_range(entity_index);
        let chunk = &mut self.chunks[chunk_ix];
        chunk.bytes[range].fill(0);
        chunk.version = version;
    }

    /// Borrows the raw bytes of the slot for `entity_index`.
    ///
    /// Returns all-zero storage semantics for unallocated chunks via `None`;
    /// callers treat `None` and a zeroed slot identically.
    #[inline]
    #[must_use]
    pub fn read(&self, entity_index: u32) -> Option<&[u8]> {
        let chunk = self.chunks.get(chunk_of(entity_index))?;
        let offset = (entity_index as usize % CHUNK_ENTITIES) * self.elem_size;
        Some(&chunk.bytes[offset..offset + self.elem_size])
    }

    /// Strict per-chunk scan: true iff any chunk was written after `since`.
    #[must_use]
    pub fn changed_since(&self, since: u32) -> bool {
        self.chunks.iter().any(|c| c.version > since)
    }

    /// Resets every chunk version to zero while keeping the byte buffers
    /// allocated. Pool release path: stale bytes are unreachable (no
    /// membership bit points at them) and the next sync overwrites whatever
    /// it copies.
    pub fn reset_versions(&mut self) {
        for chunk in &mut self.chunks {
            chunk.version = 0;
        }
    }

    /// Copies every chunk of `src` whose version exceeds `since` over the
    /// corresponding local chunk, adopting the source version. Allocates
    /// local chunks as needed; existing buffers are overwritten in place.
    pub fn sync_changed_from(&mut self, src: &Self, since: u32) {
        debug_assert_eq!(self.elem_size, src.elem_size);
        for (ix, src_chunk) in src.chunks.iter().enumerate() {
            if src_chunk.version <= since && self.chunks.get(ix).is_some() {
                continue;
            }
            self.ensure_chunk(ix);
            let dst = &mut self.chunks[ix];
            dst.bytes.copy_from_slice(&src_chunk.bytes);
            dst.version = src_chunk.version;
        }
    }
}

/// Side store for one managed (reference) component type.
pub struct ManagedColumn {
    values: FxHashMap<u32, Box<dyn ManagedComponent>>,
    chunk_versions: Vec<u32>,
}

impl ManagedColumn {
    /// Creates an empty managed column.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: FxHashMap::default(),
            chunk_versions: Vec::new(),
        }
    }

    /// Number of chunk-version slots allocated.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_versions.len()
    }

    /// Version of chunk `ix`, or 0 if untouched.
    #[inline]
    #[must_use]
    pub fn chunk_version(&self, ix: usize) -> u32 {
        self.chunk_versions.get(ix).copied().unwrap_or(0)
    }

    fn stamp(&mut self, entity_index: u32, version: u32) {
        let ix = chunk_of(entity_index);
        if self.chunk_versions.len() <= ix {
            self.chunk_versions.resize(ix + 1, 0);
        }
        self.chunk_versions[ix] = version;
    }

    /// Inserts or replaces the value for `entity_index`.
    pub fn insert(
        &mut self,
        entity_index: u32,
        value: Box<dyn ManagedComponent>,
        version: u32,
    ) {
        self.values.insert(entity_index, value);
        self.stamp(entity_index, version);
    }

    /// Drops the value for `entity_index`, if any. Removal is a write.
    pub fn remove(&mut self, entity_index: u32, version: u32) -> bool {
        let removed = self.values.remove(&entity_index).is_some();
        if removed {
            self.stamp(entity_index, version);
        }
        removed
    }

    /// Borrows the value for `entity_index`.
    #[inline]
    #[must_use]
    pub fn get(&self, entity_index: u32) -> Option<&dyn ManagedComponent> {
        self.values.get(&entity_index).map(AsRef::as_ref)
    }

    /// Mutably borrows the value for `entity_index`.
    ///
    /// The caller is responsible for stamping the write via
    /// [`touch`](Self::touch); the borrow itself does not bump versions.
    #[inline]
    pub fn get_mut(&mut self, entity_index: u32) -> Option<&mut Box<dyn ManagedComponent>> {
        self.values.get_mut(&entity_index)
    }

    /// Marks the chunk holding `entity_index` as written at `version`.
    pub fn touch(&mut self, entity_index: u32, version: u32) {
        self.stamp(entity_index, version);
    }

    /// Strict per-chunk scan: true iff any chunk was written after `since`.
    #[must_use]
    pub fn changed_since(&self, since: u32) -> bool {
        self.chunk_versions.iter().any(|&v| v > since)
    }

    /// Drops every value and resets versions, retaining map capacity.
    pub fn reset(&mut self) {
        self.values.clear();
        self.chunk_versions.iter_mut().for_each(|v| *v = 0);
    }

    /// Replaces local contents with deep clones of `src`'s values, adopting
    /// its chunk versions. Used by `SnapshotViaClone` replica sync.
    pub fn clone_all_from(&mut self, src: &Self) {
        self.values.clear();
        for (ix, value) in &src.values {
            let value: &(dyn ManagedComponent + 'static) = &**value;
            self.values.insert(*ix, value.clone_managed());
        }
        self.chunk_versions.clear();
        self.chunk_versions.extend_from_slice(&src.chunk_versions);
    }
}

impl Default for ManagedColumn {
    fn default() -> Self {
        Self::new()
    }
}
