// SPDX-License-Identifier: Apache-2.0
//! Flight recorder: keyframe + delta persistence and seekable playback.
//!
//! Byte layout (little-endian throughout):
//! - Header: 6-byte magic `FDPREC`, u32 format version, u64 timestamp.
//! - Frames: kind byte (0 = keyframe, 1 = delta), u32 tick, u32
//!   changed-entity count, then per entity its handle (u32 index + u32
//!   generation), a u16 pair count, and `(component_id: u8, len: u32,
//!   payload)` pairs. Managed payloads open with their 16-bit polymorphic
//!   type id. Each frame closes with a destruction log: u32 count plus
//!   handles.
//!
//! Changing any of this is a breaking format change; bump the header
//! version and keep a migration note.
//!
//! Delta precision: per-chunk versions gate the scan (clean chunks are
//! skipped wholesale), and a shadow replica of the last captured state
//! narrows dirty chunks down to the entities whose bytes actually moved.
//! Destroyed entities appear only in the destruction log — their slots
//! were zero-filled before capture, so no byte of a dead entity's data can
//! leak into the stream.
//!
//! Write failures degrade gracefully: the frame is dropped and counted,
//! the simulation keeps running, and [`RecordingWriter::close`] surfaces
//! the condition.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::warn;

use crate::column::chunk_of;
use crate::component::{
    ComponentKind, ComponentRegistry, ManagedComponent, PolyError, PolyRegistry,
};
use crate::ident::{ComponentTypeId, Entity, PolyTypeId};
use crate::mask::ComponentMask;
use crate::store::{EntityStore, LifecycleState, StoreError};

/// File magic.
pub const MAGIC: &[u8; 6] = b"FDPREC";
/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const KIND_KEYFRAME: u8 = 0;
const KIND_DELTA: u8 = 1;

/// Recording and playback failures.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The stream does not open with the `FDPREC` magic, or its version is
    /// newer than this reader understands.
    #[error("corrupt recording: bad magic or unsupported version")]
    CorruptRecording,
    /// The stream ended inside a frame.
    #[error("truncated frame")]
    TruncatedFrame,
    /// The target store's schema does not match the recorded component.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    /// A managed component reached serialization without a registered
    /// polymorphic type id.
    #[error("unregistered polymorphic type")]
    UnregisteredPolymorphicType,
    /// Other polymorphic codec failure.
    #[error(transparent)]
    Poly(PolyError),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Frame application failed on the target store.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Seek target beyond the recording.
    #[error("frame {0} out of range ({1} frames recorded)")]
    FrameOutOfRange(usize, usize),
}

impl From<PolyError> for RecordingError {
    fn from(err: PolyError) -> Self {
        match err {
            PolyError::Unregistered(_) => Self::UnregisteredPolymorphicType,
            other => Self::Poly(other),
        }
    }
}

/// Writer-side counters.
#[derive(Clone, Copy, Default, Debug)]
pub struct RecorderStats {
    /// Frames committed to the stream.
    pub frames_written: u64,
    /// Frames dropped on write failure.
    pub frames_dropped: u64,
    /// Keyframes among the written frames.
    pub keyframes: u64,
}

/// Streaming recorder over any `Write` sink.
pub struct RecordingWriter<W: Write> {
    out: W,
    shadow: EntityStore,
    baseline_version: u32,
    stats: RecorderStats,
    degraded: bool,
}

impl<W: Write> RecordingWriter<W> {
    /// Opens a recording: writes the header immediately.
    pub fn create(mut out: W, registry: Arc<ComponentRegistry>) -> Result<Self, RecordingError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        out.write_all(MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        out.write_all(&timestamp.to_le_bytes())?;
        Ok(Self {
            out,
            shadow: EntityStore::new(registry),
            baseline_version: 0,
            stats: RecorderStats::default(),
            degraded: false,
        })
    }

    /// Writer counters.
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Version of the last capture; deltas are relative to it.
    #[must_use]
    pub fn baseline_version(&self) -> u32 {
        self.baseline_version
    }

    /// Captures every Active entity with all snapshotable components and
    /// makes this frame the new delta baseline.
    pub fn capture_keyframe(
        &mut self,
        store: &EntityStore,
        poly: &PolyRegistry,
    ) -> Result<(), RecordingError> {
        let frame = encode_frame(store, None, poly)?;
        self.commit(store, &frame, true)
    }

    /// Captures only components whose chunk version exceeds
    /// `since_version`, narrowed to entities whose bytes differ from the
    /// recorder's shadow of the previous capture.
    pub fn capture_delta(
        &mut self,
        store: &EntityStore,
        since_version: u32,
        poly: &PolyRegistry,
    ) -> Result<(), RecordingError> {
        let frame = encode_frame(store, Some((since_version, &self.shadow)), poly)?;
        self.commit(store, &frame, false)
    }

    fn commit(
        &mut self,
        store: &EntityStore,
        frame: &[u8],
        keyframe: bool,
    ) -> Result<(), RecordingError> {
        match self.out.write_all(frame) {
            Ok(()) => {
                self.stats.frames_written += 1;
                if keyframe {
                    self.stats.keyframes += 1;
                }
            }
            Err(err) => {
                // Dropping a frame beats taking the simulation down; the
                // condition is counted and surfaced at close.
                warn!(%err, "recording frame dropped");
                self.stats.frames_dropped += 1;
                self.degraded = true;
            }
        }
        self.shadow
            .sync_from(store, &store.snapshotable_mask(), self.baseline_version);
        self.baseline_version = store.global_version();
        Ok(())
    }

    /// Flushes and finishes the recording. Any dropped frame makes close
    /// fail so the condition reaches the exit code.
    pub fn close(mut self) -> Result<RecorderStats, RecordingError> {
        self.out.flush()?;
        if self.degraded {
            return Err(RecordingError::Io(std::io::Error::other(format!(
                "{} frame(s) dropped during recording",
                self.stats.frames_dropped
            ))));
        }
        Ok(self.stats)
    }
}

fn put_entity(entity: Entity, out: &mut Vec<u8>) {
    out.extend_from_slice(&entity.index.to_le_bytes());
    out.extend_from_slice(&entity.generation.to_le_bytes());
}

/// One `(component_id, payload)` pair for an entity.
fn encode_pair(
    store: &EntityStore,
    entity: Entity,
    id: ComponentTypeId,
    poly: &PolyRegistry,
    out: &mut Vec<u8>,
) -> Result<(), RecordingError> {
    out.push(id.0);
    let registry = store.registry();
    let info = registry
        .info(id)
        .ok_or_else(|| RecordingError::SchemaMismatch(format!("component id {} vanished", id.0)))?;
    match info.kind {
        ComponentKind::Pod { size } => {
            out.extend_from_slice(&(size as u32).to_le_bytes());
            match store.read_pod_raw(id, entity.index) {
                Some(bytes) => out.extend_from_slice(bytes),
                None => out.extend(std::iter::repeat_n(0u8, size)),
            }
        }
        ComponentKind::Managed => {
            let column = store.managed_column(id).ok_or_else(|| {
                RecordingError::SchemaMismatch(format!("managed column {} missing", id.0))
            })?;
            let value = column.get(entity.index).ok_or_else(|| {
                RecordingError::SchemaMismatch(format!(
                    "managed value missing for entity {}",
                    entity.index
                ))
            })?;
            let mut body = Vec::new();
            let poly_id = poly.encode(value, &mut body)?;
            out.extend_from_slice(&((body.len() + 2) as u32).to_le_bytes());
            out.extend_from_slice(&poly_id.0.to_le_bytes());
            out.extend_from_slice(&body);
        }
    }
    Ok(())
}

/// True when the entity's bytes for `id` differ between live and shadow.
fn pair_changed(
    live: &EntityStore,
    shadow: &EntityStore,
    entity: Entity,
    id: ComponentTypeId,
    since_version: u32,
) -> bool {
    let chunk = chunk_of(entity.index);
    let registry = live.registry();
    let Some(info) = registry.info(id) else {
        return false;
    };
    match info.kind {
        ComponentKind::Pod { .. } => {
            let Some(col) = live.pod_column(id) else {
                return false;
            };
            if col.chunk_version(chunk) <= since_version {
                return false;
            }
            let shadow_has = shadow
                .slot(entity.index)
                .is_some_and(|s| s.alive && s.generation == entity.generation && s.mask.contains(id));
            if !shadow_has {
                return true;
            }
            let live_bytes = live.read_pod_raw(id, entity.index);
            let shadow_bytes = shadow.read_pod_raw(id, entity.index);
            live_bytes != shadow_bytes
        }
        ComponentKind::Managed => live
            .managed_column(id)
            .is_some_and(|col| col.chunk_version(chunk) > since_version),
    }
}

/// Encodes one frame. `delta` carries `(since_version, shadow)` for delta
/// frames; `None` means keyframe (everything Active).
fn encode_frame(
    store: &EntityStore,
    delta: Option<(u32, &EntityStore)>,
    poly: &PolyRegistry,
) -> Result<Vec<u8>, RecordingError> {
    let mask: ComponentMask = store.snapshotable_mask();
    let mut entities: Vec<(Entity, Vec<ComponentTypeId>)> = Vec::new();

    let selection = store.query().build()?;
    for entity in selection.iter() {
        let Some(slot) = store.slot(entity.index) else {
            continue;
        };
        let candidates = slot.mask.intersection(&mask);
        let pairs: Vec<ComponentTypeId> = match delta {
            None => candidates.iter().collect(),
            Some((since, shadow)) => candidates
                .iter()
                .filter(|&id| pair_changed(store, shadow, entity, id, since))
                .collect(),
        };
        if delta.is_none() || !pairs.is_empty() {
            entities.push((entity, pairs));
        }
    }

    let mut out = Vec::new();
    out.push(if delta.is_none() {
        KIND_KEYFRAME
    } else {
        KIND_DELTA
    });
    out.extend_from_slice(&store.global_version().to_le_bytes());
    out.extend_from_slice(&(entities.len() as u32).to_le_bytes());
    for (entity, pairs) in &entities {
        put_entity(*entity, &mut out);
        out.extend_from_slice(&(pairs.len() as u16).to_le_bytes());
        for id in pairs {
            encode_pair(store, *entity, *id, poly, &mut out)?;
        }
    }

    let destroyed = store.destroyed_this_frame();
    out.extend_from_slice(&(destroyed.len() as u32).to_le_bytes());
    for entity in destroyed {
        put_entity(*entity, &mut out);
    }
    Ok(out)
}

// ── reading ─────────────────────────────────────────────────────────

struct FrameReader<'a, R: Read> {
    input: &'a mut R,
}

impl<R: Read> FrameReader<'_, R> {
    fn exact(&mut self, buf: &mut [u8]) -> Result<(), RecordingError> {
        self.input.read_exact(buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                RecordingError::TruncatedFrame
            } else {
                RecordingError::Io(err)
            }
        })
    }

    fn u8(&mut self) -> Result<u8, RecordingError> {
        let mut b = [0u8; 1];
        self.exact(&mut b)?;
        Ok(b[0])
    }

    fn u16(&mut self) -> Result<u16, RecordingError> {
        let mut b = [0u8; 2];
        self.exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn u32(&mut self) -> Result<u32, RecordingError> {
        let mut b = [0u8; 4];
        self.exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn entity(&mut self) -> Result<Entity, RecordingError> {
        let index = self.u32()?;
        let generation = self.u32()?;
        Ok(Entity::new(index, generation))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, RecordingError> {
        let mut buf = vec![0u8; len];
        self.exact(&mut buf)?;
        Ok(buf)
    }
}

/// Validates the header of a recording stream.
fn read_header<R: Read>(input: &mut R) -> Result<(u32, u64), RecordingError> {
    let mut magic = [0u8; 6];
    input
        .read_exact(&mut magic)
        .map_err(|_| RecordingError::CorruptRecording)?;
    if &magic != MAGIC {
        return Err(RecordingError::CorruptRecording);
    }
    let mut word = [0u8; 4];
    input
        .read_exact(&mut word)
        .map_err(|_| RecordingError::CorruptRecording)?;
    let version = u32::from_le_bytes(word);
    if version > FORMAT_VERSION {
        return Err(RecordingError::CorruptRecording);
    }
    let mut stamp = [0u8; 8];
    input
        .read_exact(&mut stamp)
        .map_err(|_| RecordingError::CorruptRecording)?;
    Ok((version, u64::from_le_bytes(stamp)))
}

/// Streaming reader: applies frames one by one to a target store.
pub struct RecordingReader<R: Read> {
    input: R,
    version: u32,
    timestamp: u64,
}

impl<R: Read> RecordingReader<R> {
    /// Opens a stream, validating magic and version before anything is
    /// applied to any store.
    pub fn open(mut input: R) -> Result<Self, RecordingError> {
        let (version, timestamp) = read_header(&mut input)?;
        Ok(Self {
            input,
            version,
            timestamp,
        })
    }

    /// Recorded format version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Recording creation time (seconds since the epoch).
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Applies the next frame to `store`; `Ok(false)` at a clean EOF.
    pub fn read_next_frame(
        &mut self,
        store: &mut EntityStore,
        poly: &PolyRegistry,
    ) -> Result<bool, RecordingError> {
        let mut kind = [0u8; 1];
        match self.input.read_exact(&mut kind) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(RecordingError::Io(err)),
        }
        apply_frame_body(kind[0], &mut self.input, store, poly)?;
        Ok(true)
    }
}

/// One decoded `(component_id, payload)` pair, ready to apply.
enum FramePair {
    Pod(ComponentTypeId, Vec<u8>),
    Managed(ComponentTypeId, Box<dyn ManagedComponent>),
}

/// Applies one frame body (everything after the kind byte).
///
/// All-or-nothing: the whole frame is read, schema-validated, and decoded
/// first; the target store is only touched once every entity in the frame
/// has passed. A truncated stream or a schema mismatch anywhere in the
/// frame is therefore reported before any entity is created on the target.
fn apply_frame_body<R: Read>(
    kind: u8,
    input: &mut R,
    store: &mut EntityStore,
    poly: &PolyRegistry,
) -> Result<(), RecordingError> {
    if kind != KIND_KEYFRAME && kind != KIND_DELTA {
        return Err(RecordingError::CorruptRecording);
    }
    let mut reader = FrameReader { input };
    let _tick = reader.u32()?;
    let entity_count = reader.u32()?;

    // Pass 1: read and validate every entity's pairs, and the destruction
    // log, without mutating anything.
    let mut entities: Vec<(Entity, Vec<FramePair>)> =
        Vec::with_capacity(entity_count.min(4096) as usize);
    for _ in 0..entity_count {
        let entity = reader.entity()?;
        let pair_count = reader.u16()?;
        let mut pairs: Vec<FramePair> = Vec::with_capacity(pair_count.into());
        for _ in 0..pair_count {
            let id = ComponentTypeId(reader.u8()?);
            let len = reader.u32()? as usize;
            let body = reader.bytes(len)?;
            let info = store.registry().info(id).ok_or_else(|| {
                RecordingError::SchemaMismatch(format!(
                    "component id {} not registered on target store",
                    id.0
                ))
            })?;
            match info.kind {
                ComponentKind::Pod { size } => {
                    if body.len() != size {
                        return Err(RecordingError::SchemaMismatch(format!(
                            "component '{}' payload {} bytes, column expects {}",
                            info.name,
                            body.len(),
                            size
                        )));
                    }
                    pairs.push(FramePair::Pod(id, body));
                }
                ComponentKind::Managed => {
                    if body.len() < 2 {
                        return Err(RecordingError::TruncatedFrame);
                    }
                    let poly_id = PolyTypeId(u16::from_le_bytes([body[0], body[1]]));
                    let value = poly.decode(poly_id, &body[2..])?;
                    pairs.push(FramePair::Managed(id, value));
                }
            }
        }
        entities.push((entity, pairs));
    }

    let destroyed_count = reader.u32()?;
    let mut destroyed: Vec<Entity> = Vec::with_capacity(destroyed_count.min(4096) as usize);
    for _ in 0..destroyed_count {
        destroyed.push(reader.entity()?);
    }

    // Pass 2: the frame is sound; materialize it. Replay is a mutation
    // like any other and runs under an open frame.
    let _ = store.tick();
    for (entity, pairs) in entities {
        store.spawn_at(entity, LifecycleState::Active)?;
        for pair in pairs {
            match pair {
                FramePair::Pod(id, body) => {
                    store.apply_component_bytes(entity, id, &body)?;
                }
                FramePair::Managed(id, value) => {
                    store.apply_managed_boxed(entity, id, value)?;
                }
            }
        }
    }
    for entity in destroyed {
        if store.is_alive(entity) {
            store.destroy_entity(entity)?;
        }
    }
    store.end_frame();
    Ok(())
}

/// Skips one frame body, returning without touching any store. Used by the
/// index scan; relies only on explicit lengths.
fn skip_frame_body<R: Read>(input: &mut R) -> Result<u32, RecordingError> {
    let mut reader = FrameReader { input };
    let tick = reader.u32()?;
    let entity_count = reader.u32()?;
    for _ in 0..entity_count {
        let _entity = reader.entity()?;
        let pair_count = reader.u16()?;
        for _ in 0..pair_count {
            let _id = reader.u8()?;
            let len = reader.u32()? as usize;
            let _ = reader.bytes(len)?;
        }
    }
    let destroyed_count = reader.u32()?;
    for _ in 0..destroyed_count {
        let _ = reader.entity()?;
    }
    Ok(tick)
}

#[derive(Clone, Copy, Debug)]
struct FrameIndexEntry {
    offset: u64,
    keyframe: bool,
    #[allow(dead_code)]
    tick: u32,
}

/// Random-access playback over a seekable recording.
///
/// The controller scans the stream once on open, building a frame-offset
/// index. Forward steps apply the next frame; backward steps rewind to the
/// nearest keyframe at or before the target and replay deltas forward.
pub struct PlaybackController<R: Read + Seek> {
    source: R,
    index: Vec<FrameIndexEntry>,
    /// Frames applied so far; the next `step_forward` applies `applied`.
    applied: usize,
}

impl<R: Read + Seek> PlaybackController<R> {
    /// Opens and indexes a recording.
    pub fn open(mut source: R) -> Result<Self, RecordingError> {
        source.seek(SeekFrom::Start(0))?;
        read_header(&mut source)?;
        let mut index = Vec::new();
        loop {
            let offset = source.stream_position()?;
            let mut kind = [0u8; 1];
            match source.read_exact(&mut kind) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(RecordingError::Io(err)),
            }
            if kind[0] != KIND_KEYFRAME && kind[0] != KIND_DELTA {
                return Err(RecordingError::CorruptRecording);
            }
            let tick = skip_frame_body(&mut source)?;
            index.push(FrameIndexEntry {
                offset,
                keyframe: kind[0] == KIND_KEYFRAME,
                tick,
            });
        }
        Ok(Self {
            source,
            index,
            applied: 0,
        })
    }

    /// Total frames in the recording.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    /// Frames applied so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.applied
    }

    fn apply_at(
        &mut self,
        ix: usize,
        store: &mut EntityStore,
        poly: &PolyRegistry,
    ) -> Result<(), RecordingError> {
        let entry = self.index[ix];
        self.source.seek(SeekFrom::Start(entry.offset))?;
        let mut kind = [0u8; 1];
        self.source
            .read_exact(&mut kind)
            .map_err(|_| RecordingError::TruncatedFrame)?;
        apply_frame_body(kind[0], &mut self.source, store, poly)
    }

    /// Applies the next frame; `Ok(false)` at the end.
    pub fn step_forward(
        &mut self,
        store: &mut EntityStore,
        poly: &PolyRegistry,
    ) -> Result<bool, RecordingError> {
        if self.applied >= self.index.len() {
            return Ok(false);
        }
        self.apply_at(self.applied, store, poly)?;
        self.applied += 1;
        Ok(true)
    }

    /// Rebuilds `store` at the state after frame `n` (0-based): reset to
    /// the nearest keyframe at or before `n`, then replay deltas forward.
    pub fn seek_to_frame(
        &mut self,
        n: usize,
        store: &mut EntityStore,
        poly: &PolyRegistry,
    ) -> Result<(), RecordingError> {
        if n >= self.index.len() {
            return Err(RecordingError::FrameOutOfRange(n, self.index.len()));
        }
        let key = (0..=n)
            .rev()
            .find(|&i| self.index[i].keyframe)
            .unwrap_or(0);
        store.clear_retaining_capacity();
        for ix in key..=n {
            self.apply_at(ix, store, poly)?;
        }
        self.applied = n + 1;
        Ok(())
    }

    /// Steps one frame back (keyframe rewind + forward replay).
    pub fn step_backward(
        &mut self,
        store: &mut EntityStore,
        poly: &PolyRegistry,
    ) -> Result<bool, RecordingError> {
        if self.applied < 2 {
            return Ok(false);
        }
        self.seek_to_frame(self.applied - 2, store, poly)?;
        Ok(true)
    }

    /// Applies up to `n` further frames; returns how many were applied.
    pub fn fast_forward(
        &mut self,
        n: usize,
        store: &mut EntityStore,
        poly: &PolyRegistry,
    ) -> Result<usize, RecordingError> {
        let mut done = 0;
        while done < n && self.step_forward(store, poly)? {
            done += 1;
        }
        Ok(done)
    }
}
