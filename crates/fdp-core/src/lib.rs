// SPDX-License-Identifier: Apache-2.0
//! fdp-core: deterministic distributed ECS simulation runtime.
//!
//! The core hosts cooperating modules over a shared entity store,
//! orchestrating them across the main thread and a worker pool while
//! preserving determinism, snapshot isolation, and bit-for-bit replay.
//!
//! The pieces, leaves first:
//!
//! - [`store::EntityStore`]: archetype-free column storage with per-chunk
//!   change versions, lifecycle-gated visibility, and a frame-local event
//!   bus.
//! - [`snapshot::SnapshotManager`]: a double-buffered full replica plus
//!   pooled on-demand replicas shared per convoy.
//! - [`schedule::Schedule`]: five fixed phases, dependency-sorted systems.
//! - [`lifecycle::LifecycleManager`]: multi-party construction and
//!   destruction hand-shakes with ghost admission.
//! - [`time`]: wall-clock, PLL-slaved, and lockstep controllers with
//!   jitter-free barrier switching.
//! - [`recorder`]: keyframe/delta flight recording and seekable playback.
//! - [`host::ModuleHost`]: the per-frame control loop tying it together.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

pub mod cmd;
pub mod column;
pub mod component;
pub mod demo;
pub mod event;
pub mod host;
pub mod ident;
pub mod lifecycle;
pub mod mask;
pub mod module;
pub mod query;
pub mod recorder;
pub mod schedule;
pub mod snapshot;
pub mod store;
pub mod time;
pub mod workers;

pub use cmd::{CodecError, CommandBuffer, CommandOp, PlaybackError};
pub use component::{
    ComponentKind, ComponentRegistry, DataPolicy, ManagedComponent, PolyError, PolyRegistry,
    RegistryError,
};
pub use event::EventBus;
pub use host::{HostBuilder, HostConfig, HostError, HostStats, ModuleHost};
pub use ident::{ComponentTypeId, Entity, ModuleId, NodeId, PartKey, PolyTypeId};
pub use lifecycle::{
    ConstructionAck, ConstructionOrder, DestructionAck, DestructionOrder, DestructionReason,
    LifecycleConfig, LifecycleManager, LifecycleStats,
};
pub use mask::ComponentMask;
pub use module::{
    BreakerState, CircuitBreaker, DataStrategy, ExecutionMode, ExecutionPolicy, FaultKind,
    Module, ModuleCtx, ModuleError, ModuleStats, PolicyError, Trigger, WorldView,
};
pub use query::{Query, QueryBuilder};
pub use recorder::{
    PlaybackController, RecorderStats, RecordingError, RecordingReader, RecordingWriter,
};
pub use schedule::{
    Phase, Schedule, ScheduleError, System, SystemError, SystemGroup, SystemProfile,
};
pub use snapshot::{ConvoyKey, RefreshOutcome, SnapshotHandle, SnapshotManager, SnapshotPool};
pub use store::{EntityStore, LifecycleState, OwnershipRecord, StoreError};
pub use time::{
    build_controller, FrameAck, FrameOrder, GlobalTime, LockstepMasterController,
    LockstepSlaveController, LoopbackTransport, NullTransport, PllSlaveController,
    SwitchTimeMode, TimeConfig, TimeController, TimeDirector, TimeMessage, TimeMode, TimePulse,
    TimeTransport, WallClockController,
};
pub use workers::WorkerPool;
