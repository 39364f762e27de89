//! `bindery` is a compute resource binding and caching layer: it sits between
//! application code and a stateful, handle-based GPU device, tracking named
//! buffers and textures, uniform-set composition, and compute pipelines, and
//! lazily rebuilds only what has changed before each dispatch.
//!
//! ## Key Components
//! 1. **Resources**:
//!    - Named buffers ([`BufferResource`]) and 2D images ([`TextureResource`]).
//!    - Per-device realization with dirty tracking: reallocate on size change,
//!      overwrite in place otherwise.
//!    - Storage-class buffers support blocking and callback-based readback.
//!
//! 2. **Catalog**:
//!    - A constructed name → resource registry ([`ResourceStorage`]); names are
//!      the one namespace every program binds through, so two programs exchange
//!      data simply by naming the same buffer.
//!
//! 3. **Binding and dispatch**:
//!    - [`UniformSet`] caches one native descriptor set per device and rebuilds
//!      it only when a binding changes or a bound resource rebuilt.
//!    - [`ComputeProgram`] compiles its shader source on first dispatch per
//!      device and recompiles when the source's stamp changes.
//!
//! 4. **Devices**:
//!    - The [`Device`] trait abstracts the execution context; [`Gpu`] drives
//!      WebGPU, [`Headless`] is a host-memory twin with counters and a command
//!      trace.
//!    - A process may drive several devices; every cache in the layer is keyed
//!      by [`DeviceId`], so one device's rebuilds never invalidate another's.
//!
//! ## Design Principles
//! - **Laziness**: nothing is allocated, compiled, or rebuilt until a dispatch
//!   needs it, and then only the stale pieces.
//! - **Explicitness**: submission, synchronization, and teardown are caller
//!   steps; no work reaches the queue behind the caller's back, and no handle
//!   is freed by a destructor.
//! - **One owner thread**: all mutation and dispatch flows through a single
//!   scheduling context; the only asynchrony is the device's own readback
//!   completion path.

pub mod context;
pub mod device;
pub mod program;
pub mod resource;
pub mod storage;
pub mod uniform;

pub use context::{ComputeContext, ContextError, ProgramId};
pub use device::{
    Device, DeviceError, DeviceId, Gpu, GpuBuildError, GpuBuilder, Handle, Headless, ReadBack,
    TextureSpec, Uniform, UniformKind,
};
pub use program::{ComputeProgram, ProgramError, ShaderSource, SourceStamp};
pub use resource::{BufferClass, BufferResource, ResourceKind, TextureResource};
pub use storage::{ResourceStorage, StorageError};
pub use uniform::UniformSet;
