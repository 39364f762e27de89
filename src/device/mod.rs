use derive_more::{Deref, DerefMut, Display};
use thiserror::Error;

pub use gpu::{Gpu, GpuBuildError, GpuBuilder};
pub use headless::{Command, Headless};

pub mod gpu;
pub mod headless;

/// Identifies one execution/resource context.
///
/// All per-device state tables in this layer are keyed by `DeviceId`, never
/// by reference identity of a live device object.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct DeviceId(uid::Id<DeviceId>);

impl DeviceId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// An opaque id for one device-side object: a buffer, texture, shader
/// module, compute pipeline, or uniform set.
///
/// Handles are only meaningful to the device that issued them.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct Handle(uid::Id<Handle>);

impl Handle {
    /// Allocates a fresh handle. Called by device implementations when they
    /// create a new device-side object.
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// Binding classes a resource can export into a uniform set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    UniformBuffer,
    StorageBuffer,
    Image,
}

/// One entry of a uniform set: a device object bound at a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uniform {
    pub kind: UniformKind,
    pub binding: u32,
    pub handle: Handle,
}

/// Size of one texel in bytes. Device images are 2D, RGBA16-float.
pub const TEXEL_SIZE: usize = 8;

/// Dimensions of a 2D device image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSpec {
    pub width: u32,
    pub height: u32,
}

impl TextureSpec {
    /// Full payload size of the image in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.width as usize * self.height as usize * TEXEL_SIZE
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown handle: {0}")]
    UnknownHandle(Handle),
    #[error("handle {handle} is not a {expect}")]
    WrongKind {
        handle: Handle,
        expect: &'static str,
    },
    #[error("failed to compile shader `{label}`: {message}")]
    Compile { label: String, message: String },
    #[error("no compute list is open")]
    ListClosed,
    #[error("a compute list is already open")]
    ListOpen,
    #[error("no compute pipeline is bound")]
    NoPipeline,
    #[error("write of {len} bytes at offset {offset} overruns buffer of {size} bytes")]
    BufferOverrun { offset: u64, len: u64, size: u64 },
    #[error("bindings must be ascending and unique (violated at binding {0})")]
    BindingOrder(u32),
    #[error("texture payload of {len} bytes does not match image size {expect}")]
    TextureSize { len: usize, expect: usize },
    #[error("failed to read back buffer: {0}")]
    ReadBack(String),
}

/// Parses and validates a WGSL source, turning front-end and validation
/// failures into [`DeviceError::Compile`].
pub(crate) fn parse_wgsl(source: &str, label: &str) -> Result<naga::Module, DeviceError> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| DeviceError::Compile {
        label: label.into(),
        message: err.message().into(),
    })?;
    let flags = naga::valid::ValidationFlags::all();
    let capabilities =
        naga::valid::Capabilities::default() | naga::valid::Capabilities::PUSH_CONSTANT;
    naga::valid::Validator::new(flags, capabilities)
        .validate(&module)
        .map_err(|err| DeviceError::Compile {
            label: label.into(),
            message: err.as_inner().to_string(),
        })?;
    Ok(module)
}

/// Continuation for an asynchronous buffer readback.
///
/// Invoked exactly once by the device's own completion path, in submission
/// order; `FnOnce` makes a second invocation unrepresentable.
pub type ReadBack = Box<dyn FnOnce(Result<Vec<u8>, DeviceError>) + Send + 'static>;

/// An execution/resource context capable of compiling compute shaders and
/// holding GPU-visible memory behind opaque [`Handle`]s.
///
/// The trait is stateful the way a native rendering device is: objects are
/// created and freed by handle, commands are recorded into an open compute
/// list, and nothing reaches the queue until an explicit [`submit`]. Work
/// submitted to one device never affects another.
///
/// [`submit`]: Device::submit
pub trait Device {
    /// Stable identity of this device.
    fn id(&self) -> DeviceId;

    /// Compiles a WGSL source into a shader module.
    fn compile_shader(&mut self, source: &str, label: &str) -> Result<Handle, DeviceError>;

    /// Creates a compute pipeline from a compiled shader module.
    fn create_compute_pipeline(&mut self, shader: Handle) -> Result<Handle, DeviceError>;

    /// Allocates a uniform-class buffer, optionally initialized with `data`.
    fn create_uniform_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError>;

    /// Allocates a storage-class buffer, optionally initialized with `data`.
    fn create_storage_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError>;

    /// Overwrites part of an existing buffer in place.
    fn update_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8])
    -> Result<(), DeviceError>;

    /// Synchronously copies a buffer's device memory back to the host.
    fn read_buffer(&mut self, buffer: Handle) -> Result<Vec<u8>, DeviceError>;

    /// Queues a buffer readback; `callback` fires once the transfer
    /// completes, ordered by the device's own submission order.
    fn read_buffer_async(&mut self, buffer: Handle, callback: ReadBack)
    -> Result<(), DeviceError>;

    /// Creates a 2D image, optionally initialized with `data` (which must be
    /// exactly `spec.data_size()` bytes when present).
    fn create_texture(
        &mut self,
        spec: TextureSpec,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError>;

    /// Fully re-uploads an existing image in place.
    fn update_texture(&mut self, texture: Handle, data: &[u8]) -> Result<(), DeviceError>;

    /// Builds a native uniform set from `uniforms`, which must be in
    /// ascending binding order with no duplicates; backends may validate by
    /// position. The pipeline defines the set's layout at `index`.
    fn create_uniform_set(
        &mut self,
        uniforms: &[Uniform],
        pipeline: Handle,
        index: u32,
    ) -> Result<Handle, DeviceError>;

    /// Whether the device still recognizes `handle`.
    fn is_valid(&self, handle: Handle) -> bool;

    /// Releases the object behind `handle`. Freeing a handle the device no
    /// longer recognizes logs a warning and is otherwise a no-op.
    fn free(&mut self, handle: Handle);

    /// Frees `handle` only if the device still reports it valid.
    fn free_checked(&mut self, handle: Handle) {
        if self.is_valid(handle) {
            self.free(handle);
        } else {
            log::warn!("skipping free of stale handle {handle}");
        }
    }

    /// Opens a compute command list. At most one list is open at a time.
    fn compute_list_begin(&mut self) -> Result<(), DeviceError>;

    fn compute_list_bind_pipeline(&mut self, pipeline: Handle) -> Result<(), DeviceError>;

    fn compute_list_push_constants(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    fn compute_list_bind_uniform_set(&mut self, set: Handle, index: u32)
    -> Result<(), DeviceError>;

    /// Records a dispatch with the given thread-group counts. A count of 0
    /// on any axis is recorded as-is; what that does is backend-defined.
    fn compute_list_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError>;

    /// Closes the open compute list, making it eligible for submission.
    fn compute_list_end(&mut self) -> Result<(), DeviceError>;

    /// Pushes every ended compute list to the device queue. Nothing executes
    /// before this call.
    fn submit(&mut self);

    /// Blocks until all submitted work, including pending readbacks, has
    /// completed.
    fn wait_idle(&mut self);
}
