use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{
    Device, DeviceError, DeviceId, Handle, ReadBack, TextureSpec, Uniform, parse_wgsl,
};

/// One recorded compute-list command, kept for inspection after submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BindPipeline(Handle),
    PushConstants(Vec<u8>),
    BindUniformSet { set: Handle, index: u32 },
    Dispatch([u32; 3]),
}

enum Object {
    UniformBuffer(Vec<u8>),
    StorageBuffer(Vec<u8>),
    Texture { spec: TextureSpec, data: Vec<u8> },
    Shader,
    Pipeline { shader: Handle },
    UniformSet { uniforms: Vec<Uniform>, index: u32 },
}

/// A host-memory device: the full [`Device`] surface minus shader execution.
///
/// Buffers and textures live in host byte vectors, WGSL still goes through
/// the naga front end, and recorded commands move through pending and
/// submitted queues where callers can inspect them. Dispatches do not run
/// shader code, so a dispatch leaves buffer contents unchanged.
pub struct Headless {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Every live device-side object, by handle.
    objects: HashMap<Handle, Object>,
    /// The currently open compute list, if any.
    list: Option<Vec<Command>>,
    /// Ended lists awaiting submission.
    pending: Vec<Command>,
    /// Commands that have reached the queue, in submission order.
    submitted: Vec<Command>,
    /// Readbacks awaiting completion, fired in order on `wait_idle`.
    readbacks: Vec<(Handle, ReadBack)>,
    compiles: usize,
    pipelines: usize,
    set_builds: usize,
}

impl Default for Headless {
    fn default() -> Self {
        Self::new()
    }
}

impl Headless {
    pub fn new() -> Self {
        Self {
            id: DeviceId::new(),
            objects: HashMap::default(),
            list: None,
            pending: Vec::new(),
            submitted: Vec::new(),
            readbacks: Vec::new(),
            compiles: 0,
            pipelines: 0,
            set_builds: 0,
        }
    }

    /// Number of shader compilations attempted so far.
    #[inline]
    pub fn compile_count(&self) -> usize {
        self.compiles
    }

    /// Number of compute pipelines built so far.
    #[inline]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines
    }

    /// Number of native uniform sets built so far.
    #[inline]
    pub fn set_build_count(&self) -> usize {
        self.set_builds
    }

    /// Commands that have reached the queue, in submission order.
    #[inline]
    pub fn submitted(&self) -> &[Command] {
        &self.submitted
    }

    /// The entries a cached uniform set was built from.
    pub fn uniform_set(&self, handle: Handle) -> Option<&[Uniform]> {
        match self.objects.get(&handle) {
            Some(Object::UniformSet { uniforms, .. }) => Some(uniforms),
            _ => None,
        }
    }

    /// The set index a cached uniform set was built for.
    pub fn uniform_set_index(&self, handle: Handle) -> Option<u32> {
        match self.objects.get(&handle) {
            Some(Object::UniformSet { index, .. }) => Some(*index),
            _ => None,
        }
    }

    /// Bytes currently stored for a buffer.
    pub fn buffer_data(&self, handle: Handle) -> Option<&[u8]> {
        match self.objects.get(&handle) {
            Some(Object::UniformBuffer(data) | Object::StorageBuffer(data)) => Some(data),
            _ => None,
        }
    }

    /// Bytes currently stored for a texture, with its dimensions.
    pub fn texture_data(&self, handle: Handle) -> Option<(TextureSpec, &[u8])> {
        match self.objects.get(&handle) {
            Some(Object::Texture { spec, data }) => Some((*spec, data)),
            _ => None,
        }
    }

    fn insert(&mut self, object: Object) -> Handle {
        let handle = Handle::new();
        self.objects.insert(handle, object);
        handle
    }

    fn create_buffer(&mut self, size: u64, data: Option<&[u8]>, uniform: bool) -> Handle {
        let mut bytes = data.map(<[u8]>::to_vec).unwrap_or_default();
        bytes.resize(size as usize, 0);
        match uniform {
            true => self.insert(Object::UniformBuffer(bytes)),
            false => self.insert(Object::StorageBuffer(bytes)),
        }
    }

    fn buffer(&self, handle: Handle) -> Result<&Vec<u8>, DeviceError> {
        match self.objects.get(&handle) {
            Some(Object::UniformBuffer(data) | Object::StorageBuffer(data)) => Ok(data),
            Some(_) => Err(DeviceError::WrongKind {
                handle,
                expect: "buffer",
            }),
            None => Err(DeviceError::UnknownHandle(handle)),
        }
    }

    fn record(&mut self, command: Command) -> Result<(), DeviceError> {
        match &mut self.list {
            Some(list) => {
                list.push(command);
                Ok(())
            }
            None => Err(DeviceError::ListClosed),
        }
    }

    fn expect(&self, handle: Handle, expect: &'static str) -> Result<(), DeviceError> {
        let object = self
            .objects
            .get(&handle)
            .ok_or(DeviceError::UnknownHandle(handle))?;
        let matched = matches!(
            (object, expect),
            (Object::Pipeline { .. }, "pipeline")
                | (Object::Shader, "shader")
                | (Object::UniformSet { .. }, "uniform set")
                | (Object::Texture { .. }, "texture")
        );
        match matched {
            true => Ok(()),
            false => Err(DeviceError::WrongKind { handle, expect }),
        }
    }
}

impl Device for Headless {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn compile_shader(&mut self, source: &str, label: &str) -> Result<Handle, DeviceError> {
        self.compiles += 1;
        parse_wgsl(source, label)?;
        Ok(self.insert(Object::Shader))
    }

    fn create_compute_pipeline(&mut self, shader: Handle) -> Result<Handle, DeviceError> {
        self.expect(shader, "shader")?;
        self.pipelines += 1;
        Ok(self.insert(Object::Pipeline { shader }))
    }

    fn create_uniform_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError> {
        Ok(self.create_buffer(size, data, true))
    }

    fn create_storage_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError> {
        Ok(self.create_buffer(size, data, false))
    }

    fn update_buffer(
        &mut self,
        buffer: Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let size = self.buffer(buffer)?.len() as u64;
        let (offset, len) = (offset, data.len() as u64);
        if offset + len > size {
            return Err(DeviceError::BufferOverrun { offset, len, size });
        }
        match self.objects.get_mut(&buffer) {
            Some(Object::UniformBuffer(bytes) | Object::StorageBuffer(bytes)) => {
                bytes[offset as usize..(offset + len) as usize].copy_from_slice(data);
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn read_buffer(&mut self, buffer: Handle) -> Result<Vec<u8>, DeviceError> {
        Ok(self.buffer(buffer)?.clone())
    }

    fn read_buffer_async(
        &mut self,
        buffer: Handle,
        callback: ReadBack,
    ) -> Result<(), DeviceError> {
        self.buffer(buffer)?;
        self.readbacks.push((buffer, callback));
        Ok(())
    }

    fn create_texture(
        &mut self,
        spec: TextureSpec,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError> {
        let expect = spec.data_size();
        if let Some(data) = data {
            if data.len() != expect {
                return Err(DeviceError::TextureSize {
                    len: data.len(),
                    expect,
                });
            }
        }
        let data = data.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0; expect]);
        Ok(self.insert(Object::Texture { spec, data }))
    }

    fn update_texture(&mut self, texture: Handle, data: &[u8]) -> Result<(), DeviceError> {
        self.expect(texture, "texture")?;
        let Some(Object::Texture { spec, data: stored }) = self.objects.get_mut(&texture) else {
            unreachable!()
        };
        if data.len() != spec.data_size() {
            return Err(DeviceError::TextureSize {
                len: data.len(),
                expect: spec.data_size(),
            });
        }
        stored.copy_from_slice(data);
        Ok(())
    }

    fn create_uniform_set(
        &mut self,
        uniforms: &[Uniform],
        pipeline: Handle,
        index: u32,
    ) -> Result<Handle, DeviceError> {
        self.expect(pipeline, "pipeline")?;
        for uniform in uniforms {
            if !self.objects.contains_key(&uniform.handle) {
                return Err(DeviceError::UnknownHandle(uniform.handle));
            }
        }
        if let Some((_, binding)) = uniforms
            .iter()
            .map(|uniform| uniform.binding)
            .tuple_windows()
            .find(|(prev, next)| prev >= next)
        {
            return Err(DeviceError::BindingOrder(binding));
        }
        self.set_builds += 1;
        let uniforms = uniforms.to_vec();
        Ok(self.insert(Object::UniformSet { uniforms, index }))
    }

    fn is_valid(&self, handle: Handle) -> bool {
        self.objects.contains_key(&handle)
    }

    fn free(&mut self, handle: Handle) {
        if self.objects.remove(&handle).is_none() {
            log::warn!("freeing unknown handle {handle}");
        }
    }

    fn compute_list_begin(&mut self) -> Result<(), DeviceError> {
        match self.list {
            Some(_) => Err(DeviceError::ListOpen),
            None => {
                self.list = Some(Vec::new());
                Ok(())
            }
        }
    }

    fn compute_list_bind_pipeline(&mut self, pipeline: Handle) -> Result<(), DeviceError> {
        self.expect(pipeline, "pipeline")?;
        self.record(Command::BindPipeline(pipeline))
    }

    fn compute_list_push_constants(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.record(Command::PushConstants(data.to_vec()))
    }

    fn compute_list_bind_uniform_set(
        &mut self,
        set: Handle,
        index: u32,
    ) -> Result<(), DeviceError> {
        self.expect(set, "uniform set")?;
        self.record(Command::BindUniformSet { set, index })
    }

    fn compute_list_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        self.record(Command::Dispatch([x, y, z]))
    }

    fn compute_list_end(&mut self) -> Result<(), DeviceError> {
        match self.list.take() {
            Some(mut list) => {
                self.pending.append(&mut list);
                Ok(())
            }
            None => Err(DeviceError::ListClosed),
        }
    }

    fn submit(&mut self) {
        self.submitted.append(&mut self.pending);
    }

    fn wait_idle(&mut self) {
        for (buffer, callback) in std::mem::take(&mut self.readbacks) {
            let data = match self.objects.get(&buffer) {
                Some(Object::UniformBuffer(data) | Object::StorageBuffer(data)) => {
                    Ok(data.clone())
                }
                _ => Err(DeviceError::UnknownHandle(buffer)),
            };
            callback(data);
        }
    }
}
