use std::borrow::Cow;

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    Device, DeviceError, DeviceId, Handle, ReadBack, TextureSpec, Uniform, UniformKind,
    parse_wgsl,
};

enum Object {
    Buffer(wgpu::Buffer),
    Texture {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
    Shader(wgpu::ShaderModule),
    Pipeline(wgpu::ComputePipeline),
    Set(wgpu::BindGroup),
}

/// A kernel launch recorded into the open compute list.
#[derive(Clone)]
struct Kernel {
    pipeline: wgpu::ComputePipeline,
    push: Option<Vec<u8>>,
    sets: Vec<(u32, wgpu::BindGroup)>,
    dispatch: [u32; 3],
}

/// Recording state of the open compute list. Bindings persist across
/// dispatches within one list.
#[derive(Default)]
struct ListState {
    pipeline: Option<wgpu::ComputePipeline>,
    push: Option<Vec<u8>>,
    sets: Vec<(u32, wgpu::BindGroup)>,
    kernels: Vec<Kernel>,
}

/// A WebGPU-backed [`Device`].
pub struct Gpu {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Every live device-side object, by handle.
    objects: HashMap<Handle, Object>,
    /// The currently open compute list, if any.
    list: Option<ListState>,
    /// Kernel launches awaiting encoding and submission.
    pending: Vec<Kernel>,
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        let features = wgpu::Features::PUSH_CONSTANTS;
        let limits = wgpu::Limits {
            max_push_constant_size: 128,
            ..Default::default()
        };
        Self {
            adapter,
            features,
            limits,
        }
    }

    pub async fn from_instance(instance: &wgpu::Instance) -> Result<Self, GpuBuildError> {
        let adapter = instance.request_adapter(&Default::default()).await?;
        Ok(Self::new(adapter))
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
        } = self;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        Ok(Gpu {
            id: DeviceId::new(),
            device,
            queue,
            objects: HashMap::default(),
            list: None,
            pending: Vec::new(),
        })
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }
}

/// Pads a byte span to WebGPU's copy alignment, zero-filling the tail.
fn pad(data: &[u8]) -> Cow<'_, [u8]> {
    let len = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize;
    match len == data.len() {
        true => Cow::Borrowed(data),
        false => {
            let mut data = data.to_vec();
            data.resize(len, 0);
            Cow::Owned(data)
        }
    }
}

impl Gpu {
    /// The wgpu texture behind a handle, for wiring into a rendering front
    /// end (e.g. the target of a texture-realized callback).
    pub fn texture(&self, handle: Handle) -> Option<&wgpu::Texture> {
        match self.objects.get(&handle) {
            Some(Object::Texture { texture, .. }) => Some(texture),
            _ => None,
        }
    }

    fn insert(&mut self, object: Object) -> Handle {
        let handle = Handle::new();
        self.objects.insert(handle, object);
        handle
    }

    fn buffer(&self, handle: Handle) -> Result<&wgpu::Buffer, DeviceError> {
        match self.objects.get(&handle) {
            Some(Object::Buffer(buffer)) => Ok(buffer),
            Some(_) => Err(DeviceError::WrongKind {
                handle,
                expect: "buffer",
            }),
            None => Err(DeviceError::UnknownHandle(handle)),
        }
    }

    fn create_buffer(&mut self, size: u64, data: Option<&[u8]>, usage: wgpu::BufferUsages) -> Handle {
        let size = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(data) = data {
            let data = pad(data);
            self.queue.write_buffer(&buffer, 0, &data);
        }
        self.insert(Object::Buffer(buffer))
    }

    fn list_mut(&mut self) -> Result<&mut ListState, DeviceError> {
        self.list.as_mut().ok_or(DeviceError::ListClosed)
    }

    fn encode(&self) -> wgpu::CommandBuffer {
        let mut encoder = self.device.create_command_encoder(&Default::default());
        for kernel in &self.pending {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&kernel.pipeline);
            if let Some(push) = &kernel.push {
                pass.set_push_constants(0, push);
            }
            for (index, set) in &kernel.sets {
                pass.set_bind_group(*index, set, &[]);
            }
            pass.dispatch_workgroups(kernel.dispatch[0], kernel.dispatch[1], kernel.dispatch[2]);
        }
        encoder.finish()
    }
}

impl Device for Gpu {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn compile_shader(&mut self, source: &str, label: &str) -> Result<Handle, DeviceError> {
        if let Err(err) = parse_wgsl(source, label) {
            log::error!("{err}");
            return Err(err);
        }
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        Ok(self.insert(Object::Shader(module)))
    }

    fn create_compute_pipeline(&mut self, shader: Handle) -> Result<Handle, DeviceError> {
        let module = match self.objects.get(&shader) {
            Some(Object::Shader(module)) => module,
            Some(_) => {
                return Err(DeviceError::WrongKind {
                    handle: shader,
                    expect: "shader",
                });
            }
            None => return Err(DeviceError::UnknownHandle(shader)),
        };
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: None,
                layout: None,
                module,
                entry_point: None,
                compilation_options: Default::default(),
                cache: None,
            });
        Ok(self.insert(Object::Pipeline(pipeline)))
    }

    fn create_uniform_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError> {
        let usage = wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST;
        Ok(self.create_buffer(size, data, usage))
    }

    fn create_storage_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError> {
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        Ok(self.create_buffer(size, data, usage))
    }

    fn update_buffer(
        &mut self,
        buffer: Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let buffer = self.buffer(buffer)?;
        let data = pad(data);
        let (len, size) = (data.len() as u64, buffer.size());
        if offset + len > size {
            return Err(DeviceError::BufferOverrun { offset, len, size });
        }
        self.queue.write_buffer(buffer, offset, &data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: Handle) -> Result<Vec<u8>, DeviceError> {
        let buffer = self.buffer(buffer)?;
        let (sender, receiver) = flume::bounded(1);
        wgpu::util::DownloadBuffer::read_buffer(
            &self.device,
            &self.queue,
            &buffer.slice(..),
            move |data| {
                _ = sender.send(data);
            },
        );
        _ = self.device.poll(wgpu::PollType::Wait);
        let data = receiver
            .recv()
            .map_err(|_| DeviceError::ReadBack("readback channel dropped".into()))?
            .map_err(|err| DeviceError::ReadBack(err.to_string()))?;
        Ok(data.to_vec())
    }

    fn read_buffer_async(
        &mut self,
        buffer: Handle,
        callback: ReadBack,
    ) -> Result<(), DeviceError> {
        let buffer = self.buffer(buffer)?;
        wgpu::util::DownloadBuffer::read_buffer(
            &self.device,
            &self.queue,
            &buffer.slice(..),
            move |data| {
                let data = data
                    .map(|data| data.to_vec())
                    .map_err(|err| DeviceError::ReadBack(err.to_string()));
                callback(data)
            },
        );
        Ok(())
    }

    fn create_texture(
        &mut self,
        spec: TextureSpec,
        data: Option<&[u8]>,
    ) -> Result<Handle, DeviceError> {
        if let Some(data) = data {
            if data.len() != spec.data_size() {
                return Err(DeviceError::TextureSize {
                    len: data.len(),
                    expect: spec.data_size(),
                });
            }
        }
        let size = wgpu::Extent3d {
            width: spec.width,
            height: spec.height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        if let Some(data) = data {
            self.queue.write_texture(
                texture.as_image_copy(),
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(spec.width * super::TEXEL_SIZE as u32),
                    rows_per_image: Some(spec.height),
                },
                size,
            );
        }
        let view = texture.create_view(&Default::default());
        Ok(self.insert(Object::Texture { texture, view }))
    }

    fn update_texture(&mut self, texture: Handle, data: &[u8]) -> Result<(), DeviceError> {
        let texture = match self.objects.get(&texture) {
            Some(Object::Texture { texture, .. }) => texture,
            Some(_) => {
                return Err(DeviceError::WrongKind {
                    handle: texture,
                    expect: "texture",
                });
            }
            None => return Err(DeviceError::UnknownHandle(texture)),
        };
        let spec = TextureSpec {
            width: texture.width(),
            height: texture.height(),
        };
        if data.len() != spec.data_size() {
            return Err(DeviceError::TextureSize {
                len: data.len(),
                expect: spec.data_size(),
            });
        }
        self.queue.write_texture(
            texture.as_image_copy(),
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(spec.width * super::TEXEL_SIZE as u32),
                rows_per_image: Some(spec.height),
            },
            texture.size(),
        );
        Ok(())
    }

    fn create_uniform_set(
        &mut self,
        uniforms: &[Uniform],
        pipeline: Handle,
        index: u32,
    ) -> Result<Handle, DeviceError> {
        let layout = match self.objects.get(&pipeline) {
            Some(Object::Pipeline(pipeline)) => pipeline.get_bind_group_layout(index),
            Some(_) => {
                return Err(DeviceError::WrongKind {
                    handle: pipeline,
                    expect: "pipeline",
                });
            }
            None => return Err(DeviceError::UnknownHandle(pipeline)),
        };

        let mut entries = Vec::with_capacity(uniforms.len());
        for uniform in uniforms {
            let resource = match (self.objects.get(&uniform.handle), uniform.kind) {
                (
                    Some(Object::Buffer(buffer)),
                    UniformKind::UniformBuffer | UniformKind::StorageBuffer,
                ) => buffer.as_entire_binding(),
                (Some(Object::Texture { view, .. }), UniformKind::Image) => {
                    wgpu::BindingResource::TextureView(view)
                }
                (Some(_), _) => {
                    return Err(DeviceError::WrongKind {
                        handle: uniform.handle,
                        expect: "bindable resource",
                    });
                }
                (None, _) => return Err(DeviceError::UnknownHandle(uniform.handle)),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: uniform.binding,
                resource,
            });
        }

        let set = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &entries,
        });
        Ok(self.insert(Object::Set(set)))
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
                self.list = Some(ListState::default());
                Ok(())
            }
        }
    }

    fn compute_list_bind_pipeline(&mut self, pipeline: Handle) -> Result<(), DeviceError> {
        let pipeline = match self.objects.get(&pipeline) {
            Some(Object::Pipeline(pipeline)) => pipeline.clone(),
            Some(_) => {
                return Err(DeviceError::WrongKind {
                    handle: pipeline,
                    expect: "pipeline",
                });
            }
            None => return Err(DeviceError::UnknownHandle(pipeline)),
        };
        self.list_mut()?.pipeline = Some(pipeline);
        Ok(())
    }

    fn compute_list_push_constants(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.list_mut()?.push = Some(data.to_vec());
        Ok(())
    }

    fn compute_list_bind_uniform_set(
        &mut self,
        set: Handle,
        index: u32,
    ) -> Result<(), DeviceError> {
        let set = match self.objects.get(&set) {
            Some(Object::Set(set)) => set.clone(),
            Some(_) => {
                return Err(DeviceError::WrongKind {
                    handle: set,
                    expect: "uniform set",
                });
            }
            None => return Err(DeviceError::UnknownHandle(set)),
        };
        let list = self.list_mut()?;
        list.sets.retain(|(bound, _)| *bound != index);
        list.sets.push((index, set));
        Ok(())
    }

    fn compute_list_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        let list = self.list_mut()?;
        let pipeline = list.pipeline.clone().ok_or(DeviceError::NoPipeline)?;
        let kernel = Kernel {
            pipeline,
            push: list.push.clone(),
            sets: list.sets.clone(),
            dispatch: [x, y, z],
        };
        list.kernels.push(kernel);
        Ok(())
    }

    fn compute_list_end(&mut self) -> Result<(), DeviceError> {
        match self.list.take() {
            Some(mut list) => {
                self.pending.append(&mut list.kernels);
                Ok(())
            }
            None => Err(DeviceError::ListClosed),
        }
    }

    fn submit(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let command = self.encode();
        self.pending.clear();
        self.queue.submit(Some(command));
    }

    fn wait_idle(&mut self) {
        _ = self.device.poll(wgpu::PollType::Wait);
    }
}
