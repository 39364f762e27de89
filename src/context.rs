use derive_more::{Deref, DerefMut, Display};
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    device::{Device, Handle, ReadBack},
    program::{ComputeProgram, ProgramError, ShaderSource},
    resource::BufferClass,
    storage::{ResourceStorage, StorageError},
};

/// Identifies a program owned by a [`ComputeContext`].
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct ProgramId(uid::Id<ProgramId>);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("unknown program id: {0}")]
    Unknown(ProgramId),
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// The root object of the layer: one device, one resource catalog whose
/// primary device it is, and any number of compute programs.
///
/// Callers create and update named resources, bind them to program slots,
/// dispatch, then explicitly submit and wait. Readbacks are only valid after
/// the submission that produced their data has been waited on (or, for the
/// async variant, once its callback fires). Multi-device callers reach the
/// lower layers through [`storage_mut`]/[`device_mut`].
///
/// [`storage_mut`]: ComputeContext::storage_mut
/// [`device_mut`]: ComputeContext::device_mut
pub struct ComputeContext<D: Device> {
    device: D,
    storage: ResourceStorage,
    programs: HashMap<ProgramId, ComputeProgram>,
}

impl<D: Device> ComputeContext<D> {
    pub fn new(device: D) -> Self {
        let mut storage = ResourceStorage::new();
        storage.set_primary(device.id());
        Self {
            device,
            storage,
            programs: HashMap::default(),
        }
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[inline]
    pub fn storage(&self) -> &ResourceStorage {
        &self.storage
    }

    #[inline]
    pub fn storage_mut(&mut self) -> &mut ResourceStorage {
        &mut self.storage
    }

    /// Registers a program for `source` and returns its id.
    pub fn add_program(&mut self, source: ShaderSource) -> ProgramId {
        let id = ProgramId(uid::Id::new());
        self.programs.insert(id, ComputeProgram::new(source));
        id
    }

    pub fn program(&self, id: ProgramId) -> Option<&ComputeProgram> {
        self.programs.get(&id)
    }

    pub fn program_mut(&mut self, id: ProgramId) -> Option<&mut ComputeProgram> {
        self.programs.get_mut(&id)
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        class: BufferClass,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.storage.create_buffer(name, class, size, data)
    }

    pub fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
    ) -> Result<(), StorageError> {
        self.storage.create_texture(name, width, height)
    }

    pub fn set_data(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.storage.set_data(name, data)
    }

    pub fn set_size(&mut self, name: &str, size: u64) -> Result<(), StorageError> {
        self.storage.set_size(name, size)
    }

    pub fn set_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), StorageError> {
        self.storage.set_texture(name, width, height, pixels)
    }

    /// Registers an observer of a texture's image handle on the owned
    /// device; invoked each time the image is rebuilt there.
    pub fn on_texture_realized(
        &mut self,
        name: &str,
        callback: impl FnMut(Handle) + 'static,
    ) -> Result<(), StorageError> {
        self.storage.on_texture_realized(name, callback)
    }

    /// Blocking readback of a storage buffer from the owned device.
    pub fn read_back(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.storage.read_back(name, &mut self.device)
    }

    /// Blocking readback cast to a typed vector. The byte length must be a
    /// multiple of `size_of::<T>()`.
    pub fn read_back_as<T: bytemuck::Pod>(&mut self, name: &str) -> Result<Vec<T>, StorageError> {
        let data = self.read_back(name)?;
        Ok(bytemuck::cast_slice(&data).to_vec())
    }

    /// Queues a storage-buffer readback on the owned device; the callback
    /// fires once the transfer completes.
    pub fn read_back_async(&mut self, name: &str, callback: ReadBack) -> Result<(), StorageError> {
        self.storage.read_back_async(name, &mut self.device, callback)
    }

    /// Binds resource `name` at `binding` of descriptor set `set` of a
    /// program.
    pub fn bind(
        &mut self,
        id: ProgramId,
        set: u32,
        binding: u32,
        name: impl Into<String>,
    ) -> Result<(), ContextError> {
        let program = self.programs.get_mut(&id).ok_or(ContextError::Unknown(id))?;
        program.bind(set, binding, name);
        Ok(())
    }

    /// Records one dispatch of a program on the owned device. Nothing is
    /// submitted; call [`submit`](ComputeContext::submit) (or use
    /// [`dispatch_submit`](ComputeContext::dispatch_submit)) to push the
    /// recorded work to the queue.
    pub fn dispatch(
        &mut self,
        id: ProgramId,
        x: u32,
        y: u32,
        z: u32,
        push_constants: Option<&[u8]>,
    ) -> Result<(), ContextError> {
        let program = self.programs.get_mut(&id).ok_or(ContextError::Unknown(id))?;
        program.dispatch(&mut self.storage, &mut self.device, x, y, z, push_constants)?;
        Ok(())
    }

    /// Dispatches and immediately submits.
    pub fn dispatch_submit(
        &mut self,
        id: ProgramId,
        x: u32,
        y: u32,
        z: u32,
        push_constants: Option<&[u8]>,
    ) -> Result<(), ContextError> {
        self.dispatch(id, x, y, z, push_constants)?;
        self.device.submit();
        Ok(())
    }

    /// Pushes all recorded work to the device queue.
    pub fn submit(&mut self) {
        self.device.submit();
    }

    /// Blocks until submitted work, including pending readbacks, completes.
    pub fn wait_idle(&mut self) {
        self.device.wait_idle();
    }

    /// Submits pending work and blocks until it completes.
    pub fn sync(&mut self) {
        self.device.submit();
        self.device.wait_idle();
    }

    /// Closes one program, freeing everything it realized on the owned
    /// device.
    pub fn close(&mut self, id: ProgramId) -> Result<(), ContextError> {
        let mut program = self.programs.remove(&id).ok_or(ContextError::Unknown(id))?;
        program.close(&mut self.device);
        Ok(())
    }

    /// Closes every program and releases every catalog resource realized on
    /// the owned device.
    pub fn close_all(&mut self) {
        for (_, mut program) in self.programs.drain() {
            program.close(&mut self.device);
        }
        self.storage.release_all(&mut self.device);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::device::{Command, Headless};

    const IDENTITY: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = data[id.x];
}
"#;

    const FORWARD: &str = r#"
struct Params {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

var<push_constant> params: Params;

@group(0) @binding(0) var<storage, read> samples: array<f32>;
@group(0) @binding(1) var<storage, read_write> freq: array<f32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < params.count) {
        freq[id.x] = samples[id.x];
    }
}
"#;

    #[test]
    fn identity_round_trip() {
        let mut context = ComputeContext::new(Headless::new());
        let bytes: Vec<u8> = (0..64).collect();
        context
            .create_buffer("X", BufferClass::Storage, 64, Some(&bytes))
            .unwrap();

        let program = context.add_program(ShaderSource::inline(IDENTITY));
        context.bind(program, 0, 0, "X").unwrap();
        context.dispatch(program, 1, 1, 1, None).unwrap();
        context.sync();

        assert_eq!(context.read_back("X").unwrap(), bytes);
        assert_eq!(
            context
                .device()
                .submitted()
                .iter()
                .filter(|command| matches!(command, Command::Dispatch(_)))
                .count(),
            1
        );
    }

    #[test]
    fn spectrum_dispatch_records_one_kernel() {
        let mut context = ComputeContext::new(Headless::new());
        let samples: Vec<f32> = (0..64).map(|_| fastrand::f32()).collect();
        context
            .create_buffer(
                "Samples",
                BufferClass::Storage,
                256,
                Some(bytemuck::cast_slice(&samples)),
            )
            .unwrap();
        context
            .create_buffer("Freq", BufferClass::Storage, 256, None)
            .unwrap();

        let program = context.add_program(ShaderSource::inline(FORWARD));
        context.bind(program, 0, 0, "Samples").unwrap();
        context.bind(program, 0, 1, "Freq").unwrap();

        let push: [u32; 4] = [64, 0, 0, 0];
        context
            .dispatch_submit(program, 64, 1, 1, Some(bytemuck::bytes_of(&push)))
            .unwrap();

        // the uninitialized output buffer was materialized on the device
        let device = context.device();
        assert!(context.storage().handle("Freq", device.id()).is_some());

        let dispatches: Vec<_> = device
            .submitted()
            .iter()
            .filter_map(|command| match command {
                Command::Dispatch(groups) => Some(*groups),
                _ => None,
            })
            .collect();
        assert_eq!(dispatches, vec![[64, 1, 1]]);
        assert!(
            device
                .submitted()
                .contains(&Command::PushConstants(bytemuck::bytes_of(&push).to_vec()))
        );
    }

    #[test]
    fn programs_exchange_data_by_name() {
        let mut context = ComputeContext::new(Headless::new());
        context
            .create_buffer("shared", BufferClass::Storage, 32, Some(&[6; 32]))
            .unwrap();

        let producer = context.add_program(ShaderSource::inline(IDENTITY));
        let consumer = context.add_program(ShaderSource::inline(IDENTITY));
        context.bind(producer, 0, 0, "shared").unwrap();
        context.bind(consumer, 0, 0, "shared").unwrap();

        context.dispatch(producer, 1, 1, 1, None).unwrap();
        context.dispatch(consumer, 1, 1, 1, None).unwrap();
        context.sync();

        // both programs bound the same device-side buffer
        let device = context.device();
        let handle = context.storage().handle("shared", device.id()).unwrap();
        let sets: Vec<_> = device
            .submitted()
            .iter()
            .filter_map(|command| match command {
                Command::BindUniformSet { set, .. } => device.uniform_set(*set),
                _ => None,
            })
            .collect();
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|uniforms| uniforms[0].handle == handle));
    }

    #[test]
    fn async_readback_fires_once_after_wait() {
        let mut context = ComputeContext::new(Headless::new());
        context
            .create_buffer("X", BufferClass::Storage, 16, Some(&[4; 16]))
            .unwrap();
        let program = context.add_program(ShaderSource::inline(IDENTITY));
        context.bind(program, 0, 0, "X").unwrap();
        context.dispatch_submit(program, 1, 1, 1, None).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        context
            .read_back_async("X", {
                let fired = fired.clone();
                Box::new(move |data| {
                    assert_eq!(data.unwrap(), vec![4; 16]);
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            })
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        context.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        context.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closing_a_program_invalidates_its_id() {
        let mut context = ComputeContext::new(Headless::new());
        context
            .create_buffer("X", BufferClass::Storage, 16, None)
            .unwrap();
        let program = context.add_program(ShaderSource::inline(IDENTITY));
        context.bind(program, 0, 0, "X").unwrap();
        context.dispatch(program, 1, 1, 1, None).unwrap();

        context.close(program).unwrap();
        assert!(matches!(
            context.dispatch(program, 1, 1, 1, None),
            Err(ContextError::Unknown(_))
        ));
    }

    #[test]
    fn close_all_releases_catalog_resources() {
        let mut context = ComputeContext::new(Headless::new());
        context
            .create_buffer("X", BufferClass::Storage, 16, Some(&[8; 16]))
            .unwrap();
        let program = context.add_program(ShaderSource::inline(IDENTITY));
        context.bind(program, 0, 0, "X").unwrap();
        context.dispatch_submit(program, 1, 1, 1, None).unwrap();

        context.close_all();
        let id = context.device().id();
        assert_eq!(context.storage().handle("X", id), None);
        assert!(matches!(
            context.read_back("X"),
            Err(StorageError::NotRealized(_))
        ));
    }

    #[test]
    fn texture_realized_callbacks_reach_the_front_end() {
        let mut context = ComputeContext::new(Headless::new());
        context.create_texture("Spectrum", 8, 8).unwrap();
        context
            .create_buffer("X", BufferClass::Storage, 16, None)
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        context
            .on_texture_realized("Spectrum", {
                let seen = seen.clone();
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let program = context.add_program(ShaderSource::inline(
            r#"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;
@group(0) @binding(1) var image: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(image, vec2<i32>(i32(id.x), 0), vec4<f32>(f32(data[id.x])));
}
"#,
        ));
        context.bind(program, 0, 0, "X").unwrap();
        context.bind(program, 0, 1, "Spectrum").unwrap();

        context.dispatch(program, 8, 8, 1, None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        context.dispatch(program, 8, 8, 1, None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn typed_readback_casts_bytes() {
        let mut context = ComputeContext::new(Headless::new());
        let values: [u32; 4] = [1, 2, 3, 4];
        context
            .create_buffer(
                "values",
                BufferClass::Storage,
                16,
                Some(bytemuck::cast_slice(&values)),
            )
            .unwrap();
        let program = context.add_program(ShaderSource::inline(IDENTITY));
        context.bind(program, 0, 0, "values").unwrap();
        context.dispatch_submit(program, 4, 1, 1, None).unwrap();
        context.wait_idle();

        assert_eq!(context.read_back_as::<u32>("values").unwrap(), values);
    }
}
