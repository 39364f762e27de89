use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    device::{Device, DeviceError, DeviceId, Handle, ReadBack, Uniform},
    resource::{BufferClass, BufferResource, ResourceKind, TextureResource},
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("resource `{0}` is already registered")]
    NameTaken(String),
    #[error("unknown resource `{0}`")]
    Unknown(String),
    #[error("resource `{0}` is not a {1}")]
    KindMismatch(String, &'static str),
    #[error("buffer `{0}` is not a storage buffer and cannot be read back")]
    NotReadable(String),
    #[error("resource `{0}` has not been realized on this device")]
    NotRealized(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

enum Entry {
    Buffer(BufferResource),
    Texture(TextureResource),
}

impl Entry {
    fn kind(&self) -> ResourceKind {
        match self {
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::Texture(_) => ResourceKind::Texture,
        }
    }
}

/// The name → resource catalog: the single namespace through which programs
/// look up buffers and textures.
///
/// Names are shared across all programs, so two programs binding the same
/// name exchange data purely through this catalog. A name maps to exactly
/// one resource and one kind for the catalog's lifetime; registration under
/// a taken name is rejected without touching the original.
///
/// The catalog is an explicit, constructed object owned by one root context,
/// not process-global state; independent instances never share names.
#[derive(Default)]
pub struct ResourceStorage {
    entries: HashMap<String, Entry>,
    /// The process's default/shared device. Texture-realized callbacks fire
    /// only for rebuilds on it.
    primary: Option<DeviceId>,
}

impl ResourceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the default/shared device for texture-realized callbacks.
    pub fn set_primary(&mut self, device: DeviceId) {
        self.primary = Some(device);
    }

    #[inline]
    pub fn primary(&self) -> Option<DeviceId> {
        self.primary
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The kind a name is registered under, if any.
    pub fn kind(&self, name: &str) -> Option<ResourceKind> {
        self.entries.get(name).map(Entry::kind)
    }

    /// Registers a new buffer under `name`.
    pub fn create_buffer(
        &mut self,
        name: &str,
        class: BufferClass,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        if self.entries.contains_key(name) {
            return Err(StorageError::NameTaken(name.into()));
        }
        let buffer = BufferResource::new(class, size, data);
        self.entries.insert(name.into(), Entry::Buffer(buffer));
        Ok(())
    }

    /// Registers a new texture under `name`.
    pub fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
    ) -> Result<(), StorageError> {
        if self.entries.contains_key(name) {
            return Err(StorageError::NameTaken(name.into()));
        }
        let texture = TextureResource::new(width, height);
        self.entries.insert(name.into(), Entry::Texture(texture));
        Ok(())
    }

    fn buffer(&self, name: &str) -> Result<&BufferResource, StorageError> {
        match self.entries.get(name) {
            Some(Entry::Buffer(buffer)) => Ok(buffer),
            Some(_) => Err(StorageError::KindMismatch(name.into(), "buffer")),
            None => Err(StorageError::Unknown(name.into())),
        }
    }

    fn buffer_mut(&mut self, name: &str) -> Result<&mut BufferResource, StorageError> {
        match self.entries.get_mut(name) {
            Some(Entry::Buffer(buffer)) => Ok(buffer),
            Some(_) => Err(StorageError::KindMismatch(name.into(), "buffer")),
            None => Err(StorageError::Unknown(name.into())),
        }
    }

    fn texture_mut(&mut self, name: &str) -> Result<&mut TextureResource, StorageError> {
        match self.entries.get_mut(name) {
            Some(Entry::Texture(texture)) => Ok(texture),
            Some(_) => Err(StorageError::KindMismatch(name.into(), "texture")),
            None => Err(StorageError::Unknown(name.into())),
        }
    }

    /// Replaces a buffer's payload, dirtying every device that holds it.
    pub fn set_data(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.buffer_mut(name)?.set_data(data);
        Ok(())
    }

    /// Resizes a buffer without data, dirtying every device that holds it.
    pub fn set_size(&mut self, name: &str, size: u64) -> Result<(), StorageError> {
        self.buffer_mut(name)?.set_size(size);
        Ok(())
    }

    /// Replaces a texture's pixels (and possibly dimensions).
    pub fn set_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<(), StorageError> {
        self.texture_mut(name)?.set_texture(width, height, pixels);
        Ok(())
    }

    /// Registers an observer of a texture's primary-device image handle.
    pub fn on_texture_realized(
        &mut self,
        name: &str,
        callback: impl FnMut(Handle) + 'static,
    ) -> Result<(), StorageError> {
        self.texture_mut(name)?.on_realized(callback);
        Ok(())
    }

    /// The cached device handle for a name, if realized on `device`.
    pub fn handle(&self, name: &str, device: DeviceId) -> Option<Handle> {
        match self.entries.get(name)? {
            Entry::Buffer(buffer) => buffer.handle(device),
            Entry::Texture(texture) => texture.handle(device),
        }
    }

    /// Ensures the named resource is current on `device` and exports its
    /// binding descriptor. Reports whether a fresh handle was built.
    pub fn materialize<D: Device>(
        &mut self,
        name: &str,
        device: &mut D,
        binding: u32,
    ) -> Result<(Uniform, bool), StorageError> {
        let primary = self.primary == Some(device.id());
        match self.entries.get_mut(name) {
            Some(Entry::Buffer(buffer)) => Ok(buffer.materialize(device, binding)?),
            Some(Entry::Texture(texture)) => Ok(texture.materialize(device, binding, primary)?),
            None => Err(StorageError::Unknown(name.into())),
        }
    }

    /// Synchronously copies a storage buffer's device memory back to the
    /// host. Only valid after the submission that produced the data has been
    /// waited on.
    pub fn read_back<D: Device>(
        &self,
        name: &str,
        device: &mut D,
    ) -> Result<Vec<u8>, StorageError> {
        let handle = self.readable(name, device.id())?;
        Ok(device.read_buffer(handle)?)
    }

    /// Queues a storage-buffer readback; the callback fires once the device
    /// completes the transfer.
    pub fn read_back_async<D: Device>(
        &self,
        name: &str,
        device: &mut D,
        callback: ReadBack,
    ) -> Result<(), StorageError> {
        let handle = self.readable(name, device.id())?;
        Ok(device.read_buffer_async(handle, callback)?)
    }

    fn readable(&self, name: &str, device: DeviceId) -> Result<Handle, StorageError> {
        let buffer = self.buffer(name)?;
        if buffer.class() != BufferClass::Storage {
            return Err(StorageError::NotReadable(name.into()));
        }
        buffer
            .handle(device)
            .ok_or_else(|| StorageError::NotRealized(name.into()))
    }

    /// Frees one name's handle realized on `device`.
    pub fn release<D: Device>(&mut self, name: &str, device: &mut D) -> Result<(), StorageError> {
        match self.entries.get_mut(name) {
            Some(Entry::Buffer(buffer)) => Ok(buffer.release(device)),
            Some(Entry::Texture(texture)) => Ok(texture.release(device)),
            None => Err(StorageError::Unknown(name.into())),
        }
    }

    /// Frees every catalog handle realized on `device`. The registrations
    /// themselves survive and rebuild on next use.
    pub fn release_all<D: Device>(&mut self, device: &mut D) {
        for entry in self.entries.values_mut() {
            match entry {
                Entry::Buffer(buffer) => buffer.release(device),
                Entry::Texture(texture) => texture.release(device),
            }
        }
    }
}
