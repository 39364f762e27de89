use super::{Slot, Slots};
use crate::device::{Device, DeviceError, DeviceId, Handle, Uniform, UniformKind};

/// Storage class of a buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferClass {
    /// Read-only to shader code; allocation sizes are rounded up to the next
    /// multiple of 16 bytes.
    Uniform,
    /// Read/write in shader code; supports readback; sizes are exact.
    Storage,
}

impl BufferClass {
    /// Allocation size for a payload of `len` bytes.
    #[inline]
    fn aligned(self, len: u64) -> u64 {
        match self {
            Self::Uniform => len.next_multiple_of(16),
            Self::Storage => len,
        }
    }

    #[inline]
    fn uniform_kind(self) -> UniformKind {
        match self {
            Self::Uniform => UniformKind::UniformBuffer,
            Self::Storage => UniformKind::StorageBuffer,
        }
    }
}

/// A named uniform- or storage-class buffer, realized lazily on each device
/// that binds it.
pub struct BufferResource {
    class: BufferClass,
    /// Current allocation size in bytes, aligned per class.
    size: u64,
    /// Latest application-supplied payload; `None` means uninitialized.
    data: Option<Vec<u8>>,
    slots: Slots,
}

impl BufferResource {
    pub fn new(class: BufferClass, size: u64, data: Option<&[u8]>) -> Self {
        Self {
            class,
            size: class.aligned(size),
            data: data.map(<[u8]>::to_vec),
            slots: Slots::default(),
        }
    }

    #[inline]
    pub fn class(&self) -> BufferClass {
        self.class
    }

    /// Current allocation size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The cached device handle, if this buffer is realized on `device`.
    pub fn handle(&self, device: DeviceId) -> Option<Handle> {
        self.slots.get(device).and_then(|slot| slot.handle)
    }

    /// Replaces the payload. A changed allocation size marks every known
    /// device for rebuild; the content update is marked regardless.
    pub fn set_data(&mut self, data: &[u8]) {
        let size = self.class.aligned(data.len() as u64);
        if size != self.size {
            self.slots.mark_rebuild();
        }
        self.size = size;
        self.data = Some(data.to_vec());
        self.slots.mark_update();
    }

    /// Drops the payload to uninitialized and reallocates every known
    /// device's buffer at the new size.
    pub fn set_size(&mut self, size: u64) {
        self.data = None;
        self.size = self.class.aligned(size);
        self.slots.mark_rebuild();
    }

    /// Ensures the buffer is current on `device` and exports its binding
    /// descriptor for `binding`. Reports whether a fresh handle was built so
    /// dependent uniform sets know to refresh.
    pub fn materialize<D: Device>(
        &mut self,
        device: &mut D,
        binding: u32,
    ) -> Result<(Uniform, bool), DeviceError> {
        let id = device.id();
        let slot = self.slots.entry(id);
        let rebuild = slot.rebuild || slot.handle.is_none_or(|handle| !device.is_valid(handle));

        let handle = match (rebuild, slot.handle) {
            (false, Some(handle)) => {
                if slot.update {
                    if let Some(data) = self.data.as_deref() {
                        device.update_buffer(handle, 0, data)?;
                    }
                    slot.update = false;
                }
                handle
            }
            (_, previous) => {
                if let Some(previous) = previous {
                    device.free_checked(previous);
                }
                let data = self.data.as_deref();
                let handle = match self.class {
                    BufferClass::Uniform => device.create_uniform_buffer(self.size, data)?,
                    BufferClass::Storage => device.create_storage_buffer(self.size, data)?,
                };
                *slot = Slot {
                    handle: Some(handle),
                    rebuild: false,
                    update: false,
                };
                handle
            }
        };

        let uniform = Uniform {
            kind: self.class.uniform_kind(),
            binding,
            handle,
        };
        Ok((uniform, rebuild))
    }

    /// Frees the handle realized on `device` and forgets the device.
    pub fn release<D: Device>(&mut self, device: &mut D) {
        if let Some(Slot {
            handle: Some(handle),
            ..
        }) = self.slots.remove(device.id())
        {
            device.free_checked(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Headless;

    #[test]
    fn materialize_is_idempotent() {
        let mut device = Headless::new();
        let mut buffer = BufferResource::new(BufferClass::Storage, 64, Some(&[7; 64]));

        let (first, rebuilt) = buffer.materialize(&mut device, 0).unwrap();
        assert!(rebuilt);
        let (second, rebuilt) = buffer.materialize(&mut device, 0).unwrap();
        assert!(!rebuilt);
        assert_eq!(first.handle, second.handle);
        assert_eq!(second.kind, UniformKind::StorageBuffer);
    }

    #[test]
    fn resized_payload_rebuilds_with_a_fresh_handle() {
        let mut device = Headless::new();
        let mut buffer = BufferResource::new(BufferClass::Storage, 64, Some(&[7; 64]));

        let (old, _) = buffer.materialize(&mut device, 0).unwrap();
        buffer.set_data(&[1; 128]);
        let (new, rebuilt) = buffer.materialize(&mut device, 0).unwrap();
        assert!(rebuilt);
        assert_ne!(old.handle, new.handle);
        assert!(!device.is_valid(old.handle));
        assert_eq!(device.buffer_data(new.handle).unwrap(), &[1; 128]);
    }

    #[test]
    fn same_size_payload_updates_in_place() {
        let mut device = Headless::new();
        let mut payload: Vec<u8> = (0..64).map(|_| fastrand::u8(..)).collect();
        let mut buffer = BufferResource::new(BufferClass::Storage, 64, Some(&payload));

        let (old, _) = buffer.materialize(&mut device, 0).unwrap();
        payload.reverse();
        buffer.set_data(&payload);
        let (new, rebuilt) = buffer.materialize(&mut device, 0).unwrap();
        assert!(!rebuilt);
        assert_eq!(old.handle, new.handle);
        assert_eq!(device.buffer_data(new.handle).unwrap(), payload);
    }

    #[test]
    fn devices_are_isolated() {
        let mut a = Headless::new();
        let mut b = Headless::new();
        let mut buffer = BufferResource::new(BufferClass::Storage, 32, Some(&[3; 32]));

        let (on_a, _) = buffer.materialize(&mut a, 0).unwrap();
        let (_, rebuilt) = buffer.materialize(&mut b, 0).unwrap();
        assert!(rebuilt);

        let (again, rebuilt) = buffer.materialize(&mut a, 0).unwrap();
        assert!(!rebuilt);
        assert_eq!(on_a.handle, again.handle);
    }

    #[test]
    fn uniform_class_sizes_round_up_to_16() {
        let buffer = BufferResource::new(BufferClass::Uniform, 20, None);
        assert_eq!(buffer.size(), 32);
        let buffer = BufferResource::new(BufferClass::Storage, 20, None);
        assert_eq!(buffer.size(), 20);

        let mut buffer = BufferResource::new(BufferClass::Uniform, 16, None);
        buffer.set_data(&[0; 17]);
        assert_eq!(buffer.size(), 32);
    }

    #[test]
    fn set_size_reallocates_uninitialized() {
        let mut device = Headless::new();
        let mut buffer = BufferResource::new(BufferClass::Storage, 16, Some(&[9; 16]));

        let (old, _) = buffer.materialize(&mut device, 0).unwrap();
        buffer.set_size(48);
        let (new, rebuilt) = buffer.materialize(&mut device, 0).unwrap();
        assert!(rebuilt);
        assert_ne!(old.handle, new.handle);
        assert_eq!(device.buffer_data(new.handle).unwrap(), &[0; 48]);
    }

    #[test]
    fn release_frees_and_forgets_the_device() {
        let mut device = Headless::new();
        let mut buffer = BufferResource::new(BufferClass::Storage, 16, None);

        let (uniform, _) = buffer.materialize(&mut device, 0).unwrap();
        buffer.release(&mut device);
        assert!(!device.is_valid(uniform.handle));
        assert_eq!(buffer.handle(device.id()), None);

        let (_, rebuilt) = buffer.materialize(&mut device, 0).unwrap();
        assert!(rebuilt);
    }
}
