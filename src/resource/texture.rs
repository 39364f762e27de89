use super::{Slot, Slots};
use crate::device::{Device, DeviceError, DeviceId, Handle, TextureSpec, Uniform, UniformKind};

/// Callback handed the fresh device image each time a texture is rebuilt on
/// the primary device. The handle is an opaque reference a rendering front
/// end can resolve against that device.
pub type Realized = Box<dyn FnMut(Handle)>;

/// A named 2D image, realized lazily on each device that binds it.
///
/// Unlike buffers, a dirty texture is always fully re-uploaded.
pub struct TextureResource {
    spec: TextureSpec,
    /// Latest application-supplied pixels; `None` means uninitialized.
    data: Option<Vec<u8>>,
    /// Observers of the primary device's image handle.
    callbacks: Vec<Realized>,
    slots: Slots,
}

impl TextureResource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            spec: TextureSpec { width, height },
            data: None,
            callbacks: Vec::new(),
            slots: Slots::default(),
        }
    }

    #[inline]
    pub fn spec(&self) -> TextureSpec {
        self.spec
    }

    /// The cached device handle, if this texture is realized on `device`.
    pub fn handle(&self, device: DeviceId) -> Option<Handle> {
        self.slots.get(device).and_then(|slot| slot.handle)
    }

    /// Replaces the image payload. Changed dimensions force a rebuild on
    /// every known device; same-size payloads re-upload in place.
    pub fn set_texture(&mut self, width: u32, height: u32, pixels: &[u8]) {
        let spec = TextureSpec { width, height };
        if spec != self.spec {
            self.slots.mark_rebuild();
        }
        self.spec = spec;
        self.data = Some(pixels.to_vec());
        self.slots.mark_update();
    }

    /// Registers a callback invoked synchronously, once per rebuild on the
    /// primary device, with the fresh image handle.
    pub fn on_realized(&mut self, callback: impl FnMut(Handle) + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Ensures the image is current on `device` and exports its binding
    /// descriptor for `binding`. `primary` marks the process's default
    /// device, the only one whose rebuilds notify callbacks.
    pub fn materialize<D: Device>(
        &mut self,
        device: &mut D,
        binding: u32,
        primary: bool,
    ) -> Result<(Uniform, bool), DeviceError> {
        let id = device.id();
        let slot = self.slots.entry(id);
        let rebuild = slot.rebuild || slot.handle.is_none_or(|handle| !device.is_valid(handle));

        let handle = match (rebuild, slot.handle) {
            (false, Some(handle)) => {
                if slot.update {
                    if let Some(data) = self.data.as_deref() {
                        device.update_texture(handle, data)?;
                    }
                    slot.update = false;
                }
                handle
            }
            (_, previous) => {
                if let Some(previous) = previous {
                    device.free_checked(previous);
                }
                let handle = device.create_texture(self.spec, self.data.as_deref())?;
                *slot = Slot {
                    handle: Some(handle),
                    rebuild: false,
                    update: false,
                };
                if primary {
                    for callback in &mut self.callbacks {
                        callback(handle);
                    }
                }
                handle
            }
        };

        let uniform = Uniform {
            kind: UniformKind::Image,
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
