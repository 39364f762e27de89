use rustc_hash::FxHashMap as HashMap;

use crate::device::{DeviceId, Handle};

pub use buffer::{BufferClass, BufferResource};
pub use texture::{Realized, TextureResource};

pub mod buffer;
pub mod texture;

/// Kind tag under which a name is registered in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
}

/// Realization state of a resource on one device.
///
/// The handle is valid iff `rebuild` is false; buffer content is current iff
/// `update` is false.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Slot {
    pub handle: Option<Handle>,
    pub rebuild: bool,
    pub update: bool,
}

/// Per-device state table shared by both resource variants. Keys are exactly
/// the devices that have ever realized the resource; marking one device
/// never touches another's slot.
#[derive(Debug, Default)]
pub(crate) struct Slots(HashMap<DeviceId, Slot>);

impl Slots {
    /// Marks every known device for a full rebuild.
    pub fn mark_rebuild(&mut self) {
        self.0.values_mut().for_each(|slot| slot.rebuild = true);
    }

    /// Marks every known device for an in-place content update.
    pub fn mark_update(&mut self) {
        self.0.values_mut().for_each(|slot| slot.update = true);
    }

    /// The slot for `device`, registering it dirty on first sight.
    pub fn entry(&mut self, device: DeviceId) -> &mut Slot {
        self.0.entry(device).or_insert(Slot {
            handle: None,
            rebuild: true,
            update: false,
        })
    }

    pub fn get(&self, device: DeviceId) -> Option<&Slot> {
        self.0.get(&device)
    }

    /// Forgets `device`, handing back its slot for the caller to free.
    pub fn remove(&mut self, device: DeviceId) -> Option<Slot> {
        self.0.remove(&device)
    }
}
