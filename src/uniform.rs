use std::collections::BTreeMap;

use rustc_hash::FxHashMap as HashMap;

use crate::{
    device::{Device, DeviceId, Handle},
    storage::{ResourceStorage, StorageError},
};

/// Cached native set object for one device.
#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    handle: Option<Handle>,
    rebuild: bool,
}

/// An ordered binding-slot → resource-name map for one descriptor set.
///
/// The native set object is rebuilt only when a binding changes or a bound
/// resource had to rebuild its own handle; otherwise the cached handle is
/// returned untouched. Entries reach the device in ascending binding order,
/// since backends validate by position. Gaps between bindings are fine; a
/// slot can only ever hold one name.
#[derive(Default)]
pub struct UniformSet {
    bindings: BTreeMap<u32, String>,
    slots: HashMap<DeviceId, Slot>,
}

impl UniformSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or overwrites the resource bound at `binding`, marking the
    /// set dirty on every device it has ever been realized on.
    pub fn bind(&mut self, name: impl Into<String>, binding: u32) {
        self.bindings.insert(binding, name.into());
        self.slots.values_mut().for_each(|slot| slot.rebuild = true);
    }

    /// Bound resource names in ascending binding order.
    pub fn bindings(&self) -> impl Iterator<Item = (u32, &str)> {
        self.bindings
            .iter()
            .map(|(binding, name)| (*binding, name.as_str()))
    }

    /// Ensures the native set object on `device` reflects the current
    /// bindings and every bound resource's current handle, and returns it.
    pub fn resolve<D: Device>(
        &mut self,
        storage: &mut ResourceStorage,
        device: &mut D,
        pipeline: Handle,
        index: u32,
    ) -> Result<Handle, StorageError> {
        let slot = self.slots.entry(device.id()).or_insert(Slot {
            handle: None,
            rebuild: true,
        });
        let mut rebuild =
            slot.rebuild || slot.handle.is_none_or(|handle| !device.is_valid(handle));

        let mut uniforms = Vec::with_capacity(self.bindings.len());
        for (binding, name) in &self.bindings {
            let (uniform, rebuilt) = storage.materialize(name, device, *binding)?;
            rebuild |= rebuilt;
            uniforms.push(uniform);
        }

        match (rebuild, slot.handle) {
            (false, Some(handle)) => Ok(handle),
            (_, previous) => {
                if let Some(previous) = previous {
                    device.free_checked(previous);
                }
                let handle = device.create_uniform_set(&uniforms, pipeline, index)?;
                *slot = Slot {
                    handle: Some(handle),
                    rebuild: false,
                };
                Ok(handle)
            }
        }
    }

    /// Frees the cached set handle realized on `device`.
    pub fn release<D: Device>(&mut self, device: &mut D) {
        if let Some(Slot {
            handle: Some(handle),
            ..
        }) = self.slots.remove(&device.id())
        {
            device.free_checked(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::Headless, resource::BufferClass};

    fn pipeline(device: &mut Headless) -> Handle {
        let shader = device
            .compile_shader(
                r#"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(1)
fn main() {
    data[0] = data[0];
}
"#,
                "fixture",
            )
            .unwrap();
        device.create_compute_pipeline(shader).unwrap()
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut device = Headless::new();
        let mut storage = ResourceStorage::new();
        storage
            .create_buffer("buf", BufferClass::Storage, 16, None)
            .unwrap();
        let pipeline = pipeline(&mut device);

        let mut set = UniformSet::new();
        set.bind("buf", 0);
        let first = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();
        let builds = device.set_build_count();
        let second = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(device.set_build_count(), builds);
    }

    #[test]
    fn resource_rebuild_cascades_into_the_set() {
        let mut device = Headless::new();
        let mut storage = ResourceStorage::new();
        storage
            .create_buffer("buf", BufferClass::Storage, 16, None)
            .unwrap();
        let pipeline = pipeline(&mut device);

        let mut set = UniformSet::new();
        set.bind("buf", 0);
        let old = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();

        // resizing the buffer rebuilds it, which must refresh the set even
        // though the binding list is unchanged
        storage.set_size("buf", 64).unwrap();
        let new = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();
        assert_ne!(old, new);
        assert!(!device.is_valid(old));
    }

    #[test]
    fn in_place_updates_do_not_cascade() {
        let mut device = Headless::new();
        let mut storage = ResourceStorage::new();
        storage
            .create_buffer("buf", BufferClass::Storage, 16, Some(&[1; 16]))
            .unwrap();
        let pipeline = pipeline(&mut device);

        let mut set = UniformSet::new();
        set.bind("buf", 0);
        let old = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();

        storage.set_data("buf", &[2; 16]).unwrap();
        let new = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();
        assert_eq!(old, new);
    }

    #[test]
    fn rebinding_marks_realized_devices_dirty() {
        let mut device = Headless::new();
        let mut storage = ResourceStorage::new();
        storage
            .create_buffer("a", BufferClass::Storage, 16, None)
            .unwrap();
        storage
            .create_buffer("b", BufferClass::Storage, 16, None)
            .unwrap();
        let pipeline = pipeline(&mut device);

        let mut set = UniformSet::new();
        set.bind("a", 0);
        let old = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();

        set.bind("b", 0);
        let new = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();
        assert_ne!(old, new);
        let handle = storage.handle("b", device.id()).unwrap();
        assert_eq!(device.uniform_set(new).unwrap()[0].handle, handle);
    }

    #[test]
    fn entries_reach_the_device_in_ascending_binding_order() {
        let mut device = Headless::new();
        let mut storage = ResourceStorage::new();
        for name in ["x", "y", "z"] {
            storage
                .create_buffer(name, BufferClass::Storage, 16, None)
                .unwrap();
        }
        let pipeline = pipeline(&mut device);

        let mut set = UniformSet::new();
        set.bind("z", 3);
        set.bind("x", 0);
        set.bind("y", 2);
        let handle = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();

        let bindings: Vec<u32> = device
            .uniform_set(handle)
            .unwrap()
            .iter()
            .map(|uniform| uniform.binding)
            .collect();
        assert_eq!(bindings, vec![0, 2, 3]);
        assert_eq!(device.uniform_set_index(handle), Some(0));
    }

    #[test]
    fn one_resource_may_fill_several_slots() {
        let mut device = Headless::new();
        let mut storage = ResourceStorage::new();
        storage
            .create_buffer("shared", BufferClass::Storage, 16, None)
            .unwrap();
        let pipeline = pipeline(&mut device);

        let mut set = UniformSet::new();
        set.bind("shared", 0);
        set.bind("shared", 1);
        let handle = set.resolve(&mut storage, &mut device, pipeline, 0).unwrap();

        let uniforms = device.uniform_set(handle).unwrap();
        assert_eq!(uniforms.len(), 2);
        assert_eq!(uniforms[0].handle, uniforms[1].handle);
    }
}
