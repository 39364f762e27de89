use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs,
    path::PathBuf,
    time::SystemTime,
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    device::{Device, DeviceError, DeviceId, Handle},
    storage::{ResourceStorage, StorageError},
    uniform::UniformSet,
};

/// A change stamp for a shader source. A dispatch recompiles for a device
/// when the stamp it cached no longer matches the source's current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStamp {
    /// Filesystem modification time of a file source.
    Modified(SystemTime),
    /// Explicit revision of an inline source.
    Revision(u64),
}

/// Where a program's WGSL comes from.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    /// Loaded from disk on each compile; stamped by the file's modification
    /// time, so editing the file triggers recompilation.
    File(PathBuf),
    /// Text embedded in the application; stamped by a revision that bumps on
    /// every replacement.
    Inline {
        text: Cow<'static, str>,
        revision: u64,
    },
}

impl ShaderSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn inline(text: impl Into<Cow<'static, str>>) -> Self {
        Self::Inline {
            text: text.into(),
            revision: 0,
        }
    }

    /// Replaces the text, bumping the revision. A file source becomes an
    /// inline one.
    pub fn set_text(&mut self, text: impl Into<Cow<'static, str>>) {
        let revision = match self {
            Self::Inline { revision, .. } => *revision + 1,
            Self::File(_) => 0,
        };
        *self = Self::Inline {
            text: text.into(),
            revision,
        };
    }

    fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Inline { revision, .. } => format!("inline#{revision}"),
        }
    }

    fn stamp(&self) -> Result<SourceStamp, ProgramError> {
        match self {
            Self::File(path) => {
                let io = |source| ProgramError::Source {
                    path: path.clone(),
                    source,
                };
                let modified = fs::metadata(path).map_err(io)?.modified().map_err(io)?;
                Ok(SourceStamp::Modified(modified))
            }
            Self::Inline { revision, .. } => Ok(SourceStamp::Revision(*revision)),
        }
    }

    fn load(&self) -> Result<Cow<'_, str>, ProgramError> {
        match self {
            Self::File(path) => {
                let text = fs::read_to_string(path).map_err(|source| ProgramError::Source {
                    path: path.clone(),
                    source,
                })?;
                Ok(Cow::Owned(text))
            }
            Self::Inline { text, .. } => Ok(Cow::Borrowed(text)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("program is closed")]
    Closed,
    #[error("failed to read shader source {path:?}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Compiled state for one device.
#[derive(Debug, Clone, Copy)]
struct Compiled {
    shader: Handle,
    pipeline: Handle,
    stamp: SourceStamp,
}

/// A compute program: one shader source, the pipelines compiled from it per
/// device, and the uniform sets dispatched with it.
///
/// Pipelines are built on first dispatch per device and rebuilt whenever the
/// source's stamp changes. A failed compile caches nothing, so the device
/// stays uncompiled and the next dispatch retries. Dispatch records commands
/// only; submission stays an explicit, caller-driven step, so several
/// dispatches can be batched before one submit.
pub struct ComputeProgram {
    source: ShaderSource,
    /// Owned descriptor sets by set index.
    sets: BTreeMap<u32, UniformSet>,
    compiled: HashMap<DeviceId, Compiled>,
    closed: bool,
}

impl ComputeProgram {
    pub fn new(source: ShaderSource) -> Self {
        Self {
            source,
            sets: BTreeMap::new(),
            compiled: HashMap::default(),
            closed: false,
        }
    }

    #[inline]
    pub fn source(&self) -> &ShaderSource {
        &self.source
    }

    /// Mutable access to the source, e.g. to bump an inline revision.
    #[inline]
    pub fn source_mut(&mut self) -> &mut ShaderSource {
        &mut self.source
    }

    /// Swaps the shader source; every device recompiles on its next
    /// dispatch.
    pub fn set_source(&mut self, source: ShaderSource) {
        self.source = source;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The uniform set at `index`, created empty on first use.
    pub fn uniform_set(&mut self, index: u32) -> &mut UniformSet {
        self.sets.entry(index).or_default()
    }

    /// Binds resource `name` at `binding` of set `index`.
    pub fn bind(&mut self, index: u32, binding: u32, name: impl Into<String>) {
        self.uniform_set(index).bind(name, binding);
    }

    /// Records one dispatch with the given thread-group counts into a fresh
    /// compute list on `device`, recompiling the pipeline first if the
    /// source changed. `push_constants` are passed through at caller-packed
    /// size. Nothing is submitted.
    pub fn dispatch<D: Device>(
        &mut self,
        storage: &mut ResourceStorage,
        device: &mut D,
        x: u32,
        y: u32,
        z: u32,
        push_constants: Option<&[u8]>,
    ) -> Result<(), ProgramError> {
        if self.closed {
            return Err(ProgramError::Closed);
        }

        let stamp = self.source.stamp()?;
        let id = device.id();
        let fresh = self
            .compiled
            .get(&id)
            .filter(|compiled| compiled.stamp == stamp);
        let pipeline = match fresh {
            Some(compiled) => compiled.pipeline,
            None => {
                if let Some(previous) = self.compiled.remove(&id) {
                    device.free_checked(previous.pipeline);
                    device.free_checked(previous.shader);
                }
                let text = self.source.load()?;
                let shader = device.compile_shader(&text, &self.source.label())?;
                let pipeline = match device.create_compute_pipeline(shader) {
                    Ok(pipeline) => pipeline,
                    Err(err) => {
                        device.free(shader);
                        return Err(err.into());
                    }
                };
                self.compiled.insert(
                    id,
                    Compiled {
                        shader,
                        pipeline,
                        stamp,
                    },
                );
                pipeline
            }
        };

        let mut handles = Vec::with_capacity(self.sets.len());
        for (index, set) in &mut self.sets {
            handles.push((*index, set.resolve(storage, device, pipeline, *index)?));
        }

        device.compute_list_begin()?;
        device.compute_list_bind_pipeline(pipeline)?;
        if let Some(push) = push_constants {
            device.compute_list_push_constants(push)?;
        }
        for (index, handle) in handles {
            device.compute_list_bind_uniform_set(handle, index)?;
        }
        device.compute_list_dispatch(x, y, z)?;
        device.compute_list_end()?;
        Ok(())
    }

    /// Frees everything this program realized on `device`: its uniform-set
    /// handles and its shader module and pipeline. The program stays usable
    /// on other devices.
    pub fn release<D: Device>(&mut self, device: &mut D) {
        for set in self.sets.values_mut() {
            set.release(device);
        }
        if let Some(compiled) = self.compiled.remove(&device.id()) {
            device.free_checked(compiled.pipeline);
            device.free_checked(compiled.shader);
        }
    }

    /// Releases `device` and transitions to closed; any further dispatch
    /// fails. Owners of multi-device programs release secondary devices
    /// first and close on the last.
    pub fn close<D: Device>(&mut self, device: &mut D) {
        self.release(device);
        self.sets.clear();
        self.closed = true;
    }
}
