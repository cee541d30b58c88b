// Shader module loading and management
//
// Vulkan consumes SPIR-V bytecode. Shaders are compiled ahead of time (see
// build.rs) and read from disk here, so they can be swapped while running.

use ash::vk;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

/// Read a SPIR-V file into properly aligned words
pub fn load_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let shader_error = |source| RenderError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(shader_error)?;
    ash::util::read_spv(&mut file).map_err(shader_error)
}

pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: Arc<VulkanDevice>, code: &[u32]) -> RenderResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(RenderError::creation("shader module"))?;
        Ok(Self { handle, device })
    }

    pub fn from_file(device: Arc<VulkanDevice>, path: &Path) -> RenderResult<Self> {
        let code = load_spirv(path)?;
        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Self::new(device, &code)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.handle, None) };
    }
}

/// Whether a filesystem event touched a compiled shader
pub fn is_shader_change(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.extension().is_some_and(|ext| ext == "spv"))
}

/// Watches the shader directory for recompiled SPIR-V
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    directory: PathBuf,
}

impl ShaderWatcher {
    pub fn new(directory: &Path) -> notify::Result<Self> {
        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            // Receiver gone means we're shutting down
            let _ = tx.send(event);
        })?;
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        log::info!("Watching {:?} for shader changes", directory);
        Ok(Self {
            _watcher: watcher,
            events,
            directory: directory.to_path_buf(),
        })
    }

    /// Drain pending events; true if any shader changed since the last poll
    pub fn poll(&self) -> bool {
        let mut changed = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) if is_shader_change(&event) => {
                    log::debug!("Shader change: {:?}", event.paths);
                    changed = true;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watcher error in {:?}: {}", self.directory, e),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::io::Write;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_spirv_writes_count_as_changes() {
        assert!(is_shader_change(&event(
            EventKind::Modify(ModifyKind::Any),
            "shaders/quad.frag.spv"
        )));
        assert!(is_shader_change(&event(
            EventKind::Create(CreateKind::File),
            "shaders/quad.vert.spv"
        )));
        assert!(!is_shader_change(&event(
            EventKind::Modify(ModifyKind::Any),
            "shaders/quad.frag"
        )));
        assert!(!is_shader_change(&event(
            EventKind::Remove(RemoveKind::File),
            "shaders/quad.frag.spv"
        )));
    }

    #[test]
    fn load_spirv_reads_aligned_words() {
        let path = std::env::temp_dir().join(format!("vitreous-{}.spv", std::process::id()));
        let words: [u32; 3] = [0x0723_0203, 0x0001_0000, 42];
        File::create(&path)
            .unwrap()
            .write_all(bytemuck::cast_slice(&words))
            .unwrap();

        let loaded = load_spirv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, words);
    }

    #[test]
    fn missing_shader_reports_path() {
        let err = load_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        match err {
            RenderError::ShaderLoad { path, .. } => assert_eq!(path, Path::new("does/not/exist.spv")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
