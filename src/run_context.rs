//! Per-call execution environment.
//!
//! A [`RunContext`] is built fresh for each engine call from the script path and the
//! run metadata. Process-level changes (the working directory) are applied through
//! an [`EnvGuard`] that restores them when dropped, on every exit path.

use std::path::{Path, PathBuf};

use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};

use crate::metadata::RunMetadata;

pub const UNTITLED: &str = "<untitled>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Working directory for the call; untitled scripts keep the host's.
    pub cwd: Option<PathBuf>,
    /// Directories searched by `import`, in priority order.
    pub search_paths: Vec<PathBuf>,
    /// `[scriptname] + args`.
    pub argv: Vec<String>,
}

impl RunContext {
    pub fn for_script(path: Option<&Path>, meta: &RunMetadata) -> Self {
        let script_dir = path
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf);

        let mut search_paths = Vec::new();
        if let Some(dir) = &script_dir {
            search_paths.push(dir.clone());
        }
        if let Some(venv) = &meta.virtualenv {
            search_paths.push(venv.clone());
        }

        let name = path
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| UNTITLED.to_string());
        let mut argv = vec![name];
        argv.extend(meta.args.iter().cloned());

        Self {
            cwd: script_dir,
            search_paths,
            argv,
        }
    }

    /// Module resolver that looks in each search path in turn.
    pub fn module_resolver(&self) -> ModuleResolversCollection {
        let mut resolvers = ModuleResolversCollection::new();
        for dir in &self.search_paths {
            resolvers.push(FileModuleResolver::new_with_path(dir));
        }
        resolvers
    }

    pub fn argv_array(&self) -> rhai::Array {
        self.argv.iter().map(|a| rhai::Dynamic::from(a.clone())).collect()
    }
}

/// Restores the process working directory on drop.
#[derive(Debug)]
pub struct EnvGuard {
    saved_cwd: Option<PathBuf>,
}

impl EnvGuard {
    pub fn enter(ctx: &RunContext) -> std::io::Result<Self> {
        let saved_cwd = match &ctx.cwd {
            Some(dir) => {
                // the previous directory may already be gone; then there is nothing to restore
                let saved = std::env::current_dir().ok();
                std::env::set_current_dir(dir)?;
                saved
            }
            None => None,
        };
        Ok(Self { saved_cwd })
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.saved_cwd.take() {
            if let Err(e) = std::env::set_current_dir(&dir) {
                log::error!("failed to restore working directory {:?}: {}", dir, e);
            }
        }
    }
}
