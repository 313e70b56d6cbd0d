//! Isolated runtime workspace for the worker.
//!
//! Layout of a bootstrapped workspace:
//!
//! ```text
//! <tmp>/imagejfindXXXXXX/
//! ├── ImageJ.zip                  copy of the worker archive
//! └── ImageJ/                     unpacked worker tree (worker's cwd)
//!     ├── ijloader.jar            loader support file
//!     ├── macros/<bundle files>
//!     └── plugins/
//!         ├── diamond_filter.jar  filter support file
//!         └── Diamond/<bundle files>
//! ```

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::WorkspaceSources;
use crate::error::{IjError, Result};
use crate::paths;

/// A bootstrapped workspace. The directory tree is removed by [`Workspace::remove`]
/// or when the value is dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    worker_dir: PathBuf,
}

impl Workspace {
    /// Root of the workspace.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Unpacked worker tree; the worker runs with this as its cwd.
    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    /// Recursively delete the workspace.
    pub fn remove(self) -> Result<()> {
        let root = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| IjError::Workspace(format!("removing {}: {}", root.display(), e)))
    }
}

/// Attach the failing step and path to an I/O error.
fn step<T>(what: &str, path: &Path, result: io::Result<T>) -> Result<T> {
    result.map_err(|e| IjError::Workspace(format!("{} {}: {}", what, path.display(), e)))
}

/// Build a fresh workspace from the worker archive, the support files, and the
/// user's macro bundle (tar bytes).
///
/// Any failure is fatal. A partially built directory is removed before the
/// error is returned.
pub fn bootstrap(sources: &WorkspaceSources, macro_bundle: &[u8]) -> Result<Workspace> {
    let dir = tempfile::Builder::new()
        .prefix(paths::WORKSPACE_PREFIX)
        .tempdir()
        .map_err(|e| IjError::Workspace(format!("creating temporary directory: {}", e)))?;
    let root = dir.path().to_path_buf();
    debug!(workspace = %root.display(), "Created workspace directory");

    // Worker distribution
    let archive_src = sources.worker_archive_path();
    let archive_copy = root.join(&sources.worker_archive);
    step("copying", &archive_src, fs::copy(&archive_src, &archive_copy))?;
    let archive_file = step("opening", &archive_copy, File::open(&archive_copy))?;
    let mut archive = zip::ZipArchive::new(archive_file)?;
    archive.extract(&root)?;

    let worker_dir = root.join(&sources.worker_dir);
    if !worker_dir.is_dir() {
        return Err(IjError::Workspace(format!(
            "archive {} does not contain directory '{}'",
            archive_src.display(),
            sources.worker_dir
        )));
    }

    // Support files
    let loader_src = sources.loader_path();
    let loader_dst = worker_dir.join(&sources.loader);
    step("copying", &loader_src, fs::copy(&loader_src, &loader_dst))?;

    let plugins = worker_dir.join(paths::PLUGINS_DIR);
    step("creating", &plugins, fs::create_dir_all(&plugins))?;
    let plugin_src = sources.filter_plugin_path();
    let plugin_dst = plugins.join(&sources.filter_plugin);
    step("copying", &plugin_src, fs::copy(&plugin_src, &plugin_dst))?;

    // User macro bundle, unpacked twice so the worker finds it either way
    let data_dir = plugins.join(&sources.plugin_data_dir);
    step(
        "creating",
        &data_dir,
        fs::DirBuilder::new().mode(0o700).create(&data_dir),
    )?;
    unpack_bundle(macro_bundle, &data_dir)?;

    let macros = worker_dir.join(paths::MACROS_DIR);
    step("creating", &macros, fs::create_dir_all(&macros))?;
    unpack_bundle(macro_bundle, &macros)?;

    info!(
        workspace = %root.display(),
        bundle_bytes = macro_bundle.len(),
        "Workspace ready"
    );

    Ok(Workspace { dir, worker_dir })
}

/// Unpack a tar byte blob into `dest`. Entries escaping `dest` are rejected.
fn unpack_bundle(bundle: &[u8], dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(bundle);
    step("unpacking macro bundle into", dest, archive.unpack(dest))
}
