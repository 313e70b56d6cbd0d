//! Path utilities for ijexec assets and workspaces.

use std::path::PathBuf;

/// Default file name of the worker distribution archive.
pub const WORKER_ARCHIVE_FILENAME: &str = "ImageJ.zip";

/// Directory the worker archive unpacks into.
pub const WORKER_DIR: &str = "ImageJ";

/// Loader support file, placed next to the worker's main jar.
pub const LOADER_FILENAME: &str = "ijloader.jar";

/// Filter support file, placed in the worker's plugin directory.
pub const FILTER_PLUGIN_FILENAME: &str = "diamond_filter.jar";

/// Plugin directory inside the worker tree.
pub const PLUGINS_DIR: &str = "plugins";

/// Data directory (inside `plugins/`) that receives the user's macro bundle.
pub const PLUGIN_DATA_DIR: &str = "Diamond";

/// Macro directory inside the worker tree; receives a second copy of the bundle.
pub const MACROS_DIR: &str = "macros";

/// Prefix for per-instance temporary workspaces.
pub const WORKSPACE_PREFIX: &str = "imagejfind";

/// Get the asset directory holding the worker archive and support files.
///
/// - Linux: `~/.local/share/ijexec`
/// - macOS: `~/Library/Application Support/ijexec`
pub fn get_asset_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ijexec"))
        .unwrap_or_else(|| PathBuf::from(".ijexec"))
}
