//! Filter configuration.
//!
//! Every setting has a default that matches a stock ImageJ installation.
//! Use the builder methods to customize, then [`FilterConfig::with_env_overrides`]
//! to let the deployment environment adjust it.
//!
//! # Environment Variables
//!
//! - `IJEXEC_HOME` - Directory holding the worker archive and support files
//! - `IJEXEC_WORKER_ARCHIVE` - File name of the worker archive inside `IJEXEC_HOME`
//! - `IJEXEC_JAVA` - Program used to launch the worker
//! - `IJEXEC_XVFB` - Virtual framebuffer server program
//! - `IJEXEC_MAX_DISPLAYS` - Number of display numbers to probe
//! - `IJEXEC_DISPLAY` - Use this display number instead of allocating one
//! - `IJEXEC_PROTOCOL` - Worker protocol: framed, bare
//! - `IJEXEC_IMAGE_SOURCE` - Image payload: object, rgb
//! - `IJEXEC_ON_FRAMING_ERROR` - Framing error policy: isolate, teardown

use std::path::PathBuf;
use std::str::FromStr;

use crate::display::DisplayServerCommand;
use crate::paths;

/// Default number of display numbers probed before giving up.
pub const DEFAULT_MAX_DISPLAYS: u32 = 100;

/// How the worker reports its result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// `BEGIN`, any number of `ATTR` blocks, then `RESULT`.
    #[default]
    Framed,
    /// A single line holding the decimal result, no attributes.
    BareResult,
}

impl FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "framed" => Ok(Self::Framed),
            "bare" | "bare-result" => Ok(Self::BareResult),
            _ => Err(format!(
                "Unknown protocol variant: '{}'. Valid options: framed, bare",
                s
            )),
        }
    }
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Framed => write!(f, "framed"),
            Self::BareResult => write!(f, "bare"),
        }
    }
}

/// Where the outbound image payload comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageSource {
    /// The object's raw data, sent as an already-encoded image.
    #[default]
    ObjectData,
    /// The decoded RGBX image plus its dimensions, packed into RGB.
    RgbImage,
}

impl FromStr for ImageSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "object" | "data" => Ok(Self::ObjectData),
            "rgb" | "rgbimage" => Ok(Self::RgbImage),
            _ => Err(format!(
                "Unknown image source: '{}'. Valid options: object, rgb",
                s
            )),
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectData => write!(f, "object"),
            Self::RgbImage => write!(f, "rgb"),
        }
    }
}

/// What happens to the worker after a framing error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FramingPolicy {
    /// Fail only the current request; the worker keeps running.
    #[default]
    IsolateRequest,
    /// Tear the worker down; later requests fail until reinitialization.
    TeardownWorker,
}

impl FromStr for FramingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "isolate" => Ok(Self::IsolateRequest),
            "teardown" | "kill" => Ok(Self::TeardownWorker),
            _ => Err(format!(
                "Unknown framing error policy: '{}'. Valid options: isolate, teardown",
                s
            )),
        }
    }
}

/// Files the workspace bootstrapper copies into a fresh workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceSources {
    /// Directory holding the archive and support files.
    pub asset_dir: PathBuf,
    /// Worker distribution archive (zip), relative to `asset_dir`.
    pub worker_archive: String,
    /// Top-level directory the archive unpacks into.
    pub worker_dir: String,
    /// Loader support file, relative to `asset_dir`.
    pub loader: String,
    /// Filter plugin support file, relative to `asset_dir`.
    pub filter_plugin: String,
    /// Directory under `plugins/` receiving the macro bundle.
    pub plugin_data_dir: String,
}

impl Default for WorkspaceSources {
    fn default() -> Self {
        Self {
            asset_dir: paths::get_asset_dir(),
            worker_archive: paths::WORKER_ARCHIVE_FILENAME.to_string(),
            worker_dir: paths::WORKER_DIR.to_string(),
            loader: paths::LOADER_FILENAME.to_string(),
            filter_plugin: paths::FILTER_PLUGIN_FILENAME.to_string(),
            plugin_data_dir: paths::PLUGIN_DATA_DIR.to_string(),
        }
    }
}

impl WorkspaceSources {
    pub fn worker_archive_path(&self) -> PathBuf {
        self.asset_dir.join(&self.worker_archive)
    }

    pub fn loader_path(&self) -> PathBuf {
        self.asset_dir.join(&self.loader)
    }

    pub fn filter_plugin_path(&self) -> PathBuf {
        self.asset_dir.join(&self.filter_plugin)
    }
}

/// Command line for the worker process. It runs inside the worker directory.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::from("java"),
            args: [
                "-Djava.awt.headless=true",
                "-server",
                "-cp",
                "ij.jar:ijloader.jar:.",
                "ijloader.IJLoader",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Virtual display settings.
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// Display server launched for each candidate.
    pub server: DisplayServerCommand,
    /// Candidates `0..max_candidates` are probed in order.
    pub max_candidates: u32,
    /// Skip allocation and point the worker at this display.
    pub fixed: Option<u32>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            server: DisplayServerCommand::xvfb(),
            max_candidates: DEFAULT_MAX_DISPLAYS,
            fixed: None,
        }
    }
}

/// Complete configuration for one filter instance.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub workspace: WorkspaceSources,
    pub worker: WorkerSpec,
    pub display: DisplayConfig,
    pub protocol: ProtocolVariant,
    pub image_source: ImageSource,
    pub framing_policy: FramingPolicy,
}

impl FilterConfig {
    /// Create a new FilterConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory holding the worker archive and support files.
    pub fn with_asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace.asset_dir = dir.into();
        self
    }

    /// Set the worker command line.
    pub fn with_worker(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.worker = WorkerSpec {
            program: program.into(),
            args,
        };
        self
    }

    /// Set the display server launched for each candidate.
    pub fn with_display_server(mut self, server: DisplayServerCommand) -> Self {
        self.display.server = server;
        self
    }

    /// Set how many display numbers are probed.
    pub fn with_max_displays(mut self, max: u32) -> Self {
        self.display.max_candidates = max;
        self
    }

    /// Use a fixed display instead of allocating one.
    pub fn with_fixed_display(mut self, display: u32) -> Self {
        self.display.fixed = Some(display);
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVariant) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_image_source(mut self, source: ImageSource) -> Self {
        self.image_source = source;
        self
    }

    pub fn with_framing_policy(mut self, policy: FramingPolicy) -> Self {
        self.framing_policy = policy;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparsable values are reported and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("IJEXEC_HOME") {
            self.workspace.asset_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("IJEXEC_WORKER_ARCHIVE") {
            self.workspace.worker_archive = name;
        }
        if let Ok(java) = std::env::var("IJEXEC_JAVA") {
            self.worker.program = PathBuf::from(java);
        }
        if let Ok(xvfb) = std::env::var("IJEXEC_XVFB") {
            self.display.server.program = PathBuf::from(xvfb);
        }
        if let Some(max) = env_parsed::<u32>("IJEXEC_MAX_DISPLAYS") {
            self.display.max_candidates = max;
        }
        if let Some(display) = env_parsed::<u32>("IJEXEC_DISPLAY") {
            self.display.fixed = Some(display);
        }
        if let Some(protocol) = env_parsed("IJEXEC_PROTOCOL") {
            self.protocol = protocol;
        }
        if let Some(source) = env_parsed("IJEXEC_IMAGE_SOURCE") {
            self.image_source = source;
        }
        if let Some(policy) = env_parsed("IJEXEC_ON_FRAMING_ERROR") {
            self.framing_policy = policy;
        }
        self
    }
}

fn env_parsed<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid setting: {}", e);
            None
        }
    }
}
