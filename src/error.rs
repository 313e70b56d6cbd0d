//! Error types for ijexec.

use thiserror::Error;

/// Main error type for ijexec.
#[derive(Error, Debug)]
pub enum IjError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workspace setup failed: {0}")]
    Workspace(String),

    #[error("Worker archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("No free display among {candidates} candidates")]
    DisplayExhausted { candidates: u32 },

    #[error("Display server error: {0}")]
    Display(String),

    #[error("Failed to start worker: {0}")]
    Spawn(String),

    #[error("Worker is gone: {0}")]
    WorkerGone(String),

    #[error("Invalid macro name argument: {0}")]
    MacroName(String),

    #[error("Object attribute '{name}' {problem}")]
    Attribute { name: String, problem: String },

    #[error("Host channel error: {0}")]
    Host(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IjError {
    /// Whether this error aborts the whole filter instance.
    ///
    /// Setup failures leave nothing usable behind. Everything else is confined
    /// to the request that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Workspace(_)
                | Self::Archive(_)
                | Self::DisplayExhausted { .. }
                | Self::Display(_)
                | Self::Spawn(_)
                | Self::MacroName(_)
                | Self::Config(_)
        )
    }

    pub(crate) fn missing_attribute(name: &str) -> Self {
        Self::Attribute {
            name: name.to_string(),
            problem: "is missing".to_string(),
        }
    }
}

/// Result type alias for ijexec operations.
pub type Result<T> = std::result::Result<T, IjError>;
