//! ijexec - supervise a headless ImageJ worker and score objects with macros.
//!
//! A filter instance goes through three stages:
//!
//! 1. [`workspace::bootstrap`] unpacks the worker distribution and the user's
//!    macro bundle into a private temporary directory.
//! 2. [`display::allocate_display`] starts a virtual framebuffer on the first
//!    free display number.
//! 3. [`worker::spawn_worker`] launches the worker there and hands back a
//!    [`worker::WorkerHandle`] that owns everything until teardown.
//!
//! [`filter::ImageJFilter`] ties the stages together and drives the
//! [`protocol`] for each object; [`host`] exposes it over stdin/stdout.

pub mod config;
pub mod display;
pub mod error;
pub mod filter;
pub mod host;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod version;
pub mod worker;
pub mod workspace;

pub use error::{IjError, Result};
