//! Worker process supervision.
//!
//! The worker is an external JVM process that evaluates one macro per
//! request. This module owns its lifetime:
//!
//! ```text
//!   ┌──────────────┐  stdin: [len|image][len|macro]   ┌──────────────┐
//!   │  Supervisor  │ ───────────────────────────────▶ │    Worker    │
//!   │ WorkerHandle │ ◀─────────────────────────────── │  (java, cwd  │
//!   └──────┬───────┘  stdout: BEGIN / ATTR / RESULT   │  = worker dir)│
//!          │                                          └──────┬───────┘
//!          │ owns                                            │ DISPLAY
//!   ┌──────▼───────┐                                  ┌──────▼───────┐
//!   │  Workspace   │                                  │ Display lease │
//!   └──────────────┘                                  └──────────────┘
//! ```
//!
//! There is no automatic restart. A worker that dies between requests makes
//! the next request fail with [`crate::error::IjError::WorkerGone`].

mod exit;
mod ipc;
mod proc;
mod spawn;

pub use exit::{ExitReason, WorkerFailure, analyze_wait_status};
pub use proc::WorkerHandle;
pub use spawn::spawn_worker;
