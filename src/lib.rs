pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod error;
pub mod index;
pub mod leaks;
pub mod stages;
pub mod takedown;
pub mod utils;

// Re-export main types for easier access
pub use crate::config::Config;
pub use crate::context::Context;
pub use crate::core::{Deadline, Finding, ScanRequest, ScanResult, StageOutcome, ToolOutcome};
pub use crate::engine::{ExternalScan, Orchestrator};
pub use crate::error::{SurfaceError, SurfaceResult};
