// src/core/mod.rs
pub mod cdn;
pub mod deadline;
pub mod model;
pub mod outcome;

pub use cdn::CdnRanges;
pub use deadline::Deadline;
pub use model::{
    Finding, FindingKind, PortState, ScanIntensity, ScanRequest, ScanResult, ServiceRecord,
    Severity, StageName, StageReport, StageStatus, SubdomainSet, TargetType,
};
pub use outcome::{StageOutcome, ToolOutcome};
