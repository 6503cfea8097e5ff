// src/engine/mod.rs
pub mod orchestrator;
pub mod poller;
pub mod processor;
pub mod spiderfoot;

pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use poller::{Entity, JobPoller, JobState, PollProgress, PollResult, PollSettings, RemoteJob};
pub use processor::{process_entities, ProcessedSurface};
pub use spiderfoot::{ExternalScan, ExternalScanReport, SpiderFootClient, SpiderFootJob};
