// src/stages/mod.rs
pub mod active;
pub mod nmap;
pub mod passive;
pub mod portscan;
pub mod sources;
pub mod vuln;

use async_trait::async_trait;

use crate::core::{Deadline, Finding, ScanRequest, ServiceRecord, StageOutcome};

pub use active::{ActiveReport, ActiveStage, ActiveTarget, HostScan, HostScanner, ServiceScanner};
pub use passive::{PassiveReport, PassiveStage};
pub use sources::SubdomainSource;
pub use vuln::ExposureStage;

/// Subdomain discovery as seen by the orchestrator
#[async_trait]
pub trait PassiveDiscovery: Send + Sync {
    async fn discover(&self, domain: &str, deadline: &Deadline) -> StageOutcome<PassiveReport>;
}

/// Port and service scanning as seen by the orchestrator
#[async_trait]
pub trait ActiveScan: Send + Sync {
    async fn scan(&self, targets: Vec<ActiveTarget>, request: &ScanRequest, deadline: &Deadline) -> StageOutcome<ActiveReport>;
}

/// Vulnerability and exposure assessment of discovered services
#[async_trait]
pub trait VulnScan: Send + Sync {
    async fn assess(&self, services: &[ServiceRecord], deadline: &Deadline) -> StageOutcome<Vec<Finding>>;
}

#[async_trait]
impl PassiveDiscovery for PassiveStage {
    async fn discover(&self, domain: &str, deadline: &Deadline) -> StageOutcome<PassiveReport> {
        self.run(domain, deadline).await
    }
}

#[async_trait]
impl ActiveScan for ActiveStage {
    async fn scan(&self, targets: Vec<ActiveTarget>, request: &ScanRequest, deadline: &Deadline) -> StageOutcome<ActiveReport> {
        self.run(targets, request, deadline).await
    }
}

#[async_trait]
impl VulnScan for ExposureStage {
    async fn assess(&self, services: &[ServiceRecord], deadline: &Deadline) -> StageOutcome<Vec<Finding>> {
        self.run(services, deadline).await
    }
}
