// src/engine/orchestrator.rs
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use ipnetwork::IpNetwork;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{
    Deadline, ScanRequest, ScanResult, ServiceRecord, StageName, StageReport, StageStatus, SubdomainSet,
    TargetType,
};
use crate::index::{build_documents, IndexSink};
use crate::stages::active::{network_targets, resolve_targets};
use crate::stages::{ActiveScan, ActiveTarget, PassiveDiscovery, VulnScan};

/// Orchestration tuning that is not part of a request
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Time kept back from the active stage for the stages after it
    pub stage_reserve: Duration,
    pub lookup_timeout: Duration,
    pub max_cidr_hosts: usize,
    /// Write index documents even when the run timed out
    pub index_partial_results: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage_reserve: config.scan.stage_reserve(),
            lookup_timeout: Duration::from_secs(config.passive.dns_timeout_secs.max(1)),
            max_cidr_hosts: config.scan.max_cidr_hosts,
            index_partial_results: config.scan.index_partial_results,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Orchestration states in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Passive,
    Active,
    Vuln,
    Index,
    Done,
}

impl ScanState {
    fn stage(&self) -> Option<StageName> {
        match self {
            ScanState::Passive => Some(StageName::Passive),
            ScanState::Active => Some(StageName::Active),
            ScanState::Vuln => Some(StageName::Vuln),
            ScanState::Index => Some(StageName::Index),
            ScanState::Done => None,
        }
    }

    fn next(&self) -> ScanState {
        match self {
            ScanState::Passive => ScanState::Active,
            ScanState::Active => ScanState::Vuln,
            ScanState::Vuln => ScanState::Index,
            ScanState::Index | ScanState::Done => ScanState::Done,
        }
    }
}

/// Working state of one run
struct RunState {
    result: ScanResult,
    subdomains: SubdomainSet,
    tools: BTreeSet<String>,
    last_stage: Option<StageName>,
}

/// Sequences passive discovery, active scanning, vulnerability assessment and
/// indexing under a single deadline
pub struct Orchestrator {
    passive: Arc<dyn PassiveDiscovery>,
    active: Arc<dyn ActiveScan>,
    vuln: Arc<dyn VulnScan>,
    sinks: Vec<Arc<dyn IndexSink>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Create a new orchestrator from its collaborators
    pub fn new(
        passive: Arc<dyn PassiveDiscovery>,
        active: Arc<dyn ActiveScan>,
        vuln: Arc<dyn VulnScan>,
        sinks: Vec<Arc<dyn IndexSink>>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            passive,
            active,
            vuln,
            sinks,
            settings,
        }
    }

    /// Run every enabled stage. Never fails: stage failures, timeouts and
    /// index errors all end up in the returned result.
    pub async fn run(&self, request: &ScanRequest) -> ScanResult {
        info!("Starting scan {} of {} ({}) with a {}s budget", request.scan_id, request.target, request.target_type, request.timeout_secs);

        let deadline = Deadline::new(request.timeout());
        let mut run = RunState {
            result: ScanResult::new(request),
            subdomains: SubdomainSet::new(&request.target),
            tools: BTreeSet::new(),
            last_stage: None,
        };
        if request.target_type != TargetType::Domain {
            // Network targets are tracked by the addresses scanned
            run.subdomains = SubdomainSet::default();
            if let Ok(ip) = request.target.parse::<IpAddr>() {
                run.subdomains.insert_address(ip);
            }
        }

        let mut state = ScanState::Passive;
        while state != ScanState::Done {
            // Never enter a state once the budget is spent
            if deadline.is_expired() {
                self.time_out(&mut run, state, &deadline).await;
                break;
            }

            let started = Instant::now();
            let outcome = match state {
                ScanState::Passive => self.passive_state(request, &mut run, &deadline).await,
                ScanState::Active => self.active_state(request, &mut run, &deadline).await,
                ScanState::Vuln => self.vuln_state(request, &mut run, &deadline).await,
                ScanState::Index => self.index_state(&mut run).await,
                ScanState::Done => break,
            };

            if let Some(stage) = state.stage() {
                let (status, message) = outcome;
                if status == StageStatus::Failed {
                    warn!("{} stage failed: {}", stage, message.as_deref().unwrap_or("unknown error"));
                }
                run.result.stages.push(StageReport {
                    stage,
                    status,
                    message,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                });
                if status != StageStatus::Skipped {
                    run.last_stage = Some(stage);
                }
            }
            state = state.next();
        }

        let mut result = run.result;
        result.subdomains = run.subdomains.to_vec();
        for (host, ips) in run.subdomains.ip_map() {
            let known = result.host_to_ip.entry(host).or_default();
            for ip in ips {
                if !known.contains(&ip) {
                    known.push(ip);
                }
            }
        }
        result.tools_used = run.tools.into_iter().collect();
        result.refresh_counts();
        result.elapsed_time = deadline.elapsed().as_secs_f64();

        info!(
            "Scan {} finished in {:.1}s: {} assets, {} services, {} findings (timed out: {})",
            result.scan_id, result.elapsed_time, result.assets_found, result.services_found, result.vulnerabilities_found, result.timed_out
        );
        result
    }

    async fn passive_state(&self, request: &ScanRequest, run: &mut RunState, deadline: &Deadline) -> (StageStatus, Option<String>) {
        if request.target_type != TargetType::Domain {
            return skipped(format!("passive discovery does not apply to {} targets", request.target_type));
        }
        if !request.enable_passive {
            return skipped("passive discovery disabled".to_string());
        }

        let outcome = self.passive.discover(&request.target, deadline).await;
        let status = (outcome.status(), outcome.message());
        if let Some(report) = outcome.into_value() {
            info!("Passive stage found {} hostnames", report.subdomains.len());
            run.tools.extend(report.sources_used);
            run.subdomains.merge(report.subdomains);
        }
        status
    }

    async fn active_state(&self, request: &ScanRequest, run: &mut RunState, deadline: &Deadline) -> (StageStatus, Option<String>) {
        if !request.enable_active {
            return skipped("active scanning disabled".to_string());
        }

        let targets = match self.active_targets(request, &run.subdomains, deadline).await {
            Ok(targets) => targets,
            Err(reason) => return (StageStatus::Failed, Some(reason)),
        };
        if targets.is_empty() {
            return skipped("no resolvable hosts to scan".to_string());
        }
        for target in &targets {
            if request.target_type != TargetType::Domain {
                run.subdomains.insert_address(target.ip);
            }
            for hostname in &target.hostnames {
                let known = run.result.host_to_ip.entry(hostname.clone()).or_default();
                if !known.contains(&target.ip) {
                    known.push(target.ip);
                }
            }
        }

        // Keep time back for the stages after this one when there is enough of it
        let remaining = deadline.remaining();
        let budget = if remaining > self.settings.stage_reserve {
            remaining - self.settings.stage_reserve
        } else {
            remaining
        };
        let stage_deadline = deadline.child(budget);
        debug!("Active stage budget {:?} of {:?} remaining", budget, remaining);

        let outcome = self.active.scan(targets, request, &stage_deadline).await;
        let status = (outcome.status(), outcome.message());
        if let Some(report) = outcome.into_value() {
            run.tools.extend(report.tools_used);
            run.result.services = report.services;
        }
        status
    }

    async fn vuln_state(&self, request: &ScanRequest, run: &mut RunState, deadline: &Deadline) -> (StageStatus, Option<String>) {
        if !request.enable_vuln {
            return skipped("vulnerability assessment disabled".to_string());
        }

        let services: Vec<ServiceRecord> = run.result.services.clone();
        let outcome = self.vuln.assess(&services, deadline).await;
        let status = (outcome.status(), outcome.message());
        if let Some(findings) = outcome.into_value() {
            run.result.vulnerabilities = findings;
        }
        status
    }

    async fn index_state(&self, run: &mut RunState) -> (StageStatus, Option<String>) {
        if self.sinks.is_empty() {
            return skipped("no index stores configured".to_string());
        }

        run.result.subdomains = run.subdomains.to_vec();
        let documents = build_documents(&run.result);
        let mut failures = Vec::new();
        for sink in &self.sinks {
            match sink.index(&documents).await {
                Ok(count) => {
                    info!("Indexed {} documents to {}", count, sink.name());
                    run.result.indexed = true;
                }
                Err(e) => {
                    // Index failures never fail the scan
                    error!("Indexing to {} failed: {}", sink.name(), e);
                    failures.push(format!("{}: {}", sink.name(), e));
                }
            }
        }

        match (failures.is_empty(), run.result.indexed) {
            (true, _) => (StageStatus::Complete, None),
            (false, true) => (StageStatus::Partial, Some(failures.join("; "))),
            (false, false) => (StageStatus::Failed, Some(failures.join("; "))),
        }
    }

    async fn active_targets(&self, request: &ScanRequest, subdomains: &SubdomainSet, deadline: &Deadline) -> Result<Vec<ActiveTarget>, String> {
        match request.target_type {
            TargetType::Domain => Ok(resolve_targets(subdomains, self.settings.lookup_timeout, deadline).await),
            TargetType::Ip | TargetType::Cidr => {
                let network: IpNetwork = request
                    .target
                    .parse()
                    .map_err(|e| format!("invalid network target {}: {}", request.target, e))?;
                let limit = if request.target_type == TargetType::Ip { 1 } else { self.settings.max_cidr_hosts };
                Ok(network_targets(&network, limit))
            }
            TargetType::Asn => Ok(Vec::new()),
        }
    }

    /// Finalize a run whose budget ran out before `pending` could start
    async fn time_out(&self, run: &mut RunState, pending: ScanState, deadline: &Deadline) {
        let mut not_started = Vec::new();
        let mut state = pending;
        while let Some(stage) = state.stage() {
            run.result.stages.push(StageReport {
                stage,
                status: StageStatus::NotStarted,
                message: Some("deadline reached".to_string()),
                elapsed_secs: 0.0,
            });
            not_started.push(stage.to_string());
            state = state.next();
        }

        let culprit = match run.last_stage {
            Some(stage) => format!("{} stage did not complete within the budget", stage),
            None => format!("deadline reached before the {} stage started", not_started.first().map(String::as_str).unwrap_or("first")),
        };
        let warning = format!(
            "Scan timed out after {}s: {}; not started: {}",
            deadline.budget().as_secs(),
            culprit,
            not_started.join(", ")
        );
        warn!("{}", warning);
        run.result.timed_out = true;
        run.result.warning = Some(warning);

        // Only when partial results are wanted in the index
        if self.settings.index_partial_results && !self.sinks.is_empty() {
            let (status, message) = self.index_state(run).await;
            if let Some(report) = run.result.stages.iter_mut().find(|r| r.stage == StageName::Index) {
                report.status = status;
                report.message = message;
            }
        }
    }
}

fn skipped(reason: String) -> (StageStatus, Option<String>) {
    debug!("Skipping stage: {}", reason);
    (StageStatus::Skipped, Some(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::core::{Finding, FindingKind, PortState, Severity, StageOutcome};
    use crate::error::{SurfaceError, SurfaceResult};
    use crate::index::{AssetDocument, MemorySink};
    use crate::stages::{ActiveReport, PassiveReport};

    struct StubPassive {
        hosts: Vec<&'static str>,
        delay: Duration,
    }

    #[async_trait]
    impl PassiveDiscovery for StubPassive {
        async fn discover(&self, domain: &str, _deadline: &Deadline) -> StageOutcome<PassiveReport> {
            tokio::time::sleep(self.delay).await;
            let mut subdomains = SubdomainSet::new(domain);
            subdomains.insert_ip(domain, "192.0.2.10".parse().unwrap());
            for host in &self.hosts {
                subdomains.insert_ip(host, "192.0.2.10".parse().unwrap());
            }
            StageOutcome::Complete(PassiveReport {
                subdomains,
                sources_used: vec!["stub".to_string()],
                failures: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct StubActive {
        seen: Mutex<Vec<ActiveTarget>>,
        budget: Mutex<Option<Duration>>,
        fail: bool,
    }

    #[async_trait]
    impl ActiveScan for StubActive {
        async fn scan(&self, targets: Vec<ActiveTarget>, _request: &ScanRequest, deadline: &Deadline) -> StageOutcome<ActiveReport> {
            *self.budget.lock() = Some(deadline.budget());
            if self.fail {
                return StageOutcome::Failed("scanner crashed".to_string());
            }
            let mut report = ActiveReport::default();
            for target in &targets {
                for hostname in &target.hostnames {
                    report.services.push(ServiceRecord {
                        hostname: hostname.clone(),
                        ip: target.ip,
                        port: 443,
                        protocol: "tcp".to_string(),
                        name: "https".to_string(),
                        version: None,
                        state: PortState::Open,
                    });
                }
            }
            report.hosts_scanned = targets.len();
            report.tools_used.insert("nmap".to_string());
            self.seen.lock().extend(targets);
            StageOutcome::Complete(report)
        }
    }

    struct StubVuln;

    #[async_trait]
    impl VulnScan for StubVuln {
        async fn assess(&self, services: &[ServiceRecord], _deadline: &Deadline) -> StageOutcome<Vec<Finding>> {
            StageOutcome::Complete(
                services
                    .iter()
                    .take(1)
                    .map(|s| Finding::new(FindingKind::Vulnerability, Severity::High, "stub", &s.hostname, "Weak TLS"))
                    .collect(),
            )
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl IndexSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn index(&self, _documents: &[AssetDocument]) -> SurfaceResult<usize> {
            Err(SurfaceError::IndexError {
                sink: "broken".to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            stage_reserve: Duration::from_secs(60),
            lookup_timeout: Duration::from_secs(1),
            max_cidr_hosts: 16,
            index_partial_results: false,
        }
    }

    fn orchestrator(passive_delay: Duration, active: Arc<StubActive>, sinks: Vec<Arc<dyn IndexSink>>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(StubPassive {
                hosts: vec!["www.example.com", "api.example.com"],
                delay: passive_delay,
            }),
            active,
            Arc::new(StubVuln),
            sinks,
            settings(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_indexes_per_host() {
        let active = Arc::new(StubActive::default());
        let sink = Arc::new(MemorySink::new());
        let orchestrator = orchestrator(Duration::from_secs(5), active.clone(), vec![sink.clone()]);

        let request = ScanRequest::new("example.com");
        let result = orchestrator.run(&request).await;

        assert!(!result.timed_out);
        assert!(result.warning.is_none());
        assert_eq!(result.subdomains, vec!["api.example.com", "example.com", "www.example.com"]);
        // Hostnames sharing an address become one target
        let seen = active.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].hostnames, vec!["api.example.com", "example.com", "www.example.com"]);
        // 3600s budget minus 5s passive minus 60s reserve
        assert_eq!(*active.budget.lock(), Some(Duration::from_secs(3535)));

        assert_eq!(result.services_found, 3);
        assert_eq!(result.vulnerabilities_found, 1);
        assert_eq!(result.tools_used, vec!["nmap", "stub"]);
        assert!(result.indexed);
        assert_eq!(sink.documents().len(), 3);
        assert_eq!(result.stage(StageName::Index).map(|r| r.status), Some(StageStatus::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_overrun_times_out() {
        let active = Arc::new(StubActive::default());
        let sink = Arc::new(MemorySink::new());
        let orchestrator = orchestrator(Duration::from_secs(70), active.clone(), vec![sink.clone()]);

        let mut request = ScanRequest::new("example.com");
        request.timeout_secs = 60;
        let result = orchestrator.run(&request).await;

        assert!(result.timed_out);
        assert!(result.elapsed_time >= 60.0);
        assert!(result.services.is_empty());
        assert!(result.vulnerabilities.is_empty());
        let warning = result.warning.as_deref().unwrap_or_default();
        assert!(warning.contains("passive stage did not complete"), "{}", warning);

        // Nothing started after the deadline
        assert!(active.seen.lock().is_empty());
        assert_eq!(sink.writes(), 0);
        assert_eq!(result.stage(StageName::Active).map(|r| r.status), Some(StageStatus::NotStarted));
        // In-flight passive work still landed
        assert_eq!(result.subdomains.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_indexed_when_enabled() {
        let sink = Arc::new(MemorySink::new());
        let mut orchestrator = orchestrator(Duration::from_secs(70), Arc::new(StubActive::default()), vec![sink.clone()]);
        orchestrator.settings.index_partial_results = true;

        let mut request = ScanRequest::new("example.com");
        request.timeout_secs = 60;
        let result = orchestrator.run(&request).await;

        assert!(result.timed_out);
        assert!(result.indexed);
        // No services, so placeholder documents per hostname
        assert_eq!(sink.documents().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stage_and_sink_do_not_abort() {
        let active = Arc::new(StubActive { fail: true, ..StubActive::default() });
        let orchestrator = orchestrator(Duration::ZERO, active, vec![Arc::new(BrokenSink)]);

        let result = orchestrator.run(&ScanRequest::new("example.com")).await;
        assert!(!result.timed_out);
        assert!(result.services.is_empty());
        assert!(!result.indexed);
        assert_eq!(result.stage(StageName::Active).map(|r| r.status), Some(StageStatus::Failed));
        assert_eq!(result.stage(StageName::Vuln).map(|r| r.status), Some(StageStatus::Complete));
        assert_eq!(result.stage(StageName::Index).map(|r| r.status), Some(StageStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_targets_skip_passive() {
        let active = Arc::new(StubActive::default());
        let orchestrator = orchestrator(Duration::ZERO, active.clone(), Vec::new());

        let result = orchestrator.run(&ScanRequest::new("192.0.2.0/29")).await;
        assert_eq!(result.stage(StageName::Passive).map(|r| r.status), Some(StageStatus::Skipped));
        assert_eq!(active.seen.lock().len(), 6);
        assert_eq!(result.assets_found, 6);
        assert_eq!(result.subdomains.first().map(String::as_str), Some("192.0.2.1"));

        let asn = Arc::new(StubActive::default());
        let orchestrator = orchestrator_with(asn.clone());
        let result = orchestrator.run(&ScanRequest::new("AS64500")).await;
        assert!(asn.seen.lock().is_empty());
        assert_eq!(result.stage(StageName::Active).map(|r| r.status), Some(StageStatus::Skipped));
        assert_eq!(result.stage(StageName::Index).map(|r| r.status), Some(StageStatus::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_target_counts_and_indexes_the_address() {
        let sink = Arc::new(MemorySink::new());
        let orchestrator = orchestrator(Duration::ZERO, Arc::new(StubActive::default()), vec![sink.clone()]);

        let mut request = ScanRequest::new("192.0.2.7");
        request.enable_active = false;
        let result = orchestrator.run(&request).await;

        assert_eq!(result.subdomains, vec!["192.0.2.7"]);
        assert_eq!(result.assets_found, 1);
        assert!(result.indexed);
        // No services, so one placeholder document for the address
        let documents = sink.documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].asset.hostname, "192.0.2.7");
    }

    fn orchestrator_with(active: Arc<StubActive>) -> Orchestrator {
        orchestrator(Duration::ZERO, active, Vec::new())
    }
}
