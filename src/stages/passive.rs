// src/stages/passive.rs
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{Deadline, StageOutcome, SubdomainSet, ToolOutcome};
use crate::utils::http::HttpClient;
use crate::utils::shell::CommandRunner;

use super::sources::{AmassSource, CrtShSource, DnsBruteForceSource, HackerTargetSource, SubdomainSource};

/// What the passive stage produced
#[derive(Debug, Clone, Serialize)]
pub struct PassiveReport {
    pub subdomains: SubdomainSet,
    /// Sources that contributed output
    pub sources_used: Vec<String>,
    /// `source: reason` for every source that produced nothing
    pub failures: Vec<String>,
}

/// Passive subdomain discovery over a list of isolated sources
pub struct PassiveStage {
    sources: Vec<Arc<dyn SubdomainSource>>,
    source_delay: Duration,
}

impl PassiveStage {
    /// Create a new stage from explicit sources
    pub fn new(sources: Vec<Arc<dyn SubdomainSource>>, source_delay: Duration) -> Self {
        Self { sources, source_delay }
    }

    /// Build the configured sources
    pub fn from_config(config: &Config, http: HttpClient, runner: Arc<dyn CommandRunner>) -> Self {
        let mut sources: Vec<Arc<dyn SubdomainSource>> = Vec::new();

        for name in &config.passive.sources {
            match name.as_str() {
                "crtsh" => sources.push(Arc::new(CrtShSource::new(http.clone(), &config.passive.crtsh_url))),
                "hackertarget" => sources.push(Arc::new(HackerTargetSource::new(
                    http.clone(),
                    &config.passive.hackertarget_url,
                ))),
                "dns" => sources.push(Arc::new(DnsBruteForceSource::new(
                    config.passive.dns_wordlist_size,
                    Duration::from_secs(config.passive.dns_timeout_secs),
                ))),
                "amass" => sources.push(Arc::new(AmassSource::new(
                    runner.clone(),
                    &config.tools.amass,
                    Duration::from_secs(config.tools.amass_timeout_secs),
                ))),
                other => warn!("Unknown passive source in configuration: {}", other),
            }
        }

        Self::new(sources, config.passive.source_delay())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Query every source in turn and union the results. The root domain is always present.
    pub async fn run(&self, domain: &str, deadline: &Deadline) -> StageOutcome<PassiveReport> {
        info!("Starting passive discovery for {} with {} sources", domain, self.sources.len());

        let mut report = PassiveReport {
            subdomains: SubdomainSet::new(domain),
            sources_used: Vec::new(),
            failures: Vec::new(),
        };

        for (index, source) in self.sources.iter().enumerate() {
            if deadline.is_expired() {
                let reason = format!("deadline reached before source {} ran", source.name());
                warn!("Passive discovery for {} cut short: {}", domain, reason);
                return StageOutcome::Partial { value: report, reason };
            }

            debug!("Querying passive source {}", source.name());
            match source.discover(domain, deadline).await {
                ToolOutcome::Success(found) => {
                    info!("{} returned {} hostnames", source.name(), found.len());
                    report.subdomains.merge(found);
                    report.sources_used.push(source.name().to_string());
                }
                ToolOutcome::TimedOut { partial } => {
                    warn!("{} timed out", source.name());
                    if let Some(found) = partial {
                        report.subdomains.merge(found);
                        report.sources_used.push(source.name().to_string());
                    }
                    report.failures.push(format!("{}: timed out", source.name()));
                }
                ToolOutcome::Unavailable(reason) => {
                    info!("Skipping {}: {}", source.name(), reason);
                    report.failures.push(format!("{}: {}", source.name(), reason));
                }
                ToolOutcome::Failed(reason) => {
                    warn!("{} failed: {}", source.name(), reason);
                    report.failures.push(format!("{}: {}", source.name(), reason));
                }
            }

            // Rate limit between third-party sources
            if index + 1 < self.sources.len() && !self.source_delay.is_zero() {
                tokio::time::sleep(deadline.cap(self.source_delay)).await;
            }
        }

        info!("Passive discovery found {} hostnames for {}", report.subdomains.len(), domain);
        StageOutcome::Complete(report)
    }
}
