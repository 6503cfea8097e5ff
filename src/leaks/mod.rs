// src/leaks/mod.rs
pub mod hibp;
pub mod shodan;
pub mod trufflehog;

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{Finding, FindingKind, Severity, ToolOutcome};
use crate::utils::http::HttpClient;
use crate::utils::shell::CommandRunner;

pub use hibp::{HibpClient, PasswordCheck};
pub use shodan::{DatabaseKind, ShodanClient};
pub use trufflehog::{RepoScanOptions, SecretScanner};

/// What a combined leak scan should cover
#[derive(Debug, Clone, Default)]
pub struct LeakScanRequest {
    pub domain: Option<String>,
    pub emails: Vec<String>,
    pub org: Option<String>,
    pub repo_urls: Vec<String>,
    /// Local paths for a filesystem secret scan
    pub paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub include_db_scan: bool,
    pub include_secret_scan: bool,
}

/// Counts per severity and per finding category
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeakSummary {
    pub total_findings: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
    pub breaches_found: usize,
    pub exposed_databases: usize,
    pub leaked_secrets: usize,
    pub pastes_found: usize,
}

impl LeakSummary {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut summary = LeakSummary {
            total_findings: findings.len(),
            ..Default::default()
        };
        for finding in findings {
            match finding.severity {
                Severity::Critical => summary.critical += 1,
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
                Severity::Info => summary.info += 1,
            }
            match finding.kind {
                FindingKind::Breach => summary.breaches_found += 1,
                FindingKind::Paste => summary.pastes_found += 1,
                FindingKind::ExposedDatabase | FindingKind::ExposedService => summary.exposed_databases += 1,
                FindingKind::LeakedSecret => summary.leaked_secrets += 1,
                _ => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub scan_id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub findings: Vec<Finding>,
    pub summary: LeakSummary,
    /// Integrations that could not run, with the reason
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_check: Option<PasswordCheck>,
}

/// Agentless data-leak monitoring across breach data, Shodan and repository scanning
pub struct LeakMonitor {
    hibp: HibpClient,
    shodan: Option<ShodanClient>,
    secrets: SecretScanner,
}

impl LeakMonitor {
    pub fn new(hibp: HibpClient, shodan: Option<ShodanClient>, secrets: SecretScanner) -> Self {
        Self { hibp, shodan, secrets }
    }

    /// Build every integration from configuration; missing keys soft-disable their integration
    pub fn from_config(config: &Config, http: HttpClient, runner: Arc<dyn CommandRunner>) -> Self {
        let leaks = &config.leaks;
        Self::new(
            HibpClient::new(
                http.clone(),
                &leaks.hibp_url,
                leaks.hibp_api_key.clone(),
                Duration::from_millis(leaks.hibp_rate_limit_ms),
            )
            .with_passwords_url(&leaks.pwned_passwords_url),
            ShodanClient::new(http, &leaks.shodan_url, leaks.shodan_api_key.clone()),
            SecretScanner::new(
                runner,
                &config.tools.trufflehog,
                Duration::from_secs(config.tools.trufflehog_timeout_secs),
            )
            .with_filesystem_program(&config.tools.trufflehog_filesystem),
        )
    }

    /// Pwned Passwords lookup; the password itself never leaves the host
    pub async fn check_password(&self, password: &str) -> ToolOutcome<PasswordCheck> {
        self.hibp.password_exposure(password).await
    }

    /// Run every requested check and summarise the findings
    pub async fn comprehensive_scan(&self, request: &LeakScanRequest) -> LeakReport {
        let started_at = Utc::now();
        let target = request
            .domain
            .clone()
            .or_else(|| request.org.clone())
            .unwrap_or_else(|| "multiple".to_string());
        info!("Starting leak scan for {}", target);

        let mut findings = Vec::new();
        let mut skipped = Vec::new();

        // Accounts
        for email in &request.emails {
            match self.hibp.breached_account(email).await {
                ToolOutcome::Success(breaches) => {
                    findings.extend(breaches.iter().map(|b| hibp::account_breach_finding(email, b)));
                }
                outcome => note_skip(&mut skipped, "hibp breaches", email, &outcome),
            }
            match self.hibp.pastes(email).await {
                ToolOutcome::Success(pastes) => {
                    findings.extend(pastes.iter().map(|p| hibp::paste_finding(email, p)));
                }
                outcome => note_skip(&mut skipped, "hibp pastes", email, &outcome),
            }
        }

        // Domain breaches
        if let Some(domain) = &request.domain {
            match self.hibp.domain_breaches(domain).await {
                ToolOutcome::Success(breaches) => {
                    findings.extend(breaches.iter().map(|b| hibp::domain_breach_finding(domain, b)));
                }
                outcome => note_skip(&mut skipped, "hibp domain breaches", domain, &outcome),
            }
        }

        // Exposed data stores and services
        if request.include_db_scan && (request.domain.is_some() || request.org.is_some()) {
            match &self.shodan {
                Some(shodan) => {
                    findings.extend(
                        shodan
                            .exposed_databases(
                                request.domain.as_deref(),
                                request.org.as_deref(),
                                &DatabaseKind::ALL,
                                100,
                            )
                            .await,
                    );

                    if let Some(domain) = &request.domain {
                        match resolve(domain).await {
                            Some(ip) => match shodan.host_exposure(ip, domain).await {
                                ToolOutcome::Success(found) => findings.extend(found),
                                outcome => note_skip(&mut skipped, "shodan host", domain, &outcome),
                            },
                            None => warn!("Could not resolve {} for Shodan host lookup", domain),
                        }
                    }
                }
                None => skipped.push("shodan: API key not configured".to_string()),
            }
        }

        // Repositories
        if request.include_secret_scan {
            for repo_url in &request.repo_urls {
                match self.secrets.scan_repository(repo_url, &RepoScanOptions::default()).await {
                    ToolOutcome::Success(found) => findings.extend(found),
                    ToolOutcome::TimedOut { partial } => {
                        findings.extend(partial.unwrap_or_default());
                        skipped.push(format!("trufflehog3 ({}): timed out", repo_url));
                    }
                    outcome => note_skip(&mut skipped, "trufflehog3", repo_url, &outcome),
                }
            }
            for path in &request.paths {
                match self.secrets.scan_filesystem(path, &request.exclude_paths).await {
                    ToolOutcome::Success(found) => findings.extend(found),
                    ToolOutcome::TimedOut { partial } => {
                        findings.extend(partial.unwrap_or_default());
                        skipped.push(format!("trufflehog ({}): timed out", path));
                    }
                    outcome => note_skip(&mut skipped, "trufflehog", path, &outcome),
                }
            }
        }

        let summary = LeakSummary::from_findings(&findings);
        info!("Leak scan for {} finished with {} findings", target, summary.total_findings);

        LeakReport {
            scan_id: format!("leak-scan-{}", started_at.format("%Y%m%d%H%M%S")),
            target,
            started_at,
            completed_at: Utc::now(),
            findings,
            summary,
            skipped,
            password_check: None,
        }
    }
}

fn note_skip<T>(skipped: &mut Vec<String>, check: &str, subject: &str, outcome: &ToolOutcome<T>) {
    warn!("{} for {}: {}", check, subject, outcome);
    let entry = format!("{}: {}", check, outcome);
    if !skipped.contains(&entry) {
        skipped.push(entry);
    }
}

async fn resolve(domain: &str) -> Option<std::net::IpAddr> {
    tokio::net::lookup_host(format!("{}:0", domain))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
}
