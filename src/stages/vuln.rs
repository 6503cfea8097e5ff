// src/stages/vuln.rs
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use serde_json::json;
use tracing::{info, warn};

use crate::core::{Deadline, Finding, FindingKind, PortState, ServiceRecord, StageOutcome, ToolOutcome};
use crate::leaks::shodan::{risky_port, ShodanClient};

/// Flags risky services found by the active stage and enriches them with Shodan host data
pub struct ExposureStage {
    shodan: Option<ShodanClient>,
}

impl ExposureStage {
    pub fn new(shodan: Option<ShodanClient>) -> Self {
        Self { shodan }
    }

    pub async fn run(&self, services: &[ServiceRecord], deadline: &Deadline) -> StageOutcome<Vec<Finding>> {
        let mut findings = local_findings(services);
        info!("{} risky services among {} discovered", findings.len(), services.len());

        let shodan = match &self.shodan {
            Some(shodan) => shodan,
            None => {
                info!("Shodan not configured; exposure assessment uses local scan data only");
                return StageOutcome::Complete(findings);
            }
        };

        // One lookup per address, attributed to the first hostname seen on it
        let mut addresses: BTreeMap<IpAddr, &str> = BTreeMap::new();
        for service in services {
            addresses.entry(service.ip).or_insert(service.hostname.as_str());
        }

        let mut seen: HashSet<(String, u64)> = findings.iter().filter_map(exposure_key).collect();
        for (ip, hostname) in addresses {
            if deadline.is_expired() {
                let reason = format!("deadline reached before Shodan lookup of {}", ip);
                warn!("{}", reason);
                return StageOutcome::Partial { value: findings, reason };
            }

            match shodan.host_exposure(ip, hostname).await {
                ToolOutcome::Success(found) => {
                    for finding in found {
                        if let Some(key) = exposure_key(&finding) {
                            if !seen.insert(key) {
                                continue;
                            }
                        }
                        findings.push(finding);
                    }
                }
                outcome => warn!("Shodan lookup for {} failed: {}", ip, outcome),
            }
        }

        StageOutcome::Complete(findings)
    }
}

fn exposure_key(finding: &Finding) -> Option<(String, u64)> {
    if finding.kind != FindingKind::ExposedService {
        return None;
    }
    let ip = finding.detail_str("ip")?.to_string();
    let port = finding.detail.get("port")?.as_u64()?;
    Some((ip, port))
}

/// Findings for open services on ports that should not face the internet
pub fn local_findings(services: &[ServiceRecord]) -> Vec<Finding> {
    services
        .iter()
        .filter(|service| service.state == PortState::Open)
        .filter_map(|service| {
            risky_port(service.port).map(|(label, severity)| {
                Finding::new(
                    FindingKind::ExposedService,
                    severity,
                    "portscan",
                    &service.hostname,
                    format!("Exposed {} Service", label),
                )
                .with_detail(json!({
                    "ip": service.ip.to_string(),
                    "port": service.port,
                    "service": service.name,
                    "version": service.version,
                }))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::core::Severity;
    use crate::utils::http::HttpClient;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(port: u16, state: PortState) -> ServiceRecord {
        ServiceRecord {
            hostname: "db.example.com".to_string(),
            ip: "192.0.2.5".parse().unwrap(),
            port,
            protocol: "tcp".to_string(),
            name: "redis".to_string(),
            version: None,
            state,
        }
    }

    #[tokio::test]
    async fn test_local_only_without_shodan() {
        let stage = ExposureStage::new(None);
        let services = vec![
            service(6379, PortState::Open),
            service(443, PortState::Open),
            service(3306, PortState::OpenFiltered),
        ];

        let findings = stage
            .run(&services, &Deadline::new(Duration::from_secs(60)))
            .await
            .into_value()
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "Exposed Redis Service");
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_shodan_enrichment_skips_duplicates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shodan/host/192.0.2.5"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"ip_str":"192.0.2.5","vulns":["CVE-2022-0543"],
                    "data":[{"port":6379,"product":"Redis"},{"port":23,"data":"login:"}]}"#,
            ))
            .mount(&server)
            .await;

        let shodan = ShodanClient::new(HttpClient::new(None, Some(5)).unwrap(), &server.uri(), Some("k".to_string()));
        let stage = ExposureStage::new(shodan);
        let findings = stage
            .run(&[service(6379, PortState::Open)], &Deadline::new(Duration::from_secs(60)))
            .await
            .into_value()
            .unwrap();

        let titles: Vec<&str> = findings.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Exposed Redis Service", "Exposed Telnet Service", "CVE-2022-0543 reported on 192.0.2.5"]
        );
    }
}
