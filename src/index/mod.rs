// src/index/mod.rs
pub mod elastic;
pub mod meili;
pub mod memory;

use std::collections::BTreeMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Finding, FindingKind, ScanResult, ServiceRecord};
use crate::error::SurfaceResult;

pub use elastic::ElasticSink;
pub use meili::MeiliSink;
pub use memory::MemorySink;

/// Hostnames documented when a scan found no services
const PLACEHOLDER_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub domain: String,
    pub hostname: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub port: u16,
    pub protocol: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityEntry {
    pub plugin_id: String,
    pub name: String,
    pub severity: String,
    pub cvss_score: Option<f64>,
    pub cve: Option<String>,
}

/// One indexed document per discovered host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDocument {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub scan_id: String,
    pub asset: AssetInfo,
    pub services: Vec<ServiceEntry>,
    pub vulnerabilities: Vec<VulnerabilityEntry>,
}

/// A store that receives asset documents
#[async_trait]
pub trait IndexSink: Send + Sync {
    fn name(&self) -> &str;

    /// Write documents, returning how many were accepted
    async fn index(&self, documents: &[AssetDocument]) -> SurfaceResult<usize>;
}

fn service_entry(service: &ServiceRecord) -> ServiceEntry {
    ServiceEntry {
        port: service.port,
        protocol: service.protocol.clone(),
        name: service.name.clone(),
        version: service.version_or_unknown().to_string(),
    }
}

fn vulnerability_entry(finding: &Finding) -> VulnerabilityEntry {
    let plugin_id = finding
        .detail_str("plugin_id")
        .map(str::to_string)
        .unwrap_or_else(|| finding.kind.as_str().to_string());
    VulnerabilityEntry {
        plugin_id,
        name: finding.title.clone(),
        severity: finding.severity.label().to_string(),
        cvss_score: finding.detail.get("cvss_score").and_then(|v| v.as_f64()),
        cve: finding.detail_str("cve").map(str::to_string),
    }
}

/// Group a scan result into per-host documents
pub fn build_documents(result: &ScanResult) -> Vec<AssetDocument> {
    let timestamp = Utc::now();
    let first_ip = |host: &str| {
        result
            .host_to_ip
            .get(host)
            .and_then(|ips| ips.first())
            .map(|ip| ip.to_string())
    };

    let mut by_host: BTreeMap<String, AssetDocument> = BTreeMap::new();
    for service in &result.services {
        let document = by_host.entry(service.hostname.clone()).or_insert_with(|| AssetDocument {
            timestamp,
            scan_id: result.scan_id.clone(),
            asset: AssetInfo {
                domain: result.target.clone(),
                hostname: service.hostname.clone(),
                ip: Some(service.ip.to_string()),
            },
            services: Vec::new(),
            vulnerabilities: Vec::new(),
        });
        document.services.push(service_entry(service));
    }

    if by_host.is_empty() {
        for hostname in result.subdomains.iter().take(PLACEHOLDER_LIMIT) {
            by_host.insert(
                hostname.clone(),
                AssetDocument {
                    timestamp,
                    scan_id: result.scan_id.clone(),
                    asset: AssetInfo {
                        domain: result.target.clone(),
                        hostname: hostname.clone(),
                        ip: first_ip(hostname),
                    },
                    services: Vec::new(),
                    vulnerabilities: Vec::new(),
                },
            );
        }
    }

    // Findings land on the host they name, or on the host owning their address
    for finding in result.vulnerabilities.iter().filter(|f| f.kind != FindingKind::Entity) {
        let ip = finding.detail_str("ip");
        let key = if by_host.contains_key(&finding.target) {
            Some(finding.target.clone())
        } else {
            by_host
                .iter()
                .find(|(_, doc)| ip.is_some() && doc.asset.ip.as_deref() == ip)
                .map(|(host, _)| host.clone())
        };
        if let Some(document) = key.and_then(|key| by_host.get_mut(&key)) {
            document.vulnerabilities.push(vulnerability_entry(finding));
        }
    }

    by_host.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PortState, ScanRequest, Severity};
    use serde_json::json;

    fn result_with_services() -> ScanResult {
        let request = ScanRequest::new("example.com");
        let mut result = ScanResult::new(&request);
        result.subdomains = vec!["example.com".to_string(), "www.example.com".to_string()];
        for (host, port, name) in [("www.example.com", 443, "https"), ("www.example.com", 80, "http"), ("example.com", 22, "ssh")] {
            result.services.push(ServiceRecord {
                hostname: host.to_string(),
                ip: "192.0.2.1".parse().unwrap(),
                port,
                protocol: "tcp".to_string(),
                name: name.to_string(),
                version: None,
                state: PortState::Open,
            });
        }
        result
    }

    #[test]
    fn test_documents_group_by_host() {
        let mut result = result_with_services();
        result.vulnerabilities.push(
            Finding::new(FindingKind::Vulnerability, Severity::High, "shodan", "www.example.com", "CVE-2023-1")
                .with_detail(json!({"plugin_id": "CVE-2023-1", "cve": "CVE-2023-1", "cvss_score": 7.5})),
        );

        let documents = build_documents(&result);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].asset.hostname, "example.com");
        assert_eq!(documents[1].services.len(), 2);
        assert_eq!(documents[1].services[0].version, "unknown");

        let vuln = &documents[1].vulnerabilities[0];
        assert_eq!(vuln.severity, "High");
        assert_eq!(vuln.cvss_score, Some(7.5));
        assert_eq!(vuln.cve.as_deref(), Some("CVE-2023-1"));
    }

    #[test]
    fn test_placeholder_documents_when_no_services() {
        let request = ScanRequest::new("example.com");
        let mut result = ScanResult::new(&request);
        result.subdomains = (0..15).map(|i| format!("h{:02}.example.com", i)).collect();

        let documents = build_documents(&result);
        assert_eq!(documents.len(), PLACEHOLDER_LIMIT);
        assert!(documents.iter().all(|d| d.services.is_empty()));
    }

    #[test]
    fn test_timestamp_field_name() {
        let documents = build_documents(&result_with_services());
        let value = serde_json::to_value(&documents[0]).unwrap();
        assert!(value.get("@timestamp").is_some());
        assert_eq!(value["asset"]["domain"], "example.com");
    }
}
