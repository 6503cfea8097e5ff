// src/core/model.rs
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SurfaceError;

static ASN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i)AS\d+$").expect("valid ASN regex"));

/// Kind of scan target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Domain,
    Ip,
    Cidr,
    Asn,
}

impl TargetType {
    /// Guess the target type from its textual form
    pub fn detect(target: &str) -> Self {
        let target = target.trim();
        if ASN_PATTERN.is_match(target) {
            TargetType::Asn
        } else if target.contains('/') && target.parse::<IpNetwork>().is_ok() {
            TargetType::Cidr
        } else if target.parse::<IpAddr>().is_ok() {
            TargetType::Ip
        } else {
            TargetType::Domain
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Domain => write!(f, "domain"),
            TargetType::Ip => write!(f, "ip"),
            TargetType::Cidr => write!(f, "cidr"),
            TargetType::Asn => write!(f, "asn"),
        }
    }
}

impl FromStr for TargetType {
    type Err = SurfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "domain" => Ok(TargetType::Domain),
            "ip" => Ok(TargetType::Ip),
            "cidr" => Ok(TargetType::Cidr),
            "asn" => Ok(TargetType::Asn),
            other => Err(SurfaceError::InvalidInput(format!("Unknown target type: {}", other))),
        }
    }
}

/// How hard the active stage pushes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanIntensity {
    Light,
    #[default]
    Normal,
    Intensive,
    Aggressive,
}

impl FromStr for ScanIntensity {
    type Err = SurfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(ScanIntensity::Light),
            "normal" => Ok(ScanIntensity::Normal),
            "intensive" => Ok(ScanIntensity::Intensive),
            "aggressive" => Ok(ScanIntensity::Aggressive),
            other => Err(SurfaceError::InvalidInput(format!("Unknown scan intensity: {}", other))),
        }
    }
}

/// Parameters of one orchestration run. Built once and never mutated while the run is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_id: String,
    pub target: String,
    pub target_type: TargetType,
    pub enable_passive: bool,
    pub enable_active: bool,
    pub enable_vuln: bool,
    pub scan_intensity: ScanIntensity,
    pub port_range: Option<String>,
    pub max_threads: usize,
    pub timeout_secs: u64,
}

impl ScanRequest {
    /// Create a new request with every stage enabled
    pub fn new(target: &str) -> Self {
        let target = target.trim().to_lowercase();
        Self {
            scan_id: Uuid::new_v4().to_string(),
            target_type: TargetType::detect(&target),
            target,
            enable_passive: true,
            enable_active: true,
            enable_vuln: true,
            scan_intensity: ScanIntensity::default(),
            port_range: None,
            max_threads: 4,
            timeout_secs: 3600,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Hostnames discovered for a root domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubdomainSet {
    root: String,
    hosts: BTreeSet<String>,
    ips: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl SubdomainSet {
    /// Create a set seeded with the root domain
    pub fn new(root: &str) -> Self {
        let root = normalize_hostname(root);
        let mut hosts = BTreeSet::new();
        if !root.is_empty() {
            hosts.insert(root.clone());
        }
        Self {
            root,
            hosts,
            ips: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Normalize and insert a hostname. Names outside the root domain are rejected.
    pub fn insert(&mut self, host: &str) -> bool {
        match self.accept(host) {
            Some(host) => {
                self.hosts.insert(host);
                true
            }
            None => false,
        }
    }

    /// Record an address for a hostname, inserting the hostname too
    pub fn insert_ip(&mut self, host: &str, ip: IpAddr) -> bool {
        match self.accept(host) {
            Some(host) => {
                self.hosts.insert(host.clone());
                self.ips.entry(host).or_default().insert(ip);
                true
            }
            None => false,
        }
    }

    /// Record a scanned address as an asset of its own, outside any root domain
    pub fn insert_address(&mut self, ip: IpAddr) -> bool {
        let host = ip.to_string();
        self.ips.entry(host.clone()).or_default().insert(ip);
        self.hosts.insert(host)
    }

    /// Union another set into this one
    pub fn merge(&mut self, other: SubdomainSet) {
        for host in other.hosts {
            self.insert(&host);
        }
        for (host, ips) in other.ips {
            for ip in ips {
                self.insert_ip(&host, ip);
            }
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_hostname(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Sorted hostnames
    pub fn hosts(&self) -> impl Iterator<Item = &String> {
        self.hosts.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.hosts.iter().cloned().collect()
    }

    pub fn ips_for(&self, host: &str) -> Vec<IpAddr> {
        self.ips
            .get(&normalize_hostname(host))
            .map(|ips| ips.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Hostname to address map
    pub fn ip_map(&self) -> BTreeMap<String, Vec<IpAddr>> {
        self.ips
            .iter()
            .map(|(host, ips)| (host.clone(), ips.iter().copied().collect()))
            .collect()
    }

    fn accept(&self, host: &str) -> Option<String> {
        let host = normalize_hostname(host);
        if host.is_empty() || host.contains(char::is_whitespace) {
            return None;
        }
        if host == self.root || host.ends_with(&format!(".{}", self.root)) {
            Some(host)
        } else {
            None
        }
    }
}

/// Lowercase, trim, drop wildcard labels and the trailing dot
pub fn normalize_hostname(host: &str) -> String {
    let mut host = host.trim().to_lowercase();
    while let Some(stripped) = host.strip_prefix("*.") {
        host = stripped.to_string();
    }
    host.trim_end_matches('.').to_string()
}

/// Port state as reported by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "unknown")]
    Unknown,
}

impl PortState {
    pub fn parse(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "open" => PortState::Open,
            "open|filtered" => PortState::OpenFiltered,
            "filtered" => PortState::Filtered,
            "closed" | "closed|filtered" => PortState::Closed,
            _ => PortState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::OpenFiltered => "open|filtered",
            PortState::Filtered => "filtered",
            PortState::Closed => "closed",
            PortState::Unknown => "unknown",
        }
    }
}

/// A network service observed on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: String,
    pub name: String,
    pub version: Option<String>,
    pub state: PortState,
}

impl ServiceRecord {
    /// Whether the scanner identified what is listening
    pub fn has_service_evidence(&self) -> bool {
        let named = !self.name.is_empty() && self.name != "unknown";
        let versioned = self
            .version
            .as_deref()
            .map(|v| !v.is_empty() && !v.starts_with("unknown"))
            .unwrap_or(false);
        named || versioned
    }

    pub fn version_or_unknown(&self) -> &str {
        self.version.as_deref().unwrap_or("unknown")
    }
}

/// Severity scale shared by every finding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric scale used by scanners, 0 (info) to 4 (critical)
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Severity::Info,
            1 => Severity::Low,
            2 => Severity::Medium,
            3 => Severity::High,
            _ => Severity::Critical,
        }
    }

    /// Lenient parse; anything unrecognised is medium
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "info" | "informational" | "none" => Severity::Info,
            "low" => Severity::Low,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Display label used in index documents
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Vulnerability,
    ExposedService,
    ExposedDatabase,
    Breach,
    Paste,
    LeakedSecret,
    Entity,
    Threat,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::Vulnerability => "vulnerability",
            FindingKind::ExposedService => "exposed_service",
            FindingKind::ExposedDatabase => "exposed_database",
            FindingKind::Breach => "breach",
            FindingKind::Paste => "paste",
            FindingKind::LeakedSecret => "leaked_secret",
            FindingKind::Entity => "entity",
            FindingKind::Threat => "threat",
        }
    }
}

/// A uniform record of something worth reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub source: String,
    pub target: String,
    pub title: String,
    #[serde(default)]
    pub detail: Value,
    pub discovered_at: DateTime<Utc>,
}

impl Finding {
    /// Create a new finding timestamped now
    pub fn new(kind: FindingKind, severity: Severity, source: &str, target: &str, title: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            source: source.to_string(),
            target: target.to_string(),
            title: title.into(),
            detail: Value::Null,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// A string field from the detail payload
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail.get(key).and_then(Value::as_str)
    }
}

/// Orchestration stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Passive,
    Active,
    Vuln,
    Index,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageName::Passive => write!(f, "passive"),
            StageName::Active => write!(f, "active"),
            StageName::Vuln => write!(f, "vuln"),
            StageName::Index => write!(f, "index"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Complete,
    Partial,
    Skipped,
    Failed,
    NotStarted,
}

/// What happened to one stage of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageName,
    pub status: StageStatus,
    pub message: Option<String>,
    pub elapsed_secs: f64,
}

/// Aggregated outcome of an orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: String,
    pub target: String,
    pub target_type: TargetType,
    pub subdomains: Vec<String>,
    pub host_to_ip: BTreeMap<String, Vec<IpAddr>>,
    pub services: Vec<ServiceRecord>,
    pub vulnerabilities: Vec<Finding>,
    pub assets_found: usize,
    pub services_found: usize,
    pub vulnerabilities_found: usize,
    pub elapsed_time: f64,
    pub timed_out: bool,
    pub warning: Option<String>,
    pub stages: Vec<StageReport>,
    pub tools_used: Vec<String>,
    pub indexed: bool,
}

impl ScanResult {
    /// Create an empty result for a request
    pub fn new(request: &ScanRequest) -> Self {
        Self {
            scan_id: request.scan_id.clone(),
            target: request.target.clone(),
            target_type: request.target_type,
            subdomains: Vec::new(),
            host_to_ip: BTreeMap::new(),
            services: Vec::new(),
            vulnerabilities: Vec::new(),
            assets_found: 0,
            services_found: 0,
            vulnerabilities_found: 0,
            elapsed_time: 0.0,
            timed_out: false,
            warning: None,
            stages: Vec::new(),
            tools_used: Vec::new(),
            indexed: false,
        }
    }

    /// Recompute the summary counters
    pub fn refresh_counts(&mut self) {
        self.assets_found = self.subdomains.len();
        self.services_found = self.services.len();
        self.vulnerabilities_found = self.vulnerabilities.len();
    }

    pub fn stage(&self, stage: StageName) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_type_detection() {
        assert_eq!(TargetType::detect("example.com"), TargetType::Domain);
        assert_eq!(TargetType::detect("192.0.2.10"), TargetType::Ip);
        assert_eq!(TargetType::detect("2001:db8::1"), TargetType::Ip);
        assert_eq!(TargetType::detect("192.0.2.0/28"), TargetType::Cidr);
        assert_eq!(TargetType::detect("AS13335"), TargetType::Asn);
        assert_eq!(TargetType::detect("as64500"), TargetType::Asn);
    }

    #[test]
    fn test_subdomain_set_union_is_sorted_and_scoped() {
        let mut set = SubdomainSet::new("Example.com");
        assert!(set.insert("www.example.com"));
        assert!(set.insert("*.API.example.com."));
        assert!(!set.insert("example.org"));
        assert!(!set.insert("notexample.com"));

        let mut other = SubdomainSet::new("example.com");
        other.insert("api.example.com");
        other.insert_ip("mail.example.com", "192.0.2.25".parse().unwrap());
        set.merge(other);

        assert_eq!(
            set.to_vec(),
            vec!["api.example.com", "example.com", "mail.example.com", "www.example.com"]
        );
        assert_eq!(set.ips_for("mail.example.com"), vec!["192.0.2.25".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_addresses_are_assets_without_a_root() {
        let ip: IpAddr = "192.0.2.9".parse().unwrap();
        let mut set = SubdomainSet::default();
        assert!(set.insert_address(ip));
        assert!(!set.insert_address(ip));
        assert_eq!(set.to_vec(), vec!["192.0.2.9"]);
        assert_eq!(set.ips_for("192.0.2.9"), vec![ip]);
    }

    #[test]
    fn test_port_state_parse() {
        assert_eq!(PortState::parse("open"), PortState::Open);
        assert_eq!(PortState::parse("open|filtered"), PortState::OpenFiltered);
        assert_eq!(PortState::parse("filtered"), PortState::Filtered);
        assert_eq!(PortState::parse("weird"), PortState::Unknown);
    }

    #[test]
    fn test_service_evidence() {
        let mut record = ServiceRecord {
            hostname: "example.com".to_string(),
            ip: "192.0.2.1".parse().unwrap(),
            port: 8080,
            protocol: "tcp".to_string(),
            name: "unknown".to_string(),
            version: None,
            state: PortState::OpenFiltered,
        };
        assert!(!record.has_service_evidence());

        record.version = Some("unknown (socket fallback - unverified)".to_string());
        assert!(!record.has_service_evidence());

        record.name = "http-proxy".to_string();
        assert!(record.has_service_evidence());
    }

    #[test]
    fn test_severity_scale() {
        assert_eq!(Severity::from_level(0), Severity::Info);
        assert_eq!(Severity::from_level(4), Severity::Critical);
        assert_eq!(Severity::normalize("HIGH"), Severity::High);
        assert_eq!(Severity::normalize("whatever"), Severity::Medium);
        assert!(Severity::Critical > Severity::Low);
    }
}
