// src/takedown/mod.rs
pub mod repository;
pub mod typosquat;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TakedownConfig;
use crate::core::{Finding, FindingKind, Severity};
use crate::error::SurfaceError;

pub use repository::{summarize, JsonFileThreatRepository, ThreatRepository, ThreatSummary};
pub use typosquat::{generate_patterns, similarity};

const SUSPICIOUS_TLDS: &[&str] = &[
    ".tk", ".ml", ".ga", ".cf", ".gq", ".xyz", ".top", ".club", ".online", ".site", ".website", ".space", ".tech", ".info",
];

const PHISHING_KEYWORDS: &[&str] = &[
    "login", "signin", "verify", "secure", "account", "update", "confirm", "banking", "password", "credential",
    "authenticate", "wallet", "crypto", "support", "helpdesk", "billing",
];

static IP_LIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+[-_.]\d+[-_.]\d+").expect("valid IP-like regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    PhishingDomain,
    Typosquat,
    LookalikeDomain,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::PhishingDomain => "phishing_domain",
            ThreatType::Typosquat => "typosquat",
            ThreatType::LookalikeDomain => "lookalike_domain",
        }
    }

    /// `lookalike_domain` becomes `Lookalike Domain`
    pub fn title(&self) -> &'static str {
        match self {
            ThreatType::PhishingDomain => "Phishing Domain",
            ThreatType::Typosquat => "Typosquat",
            ThreatType::LookalikeDomain => "Lookalike Domain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakedownStatus {
    Detected,
    Investigating,
    TakedownRequested,
    TakedownPending,
    TakedownCompleted,
    TakedownRejected,
    Monitoring,
    FalsePositive,
}

impl TakedownStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakedownStatus::Detected => "detected",
            TakedownStatus::Investigating => "investigating",
            TakedownStatus::TakedownRequested => "takedown_requested",
            TakedownStatus::TakedownPending => "takedown_pending",
            TakedownStatus::TakedownCompleted => "takedown_completed",
            TakedownStatus::TakedownRejected => "takedown_rejected",
            TakedownStatus::Monitoring => "monitoring",
            TakedownStatus::FalsePositive => "false_positive",
        }
    }
}

impl fmt::Display for TakedownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TakedownStatus {
    type Err = SurfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_lowercase().as_str() {
            "detected" => TakedownStatus::Detected,
            "investigating" => TakedownStatus::Investigating,
            "takedown_requested" => TakedownStatus::TakedownRequested,
            "takedown_pending" => TakedownStatus::TakedownPending,
            "takedown_completed" => TakedownStatus::TakedownCompleted,
            "takedown_rejected" => TakedownStatus::TakedownRejected,
            "monitoring" => TakedownStatus::Monitoring,
            "false_positive" => TakedownStatus::FalsePositive,
            other => return Err(SurfaceError::InvalidInput(format!("Unknown takedown status: {}", other))),
        };
        Ok(status)
    }
}

/// A brand whose lookalikes are monitored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandConfig {
    pub brand_name: String,
    pub domains: Vec<String>,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub typosquat_patterns: Vec<String>,
}

impl BrandConfig {
    pub fn new(brand_name: &str, domains: Vec<String>, keywords: Vec<String>) -> Self {
        Self {
            brand_name: brand_name.to_string(),
            domains: domains.into_iter().map(|d| d.trim().to_lowercase()).collect(),
            keywords: keywords.into_iter().map(|k| k.trim().to_lowercase()).filter(|k| !k.is_empty()).collect(),
            typosquat_patterns: Vec::new(),
        }
    }
}

/// A domain that appears to impersonate a brand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAlert {
    pub id: String,
    pub threat_type: ThreatType,
    pub platform: String,
    pub target: String,
    pub brand_affected: String,
    pub similarity_score: f64,
    pub risk_level: Severity,
    pub status: TakedownStatus,
    #[serde(default)]
    pub evidence: Value,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreatAlert {
    fn new(threat_type: ThreatType, target: &str, brand: &str, similarity_score: f64, risk_level: Severity, evidence: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            threat_type,
            platform: "domain".to_string(),
            target: target.to_string(),
            brand_affected: brand.to_string(),
            similarity_score,
            risk_level,
            status: TakedownStatus::Detected,
            evidence,
            detected_at: now,
            updated_at: now,
        }
    }

    pub fn to_finding(&self) -> Finding {
        Finding::new(
            FindingKind::Threat,
            self.risk_level,
            "takedown",
            &self.target,
            format!("{} impersonating {}", self.threat_type.title(), self.brand_affected),
        )
        .with_detail(json!({
            "threat_id": self.id,
            "similarity_score": self.similarity_score,
            "status": self.status,
        }))
    }

    fn evidence_list(&self, key: &str) -> String {
        let items: Vec<&str> = self
            .evidence
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if items.is_empty() {
            "N/A".to_string()
        } else {
            items.join(", ")
        }
    }
}

/// Where to send a takedown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakedownContact {
    pub provider: String,
    pub abuse_url: Option<String>,
    pub email: Option<String>,
    pub phishing_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakedownRequest {
    pub id: String,
    pub threat_id: String,
    pub platform: String,
    pub target: String,
    /// abuse_report, dmca, trademark or phishing
    pub request_type: String,
    pub status: TakedownStatus,
    pub contact: TakedownContact,
    pub created_at: DateTime<Utc>,
}

fn contacts() -> Vec<TakedownContact> {
    let contact = |provider: &str, abuse_url: Option<&str>, email: Option<&str>, phishing_url: Option<&str>| TakedownContact {
        provider: provider.to_string(),
        abuse_url: abuse_url.map(str::to_string),
        email: email.map(str::to_string),
        phishing_url: phishing_url.map(str::to_string),
    };
    vec![
        contact("cloudflare", Some("https://www.cloudflare.com/abuse/"), Some("abuse@cloudflare.com"), None),
        contact("godaddy", Some("https://supportcenter.godaddy.com/AbuseReport"), Some("abuse@godaddy.com"), None),
        contact(
            "namecheap",
            Some("https://www.namecheap.com/support/knowledgebase/article.aspx/9196/5/how-and-where-can-i-file-abuse-complaints"),
            Some("abuse@namecheap.com"),
            None,
        ),
        contact("google", None, None, Some("https://safebrowsing.google.com/safebrowsing/report_phish/")),
    ]
}

/// Phishing indicators found in a domain name
pub fn phishing_indicators(domain: &str) -> Vec<String> {
    let domain = domain.to_lowercase();
    let mut indicators = Vec::new();

    for tld in SUSPICIOUS_TLDS {
        if domain.ends_with(tld) {
            indicators.push(format!("Suspicious TLD: {}", tld));
        }
    }
    for keyword in PHISHING_KEYWORDS {
        if domain.contains(keyword) {
            indicators.push(format!("Phishing keyword: {}", keyword));
        }
    }
    let hyphens = domain.matches('-').count();
    if hyphens > 2 {
        indicators.push(format!("Excessive hyphens: {}", hyphens));
    }
    if IP_LIKE.is_match(&domain) {
        indicators.push("IP-like pattern".to_string());
    }
    indicators
}

/// Risk from the number of phishing indicators
pub fn indicator_risk(count: usize) -> Severity {
    match count {
        0 => Severity::Low,
        1 => Severity::Medium,
        2 => Severity::High,
        _ => Severity::Critical,
    }
}

/// Risk from brand similarity
pub fn similarity_risk(similarity: f64) -> Severity {
    if similarity > 0.9 {
        Severity::Critical
    } else if similarity > 0.7 {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Detects domains impersonating monitored brands
pub struct TakedownMonitor {
    brands: BTreeMap<String, BrandConfig>,
    similarity_threshold: f64,
    max_patterns: usize,
}

impl TakedownMonitor {
    pub fn new(config: &TakedownConfig) -> Self {
        Self {
            brands: BTreeMap::new(),
            similarity_threshold: config.similarity_threshold,
            max_patterns: config.max_patterns,
        }
    }

    /// Add or replace a brand, generating its typosquat patterns when none are given
    pub fn add_brand(&mut self, mut brand: BrandConfig) {
        if brand.typosquat_patterns.is_empty() {
            brand.typosquat_patterns = generate_patterns(&brand.brand_name, self.max_patterns);
        }
        info!("Monitoring brand {} with {} typosquat patterns", brand.brand_name, brand.typosquat_patterns.len());
        self.brands.insert(brand.brand_name.to_lowercase(), brand);
    }

    pub fn brands(&self) -> impl Iterator<Item = &BrandConfig> {
        self.brands.values()
    }

    /// Classify a single domain against every brand, then against generic phishing indicators
    pub fn check_domain(&self, domain: &str) -> Option<ThreatAlert> {
        let domain = domain.trim().to_lowercase();

        for (key, brand) in &self.brands {
            if brand.domains.contains(&domain) {
                debug!("{} is an official domain of {}", domain, brand.brand_name);
                return None;
            }

            for pattern in &brand.typosquat_patterns {
                if domain.contains(pattern.as_str()) || pattern.contains(domain.as_str()) {
                    let score = similarity(key, &domain);
                    if score > self.similarity_threshold {
                        return Some(self.brand_alert(ThreatType::Typosquat, &domain, brand, score));
                    }
                }
            }

            if brand.keywords.iter().any(|keyword| domain.contains(keyword.as_str())) {
                let score = similarity(&brand.brand_name, &domain);
                return Some(self.brand_alert(ThreatType::LookalikeDomain, &domain, brand, score));
            }

            let base = typosquat::domain_base(&domain);
            if brand.domains.iter().any(|official| typosquat::domain_base(official) == base) {
                return Some(self.brand_alert(ThreatType::LookalikeDomain, &domain, brand, 0.95));
            }
        }

        let indicators = phishing_indicators(&domain);
        if indicators.is_empty() {
            return None;
        }
        let risk = indicator_risk(indicators.len());
        Some(ThreatAlert::new(
            ThreatType::PhishingDomain,
            &domain,
            "unknown",
            0.0,
            risk,
            json!({ "phishing_indicators": indicators }),
        ))
    }

    /// Check many domains, keeping those that look like threats
    pub fn scan_domains(&self, domains: &[String]) -> Vec<ThreatAlert> {
        let threats: Vec<ThreatAlert> = domains.iter().filter_map(|d| self.check_domain(d)).collect();
        info!("{} of {} domains flagged", threats.len(), domains.len());
        threats
    }

    fn brand_alert(&self, threat_type: ThreatType, domain: &str, brand: &BrandConfig, score: f64) -> ThreatAlert {
        info!("{} flagged as {} of {} (similarity {:.2})", domain, threat_type.as_str(), brand.brand_name, score);
        ThreatAlert::new(
            threat_type,
            domain,
            &brand.brand_name,
            score,
            similarity_risk(score),
            json!({
                "official_domains": brand.domains,
                "similarity_analysis": {
                    "brand": brand.brand_name.to_lowercase().replace(' ', ""),
                    "domain_base": typosquat::domain_base(domain),
                    "ratio": score,
                },
                "phishing_indicators": phishing_indicators(domain),
            }),
        )
    }
}

/// Contact for a threat, from the registrar named in its evidence when known
pub fn contact_for(threat: &ThreatAlert) -> TakedownContact {
    let registrar = threat
        .evidence
        .get("registration_info")
        .and_then(|info| info.get("registrar"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();

    let known = contacts();
    let fallback = known.iter().find(|c| c.provider == "google").cloned();
    known
        .into_iter()
        .find(|c| !registrar.is_empty() && registrar.contains(&c.provider))
        .or(fallback)
        .unwrap_or_else(|| TakedownContact {
            provider: "unknown".to_string(),
            abuse_url: None,
            email: None,
            phishing_url: None,
        })
}

pub fn takedown_request(threat: &ThreatAlert, request_type: &str) -> TakedownRequest {
    TakedownRequest {
        id: Uuid::new_v4().simple().to_string()[..8].to_string(),
        threat_id: threat.id.clone(),
        platform: threat.platform.clone(),
        target: threat.target.clone(),
        request_type: request_type.to_string(),
        status: TakedownStatus::TakedownRequested,
        contact: contact_for(threat),
        created_at: Utc::now(),
    }
}

/// Plain-text abuse report for a registrar or host
pub fn abuse_report(threat: &ThreatAlert) -> String {
    format!(
        "ABUSE REPORT - {kind_upper}\n\
         \n\
         Date: {date}\n\
         Report Type: {kind}\n\
         \n\
         THREAT DETAILS\n\
         ==============\n\
         Malicious URL/Domain: {target}\n\
         Platform: {platform}\n\
         Risk Level: {risk}\n\
         Similarity Score: {score:.2}%\n\
         \n\
         BRAND AFFECTED\n\
         ==============\n\
         Brand Name: {brand}\n\
         Official Domains: {domains}\n\
         \n\
         EVIDENCE\n\
         ========\n\
         Detection Date: {detected}\n\
         Phishing Indicators: {indicators}\n\
         \n\
         REQUESTED ACTION\n\
         ================\n\
         We request immediate suspension/takedown of the above-mentioned domain\n\
         as it is being used for phishing/brand impersonation purposes.\n\
         \n\
         Thank you for your prompt attention to this matter.",
        kind_upper = threat.threat_type.as_str().to_uppercase(),
        date = Utc::now().format("%Y-%m-%d %H:%M UTC"),
        kind = threat.threat_type.title(),
        target = threat.target,
        platform = threat.platform,
        risk = threat.risk_level.as_str().to_uppercase(),
        score = threat.similarity_score * 100.0,
        brand = threat.brand_affected,
        domains = threat.evidence_list("official_domains"),
        detected = threat.detected_at.to_rfc3339(),
        indicators = threat.evidence_list("phishing_indicators"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> TakedownMonitor {
        let mut monitor = TakedownMonitor::new(&TakedownConfig::default());
        monitor.add_brand(BrandConfig::new(
            "PayPal",
            vec!["paypal.com".to_string()],
            vec!["paypal".to_string()],
        ));
        monitor
    }

    #[test]
    fn test_typosquat_detected() {
        let threat = monitor().check_domain("paypa1.com").expect("typosquat");
        assert_eq!(threat.threat_type, ThreatType::Typosquat);
        assert_eq!(threat.brand_affected, "PayPal");
        // 2 * 5 / 12
        assert_eq!(threat.risk_level, Severity::High);
        assert_eq!(threat.status, TakedownStatus::Detected);
    }

    #[test]
    fn test_keyword_and_official_base_lookalikes() {
        let mut monitor = monitor();
        // Brand keyword present, too far from "paypal" to pass the typosquat threshold
        let threat = monitor.check_domain("paypal-refunds-center.net").expect("keyword lookalike");
        assert_eq!(threat.threat_type, ThreatType::LookalikeDomain);
        assert_eq!(threat.brand_affected, "PayPal");

        // The brand on another TLD is caught by its omission patterns
        let threat = monitor.check_domain("PayPal.de").expect("other tld");
        assert_eq!(threat.threat_type, ThreatType::Typosquat);
        assert_eq!(threat.risk_level, Severity::Critical);

        monitor.add_brand(BrandConfig::new("Globex", vec!["initech.com".to_string()], Vec::new()));
        let threat = monitor.check_domain("initech.io").expect("official base lookalike");
        assert_eq!(threat.threat_type, ThreatType::LookalikeDomain);
        assert_eq!(threat.similarity_score, 0.95);
        assert_eq!(threat.risk_level, Severity::Critical);

        assert!(monitor.check_domain("paypal.com").is_none());
        assert!(monitor.check_domain("initech.com").is_none());
    }

    #[test]
    fn test_generic_phishing_indicators() {
        let monitor = monitor();
        let threat = monitor.check_domain("secure-login-account-update.xyz").expect("phishing");
        assert_eq!(threat.threat_type, ThreatType::PhishingDomain);
        assert_eq!(threat.brand_affected, "unknown");
        assert_eq!(threat.risk_level, Severity::Critical);

        assert!(monitor.check_domain("example.org").is_none());
        assert_eq!(phishing_indicators("10-0-0.example.com"), vec!["IP-like pattern".to_string()]);
        assert_eq!(indicator_risk(1), Severity::Medium);
    }

    #[test]
    fn test_takedown_request_and_report() {
        let mut threat = monitor().check_domain("paypa1.com").expect("threat");
        let request = takedown_request(&threat, "abuse_report");
        assert_eq!(request.threat_id, threat.id);
        assert_eq!(request.contact.provider, "google");

        threat.evidence["registration_info"] = json!({"registrar": "NameCheap, Inc."});
        assert_eq!(contact_for(&threat).provider, "namecheap");

        let report = abuse_report(&threat);
        assert!(report.starts_with("ABUSE REPORT - TYPOSQUAT"));
        assert!(report.contains("Malicious URL/Domain: paypa1.com"));
        assert!(report.contains("Official Domains: paypal.com"));
        assert!(report.contains("Risk Level: HIGH"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("takedown_completed".parse::<TakedownStatus>().unwrap(), TakedownStatus::TakedownCompleted);
        assert!("gone".parse::<TakedownStatus>().is_err());
    }
}
