// src/config/schema.rs
use std::path::PathBuf;
use std::time::Duration;
use serde::{Serialize, Deserialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub scan: ScanConfig,
    pub passive: PassiveConfig,
    pub active: ActiveConfig,
    pub tools: ToolsConfig,
    pub spiderfoot: SpiderFootConfig,
    pub index: IndexConfig,
    pub leaks: LeaksConfig,
    pub takedown: TakedownConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: home_dir.join(".surfacewatch/data"),
            user_agent: format!("surfacewatch/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
        }
    }
}

/// Orchestration defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub timeout_secs: u64,
    /// Time kept back for the stages after the active scan
    pub stage_reserve_secs: u64,
    pub max_threads: usize,
    pub intensity: String,
    pub index_partial_results: bool,
    pub max_cidr_hosts: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            stage_reserve_secs: 60,
            max_threads: num_cpus::get().max(2),
            intensity: "normal".to_string(),
            index_partial_results: false,
            max_cidr_hosts: 256,
        }
    }
}

impl ScanConfig {
    pub fn stage_reserve(&self) -> Duration {
        Duration::from_secs(self.stage_reserve_secs)
    }
}

/// Passive discovery sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveConfig {
    pub sources: Vec<String>,
    pub source_delay_ms: u64,
    pub crtsh_url: String,
    pub hackertarget_url: String,
    pub dns_wordlist_size: usize,
    pub dns_timeout_secs: u64,
}

impl Default for PassiveConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                "crtsh".to_string(),
                "amass".to_string(),
                "hackertarget".to_string(),
                "dns".to_string(),
            ],
            source_delay_ms: 500,
            crtsh_url: "https://crt.sh".to_string(),
            hackertarget_url: "https://api.hackertarget.com".to_string(),
            dns_wordlist_size: 50,
            dns_timeout_secs: 2,
        }
    }
}

impl PassiveConfig {
    pub fn source_delay(&self) -> Duration {
        Duration::from_millis(self.source_delay_ms)
    }
}

/// Active scanning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveConfig {
    pub use_masscan: bool,
    pub web_ports: Vec<u16>,
    pub cdn_ranges: Vec<String>,
    pub socket_timeout_secs: u64,
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            use_masscan: true,
            web_ports: vec![80, 443],
            cdn_ranges: crate::core::cdn::CLOUDFLARE_RANGES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            socket_timeout_secs: 2,
        }
    }
}

/// External tool locations and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub amass: String,
    pub masscan: String,
    pub nmap: String,
    pub trufflehog: String,
    /// Go trufflehog, used for filesystem scans
    pub trufflehog_filesystem: String,
    pub amass_timeout_secs: u64,
    pub masscan_timeout_secs: u64,
    pub nmap_timeout_secs: u64,
    pub trufflehog_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            amass: "amass".to_string(),
            masscan: "masscan".to_string(),
            nmap: "nmap".to_string(),
            trufflehog: "trufflehog3".to_string(),
            trufflehog_filesystem: "trufflehog".to_string(),
            amass_timeout_secs: 300,
            masscan_timeout_secs: 300,
            nmap_timeout_secs: 300,
            trufflehog_timeout_secs: 600,
            probe_timeout_secs: 5,
        }
    }
}

/// SpiderFoot server and polling behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiderFootConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub modules: Vec<String>,
    pub max_duration_secs: u64,
    pub poll_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub grace_period_secs: u64,
    pub grace_poll_interval_secs: u64,
    pub final_delay_secs: u64,
}

impl Default for SpiderFootConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            api_key: None,
            modules: Vec::new(),
            max_duration_secs: 1800,
            poll_interval_secs: 5,
            settle_delay_secs: 5,
            grace_period_secs: 10,
            grace_poll_interval_secs: 2,
            final_delay_secs: 3,
        }
    }
}

/// Index sinks. A sink without a URL is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub elasticsearch_url: Option<String>,
    pub elasticsearch_api_key: Option<String>,
    pub elasticsearch_index: String,
    pub meilisearch_url: Option<String>,
    pub meilisearch_api_key: Option<String>,
    pub meilisearch_index: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            elasticsearch_url: None,
            elasticsearch_api_key: None,
            elasticsearch_index: "assets".to_string(),
            meilisearch_url: None,
            meilisearch_api_key: None,
            meilisearch_index: "assets_search".to_string(),
        }
    }
}

/// Leak monitoring APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaksConfig {
    pub hibp_api_key: Option<String>,
    pub hibp_url: String,
    pub hibp_rate_limit_ms: u64,
    pub pwned_passwords_url: String,
    pub shodan_api_key: Option<String>,
    pub shodan_url: String,
}

impl Default for LeaksConfig {
    fn default() -> Self {
        Self {
            hibp_api_key: None,
            hibp_url: "https://haveibeenpwned.com/api/v3".to_string(),
            hibp_rate_limit_ms: 1500,
            pwned_passwords_url: "https://api.pwnedpasswords.com".to_string(),
            shodan_api_key: None,
            shodan_url: "https://api.shodan.io".to_string(),
        }
    }
}

/// Brand protection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TakedownConfig {
    pub similarity_threshold: f64,
    pub max_patterns: usize,
}

impl Default for TakedownConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            max_patterns: 500,
        }
    }
}
