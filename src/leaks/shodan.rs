// src/leaks/shodan.rs
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::core::{Finding, FindingKind, Severity, ToolOutcome};
use crate::utils::http::{endpoint, HttpClient};

/// Service families searched for as exposed data stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Mongodb,
    Elasticsearch,
    Cassandra,
    Couchdb,
    Redis,
    Jenkins,
    Gitlab,
    Rsync,
    Sonarqube,
    Kibana,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 10] = [
        DatabaseKind::Mongodb,
        DatabaseKind::Elasticsearch,
        DatabaseKind::Cassandra,
        DatabaseKind::Couchdb,
        DatabaseKind::Redis,
        DatabaseKind::Jenkins,
        DatabaseKind::Gitlab,
        DatabaseKind::Rsync,
        DatabaseKind::Sonarqube,
        DatabaseKind::Kibana,
    ];

    /// Shodan search query for this kind of exposure
    pub fn query(&self) -> &'static str {
        match self {
            DatabaseKind::Mongodb => r#"product:"MongoDB" -authentication"#,
            DatabaseKind::Elasticsearch => r#"product:"Elastic" port:9200"#,
            DatabaseKind::Cassandra => r#"product:"Cassandra""#,
            DatabaseKind::Couchdb => r#"product:"CouchDB""#,
            DatabaseKind::Redis => r#"product:"Redis" -authentication"#,
            DatabaseKind::Jenkins => r#"product:"Jenkins" http.title:"Dashboard""#,
            DatabaseKind::Gitlab => r#"http.title:"GitLab""#,
            DatabaseKind::Rsync => "port:873 @RSYNC",
            DatabaseKind::Sonarqube => r#"http.title:"SonarQube""#,
            DatabaseKind::Kibana => "kibana content-length:217",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Mongodb => "mongodb",
            DatabaseKind::Elasticsearch => "elasticsearch",
            DatabaseKind::Cassandra => "cassandra",
            DatabaseKind::Couchdb => "couchdb",
            DatabaseKind::Redis => "redis",
            DatabaseKind::Jenkins => "jenkins",
            DatabaseKind::Gitlab => "gitlab",
            DatabaseKind::Rsync => "rsync",
            DatabaseKind::Sonarqube => "sonarqube",
            DatabaseKind::Kibana => "kibana",
        }
    }

    /// Stores that are usually open to anyone when reachable
    fn unauthenticated_by_default(&self) -> bool {
        matches!(self, DatabaseKind::Mongodb | DatabaseKind::Redis | DatabaseKind::Elasticsearch)
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ports whose exposure is a finding on its own, with the service and its severity
pub fn risky_port(port: u16) -> Option<(&'static str, Severity)> {
    match port {
        21 => Some(("FTP", Severity::High)),
        22 => Some(("SSH", Severity::Medium)),
        23 => Some(("Telnet", Severity::Critical)),
        25 => Some(("SMTP", Severity::Medium)),
        3306 => Some(("MySQL", Severity::High)),
        5432 => Some(("PostgreSQL", Severity::High)),
        6379 => Some(("Redis", Severity::Critical)),
        27017 => Some(("MongoDB", Severity::Critical)),
        9200 => Some(("Elasticsearch", Severity::High)),
        11211 => Some(("Memcached", Severity::High)),
        _ => None,
    }
}

/// One banner as returned in search matches and host data
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShodanBanner {
    pub ip_str: Option<String>,
    pub port: u16,
    pub transport: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub org: Option<String>,
    pub isp: Option<String>,
    pub hostnames: Vec<String>,
    pub data: String,
    pub vulns: HashMap<String, Value>,
    pub location: ShodanLocation,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShodanLocation {
    pub country_name: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShodanHost {
    pub ip_str: String,
    pub ports: Vec<u16>,
    pub hostnames: Vec<String>,
    pub org: Option<String>,
    pub vulns: Vec<String>,
    pub data: Vec<ShodanBanner>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    matches: Vec<ShodanBanner>,
}

fn banner_excerpt(banner: &str) -> String {
    banner.chars().take(500).collect()
}

fn sorted_vulns(vulns: &HashMap<String, Value>) -> Vec<String> {
    let mut ids: Vec<String> = vulns.keys().cloned().collect();
    ids.sort();
    ids
}

/// Severity of an exposed data store match
pub fn assess_database_severity(kind: DatabaseKind, banner: &ShodanBanner) -> Severity {
    if kind.unauthenticated_by_default() {
        let data = banner.data.to_lowercase();
        if !data.contains("authentication") && !data.contains("unauthorized") {
            return Severity::Critical;
        }
    }
    if !banner.vulns.is_empty() {
        return Severity::High;
    }
    Severity::Medium
}

/// Shodan REST client
pub struct ShodanClient {
    http: HttpClient,
    base_url: String,
    api_key: String,
}

impl ShodanClient {
    /// Create a client; `None` when no key is configured
    pub fn new(http: HttpClient, base_url: &str, api_key: Option<String>) -> Option<Self> {
        match api_key.filter(|k| !k.trim().is_empty()) {
            Some(api_key) => Some(Self {
                http,
                base_url: base_url.to_string(),
                api_key,
            }),
            None => {
                info!("Shodan API key not configured; Shodan lookups disabled");
                None
            }
        }
    }

    /// Host lookup; `Success(None)` when Shodan has no data for the address
    pub async fn host(&self, ip: IpAddr) -> ToolOutcome<Option<ShodanHost>> {
        let response = self.http
            .request_get(&endpoint(&self.base_url, &format!("/shodan/host/{}", ip)))
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return ToolOutcome::Failed(format!("Shodan request failed: {}", e)),
        };

        match response.status() {
            StatusCode::OK => match response.json::<ShodanHost>().await {
                Ok(host) => ToolOutcome::Success(Some(host)),
                Err(e) => ToolOutcome::Failed(format!("failed to decode Shodan host: {}", e)),
            },
            StatusCode::NOT_FOUND => {
                info!("No Shodan data for {}", ip);
                ToolOutcome::Success(None)
            }
            StatusCode::UNAUTHORIZED => ToolOutcome::Failed("Shodan API key is invalid".to_string()),
            status => ToolOutcome::Failed(format!("Shodan host lookup returned {}", status)),
        }
    }

    /// Raw search
    pub async fn search(&self, query: &str, limit: usize) -> ToolOutcome<Vec<ShodanBanner>> {
        let limit = limit.min(100).to_string();
        let response = self.http
            .request_get(&endpoint(&self.base_url, "/shodan/host/search"))
            .query(&[("key", self.api_key.as_str()), ("query", query), ("limit", limit.as_str())])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return ToolOutcome::Failed(format!("Shodan request failed: {}", e)),
        };

        match response.status() {
            StatusCode::OK => match response.json::<SearchResponse>().await {
                Ok(body) => ToolOutcome::Success(body.matches),
                Err(e) => ToolOutcome::Failed(format!("failed to decode Shodan search: {}", e)),
            },
            StatusCode::UNAUTHORIZED => ToolOutcome::Unavailable("Shodan API key is invalid".to_string()),
            status => ToolOutcome::Failed(format!("Shodan search returned {}", status)),
        }
    }

    /// Search for exposed data stores, optionally narrowed to a hostname or organisation
    pub async fn exposed_databases(
        &self,
        domain: Option<&str>,
        org: Option<&str>,
        kinds: &[DatabaseKind],
        limit: usize,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        let target = domain.or(org).unwrap_or("general");

        for kind in kinds {
            let mut query = kind.query().to_string();
            if let Some(domain) = domain {
                query.push_str(&format!(r#" hostname:"{}""#, domain));
            }
            if let Some(org) = org {
                query.push_str(&format!(r#" org:"{}""#, org));
            }

            match self.search(&query, limit).await {
                ToolOutcome::Success(matches) => {
                    for banner in matches {
                        findings.push(database_finding(*kind, target, &banner));
                    }
                }
                ToolOutcome::Unavailable(reason) => {
                    // Bad key fails every query the same way
                    error!("{}", reason);
                    break;
                }
                outcome => warn!("Shodan query failed for {}: {}", kind, outcome),
            }
        }

        findings
    }

    /// Findings for risky services Shodan has seen on an address
    pub async fn host_exposure(&self, ip: IpAddr, target: &str) -> ToolOutcome<Vec<Finding>> {
        self.host(ip).await.map(|host| match host {
            Some(host) => exposure_findings(ip, target, &host),
            None => Vec::new(),
        })
    }
}

fn database_finding(kind: DatabaseKind, target: &str, banner: &ShodanBanner) -> Finding {
    let ip = banner.ip_str.clone().unwrap_or_default();
    Finding::new(
        FindingKind::ExposedDatabase,
        assess_database_severity(kind, banner),
        "shodan",
        target,
        format!("Exposed {} Database", kind.as_str().to_uppercase()),
    )
    .with_detail(json!({
        "ip": ip,
        "port": banner.port,
        "hostnames": banner.hostnames,
        "org": banner.org,
        "isp": banner.isp,
        "country": banner.location.country_name,
        "city": banner.location.city,
        "product": banner.product,
        "version": banner.version,
        "banner": banner_excerpt(&banner.data),
        "database_type": kind.as_str(),
        "vulns": sorted_vulns(&banner.vulns),
    }))
}

/// Risky-port and CVE findings from a host lookup
pub fn exposure_findings(ip: IpAddr, target: &str, host: &ShodanHost) -> Vec<Finding> {
    let mut findings = Vec::new();

    for banner in &host.data {
        if let Some((service, severity)) = risky_port(banner.port) {
            findings.push(
                Finding::new(
                    FindingKind::ExposedService,
                    severity,
                    "shodan",
                    target,
                    format!("Exposed {} Service", service),
                )
                .with_detail(json!({
                    "ip": ip.to_string(),
                    "port": banner.port,
                    "service": service,
                    "product": banner.product,
                    "version": banner.version,
                    "banner": banner_excerpt(&banner.data),
                    "vulns": sorted_vulns(&banner.vulns),
                })),
            );
        }
    }

    for cve in &host.vulns {
        findings.push(
            Finding::new(FindingKind::Vulnerability, Severity::High, "shodan", target, format!("{} reported on {}", cve, ip))
                .with_detail(json!({
                    "ip": ip.to_string(),
                    "plugin_id": cve,
                    "cve": cve,
                })),
        );
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ShodanClient {
        ShodanClient::new(HttpClient::new(None, Some(5)).unwrap(), &server.uri(), Some("key".to_string())).unwrap()
    }

    #[test]
    fn test_missing_key_disables_client() {
        let http = HttpClient::new(None, Some(5)).unwrap();
        assert!(ShodanClient::new(http.clone(), "https://api.shodan.io", None).is_none());
        assert!(ShodanClient::new(http, "https://api.shodan.io", Some("  ".to_string())).is_none());
    }

    #[test]
    fn test_database_severity() {
        let open = ShodanBanner { data: "MongoDB Server Information".to_string(), ..Default::default() };
        assert_eq!(assess_database_severity(DatabaseKind::Mongodb, &open), Severity::Critical);

        let locked = ShodanBanner { data: "Authentication required".to_string(), ..Default::default() };
        assert_eq!(assess_database_severity(DatabaseKind::Redis, &locked), Severity::Medium);

        let mut vulnerable = ShodanBanner::default();
        vulnerable.vulns.insert("CVE-2021-44228".to_string(), Value::Null);
        assert_eq!(assess_database_severity(DatabaseKind::Jenkins, &vulnerable), Severity::High);
    }

    #[tokio::test]
    async fn test_host_exposure_flags_risky_ports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shodan/host/192.0.2.5"))
            .and(query_param("key", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"ip_str":"192.0.2.5","ports":[22,443,6379],"vulns":["CVE-2023-0001"],
                    "data":[{"port":22,"product":"OpenSSH","data":"SSH-2.0-OpenSSH_8.9"},
                            {"port":443,"product":"nginx","data":"HTTP/1.1 200 OK"},
                            {"port":6379,"product":"Redis","data":"redis_version:7.0"}]}"#,
            ))
            .mount(&server)
            .await;

        let findings = client(&server)
            .host_exposure("192.0.2.5".parse().unwrap(), "example.com")
            .await
            .into_value()
            .unwrap();

        let titles: Vec<&str> = findings.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(titles, vec!["Exposed SSH Service", "Exposed Redis Service", "CVE-2023-0001 reported on 192.0.2.5"]);
        assert_eq!(findings[1].severity, Severity::Critical);
        assert_eq!(findings[2].detail_str("cve"), Some("CVE-2023-0001"));
    }

    #[tokio::test]
    async fn test_host_without_data_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = client(&server).host_exposure("192.0.2.9".parse().unwrap(), "example.com").await;
        assert_eq!(outcome.into_value().map(|f| f.len()), Some(0));
    }

    #[tokio::test]
    async fn test_exposed_database_query_includes_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shodan/host/search"))
            .and(query_param("query", r#"product:"Redis" -authentication hostname:"example.com""#))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"matches":[{"ip_str":"192.0.2.7","port":6379,"data":"redis_version:6.2"}]}"#,
            ))
            .mount(&server)
            .await;

        let findings = client(&server)
            .exposed_databases(Some("example.com"), None, &[DatabaseKind::Redis], 100)
            .await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "Exposed REDIS Database");
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].detail_str("database_type"), Some("redis"));
    }
}
