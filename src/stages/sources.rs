// src/stages/sources.rs
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::core::{Deadline, SubdomainSet, ToolOutcome};
use crate::utils::http::{endpoint, HttpClient};
use crate::utils::shell::{args, CommandRunner};

/// Candidate labels for DNS brute forcing, most common first
pub const COMMON_SUBDOMAINS: &[&str] = &[
    "www", "mail", "ftp", "localhost", "webmail", "smtp", "pop", "ns1", "webdisk", "ns2",
    "cpanel", "whm", "autodiscover", "autoconfig", "m", "imap", "test", "ns", "blog", "pop3",
    "dev", "www2", "admin", "forum", "news", "vpn", "ns3", "mail2", "new", "mysql",
    "old", "lists", "support", "mobile", "mx", "static", "docs", "beta", "web2", "www1",
    "api", "cdn", "stats", "dns1", "www3", "dns", "api2", "secure", "test2", "ns4",
    "shop", "sql", "secure2", "portal", "app", "stage", "staging", "git", "vpn2", "remote",
];

/// Trait for subdomain discovery sources
#[async_trait]
pub trait SubdomainSource: Send + Sync {
    /// Get the name of the source
    fn name(&self) -> &str;

    /// Discover hostnames under `domain`. Implementations keep their own work inside `deadline`.
    async fn discover(&self, domain: &str, deadline: &Deadline) -> ToolOutcome<SubdomainSet>;
}

/// Run an HTTP future under the time left, mapping errors to outcomes
async fn bounded<T, F>(deadline: &Deadline, fut: F) -> ToolOutcome<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    if deadline.is_expired() {
        return ToolOutcome::TimedOut { partial: None };
    }
    match tokio::time::timeout(deadline.remaining(), fut).await {
        Ok(Ok(value)) => ToolOutcome::Success(value),
        Ok(Err(e)) => ToolOutcome::Failed(format!("{:#}", e)),
        Err(_) => ToolOutcome::TimedOut { partial: None },
    }
}

#[derive(Debug, Deserialize)]
struct CrtShEntry {
    #[serde(default)]
    name_value: String,
}

/// Certificate transparency search through crt.sh
pub struct CrtShSource {
    http: HttpClient,
    base_url: String,
}

impl CrtShSource {
    pub fn new(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
        }
    }

    async fn fetch(&self, domain: &str) -> anyhow::Result<Vec<CrtShEntry>> {
        let response = self.http
            .request_get(&endpoint(&self.base_url, "/"))
            .query(&[("q", format!("%.{}", domain)), ("output", "json".to_string())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Vec<CrtShEntry>>().await?)
    }
}

#[async_trait]
impl SubdomainSource for CrtShSource {
    fn name(&self) -> &str {
        "crtsh"
    }

    async fn discover(&self, domain: &str, deadline: &Deadline) -> ToolOutcome<SubdomainSet> {
        bounded(deadline, self.fetch(domain)).await.map(|entries| {
            let mut set = SubdomainSet::new(domain);
            for entry in entries {
                for name in entry.name_value.lines() {
                    set.insert(name);
                }
            }
            debug!("crt.sh returned {} hostnames for {}", set.len(), domain);
            set
        })
    }
}

/// HackerTarget host search (`hostname,ip` per line)
pub struct HackerTargetSource {
    http: HttpClient,
    base_url: String,
}

impl HackerTargetSource {
    pub fn new(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
        }
    }

    async fn fetch(&self, domain: &str) -> anyhow::Result<String> {
        let response = self.http
            .request_get(&endpoint(&self.base_url, "/hostsearch/"))
            .query(&[("q", domain)])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Parse a HackerTarget hostsearch body
pub fn parse_hostsearch(domain: &str, body: &str) -> ToolOutcome<SubdomainSet> {
    let trimmed = body.trim();
    if trimmed.starts_with("error") || trimmed.starts_with("API count exceeded") {
        return ToolOutcome::Failed(trimmed.lines().next().unwrap_or_default().to_string());
    }

    let mut set = SubdomainSet::new(domain);
    for line in trimmed.lines() {
        let mut fields = line.split(',');
        let host = match fields.next() {
            Some(host) if !host.trim().is_empty() => host.trim(),
            _ => continue,
        };
        match fields.next().and_then(|ip| ip.trim().parse::<IpAddr>().ok()) {
            Some(ip) => set.insert_ip(host, ip),
            None => set.insert(host),
        };
    }
    ToolOutcome::Success(set)
}

#[async_trait]
impl SubdomainSource for HackerTargetSource {
    fn name(&self) -> &str {
        "hackertarget"
    }

    async fn discover(&self, domain: &str, deadline: &Deadline) -> ToolOutcome<SubdomainSet> {
        bounded(deadline, self.fetch(domain))
            .await
            .and_then(|body| parse_hostsearch(domain, &body))
    }
}

/// Resolves common labels under the domain
pub struct DnsBruteForceSource {
    resolver: TokioAsyncResolver,
    wordlist_size: usize,
    lookup_timeout: Duration,
}

impl DnsBruteForceSource {
    /// Create a new brute forcer using the first `wordlist_size` candidate labels
    pub fn new(wordlist_size: usize, lookup_timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = lookup_timeout;
        opts.attempts = 1;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            wordlist_size,
            lookup_timeout,
        }
    }

    pub fn candidates(&self, domain: &str) -> Vec<String> {
        COMMON_SUBDOMAINS
            .iter()
            .take(self.wordlist_size)
            .map(|label| format!("{}.{}", label, domain))
            .collect()
    }
}

#[async_trait]
impl SubdomainSource for DnsBruteForceSource {
    fn name(&self) -> &str {
        "dns"
    }

    async fn discover(&self, domain: &str, deadline: &Deadline) -> ToolOutcome<SubdomainSet> {
        let mut lookups = JoinSet::new();
        let lookup_timeout = deadline.cap(self.lookup_timeout);

        for candidate in self.candidates(domain) {
            let resolver = self.resolver.clone();
            lookups.spawn(async move {
                let resolved = tokio::time::timeout(lookup_timeout, resolver.lookup_ip(candidate.as_str())).await;
                match resolved {
                    Ok(Ok(lookup)) => Some((candidate, lookup.iter().collect::<Vec<IpAddr>>())),
                    _ => None,
                }
            });
        }

        let mut set = SubdomainSet::new(domain);
        while let Some(joined) = lookups.join_next().await {
            if let Ok(Some((host, ips))) = joined {
                set.insert(&host);
                for ip in ips {
                    set.insert_ip(&host, ip);
                }
            }
        }

        debug!("DNS brute force resolved {} hostnames for {}", set.len() - 1, domain);
        ToolOutcome::Success(set)
    }
}

#[derive(Debug, Deserialize)]
struct AmassRecord {
    name: String,
    #[serde(default)]
    addresses: Vec<AmassAddress>,
}

#[derive(Debug, Deserialize)]
struct AmassAddress {
    ip: String,
}

/// Parse amass JSON-lines output; malformed lines are skipped
pub fn parse_amass_output(domain: &str, text: &str) -> SubdomainSet {
    let mut set = SubdomainSet::new(domain);
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<AmassRecord>(line) {
            Ok(record) => {
                set.insert(&record.name);
                for address in record.addresses {
                    if let Ok(ip) = address.ip.parse::<IpAddr>() {
                        set.insert_ip(&record.name, ip);
                    }
                }
            }
            Err(e) => debug!("Skipping amass line: {}", e),
        }
    }
    set
}

/// OWASP amass in passive mode
pub struct AmassSource {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl AmassSource {
    pub fn new(runner: Arc<dyn CommandRunner>, program: &str, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl SubdomainSource for AmassSource {
    fn name(&self) -> &str {
        "amass"
    }

    async fn discover(&self, domain: &str, deadline: &Deadline) -> ToolOutcome<SubdomainSet> {
        let output_file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => return ToolOutcome::Failed(format!("failed to create temporary file: {}", e)),
        };
        let output_path = output_file.path().to_string_lossy().into_owned();

        let command_args = args(["enum", "-passive", "-d", domain, "-json", output_path.as_str()]);
        let outcome = self.runner
            .run(&self.program, &command_args, deadline.cap(self.timeout))
            .await;

        // amass writes as it goes, so a killed run still leaves usable lines
        let text = match outcome {
            ToolOutcome::Success(_) | ToolOutcome::TimedOut { .. } => {
                tokio::fs::read_to_string(&output_path).await.unwrap_or_default()
            }
            _ => String::new(),
        };

        match outcome {
            ToolOutcome::Success(_) => {
                let set = parse_amass_output(domain, &text);
                info!("amass found {} hostnames for {}", set.len(), domain);
                ToolOutcome::Success(set)
            }
            ToolOutcome::TimedOut { .. } => {
                let set = parse_amass_output(domain, &text);
                warn!("amass timed out; keeping {} hostnames", set.len());
                ToolOutcome::TimedOut { partial: Some(set) }
            }
            ToolOutcome::Unavailable(reason) => ToolOutcome::Unavailable(reason),
            ToolOutcome::Failed(reason) => ToolOutcome::Failed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolOutcome;
    use crate::utils::shell::{CommandOutput, MockCommandRunner};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_crtsh_splits_and_filters_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("q", "%.example.com"))
            .and(query_param("output", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"name_value": "www.example.com\n*.example.com"},
                    {"name_value": "API.example.com"},
                    {"name_value": "evil.com"}]"#,
            ))
            .mount(&server)
            .await;

        let source = CrtShSource::new(HttpClient::new(None, Some(5)).unwrap(), &server.uri());
        let deadline = Deadline::new(Duration::from_secs(30));
        let set = source.discover("example.com", &deadline).await.into_value().unwrap();

        assert_eq!(set.to_vec(), vec!["api.example.com", "example.com", "www.example.com"]);
    }

    #[tokio::test]
    async fn test_crtsh_error_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let source = CrtShSource::new(HttpClient::new(None, Some(5)).unwrap(), &server.uri());
        let outcome = source.discover("example.com", &Deadline::new(Duration::from_secs(30))).await;
        assert!(matches!(outcome, ToolOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_hackertarget_records_addresses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hostsearch/"))
            .and(query_param("q", "example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "mail.example.com,192.0.2.25\nvpn.example.com,not-an-ip\n",
            ))
            .mount(&server)
            .await;

        let source = HackerTargetSource::new(HttpClient::new(None, Some(5)).unwrap(), &server.uri());
        let set = source
            .discover("example.com", &Deadline::new(Duration::from_secs(30)))
            .await
            .into_value()
            .unwrap();

        assert!(set.contains("vpn.example.com"));
        assert_eq!(set.ips_for("mail.example.com"), vec!["192.0.2.25".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_hostsearch_quota_message_is_failure() {
        let outcome = parse_hostsearch("example.com", "API count exceeded - Increase Quota with Membership");
        assert!(matches!(outcome, ToolOutcome::Failed(_)));
    }

    #[test]
    fn test_parse_amass_output() {
        let text = r#"{"name":"dev.example.com","domain":"example.com","addresses":[{"ip":"192.0.2.7","cidr":"192.0.2.0/24"}]}
not json
{"name":"other.org","addresses":[]}"#;
        let set = parse_amass_output("example.com", text);
        assert_eq!(set.to_vec(), vec!["dev.example.com", "example.com"]);
        assert_eq!(set.ips_for("dev.example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_amass_unavailable_passes_through() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| ToolOutcome::Unavailable("amass not found".to_string()));

        let source = AmassSource::new(Arc::new(runner), "amass", Duration::from_secs(300));
        let outcome = source.discover("example.com", &Deadline::new(Duration::from_secs(30))).await;
        assert!(outcome.is_unavailable());
    }

    #[tokio::test]
    async fn test_amass_passes_domain_and_output_file() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args, _| {
                program == "amass" && args[0] == "enum" && args[1] == "-passive" && args[3] == "example.com"
            })
            .returning(|_, _, _| ToolOutcome::Success(CommandOutput { status: Some(0), ..Default::default() }));

        let source = AmassSource::new(Arc::new(runner), "amass", Duration::from_secs(300));
        let set = source
            .discover("example.com", &Deadline::new(Duration::from_secs(30)))
            .await
            .into_value()
            .unwrap();
        assert_eq!(set.to_vec(), vec!["example.com"]);
    }

    #[test]
    fn test_dns_candidates_respect_wordlist_size() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let source = DnsBruteForceSource::new(50, Duration::from_secs(2));
        let candidates = source.candidates("example.com");
        assert_eq!(candidates.len(), 50);
        assert_eq!(candidates[0], "www.example.com");
    }
}
