// src/leaks/hibp.rs
use std::time::Duration;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::{Finding, FindingKind, Severity, ToolOutcome};
use crate::utils::http::{endpoint_segments, HttpClient};

/// A breach record from HaveIBeenPwned
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Breach {
    pub name: String,
    pub title: String,
    pub domain: String,
    pub breach_date: String,
    pub added_date: String,
    pub pwn_count: u64,
    pub description: String,
    pub data_classes: Vec<String>,
    pub is_verified: bool,
    pub is_fabricated: bool,
    pub is_sensitive: bool,
    pub is_spam_list: bool,
}

/// A paste an account appeared in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Paste {
    pub source: String,
    pub id: String,
    pub title: Option<String>,
    pub date: Option<String>,
    pub email_count: u64,
}

/// Result of a Pwned Passwords range lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PasswordCheck {
    pub pwned: bool,
    /// Times the password appears across breaches
    pub count: u64,
    pub message: String,
}

impl PasswordCheck {
    fn new(count: u64) -> Self {
        let message = if count > 0 {
            format!("Password found in {} data breaches", count)
        } else {
            "Password not found in known breaches".to_string()
        };
        Self {
            pwned: count > 0,
            count,
            message,
        }
    }
}

/// Uppercase SHA-1 of a password split into the 5 character prefix sent
/// to the range API and the suffix matched locally
pub fn password_hash_parts(password: &str) -> (String, String) {
    let hash = format!("{:X}", Sha1::digest(password.as_bytes()));
    let (prefix, suffix) = hash.split_at(5);
    (prefix.to_string(), suffix.to_string())
}

/// Find a hash suffix in a range response of `SUFFIX:COUNT` lines
pub fn range_count(body: &str, suffix: &str) -> u64 {
    body.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(suffix))
        .and_then(|(_, count)| count.trim().parse().ok())
        .unwrap_or(0)
}

/// HaveIBeenPwned v3 client. Requests are spaced by the configured rate limit.
pub struct HibpClient {
    http: HttpClient,
    base_url: String,
    passwords_url: String,
    api_key: Option<String>,
    rate_limit: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl HibpClient {
    pub fn new(http: HttpClient, base_url: &str, api_key: Option<String>, rate_limit: Duration) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            passwords_url: "https://api.pwnedpasswords.com".to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            rate_limit,
            last_request: Mutex::new(None),
        }
    }

    /// Point password lookups at another Pwned Passwords endpoint
    pub fn with_passwords_url(mut self, url: &str) -> Self {
        self.passwords_url = url.to_string();
        self
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < self.rate_limit {
                tokio::time::sleep(self.rate_limit - since).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn fetch<T>(&self, segments: &[&str], query: &[(&str, &str)]) -> ToolOutcome<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let api_key = match &self.api_key {
            Some(key) => key,
            None => {
                warn!("HIBP API key not configured");
                return ToolOutcome::Unavailable("HIBP API key not configured".to_string());
            }
        };

        let url = match endpoint_segments(&self.base_url, segments) {
            Ok(url) => url,
            Err(e) => return ToolOutcome::Failed(format!("{:#}", e)),
        };

        self.throttle().await;

        let response = self.http
            .request_get(&url)
            .header("hibp-api-key", api_key)
            .query(query)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return ToolOutcome::Failed(format!("HIBP request failed: {}", e)),
        };

        match response.status() {
            StatusCode::OK => match response.json::<Vec<T>>().await {
                Ok(items) => ToolOutcome::Success(items),
                Err(e) => ToolOutcome::Failed(format!("failed to decode HIBP response: {}", e)),
            },
            // Nothing on record
            StatusCode::NOT_FOUND => ToolOutcome::Success(Vec::new()),
            StatusCode::UNAUTHORIZED => {
                error!("HIBP API key is invalid");
                ToolOutcome::Failed("HIBP API key is invalid".to_string())
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("HIBP rate limit exceeded");
                ToolOutcome::Failed("HIBP rate limit exceeded".to_string())
            }
            status => ToolOutcome::Failed(format!("HIBP returned {}", status)),
        }
    }

    /// Breaches an email address appears in
    pub async fn breached_account(&self, email: &str) -> ToolOutcome<Vec<Breach>> {
        debug!("Checking HIBP breaches for {}", email);
        self.fetch(
            &["breachedaccount", email],
            &[("truncateResponse", "false"), ("includeUnverified", "false")],
        )
        .await
    }

    /// Breaches attributed to a domain
    pub async fn domain_breaches(&self, domain: &str) -> ToolOutcome<Vec<Breach>> {
        self.fetch(&["breaches"], &[("domain", domain)]).await
    }

    /// Pastes an email address appears in
    pub async fn pastes(&self, email: &str) -> ToolOutcome<Vec<Paste>> {
        self.fetch(&["pasteaccount", email], &[]).await
    }

    /// k-anonymity lookup: only the first five hex characters of the hash leave the host.
    /// Needs no API key.
    pub async fn password_exposure(&self, password: &str) -> ToolOutcome<PasswordCheck> {
        let (prefix, suffix) = password_hash_parts(password);
        let url = match endpoint_segments(&self.passwords_url, &["range", prefix.as_str()]) {
            Ok(url) => url,
            Err(e) => return ToolOutcome::Failed(format!("{:#}", e)),
        };

        let response = match self.http.request_get(&url).send().await {
            Ok(response) => response,
            Err(e) => return ToolOutcome::Failed(format!("Pwned Passwords request failed: {}", e)),
        };
        if response.status() != StatusCode::OK {
            error!("Password check failed: {}", response.status());
            return ToolOutcome::Failed(format!("Pwned Passwords returned {}", response.status()));
        }

        match response.text().await {
            Ok(body) => {
                let check = PasswordCheck::new(range_count(&body, &suffix));
                info!("Password check: {}", check.message);
                ToolOutcome::Success(check)
            }
            Err(e) => ToolOutcome::Failed(format!("failed to read Pwned Passwords response: {}", e)),
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Finding for an account breach; verified breaches rank higher
pub fn account_breach_finding(email: &str, breach: &Breach) -> Finding {
    let severity = if breach.is_verified { Severity::High } else { Severity::Medium };
    Finding::new(FindingKind::Breach, severity, "hibp", email, format!("Email found in {} breach", breach.title))
        .with_detail(json!({
            "email": email,
            "breach_name": breach.name,
            "breach_date": breach.breach_date,
            "pwn_count": breach.pwn_count,
            "data_classes": breach.data_classes,
            "is_verified": breach.is_verified,
            "description": truncate(&breach.description, 500),
        }))
}

pub fn domain_breach_finding(domain: &str, breach: &Breach) -> Finding {
    Finding::new(FindingKind::Breach, Severity::High, "hibp", domain, format!("Domain associated with {} breach", breach.title))
        .with_detail(json!({
            "domain": domain,
            "breach_name": breach.name,
            "breach_date": breach.breach_date,
            "pwn_count": breach.pwn_count,
            "data_classes": breach.data_classes,
        }))
}

pub fn paste_finding(email: &str, paste: &Paste) -> Finding {
    let title = paste.title.clone().unwrap_or_else(|| "Untitled".to_string());
    Finding::new(FindingKind::Paste, Severity::Medium, "hibp", email, format!("Email found in paste: {}", title))
        .with_detail(json!({
            "email": email,
            "paste_source": paste.source,
            "paste_id": paste.id,
            "paste_date": paste.date,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, key: Option<&str>) -> HibpClient {
        HibpClient::new(
            HttpClient::new(None, Some(5)).unwrap(),
            &server.uri(),
            key.map(str::to_string),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_breached_account_sends_key_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/breachedaccount/alice@example.com"))
            .and(header("hibp-api-key", "secret"))
            .and(query_param("truncateResponse", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"Name":"Adobe","Title":"Adobe","Domain":"adobe.com","BreachDate":"2013-10-04",
                     "PwnCount":152445165,"DataClasses":["Email addresses","Passwords"],"IsVerified":true}]"#,
            ))
            .mount(&server)
            .await;

        let breaches = client(&server, Some("secret"))
            .breached_account("alice@example.com")
            .await
            .into_value()
            .unwrap();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].pwn_count, 152445165);

        let finding = account_breach_finding("alice@example.com", &breaches[0]);
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.kind, FindingKind::Breach);
    }

    #[tokio::test]
    async fn test_account_is_a_single_encoded_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/breachedaccount/ops%2Fteam@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server, Some("secret")).breached_account("ops/team@example.com").await;
        assert_eq!(outcome.into_value().map(|b| b.len()), Some(0));
    }

    #[test]
    fn test_password_hash_parts() {
        let (prefix, suffix) = password_hash_parts("password");
        assert_eq!(prefix, "5BAA6");
        assert_eq!(suffix, "1E4C9B93F3F0682250B6CF8331B7EE68FD8");
    }

    #[test]
    fn test_range_count() {
        let body = "0018A45C4D1DEF81644B54AB7F969B88D65:1\r\n1E4C9B93F3F0682250B6CF8331B7EE68FD8:9659365\r\n";
        assert_eq!(range_count(body, "1E4C9B93F3F0682250B6CF8331B7EE68FD8"), 9659365);
        assert_eq!(range_count(body, "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"), 0);
    }

    #[tokio::test]
    async fn test_password_exposure_sends_only_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/range/5BAA6"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "003D68EB55068C33ACE09247EE4C639306B:3\r\n1E4C9B93F3F0682250B6CF8331B7EE68FD8:9659365\r\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        // No API key needed
        let hibp = client(&server, None).with_passwords_url(&server.uri());
        let check = hibp.password_exposure("password").await.into_value().unwrap();
        assert!(check.pwned);
        assert_eq!(check.count, 9659365);

    }

    #[tokio::test]
    async fn test_password_missing_from_range_is_clean() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/range/5BAA6"))
            .respond_with(ResponseTemplate::new(200).set_body_string("003D68EB55068C33ACE09247EE4C639306B:3\r\n"))
            .mount(&server)
            .await;

        let hibp = client(&server, None).with_passwords_url(&server.uri());
        let check = hibp.password_exposure("password").await.into_value().unwrap();
        assert!(!check.pwned);
        assert_eq!(check.count, 0);
        assert_eq!(check.message, "Password not found in known breaches");
    }

    #[tokio::test]
    async fn test_not_found_means_clean() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = client(&server, Some("secret")).pastes("bob@example.com").await;
        assert_eq!(outcome.into_value().map(|p| p.len()), Some(0));
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let server = MockServer::start().await;
        let outcome = client(&server, None).domain_breaches("example.com").await;
        assert!(outcome.is_unavailable());
    }

    #[tokio::test]
    async fn test_invalid_key_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let outcome = client(&server, Some("wrong")).domain_breaches("example.com").await;
        assert!(matches!(outcome, ToolOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spaces_requests() {
        let hibp = HibpClient::new(
            HttpClient::new(None, Some(5)).unwrap(),
            "http://127.0.0.1:9",
            Some("k".to_string()),
            Duration::from_millis(1500),
        );
        let started = Instant::now();
        hibp.throttle().await;
        hibp.throttle().await;
        hibp.throttle().await;
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }
}
