// src/engine/spiderfoot.rs
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{header, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SpiderFootConfig;
use crate::core::{Deadline, Finding, StageOutcome, ToolOutcome};
use crate::utils::http::{endpoint, HttpClient};

use super::poller::{Entity, JobPoller, JobState, PollProgress, PollSettings, RemoteJob};
use super::processor::{process_entities, ProcessedSurface};

/// SpiderFoot usecase for a requested scan type
pub fn usecase_for(scan_type: &str) -> &'static str {
    match scan_type.to_lowercase().as_str() {
        "passive" => "passive",
        "footprint" => "footprint",
        "investigate" => "investigate",
        // mvp, all and enrichment need the active modules
        _ => "all",
    }
}

/// Scan id from a `/startscan` response
pub fn parse_start_response(body: &Value) -> ToolOutcome<String> {
    match body {
        Value::Array(items) if items.len() >= 2 => {
            let message = items[1].as_str().map(str::to_string).unwrap_or_else(|| items[1].to_string());
            if items[0].as_str() == Some("SUCCESS") {
                ToolOutcome::Success(message)
            } else {
                ToolOutcome::Failed(format!("SpiderFoot refused the scan: {}", message))
            }
        }
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("scan_id"))
            .and_then(Value::as_str)
            .map(|id| ToolOutcome::Success(id.to_string()))
            .unwrap_or_else(|| ToolOutcome::Failed("no scan id in SpiderFoot response".to_string())),
        other => ToolOutcome::Failed(format!("unexpected SpiderFoot response: {}", other)),
    }
}

/// Status string from `/scanstatus`: `[name, target, created, started, finished, status, ...]`
pub fn parse_status(body: &Value) -> Option<&str> {
    body.as_array().and_then(|items| items.get(5)).and_then(Value::as_str)
}

/// Entities from `/scanexportjsonmulti`, skipping the root event and empty items
pub fn parse_events(body: &Value) -> Vec<Entity> {
    let items = match body.as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let entity_type = item.get("event_type").and_then(Value::as_str).unwrap_or_default();
            let data = item.get("data").and_then(Value::as_str).unwrap_or_default();
            if entity_type.is_empty() || entity_type == "ROOT" || data.is_empty() {
                return None;
            }
            Some(Entity {
                entity_type: entity_type.to_string(),
                value: data.to_string(),
                module: item.get("module").and_then(Value::as_str).unwrap_or_default().to_string(),
                source_data: item.get("source_data").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

/// The same URL addressed to 127.0.0.1 when it names localhost
fn loopback_alternative(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    if parsed.host_str() != Some("localhost") {
        return None;
    }
    parsed.set_host(Some("127.0.0.1")).ok()?;
    Some(parsed.as_str().trim_end_matches('/').to_string())
}

/// SpiderFoot web API client bound to a reachable server
pub struct SpiderFootClient {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl SpiderFootClient {
    pub fn new(http: HttpClient, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Find a server that answers, trying 127.0.0.1 when the URL names localhost
    pub async fn connect(http: HttpClient, url: &str, api_key: Option<String>) -> ToolOutcome<Self> {
        let mut candidates = vec![url.to_string()];
        candidates.extend(loopback_alternative(url));

        let mut last_error = String::from("no candidate URL");
        for candidate in candidates {
            let client = Self::new(http.clone(), &candidate, api_key.clone());
            for path in ["/", "/scanlist"] {
                match client.request(client.http.request_get(&endpoint(&client.base_url, path))).send().await {
                    Ok(response) if response.status().as_u16() < 400 => {
                        info!("SpiderFoot reachable at {} (via {})", client.base_url, path);
                        return ToolOutcome::Success(client);
                    }
                    Ok(response) => last_error = format!("{}{} returned {}", client.base_url, path, response.status()),
                    Err(e) => {
                        debug!("SpiderFoot not reachable at {}{}: {}", client.base_url, path, e);
                        last_error = e.to_string();
                    }
                }
            }
        }

        ToolOutcome::Unavailable(format!("SpiderFoot server not reachable: {}", last_error))
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header(header::ACCEPT, "application/json");
        match &self.api_key {
            Some(key) => builder.query(&[("apikey", key.as_str())]),
            None => builder,
        }
    }

    async fn get_value(&self, path: &str, query: &[(&str, &str)]) -> ToolOutcome<Value> {
        let builder = self.request(self.http.request_get(&endpoint(&self.base_url, path)).query(query));
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return ToolOutcome::Failed(format!("{} request failed: {}", path, e)),
        };
        if !response.status().is_success() {
            return ToolOutcome::Failed(format!("{} returned {}", path, response.status()));
        }
        match response.json::<Value>().await {
            Ok(value) => ToolOutcome::Success(value),
            Err(e) => ToolOutcome::Failed(format!("{} returned non-JSON body: {}", path, e)),
        }
    }

    /// Start a scan, returning the SpiderFoot scan id
    pub async fn start_scan(&self, name: &str, target: &str, scan_type: &str, modules: &[String]) -> ToolOutcome<String> {
        let modulelist = modules.join(",");
        let form = [
            ("scanname", name),
            ("scantarget", target),
            ("modulelist", modulelist.as_str()),
            ("usecase", usecase_for(scan_type)),
            ("typelist", ""),
        ];
        info!("Starting SpiderFoot scan of {} (usecase {}, {} modules)", target, usecase_for(scan_type), modules.len());

        let builder = self.request(self.http.request_post(&endpoint(&self.base_url, "/startscan")).form(&form));
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return ToolOutcome::Failed(format!("startscan request failed: {}", e)),
        };
        if !response.status().is_success() {
            return ToolOutcome::Failed(format!("startscan returned {}", response.status()));
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<Value>(&text) {
            Ok(body) => parse_start_response(&body),
            Err(_) => {
                let preview: String = text.chars().take(200).collect();
                ToolOutcome::Failed(format!("startscan returned a non-JSON body: {}", preview))
            }
        }
    }

    pub async fn scan_status(&self, scan_id: &str) -> ToolOutcome<JobState> {
        self.get_value("/scanstatus", &[("id", scan_id)]).await.and_then(|body| match parse_status(&body) {
            Some(status) => ToolOutcome::Success(JobState::parse(status)),
            None => ToolOutcome::Failed("malformed scanstatus response".to_string()),
        })
    }

    pub async fn results(&self, scan_id: &str) -> ToolOutcome<Vec<Entity>> {
        self.get_value("/scanexportjsonmulti", &[("ids", scan_id)]).await.map(|body| parse_events(&body))
    }

    pub async fn stop_scan(&self, scan_id: &str) -> ToolOutcome<()> {
        let builder = self.request(self.http.request_get(&endpoint(&self.base_url, "/stopscan")).query(&[("id", scan_id)]));
        match builder.send().await {
            Ok(response) if response.status().is_success() => ToolOutcome::Success(()),
            Ok(response) => ToolOutcome::Failed(format!("stopscan returned {}", response.status())),
            Err(e) => ToolOutcome::Failed(format!("stopscan request failed: {}", e)),
        }
    }
}

/// A running SpiderFoot scan
pub struct SpiderFootJob {
    client: Arc<SpiderFootClient>,
    scan_id: String,
}

impl SpiderFootJob {
    pub fn new(client: Arc<SpiderFootClient>, scan_id: &str) -> Self {
        Self {
            client,
            scan_id: scan_id.to_string(),
        }
    }
}

#[async_trait]
impl RemoteJob for SpiderFootJob {
    fn id(&self) -> &str {
        &self.scan_id
    }

    async fn status(&self) -> ToolOutcome<JobState> {
        self.client.scan_status(&self.scan_id).await
    }

    async fn snapshot(&self) -> ToolOutcome<Vec<Entity>> {
        self.client.results(&self.scan_id).await
    }

    async fn stop(&self) -> ToolOutcome<()> {
        self.client.stop_scan(&self.scan_id).await
    }
}

/// Outcome of an external surface scan
#[derive(Debug, Clone, Serialize)]
pub struct ExternalScanReport {
    pub scan_id: String,
    pub spiderfoot_id: String,
    pub target: String,
    pub scan_type: String,
    pub state: Option<JobState>,
    pub timed_out: bool,
    pub warning: Option<String>,
    pub elapsed_time: f64,
    pub entities: Vec<Entity>,
    pub modules_run: Vec<String>,
    pub processed: ProcessedSurface,
    pub findings: Vec<Finding>,
}

/// Runs a SpiderFoot scan under a time budget and processes what it finds
pub struct ExternalScan {
    http: HttpClient,
    config: SpiderFootConfig,
    poller: JobPoller,
}

impl ExternalScan {
    pub fn new(http: HttpClient, config: SpiderFootConfig) -> Self {
        let poller = JobPoller::new(PollSettings::from_config(&config));
        Self { http, config, poller }
    }

    /// Progress of the running scan
    pub fn progress(&self) -> tokio::sync::watch::Receiver<PollProgress> {
        self.poller.subscribe()
    }

    pub async fn run(&self, scan_id: &str, target: &str, scan_type: &str, max_duration: Option<Duration>) -> StageOutcome<ExternalScanReport> {
        let budget = max_duration.unwrap_or_else(|| Duration::from_secs(self.config.max_duration_secs));

        let client = match SpiderFootClient::connect(self.http.clone(), &self.config.url, self.config.api_key.clone()).await {
            ToolOutcome::Success(client) => Arc::new(client),
            outcome => {
                warn!("External scan of {} not started: {}", target, outcome);
                return StageOutcome::Failed(outcome.to_string());
            }
        };

        let name = format!("surfacewatch-{}", scan_id);
        let spiderfoot_id = match client.start_scan(&name, target, scan_type, &self.config.modules).await {
            ToolOutcome::Success(id) => id,
            outcome => {
                warn!("SpiderFoot scan of {} not started: {}", target, outcome);
                return StageOutcome::Failed(outcome.to_string());
            }
        };
        info!("SpiderFoot scan {} started for {}", spiderfoot_id, target);

        // The budget starts once the remote scan exists
        let deadline = Deadline::new(budget);
        let job = SpiderFootJob::new(client, &spiderfoot_id);
        let polled = self.poller.run(&job, &deadline).await;

        let mut modules_run: Vec<String> = polled.entities.iter().map(|e| e.module.clone()).filter(|m| !m.is_empty()).collect();
        modules_run.sort();
        modules_run.dedup();

        let processed = process_entities(&polled.entities);
        let findings = processed.findings(target);
        let warning = polled.timed_out.then(|| {
            format!(
                "Scan timed out after {}s. Showing partial results with {} entities.",
                budget.as_secs(),
                polled.entities.len()
            )
        });

        let report = ExternalScanReport {
            scan_id: scan_id.to_string(),
            spiderfoot_id,
            target: target.to_string(),
            scan_type: scan_type.to_string(),
            state: polled.state,
            timed_out: polled.timed_out,
            warning: warning.clone(),
            elapsed_time: polled.elapsed_secs,
            entities: polled.entities,
            modules_run,
            processed,
            findings,
        };

        match warning {
            Some(reason) => StageOutcome::Partial { value: report, reason },
            None => StageOutcome::Complete(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_usecase_mapping() {
        assert_eq!(usecase_for("mvp"), "all");
        assert_eq!(usecase_for("enrichment"), "all");
        assert_eq!(usecase_for("all"), "all");
        assert_eq!(usecase_for("passive"), "passive");
    }

    #[test]
    fn test_loopback_alternative() {
        assert_eq!(loopback_alternative("http://localhost:5001"), Some("http://127.0.0.1:5001".to_string()));
        assert_eq!(loopback_alternative("http://spiderfoot.internal:5001"), None);
        assert_eq!(loopback_alternative("not a url"), None);
    }

    #[test]
    fn test_parse_start_response() {
        assert_eq!(parse_start_response(&json!(["SUCCESS", "ABC123"])), ToolOutcome::Success("ABC123".to_string()));
        assert!(matches!(parse_start_response(&json!(["ERROR", "Invalid target"])), ToolOutcome::Failed(_)));
        assert_eq!(parse_start_response(&json!({"scan_id": "XYZ"})), ToolOutcome::Success("XYZ".to_string()));
        assert!(matches!(parse_start_response(&json!("ok")), ToolOutcome::Failed(_)));
    }

    #[test]
    fn test_parse_events_skips_root_and_empty() {
        let body = json!([
            {"event_type": "ROOT", "data": "example.com", "module": ""},
            {"event_type": "INTERNET_NAME", "data": "www.example.com", "module": "sfp_crt", "source_data": "example.com"},
            {"event_type": "IP_ADDRESS", "data": "", "module": "sfp_dnsresolve"},
            {"data": "orphan"}
        ]);
        let entities = parse_events(&body);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].value, "www.example.com");
        assert_eq!(entities[0].source_data.as_deref(), Some("example.com"));
        assert_eq!(parse_status(&json!(["n", "t", 0, 0, 0, "RUNNING"])), Some("RUNNING"));
        assert_eq!(parse_status(&json!(["short"])), None);
    }

    #[tokio::test]
    async fn test_external_scan_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server).await;
        Mock::given(method("POST")).and(path("/startscan"))
            .and(body_string_contains("usecase=all"))
            .and(body_string_contains("scantarget=example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"["SUCCESS","SF1"]"#))
            .expect(1)
            .mount(&server).await;
        Mock::given(method("GET")).and(path("/scanstatus")).and(query_param("id", "SF1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"["n","example.com",0,0,0,"FINISHED"]"#))
            .mount(&server).await;
        Mock::given(method("GET")).and(path("/scanexportjsonmulti")).and(query_param("ids", "SF1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"event_type":"ROOT","data":"example.com","module":""},
                    {"event_type":"INTERNET_NAME","data":"www.example.com","module":"sfp_crt"},
                    {"event_type":"CLOUD_STORAGE_BUCKET_OPEN","data":"example.s3.amazonaws.com","module":"sfp_s3bucket"}]"#,
            ))
            .mount(&server).await;

        let config = SpiderFootConfig {
            url: server.uri(),
            settle_delay_secs: 0,
            final_delay_secs: 0,
            ..SpiderFootConfig::default()
        };
        let scan = ExternalScan::new(HttpClient::new(None, Some(5)).unwrap(), config);
        let outcome = scan.run("scan-1", "example.com", "mvp", Some(Duration::from_secs(60))).await;

        let report = match outcome {
            StageOutcome::Complete(report) => report,
            other => panic!("unexpected outcome: {:?}", other.status()),
        };
        assert_eq!(report.spiderfoot_id, "SF1");
        assert_eq!(report.state, Some(JobState::Finished));
        assert_eq!(report.entities.len(), 2);
        assert_eq!(report.modules_run, vec!["sfp_crt", "sfp_s3bucket"]);
        assert_eq!(report.processed.statistics.open_buckets, 1);
        assert_eq!(report.findings.len(), 1);
        assert!(report.warning.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_stage() {
        let config = SpiderFootConfig {
            url: "http://127.0.0.1:9".to_string(),
            ..SpiderFootConfig::default()
        };
        let scan = ExternalScan::new(HttpClient::new(None, Some(2)).unwrap(), config);
        let outcome = scan.run("scan-2", "example.com", "passive", None).await;
        assert!(matches!(outcome, StageOutcome::Failed(_)));
    }
}
