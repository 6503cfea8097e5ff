// src/index/meili.rs
use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;
use tracing::info;

use crate::error::{SurfaceError, SurfaceResult};
use crate::utils::http::{endpoint, HttpClient};

use super::{AssetDocument, IndexSink};

/// Flat search document; Meilisearch filters poorly on nested objects
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub id: String,
    pub scan_id: String,
    pub timestamp: String,
    pub domain: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub ports: Vec<u16>,
    pub services: Vec<String>,
    pub vulnerabilities: Vec<String>,
    pub vulnerability_count: usize,
    pub severities: Vec<String>,
}

/// Document ids may only hold ASCII alphanumerics, hyphens and underscores
pub fn document_id(scan_id: &str, hostname: &str) -> String {
    format!("{}-{}", scan_id, hostname)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub fn flatten(document: &AssetDocument) -> SearchDocument {
    let mut severities: Vec<String> = document.vulnerabilities.iter().map(|v| v.severity.clone()).collect();
    severities.sort();
    severities.dedup();

    SearchDocument {
        id: document_id(&document.scan_id, &document.asset.hostname),
        scan_id: document.scan_id.clone(),
        timestamp: document.timestamp.to_rfc3339(),
        domain: document.asset.domain.clone(),
        hostname: document.asset.hostname.clone(),
        ip: document.asset.ip.clone(),
        ports: document.services.iter().map(|s| s.port).collect(),
        services: document
            .services
            .iter()
            .map(|s| format!("{}/{} {}", s.port, s.name, s.version))
            .collect(),
        vulnerabilities: document.vulnerabilities.iter().map(|v| v.name.clone()).collect(),
        vulnerability_count: document.vulnerabilities.len(),
        severities,
    }
}

/// Meilisearch document writer
pub struct MeiliSink {
    http: HttpClient,
    url: String,
    index: String,
    api_key: Option<String>,
}

impl MeiliSink {
    pub fn new(http: HttpClient, url: &str, index: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            url: url.to_string(),
            index: index.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

#[async_trait]
impl IndexSink for MeiliSink {
    fn name(&self) -> &str {
        "meilisearch"
    }

    async fn index(&self, documents: &[AssetDocument]) -> SurfaceResult<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let flat: Vec<SearchDocument> = documents.iter().map(flatten).collect();

        let mut request = self.http
            .request_post(&endpoint(&self.url, &format!("/indexes/{}/documents", self.index)))
            .query(&[("primaryKey", "id")])
            .json(&flat);
        if let Some(api_key) = &self.api_key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SurfaceError::IndexError {
                sink: self.name().to_string(),
                message: format!("document upload returned {}: {}", status, text),
            });
        }

        // Meilisearch queues the write and answers 202 with a task
        info!("Queued {} documents for Meilisearch index {}", flat.len(), self.index);
        Ok(flat.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ScanRequest, ScanResult};
    use crate::index::build_documents;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_document_id_is_sanitized() {
        assert_eq!(document_id("abc-123", "www.example.com"), "abc-123-www_example_com");
    }

    #[tokio::test]
    async fn test_upload_flat_documents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/indexes/assets_search/documents"))
            .and(query_param("primaryKey", "id"))
            .and(header("authorization", "Bearer master"))
            .respond_with(ResponseTemplate::new(202).set_body_string(r#"{"taskUid":1,"status":"enqueued"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let mut result = ScanResult::new(&ScanRequest::new("example.com"));
        result.subdomains = vec!["example.com".to_string()];
        let documents = build_documents(&result);

        let sink = MeiliSink::new(
            HttpClient::new(None, Some(5)).unwrap(),
            &server.uri(),
            "assets_search",
            Some("master".to_string()),
        );
        assert_eq!(sink.index(&documents).await.unwrap(), 1);

        let flat = flatten(&documents[0]);
        assert_eq!(flat.hostname, "example.com");
        assert!(flat.ports.is_empty());
    }
}
