// src/index/elastic.rs
use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{SurfaceError, SurfaceResult};
use crate::utils::http::{endpoint, HttpClient};

use super::{AssetDocument, IndexSink};

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// Elasticsearch bulk writer
pub struct ElasticSink {
    http: HttpClient,
    url: String,
    index: String,
    api_key: Option<String>,
}

impl ElasticSink {
    pub fn new(http: HttpClient, url: &str, index: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            url: url.to_string(),
            index: index.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// Newline-delimited bulk body, one action line per document
    pub fn bulk_body(&self, documents: &[AssetDocument]) -> SurfaceResult<String> {
        let action = json!({"index": {"_index": self.index}}).to_string();
        let mut body = String::new();
        for document in documents {
            body.push_str(&action);
            body.push('\n');
            body.push_str(&serde_json::to_string(document)?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl IndexSink for ElasticSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn index(&self, documents: &[AssetDocument]) -> SurfaceResult<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let mut request = self.http
            .request_post(&endpoint(&self.url, "/_bulk"))
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(self.bulk_body(documents)?);
        if let Some(api_key) = &self.api_key {
            request = request.header(header::AUTHORIZATION, format!("ApiKey {}", api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SurfaceError::IndexError {
                sink: self.name().to_string(),
                message: format!("bulk request returned {}: {}", status, text),
            });
        }

        let bulk: BulkResponse = response.json().await?;
        let failed = if bulk.errors {
            bulk.items
                .iter()
                .filter(|item| item.get("index").and_then(|i| i.get("error")).is_some())
                .count()
        } else {
            0
        };
        if failed > 0 {
            warn!("Elasticsearch rejected {} of {} documents", failed, documents.len());
        }

        let accepted = documents.len() - failed.min(documents.len());
        info!("Indexed {} documents into Elasticsearch index {}", accepted, self.index);
        debug!("Bulk response contained {} items", bulk.items.len());
        Ok(accepted)
    }
}
