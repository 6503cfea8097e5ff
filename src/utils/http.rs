// src/utils/http.rs
use std::time::Duration;
use anyhow::{anyhow, Result, Context};
use reqwest::{Client, RequestBuilder};
use url::Url;
use tracing::debug;

use crate::config::GlobalConfig;

/// HTTP client shared by every API integration
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(user_agent: Option<String>, timeout_secs: Option<u64>) -> Result<Self> {
        let user_agent = user_agent.unwrap_or_else(|| format!("surfacewatch/{}", env!("CARGO_PKG_VERSION")));
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(30));

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(&user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Create a client from the global settings
    pub fn from_config(global: &GlobalConfig) -> Result<Self> {
        Self::new(Some(global.user_agent.clone()), Some(global.http_timeout_secs))
    }

    /// Start a GET request; callers add headers and query parameters
    pub fn request_get(&self, url: &str) -> RequestBuilder {
        debug!("GET {}", url);
        self.client.get(url)
    }

    /// Start a POST request
    pub fn request_post(&self, url: &str) -> RequestBuilder {
        debug!("POST {}", url);
        self.client.post(url)
    }
}

/// Join a base URL and a path without doubling slashes
pub fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Append path segments to a base URL, percent-encoding each one
pub fn endpoint_segments(base: &str, segments: &[&str]) -> Result<String> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid base URL {}", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Base URL {} cannot take a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.into())
}
