// src/context.rs
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::{ExternalScan, Orchestrator, OrchestratorSettings};
use crate::error::{SurfaceError, SurfaceResult};
use crate::index::{ElasticSink, IndexSink, MeiliSink};
use crate::leaks::{LeakMonitor, ShodanClient};
use crate::stages::{ActiveStage, ExposureStage, PassiveStage, ServiceScanner};
use crate::takedown::{JsonFileThreatRepository, TakedownMonitor};
use crate::utils::{CommandRunner, HttpClient, SystemCommandRunner};

/// Application context holding every wired-up service
pub struct Context {
    pub config: Arc<Config>,
    pub http: HttpClient,
    pub runner: Arc<dyn CommandRunner>,
    pub passive: Arc<PassiveStage>,
    pub active: Arc<ActiveStage>,
    pub orchestrator: Arc<Orchestrator>,
    pub leaks: Arc<LeakMonitor>,
    pub external: Arc<ExternalScan>,
    pub takedown: TakedownMonitor,
    pub threats: Arc<JsonFileThreatRepository>,
}

impl Context {
    /// Create a new application context from loaded configuration
    pub async fn new(config: Config) -> SurfaceResult<Self> {
        let http = HttpClient::from_config(&config.global)
            .map_err(|e| SurfaceError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(Duration::from_secs(config.tools.probe_timeout_secs)));

        // Stages
        let passive = Arc::new(PassiveStage::from_config(&config, http.clone(), runner.clone()));
        let scanner = ServiceScanner::from_config(&config, runner.clone())?;
        let active = Arc::new(ActiveStage::new(Arc::new(scanner)));
        let exposure = Arc::new(ExposureStage::new(Self::shodan(&config, &http)));

        let sinks = Self::index_sinks(&config, &http);
        info!("{} index sink(s) configured", sinks.len());

        let orchestrator = Arc::new(Orchestrator::new(
            passive.clone(),
            active.clone(),
            exposure,
            sinks,
            OrchestratorSettings::from_config(&config),
        ));

        let leaks = Arc::new(LeakMonitor::from_config(&config, http.clone(), runner.clone()));
        let external = Arc::new(ExternalScan::new(http.clone(), config.spiderfoot.clone()));

        let takedown = TakedownMonitor::new(&config.takedown);
        let threats = Arc::new(JsonFileThreatRepository::new(config.global.data_dir.clone()));
        threats.init().await?;

        debug!("Context ready, data directory {}", config.global.data_dir.display());

        Ok(Self {
            config: Arc::new(config),
            http,
            runner,
            passive,
            active,
            orchestrator,
            leaks,
            external,
            takedown,
            threats,
        })
    }

    fn shodan(config: &Config, http: &HttpClient) -> Option<ShodanClient> {
        ShodanClient::new(http.clone(), &config.leaks.shodan_url, config.leaks.shodan_api_key.clone())
    }

    /// Sinks with a configured URL
    pub fn index_sinks(config: &Config, http: &HttpClient) -> Vec<Arc<dyn IndexSink>> {
        let index = &config.index;
        let mut sinks: Vec<Arc<dyn IndexSink>> = Vec::new();

        if let Some(url) = index.elasticsearch_url.as_deref().filter(|u| !u.is_empty()) {
            sinks.push(Arc::new(ElasticSink::new(
                http.clone(),
                url,
                &index.elasticsearch_index,
                index.elasticsearch_api_key.clone(),
            )));
        }
        if let Some(url) = index.meilisearch_url.as_deref().filter(|u| !u.is_empty()) {
            sinks.push(Arc::new(MeiliSink::new(
                http.clone(),
                url,
                &index.meilisearch_index,
                index.meilisearch_api_key.clone(),
            )));
        }
        sinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_sinks_follow_urls() {
        let http = HttpClient::new(None, Some(5)).unwrap();
        let mut config = Config::default();
        assert!(Context::index_sinks(&config, &http).is_empty());

        config.index.elasticsearch_url = Some("http://localhost:9200".to_string());
        config.index.meilisearch_url = Some(String::new());
        let sinks = Context::index_sinks(&config, &http);
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].name(), "elasticsearch");

        config.index.meilisearch_url = Some("http://localhost:7700".to_string());
        assert_eq!(Context::index_sinks(&config, &http).len(), 2);
    }
}
