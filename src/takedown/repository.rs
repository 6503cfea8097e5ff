// src/takedown/repository.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{TakedownRequest, TakedownStatus, ThreatAlert};
use crate::error::{SurfaceError, SurfaceResult};

/// Storage for detected threats and the takedowns filed against them
#[async_trait]
pub trait ThreatRepository: Send + Sync {
    async fn save(&self, threat: &ThreatAlert) -> SurfaceResult<()>;

    async fn get(&self, id: &str) -> SurfaceResult<Option<ThreatAlert>>;

    async fn list(&self) -> SurfaceResult<Vec<ThreatAlert>>;

    async fn save_request(&self, request: &TakedownRequest) -> SurfaceResult<()>;

    async fn list_requests(&self) -> SurfaceResult<Vec<TakedownRequest>>;

    /// Move a threat to a new status
    async fn update_status(&self, id: &str, status: TakedownStatus) -> SurfaceResult<ThreatAlert> {
        let mut threat = self
            .get(id)
            .await?
            .ok_or_else(|| SurfaceError::NotFound(format!("threat {}", id)))?;
        threat.status = status;
        threat.updated_at = Utc::now();
        self.save(&threat).await?;
        info!("Threat {} is now {}", id, status);
        Ok(threat)
    }
}

/// One JSON file per record under `<data_dir>/threats` and `<data_dir>/takedowns`
pub struct JsonFileThreatRepository {
    data_dir: PathBuf,
}

impl JsonFileThreatRepository {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Create the storage directories
    pub async fn init(&self) -> SurfaceResult<()> {
        for dir in [self.threats_dir(), self.takedowns_dir()] {
            fs::create_dir_all(&dir)
                .await
                .context(format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn threats_dir(&self) -> PathBuf {
        self.data_dir.join("threats")
    }

    fn takedowns_dir(&self) -> PathBuf {
        self.data_dir.join("takedowns")
    }

    async fn write_json<T: Serialize>(dir: &Path, id: &str, value: &T) -> SurfaceResult<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .await
                .context(format!("Failed to create directory {}", dir.display()))?;
        }
        let path = dir.join(format!("{}.json", id));
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json)
            .await
            .context(format!("Failed to write {}", path.display()))?;
        debug!("Saved {}", path.display());
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(dir: &Path) -> SurfaceResult<Vec<T>> {
        let mut records = Vec::new();
        if !dir.exists() {
            return Ok(records);
        }

        let mut entries = fs::read_dir(dir)
            .await
            .context(format!("Failed to read directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = fs::read_to_string(&path)
                .await
                .context(format!("Failed to read {}", path.display()))?;
            match serde_json::from_str(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ThreatRepository for JsonFileThreatRepository {
    async fn save(&self, threat: &ThreatAlert) -> SurfaceResult<()> {
        Self::write_json(&self.threats_dir(), &threat.id, threat).await
    }

    async fn get(&self, id: &str) -> SurfaceResult<Option<ThreatAlert>> {
        let path = self.threats_dir().join(format!("{}.json", id));
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .await
            .context(format!("Failed to read threat file: {}", path.display()))?;
        let threat = serde_json::from_str(&json)
            .context(format!("Failed to parse threat JSON from {}", path.display()))?;
        Ok(Some(threat))
    }

    async fn list(&self) -> SurfaceResult<Vec<ThreatAlert>> {
        let mut threats: Vec<ThreatAlert> = Self::read_all(&self.threats_dir()).await?;
        threats.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(threats)
    }

    async fn save_request(&self, request: &TakedownRequest) -> SurfaceResult<()> {
        Self::write_json(&self.takedowns_dir(), &request.id, request).await
    }

    async fn list_requests(&self) -> SurfaceResult<Vec<TakedownRequest>> {
        let mut requests: Vec<TakedownRequest> = Self::read_all(&self.takedowns_dir()).await?;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatSummary {
    pub total_threats: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_platform: BTreeMap<String, usize>,
    /// Detected within the last 24 hours
    pub recent_threats: usize,
    /// Completed takedowns as a percentage of all requests
    pub takedown_success_rate: f64,
}

/// Tally threats and takedown requests
pub fn summarize(threats: &[ThreatAlert], requests: &[TakedownRequest]) -> ThreatSummary {
    let mut summary = ThreatSummary {
        total_threats: threats.len(),
        ..Default::default()
    };

    let cutoff = Utc::now() - Duration::hours(24);
    for threat in threats {
        *summary.by_status.entry(threat.status.as_str().to_string()).or_insert(0) += 1;
        *summary.by_type.entry(threat.threat_type.as_str().to_string()).or_insert(0) += 1;
        *summary.by_platform.entry(threat.platform.clone()).or_insert(0) += 1;
        if threat.detected_at > cutoff {
            summary.recent_threats += 1;
        }
    }

    if !requests.is_empty() {
        let completed = requests
            .iter()
            .filter(|r| r.status == TakedownStatus::TakedownCompleted)
            .count();
        summary.takedown_success_rate = completed as f64 / requests.len() as f64 * 100.0;
    }
    summary
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryThreatRepository;
    use super::*;
    use crate::config::TakedownConfig;
    use crate::takedown::{takedown_request, BrandConfig, TakedownMonitor};

    fn threats() -> Vec<ThreatAlert> {
        let mut monitor = TakedownMonitor::new(&TakedownConfig::default());
        monitor.add_brand(BrandConfig::new("PayPal", vec!["paypal.com".to_string()], vec!["paypal".to_string()]));
        monitor.scan_domains(&[
            "paypa1.com".to_string(),
            "paypal-refunds-center.net".to_string(),
            "secure-login-account-update.xyz".to_string(),
            "example.org".to_string(),
        ])
    }

    #[tokio::test]
    async fn test_json_repository_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileThreatRepository::new(dir.path().to_path_buf());
        repo.init().await.unwrap();

        let threats = threats();
        assert_eq!(threats.len(), 3);
        for threat in &threats {
            repo.save(threat).await.unwrap();
        }
        let request = takedown_request(&threats[0], "abuse_report");
        repo.save_request(&request).await.unwrap();

        assert_eq!(repo.list().await.unwrap().len(), 3);
        let loaded = repo.get(&threats[0].id).await.unwrap().expect("saved threat");
        assert_eq!(loaded.target, "paypa1.com");
        assert!(repo.get("missing").await.unwrap().is_none());

        let requests = repo.list_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].threat_id, threats[0].id);
    }

    #[tokio::test]
    async fn test_corrupt_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileThreatRepository::new(dir.path().to_path_buf());
        repo.init().await.unwrap();
        std::fs::write(dir.path().join("threats").join("broken.json"), "{not json").unwrap();

        repo.save(&threats()[0]).await.unwrap();
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status() {
        let repo = MemoryThreatRepository::default();
        let threat = threats().remove(0);
        repo.save(&threat).await.unwrap();

        let updated = repo.update_status(&threat.id, TakedownStatus::Investigating).await.unwrap();
        assert_eq!(updated.status, TakedownStatus::Investigating);
        assert!(updated.updated_at >= threat.updated_at);
        assert_eq!(repo.get(&threat.id).await.unwrap().unwrap().status, TakedownStatus::Investigating);

        let missing = repo.update_status("nope", TakedownStatus::Monitoring).await;
        assert!(matches!(missing, Err(SurfaceError::NotFound(_))));
    }

    #[test]
    fn test_summary() {
        let mut threats = threats();
        threats[1].status = TakedownStatus::FalsePositive;
        threats[2].detected_at = Utc::now() - Duration::days(3);

        let mut done = takedown_request(&threats[0], "abuse_report");
        done.status = TakedownStatus::TakedownCompleted;
        let pending = takedown_request(&threats[0], "phishing");

        let summary = summarize(&threats, &[done, pending]);
        assert_eq!(summary.total_threats, 3);
        assert_eq!(summary.by_status["detected"], 2);
        assert_eq!(summary.by_status["false_positive"], 1);
        assert_eq!(summary.by_type["typosquat"], 1);
        assert_eq!(summary.by_type["lookalike_domain"], 1);
        assert_eq!(summary.by_type["phishing_domain"], 1);
        assert_eq!(summary.by_platform["domain"], 3);
        assert_eq!(summary.recent_threats, 2);
        assert_eq!(summary.takedown_success_rate, 50.0);
    }
}
