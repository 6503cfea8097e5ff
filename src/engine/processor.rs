// src/engine/processor.rs
use std::collections::{BTreeMap, BTreeSet};
use serde::Serialize;
use serde_json::json;

use crate::core::{Finding, FindingKind, Severity};

use super::poller::Entity;

const INFRASTRUCTURE_TYPES: &[&str] = &[
    "IP_ADDRESS",
    "INTERNET_NAME",
    "AFFILIATE_INTERNET_NAME",
    "NETBLOCK_OWNER",
    "BGP_AS_OWNER",
    "TCP_PORT_OPEN",
    "UDP_PORT_OPEN",
];

const CLOUD_STORAGE_TYPES: &[&str] = &[
    "CLOUD_STORAGE_BUCKET",
    "CLOUD_STORAGE_BUCKET_OPEN",
    "CLOUD_STORAGE_BUCKET_OPEN_DIRECTORY",
];

const WEB_APPLICATION_TYPES: &[&str] = &[
    "WEBSERVER_BANNER",
    "SOFTWARE_USED",
    "HTTP_CODE",
    "TECHNOLOGY",
    "WEBSERVER_HTTPHEADERS",
    "TARGET_WEB_CONTENT",
    "TARGET_WEB_CONTENT_TYPE",
];

const LEAKS_RISKS_TYPES: &[&str] = &[
    "EMAIL_ADDRESS",
    "POTENTIAL_VULNERABILITY",
    "BLACKLISTED_INTERNET_NAME",
    "LEAKED_CREDENTIALS",
    "EXPOSED_API_KEY",
    "EXPOSED_SECRET",
    "LINKED_URL_INTERNAL",
    "LINKED_URL_EXTERNAL",
    "FORM_NAME",
];

/// Leak types raised as alerts
const CRITICAL_LEAK_TYPES: &[&str] = &["EMAIL_ADDRESS", "LEAKED_CREDENTIALS", "EXPOSED_API_KEY", "EXPOSED_SECRET"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Infrastructure,
    CloudStorage,
    WebApplication,
    LeaksRisks,
    Other,
}

impl EntityCategory {
    pub fn of(entity_type: &str) -> Self {
        let entity_type = entity_type.to_uppercase();
        let entity_type = entity_type.as_str();
        if INFRASTRUCTURE_TYPES.contains(&entity_type) {
            EntityCategory::Infrastructure
        } else if CLOUD_STORAGE_TYPES.contains(&entity_type) {
            EntityCategory::CloudStorage
        } else if WEB_APPLICATION_TYPES.contains(&entity_type) {
            EntityCategory::WebApplication
        } else if LEAKS_RISKS_TYPES.contains(&entity_type) {
            EntityCategory::LeaksRisks
        } else {
            EntityCategory::Other
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub category: EntityCategory,
    pub message: String,
    pub entity: Entity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategorizedEntities {
    pub infrastructure: Vec<Entity>,
    pub cloud_storage: Vec<Entity>,
    pub web_applications: Vec<Entity>,
    pub leaks_risks: Vec<Entity>,
    pub other: Vec<Entity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SurfaceStatistics {
    pub total_entities: usize,
    pub unique_subdomains: usize,
    pub unique_ips: usize,
    pub unique_emails: usize,
    pub open_buckets: usize,
    pub critical_findings: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubdomainAsset {
    pub subdomain: String,
    pub technologies: Vec<String>,
}

/// Categorised view of an external surface scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessedSurface {
    pub categorized: CategorizedEntities,
    pub assets: BTreeMap<String, SubdomainAsset>,
    pub statistics: SurfaceStatistics,
    pub alerts: Vec<Alert>,
}

impl ProcessedSurface {
    /// Alerts as uniform findings
    pub fn findings(&self, target: &str) -> Vec<Finding> {
        self.alerts
            .iter()
            .map(|alert| {
                let kind = match alert.category {
                    EntityCategory::CloudStorage => FindingKind::ExposedService,
                    _ => FindingKind::LeakedSecret,
                };
                Finding::new(kind, Severity::Critical, "spiderfoot", target, alert.message.clone()).with_detail(json!({
                    "type": alert.entity.entity_type,
                    "value": alert.entity.value,
                    "module": alert.entity.module,
                }))
            })
            .collect()
    }
}

/// `LEAKED_CREDENTIALS` becomes `Leaked Credentials`
fn title_case(entity_type: &str) -> String {
    entity_type
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn alert_for(category: EntityCategory, entity: &Entity) -> Option<Alert> {
    let entity_type = entity.entity_type.to_uppercase();
    let message = match category {
        EntityCategory::CloudStorage if entity_type == "CLOUD_STORAGE_BUCKET_OPEN" => {
            format!("Open cloud storage bucket found: {}", entity.value)
        }
        EntityCategory::LeaksRisks if CRITICAL_LEAK_TYPES.contains(&entity_type.as_str()) => {
            format!("{} found: {}", title_case(&entity_type), entity.value)
        }
        _ => return None,
    };
    Some(Alert { category, message, entity: entity.clone() })
}

/// Sort entities into categories, raise alerts, count and group them
pub fn process_entities(entities: &[Entity]) -> ProcessedSurface {
    let mut processed = ProcessedSurface::default();
    let mut subdomains = BTreeSet::new();
    let mut ips = BTreeSet::new();
    let mut emails = BTreeSet::new();
    let mut open_buckets = 0usize;

    for entity in entities {
        let category = EntityCategory::of(&entity.entity_type);
        let bucket = match category {
            EntityCategory::Infrastructure => &mut processed.categorized.infrastructure,
            EntityCategory::CloudStorage => &mut processed.categorized.cloud_storage,
            EntityCategory::WebApplication => &mut processed.categorized.web_applications,
            EntityCategory::LeaksRisks => &mut processed.categorized.leaks_risks,
            EntityCategory::Other => &mut processed.categorized.other,
        };
        bucket.push(entity.clone());

        if let Some(alert) = alert_for(category, entity) {
            processed.alerts.push(alert);
        }

        match entity.entity_type.to_uppercase().as_str() {
            "INTERNET_NAME" => {
                subdomains.insert(entity.value.clone());
                processed
                    .assets
                    .entry(entity.value.clone())
                    .or_insert_with(|| SubdomainAsset {
                        subdomain: entity.value.clone(),
                        technologies: Vec::new(),
                    });
            }
            "IP_ADDRESS" => {
                ips.insert(entity.value.clone());
            }
            "EMAIL_ADDRESS" => {
                emails.insert(entity.value.clone());
            }
            "CLOUD_STORAGE_BUCKET_OPEN" => open_buckets += 1,
            _ => {}
        }
    }

    // Without relationship data, technologies attach by substring match
    for entity in entities {
        let entity_type = entity.entity_type.to_uppercase();
        if entity_type != "SOFTWARE_USED" && entity_type != "TECHNOLOGY" {
            continue;
        }
        for (subdomain, asset) in processed.assets.iter_mut() {
            let related = subdomain.contains(&entity.value) || entity.value.contains(subdomain.as_str());
            if related && !asset.technologies.contains(&entity.value) {
                asset.technologies.push(entity.value.clone());
            }
        }
    }

    processed.statistics = SurfaceStatistics {
        total_entities: entities.len(),
        unique_subdomains: subdomains.len(),
        unique_ips: ips.len(),
        unique_emails: emails.len(),
        open_buckets,
        critical_findings: processed.alerts.len(),
    };
    processed
}
