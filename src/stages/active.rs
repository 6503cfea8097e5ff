// src/stages/active.rs
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{CdnRanges, Deadline, ScanRequest, ServiceRecord, StageOutcome, SubdomainSet, ToolOutcome};
use crate::error::SurfaceResult;
use crate::utils::shell::CommandRunner;

use super::nmap::{nmap_args, parse_nmap_xml, should_emit, to_record};
use super::portscan::{candidate_ports, socket_probe, MasscanSweep};

/// One address to scan and the hostnames that resolve to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTarget {
    pub ip: IpAddr,
    pub hostnames: Vec<String>,
}

impl ActiveTarget {
    pub fn new(ip: IpAddr, hostname: &str) -> Self {
        Self {
            ip,
            hostnames: vec![hostname.to_string()],
        }
    }

    pub fn primary_hostname(&self) -> String {
        self.hostnames.first().cloned().unwrap_or_else(|| self.ip.to_string())
    }
}

/// Result of scanning one address
#[derive(Debug, Clone, Default)]
pub struct HostScan {
    pub services: Vec<ServiceRecord>,
    pub tools_used: Vec<String>,
}

/// What the active stage produced
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveReport {
    pub services: Vec<ServiceRecord>,
    pub hosts_scanned: usize,
    pub hosts_skipped: usize,
    pub tools_used: BTreeSet<String>,
}

/// Scans a single address
#[async_trait]
pub trait HostScanner: Send + Sync {
    async fn scan_host(&self, target: &ActiveTarget, request: &ScanRequest, deadline: &Deadline) -> HostScan;
}

/// masscan sweep, nmap service detection and a socket fallback, filtered for CDN noise
pub struct ServiceScanner {
    runner: Arc<dyn CommandRunner>,
    masscan: Option<MasscanSweep>,
    nmap_program: String,
    nmap_timeout: Duration,
    socket_timeout: Duration,
    cdn: CdnRanges,
    web_ports: Vec<u16>,
}

impl ServiceScanner {
    /// Create a scanner from configuration
    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> SurfaceResult<Self> {
        let masscan = if config.active.use_masscan {
            Some(MasscanSweep::new(
                runner.clone(),
                &config.tools.masscan,
                Duration::from_secs(config.tools.masscan_timeout_secs),
            ))
        } else {
            None
        };

        Ok(Self {
            runner,
            masscan,
            nmap_program: config.tools.nmap.clone(),
            nmap_timeout: Duration::from_secs(config.tools.nmap_timeout_secs),
            socket_timeout: Duration::from_secs(config.active.socket_timeout_secs),
            cdn: CdnRanges::from_strings(&config.active.cdn_ranges)?,
            web_ports: config.active.web_ports.clone(),
        })
    }

    async fn discover_ports(&self, target: &ActiveTarget, request: &ScanRequest, deadline: &Deadline, tools: &mut Vec<String>) -> Vec<u16> {
        let port_range = request.port_range.as_deref();

        if let Some(masscan) = &self.masscan {
            match masscan.sweep(target.ip, request.scan_intensity, port_range, deadline).await {
                ToolOutcome::Success(ports) if !ports.is_empty() => {
                    tools.push("masscan".to_string());
                    return ports;
                }
                ToolOutcome::TimedOut { partial: Some(ports) } if !ports.is_empty() => {
                    tools.push("masscan".to_string());
                    return ports;
                }
                ToolOutcome::Unavailable(_) => {}
                outcome => debug!("masscan gave nothing usable for {}: {}", target.ip, outcome),
            }
        }

        candidate_ports(request.scan_intensity, port_range)
    }

    async fn run_nmap(&self, target: &ActiveTarget, ports: &[u16], deadline: &Deadline) -> ToolOutcome<Vec<ServiceRecord>> {
        let output_file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => return ToolOutcome::Failed(format!("failed to create temporary file: {}", e)),
        };
        let output_path = output_file.path().to_string_lossy().into_owned();

        let outcome = self.runner
            .run(&self.nmap_program, &nmap_args(target.ip, ports, &output_path), deadline.cap(self.nmap_timeout))
            .await;

        match outcome {
            ToolOutcome::Success(output) if !output.success() => {
                ToolOutcome::Failed(format!("nmap exited with {:?}: {}", output.status, output.stderr.trim()))
            }
            ToolOutcome::Success(_) => {
                let xml = tokio::fs::read_to_string(&output_path).await.unwrap_or_default();
                ToolOutcome::Success(self.records_from_xml(target, &xml))
            }
            ToolOutcome::TimedOut { .. } => {
                let xml = tokio::fs::read_to_string(&output_path).await.unwrap_or_default();
                ToolOutcome::TimedOut { partial: Some(self.records_from_xml(target, &xml)) }
            }
            ToolOutcome::Unavailable(reason) => ToolOutcome::Unavailable(reason),
            ToolOutcome::Failed(reason) => ToolOutcome::Failed(reason),
        }
    }

    fn records_from_xml(&self, target: &ActiveTarget, xml: &str) -> Vec<ServiceRecord> {
        let hostname = target.primary_hostname();
        parse_nmap_xml(xml)
            .into_iter()
            .flat_map(|host| {
                let ip = host.address.unwrap_or(target.ip);
                host.ports
                    .into_iter()
                    .map(|port| to_record(&hostname, ip, &port))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[async_trait]
impl HostScanner for ServiceScanner {
    async fn scan_host(&self, target: &ActiveTarget, request: &ScanRequest, deadline: &Deadline) -> HostScan {
        let mut scan = HostScan::default();
        let on_cdn = self.cdn.contains(&target.ip);
        if on_cdn {
            debug!("{} is a CDN edge address", target.ip);
        }

        // Port discovery
        let ports = self.discover_ports(target, request, deadline, &mut scan.tools_used).await;
        if deadline.is_expired() {
            warn!("Deadline reached after port discovery on {}", target.ip);
            return scan;
        }

        // Service detection
        let records = match self.run_nmap(target, &ports, deadline).await {
            ToolOutcome::Success(records) => {
                scan.tools_used.push("nmap".to_string());
                records
            }
            ToolOutcome::TimedOut { partial } => {
                scan.tools_used.push("nmap".to_string());
                partial.unwrap_or_default()
            }
            outcome => {
                info!("nmap unusable for {} ({}); falling back to socket probe", target.ip, outcome);
                if deadline.is_expired() {
                    return scan;
                }
                scan.tools_used.push("socket".to_string());
                socket_probe(
                    &target.primary_hostname(),
                    target.ip,
                    &ports,
                    self.socket_timeout,
                    on_cdn,
                    &self.web_ports,
                )
                .await
            }
        };

        let total = records.len();
        scan.services = records
            .into_iter()
            .filter(|record| should_emit(record, on_cdn, &self.web_ports))
            .collect();
        if scan.services.len() < total {
            debug!("Dropped {} unconfirmed ports on {}", total - scan.services.len(), target.ip);
        }

        scan
    }
}

/// Runs a host scanner over many addresses with bounded parallelism
pub struct ActiveStage {
    scanner: Arc<dyn HostScanner>,
}

impl ActiveStage {
    pub fn new(scanner: Arc<dyn HostScanner>) -> Self {
        Self { scanner }
    }

    /// Scan every target. Each host checks the deadline before it starts; hosts
    /// that never start are counted as skipped and the outcome is partial.
    pub async fn run(&self, targets: Vec<ActiveTarget>, request: &ScanRequest, deadline: &Deadline) -> StageOutcome<ActiveReport> {
        info!("Starting active scan of {} hosts with {} workers", targets.len(), request.max_threads.max(1));

        let semaphore = Arc::new(Semaphore::new(request.max_threads.max(1)));
        let request = Arc::new(request.clone());
        let deadline = *deadline;
        let total = targets.len();
        let mut tasks = JoinSet::new();
        let mut started = 0usize;

        for target in targets {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker pool closed: {}", e);
                    break;
                }
            };
            if deadline.is_expired() {
                warn!("Deadline reached; not starting remaining {} hosts", total - started);
                break;
            }

            started += 1;
            let scanner = self.scanner.clone();
            let request = request.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let scan = scanner.scan_host(&target, &request, &deadline).await;
                (target, scan)
            });
        }

        let mut report = ActiveReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, scan)) => {
                    report.hosts_scanned += 1;
                    report.tools_used.extend(scan.tools_used);
                    for record in scan.services {
                        // Every hostname sharing the address shares its services
                        for hostname in &target.hostnames {
                            let mut record = record.clone();
                            record.hostname = hostname.clone();
                            report.services.push(record);
                        }
                    }
                }
                Err(e) => error!("Host scan task failed: {}", e),
            }
        }

        report.hosts_skipped = total - started;
        report.services.sort_by(|a, b| (&a.hostname, a.port).cmp(&(&b.hostname, b.port)));
        report.services.dedup();

        info!(
            "Active scan finished: {} services on {} hosts ({} skipped)",
            report.services.len(),
            report.hosts_scanned,
            report.hosts_skipped
        );

        if report.hosts_skipped > 0 {
            let reason = format!("deadline reached with {} of {} hosts not scanned", report.hosts_skipped, total);
            StageOutcome::Partial { value: report, reason }
        } else {
            StageOutcome::Complete(report)
        }
    }
}

/// Resolve discovered hostnames to scan targets, grouping hostnames that share an address
pub async fn resolve_targets(subdomains: &SubdomainSet, lookup_timeout: Duration, deadline: &Deadline) -> Vec<ActiveTarget> {
    let known = subdomains.ip_map();
    let mut lookups = JoinSet::new();
    let mut by_ip: BTreeMap<IpAddr, Vec<String>> = BTreeMap::new();

    for host in subdomains.hosts() {
        match known.get(host).and_then(|ips| ips.first()) {
            Some(ip) => by_ip.entry(*ip).or_default().push(host.clone()),
            None => {
                let host = host.clone();
                let timeout = deadline.cap(lookup_timeout);
                lookups.spawn(async move {
                    let resolved = tokio::time::timeout(timeout, tokio::net::lookup_host(format!("{}:0", host))).await;
                    match resolved {
                        Ok(Ok(mut addrs)) => addrs.next().map(|addr| (host, addr.ip())),
                        _ => None,
                    }
                });
            }
        }
    }

    while let Some(joined) = lookups.join_next().await {
        if let Ok(Some((host, ip))) = joined {
            by_ip.entry(ip).or_default().push(host);
        }
    }

    by_ip
        .into_iter()
        .map(|(ip, mut hostnames)| {
            hostnames.sort();
            hostnames.dedup();
            ActiveTarget { ip, hostnames }
        })
        .collect()
}

/// Targets for a bare address or a CIDR block, capped at `max_hosts`
pub fn network_targets(network: &IpNetwork, max_hosts: usize) -> Vec<ActiveTarget> {
    let hosts: Vec<IpAddr> = match network {
        IpNetwork::V4(net) if net.prefix() < 31 => net
            .iter()
            .filter(|ip| *ip != net.network() && *ip != net.broadcast())
            .map(IpAddr::V4)
            .take(max_hosts)
            .collect(),
        _ => network.iter().take(max_hosts).collect(),
    };

    hosts
        .into_iter()
        .map(|ip| ActiveTarget::new(ip, &ip.to_string()))
        .collect()
}
