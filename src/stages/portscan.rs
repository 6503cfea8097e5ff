// src/stages/portscan.rs
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::core::{Deadline, PortState, ScanIntensity, ServiceRecord, ToolOutcome};
use crate::utils::shell::{args, CommandRunner};

const AGGRESSIVE_PORTS: &[u16] = &[
    21, 22, 25, 53, 80, 110, 143, 443, 993, 995, 1723, 3306, 3389, 5432, 5900, 6379, 8080, 9200, 27017,
];
const INTENSIVE_PORTS: &[u16] = &[
    21, 22, 25, 53, 80, 110, 143, 443, 993, 995, 1723, 3306, 3389, 5432, 5900, 8080,
];
const COMMON_PORTS: &[u16] = &[
    21, 22, 25, 53, 80, 110, 143, 443, 993, 995, 3306, 3389, 5432, 8080,
];

/// Version string attached to services seen only by a TCP connect
pub const SOCKET_FALLBACK_VERSION: &str = "unknown (socket fallback - unverified)";

/// Port specification handed to masscan
pub fn masscan_port_spec(intensity: ScanIntensity, port_range: Option<&str>) -> String {
    if let Some(range) = port_range.map(str::trim).filter(|r| !r.is_empty()) {
        return range.to_string();
    }
    match intensity {
        ScanIntensity::Aggressive => "1-65535".to_string(),
        ScanIntensity::Intensive => "1-10000".to_string(),
        _ => "1-1000".to_string(),
    }
}

/// Packets per second for masscan
pub fn masscan_rate(intensity: ScanIntensity) -> u32 {
    match intensity {
        ScanIntensity::Aggressive => 5000,
        ScanIntensity::Intensive => 2000,
        ScanIntensity::Light => 500,
        ScanIntensity::Normal => 1000,
    }
}

/// Fixed candidate ports used when no sweep result is available
pub fn candidate_ports(intensity: ScanIntensity, port_range: Option<&str>) -> Vec<u16> {
    let mut ports: Vec<u16> = match port_range.map(str::trim).filter(|r| !r.is_empty()) {
        Some(range) if range.contains(',') => range
            .split(',')
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .collect(),
        // Ranges are too wide to connect-probe; use the common list
        Some(range) if range.contains('-') => COMMON_PORTS.to_vec(),
        Some(range) => range.parse::<u16>().map(|p| vec![p]).unwrap_or_default(),
        None => match intensity {
            ScanIntensity::Aggressive => AGGRESSIVE_PORTS.to_vec(),
            ScanIntensity::Intensive => INTENSIVE_PORTS.to_vec(),
            _ => COMMON_PORTS.to_vec(),
        },
    };

    if ports.is_empty() {
        ports = vec![80, 443];
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Well-known service name for a port
pub fn service_name(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        993 => "imaps",
        995 => "pop3s",
        1723 => "pptp",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        5432 => "postgresql",
        5900 => "vnc",
        6379 => "redis",
        8080 => "http-proxy",
        9200 => "elasticsearch",
        27017 => "mongodb",
        _ => "unknown",
    }
}

#[derive(Debug, Deserialize)]
struct MasscanRecord {
    #[serde(default)]
    ports: Vec<MasscanPort>,
}

#[derive(Debug, Deserialize)]
struct MasscanPort {
    port: u16,
}

/// Parse masscan `-oJ` output. Each record sits on its own line, usually with a trailing comma.
pub fn parse_masscan_output(text: &str) -> Vec<u16> {
    let mut ports = BTreeSet::new();
    for line in text.lines().map(str::trim) {
        if !line.starts_with('{') {
            continue;
        }
        let line = line.trim_end_matches(',');
        match serde_json::from_str::<MasscanRecord>(line) {
            Ok(record) => ports.extend(record.ports.into_iter().map(|p| p.port)),
            Err(e) => debug!("Skipping masscan line: {}", e),
        }
    }
    ports.into_iter().collect()
}

/// Fast port sweep with masscan. Availability is probed once per instance.
pub struct MasscanSweep {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
    available: OnceCell<bool>,
}

impl MasscanSweep {
    pub fn new(runner: Arc<dyn CommandRunner>, program: &str, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.to_string(),
            timeout,
            available: OnceCell::new(),
        }
    }

    pub async fn is_available(&self) -> bool {
        *self.available
            .get_or_init(|| async move {
                let available = self.runner.is_available(&self.program).await;
                if available {
                    info!("masscan is available; using it for port discovery");
                } else {
                    info!("masscan not available; falling back to fixed port lists");
                }
                available
            })
            .await
    }

    /// Sweep one address for open ports
    pub async fn sweep(
        &self,
        ip: IpAddr,
        intensity: ScanIntensity,
        port_range: Option<&str>,
        deadline: &Deadline,
    ) -> ToolOutcome<Vec<u16>> {
        if !self.is_available().await {
            return ToolOutcome::Unavailable(format!("{} not available", self.program));
        }

        let output_file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => return ToolOutcome::Failed(format!("failed to create temporary file: {}", e)),
        };
        let output_path = output_file.path().to_string_lossy().into_owned();

        let command_args = args([
            ip.to_string(),
            format!("-p{}", masscan_port_spec(intensity, port_range)),
            format!("--rate={}", masscan_rate(intensity)),
            "-oJ".to_string(),
            output_path.clone(),
        ]);

        let outcome = self.runner
            .run(&self.program, &command_args, deadline.cap(self.timeout))
            .await;

        match outcome {
            ToolOutcome::Success(output) if !output.success() => {
                ToolOutcome::Failed(format!("masscan exited with {:?}: {}", output.status, output.stderr.trim()))
            }
            ToolOutcome::Success(_) => {
                let text = tokio::fs::read_to_string(&output_path).await.unwrap_or_default();
                let ports = parse_masscan_output(&text);
                debug!("masscan found {} open ports on {}", ports.len(), ip);
                ToolOutcome::Success(ports)
            }
            ToolOutcome::TimedOut { .. } => {
                let text = tokio::fs::read_to_string(&output_path).await.unwrap_or_default();
                ToolOutcome::TimedOut { partial: Some(parse_masscan_output(&text)) }
            }
            ToolOutcome::Unavailable(reason) => ToolOutcome::Unavailable(reason),
            ToolOutcome::Failed(reason) => ToolOutcome::Failed(reason),
        }
    }
}

/// TCP connect probe used when nmap cannot run. On CDN addresses only web ports are tried,
/// since the edge accepts connections on ports the origin never exposes.
pub async fn socket_probe(
    hostname: &str,
    ip: IpAddr,
    ports: &[u16],
    connect_timeout: Duration,
    on_cdn: bool,
    web_ports: &[u16],
) -> Vec<ServiceRecord> {
    let mut records = Vec::new();

    for &port in ports {
        if on_cdn && !web_ports.contains(&port) {
            debug!("Skipping non-web port {} on CDN address {}", port, ip);
            continue;
        }

        let address = SocketAddr::new(ip, port);
        match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {
                records.push(ServiceRecord {
                    hostname: hostname.to_string(),
                    ip,
                    port,
                    protocol: "tcp".to_string(),
                    name: service_name(port).to_string(),
                    version: Some(SOCKET_FALLBACK_VERSION.to_string()),
                    state: PortState::Open,
                });
            }
            Ok(Err(e)) => debug!("{}:{} refused: {}", ip, port, e),
            Err(_) => debug!("{}:{} connect timed out", ip, port),
        }
    }

    if !records.is_empty() {
        warn!("Socket fallback found {} unverified open ports on {}", records.len(), ip);
    }
    records
}
