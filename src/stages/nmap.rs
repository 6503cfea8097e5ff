// src/stages/nmap.rs
use std::collections::HashMap;
use std::net::IpAddr;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::{PortState, ServiceRecord};

static HOST_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<host[\s>].*?</host>").expect("valid host regex"));
static PORT_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<port\s([^>]*)>(.*?)</port>").expect("valid port regex"));
static ADDRESS_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<address\s([^>]*)/?>").expect("valid address regex"));
static STATE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<state\s([^>]*)/?>").expect("valid state regex"));
static SERVICE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<service\s([^>]*)/?>").expect("valid service regex"));
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"([\w:-]+)="([^"]*)""#).expect("valid attribute regex"));

/// A port entry from nmap's XML report
#[derive(Debug, Clone, PartialEq)]
pub struct NmapPort {
    pub port: u16,
    pub protocol: String,
    pub state: PortState,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub method: Option<String>,
}

impl NmapPort {
    /// "product version", or nothing when nmap did not fingerprint the service
    pub fn version_info(&self) -> Option<String> {
        let joined = [self.product.as_deref(), self.version.as_deref()]
            .iter()
            .flatten()
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        let joined = joined.trim();
        if joined.is_empty() {
            None
        } else {
            Some(joined.to_string())
        }
    }
}

/// A host entry from nmap's XML report
#[derive(Debug, Clone, PartialEq)]
pub struct NmapHost {
    pub address: Option<IpAddr>,
    pub ports: Vec<NmapPort>,
}

/// Arguments for a service-version scan writing XML to `output_path`
pub fn nmap_args(ip: IpAddr, ports: &[u16], output_path: &str) -> Vec<String> {
    let port_list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
    vec![
        "-sV".to_string(),
        "--version-intensity".to_string(),
        "5".to_string(),
        "--max-retries".to_string(),
        "1".to_string(),
        "-T4".to_string(),
        "-p".to_string(),
        port_list,
        ip.to_string(),
        "-oX".to_string(),
        output_path.to_string(),
    ]
}

fn attributes(raw: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), unescape(&c[2])))
        .collect()
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}

/// Parse an nmap XML report. Unparseable ports are skipped rather than failing the report.
pub fn parse_nmap_xml(xml: &str) -> Vec<NmapHost> {
    let mut hosts = Vec::new();

    for host_match in HOST_BLOCK.find_iter(xml) {
        let block = host_match.as_str();

        let address = ADDRESS_TAG
            .captures_iter(block)
            .map(|c| attributes(&c[1]))
            .filter(|attrs| attrs.get("addrtype").map(|t| t != "mac").unwrap_or(true))
            .find_map(|attrs| attrs.get("addr").and_then(|a| a.parse::<IpAddr>().ok()));

        let mut ports = Vec::new();
        for port_caps in PORT_BLOCK.captures_iter(block) {
            let port_attrs = attributes(&port_caps[1]);
            let port = match port_attrs.get("portid").and_then(|p| p.parse::<u16>().ok()) {
                Some(port) => port,
                None => continue,
            };
            let body = &port_caps[2];

            let state = STATE_TAG
                .captures(body)
                .map(|c| attributes(&c[1]))
                .and_then(|attrs| attrs.get("state").map(|s| PortState::parse(s)))
                .unwrap_or(PortState::Unknown);

            let service = SERVICE_TAG.captures(body).map(|c| attributes(&c[1])).unwrap_or_default();

            ports.push(NmapPort {
                port,
                protocol: port_attrs.get("protocol").cloned().unwrap_or_else(|| "tcp".to_string()),
                state,
                service: non_empty(service.get("name")),
                product: non_empty(service.get("product")),
                version: non_empty(service.get("version")),
                method: non_empty(service.get("method")),
            });
        }

        hosts.push(NmapHost { address, ports });
    }

    hosts
}

/// Convert a parsed port into a record
pub fn to_record(hostname: &str, ip: IpAddr, port: &NmapPort) -> ServiceRecord {
    ServiceRecord {
        hostname: hostname.to_string(),
        ip,
        port: port.port,
        protocol: port.protocol.clone(),
        name: port.service.clone().unwrap_or_else(|| "unknown".to_string()),
        version: port.version_info(),
        state: port.state,
    }
}

/// Whether a scanned port becomes a `ServiceRecord`.
///
/// `open` is always kept. `open|filtered` is kept unless the address is a CDN edge,
/// the port is not a web port, and nothing identified the service; CDN edges answer
/// on every port, so such a result says nothing about the target. Anything else is dropped.
pub fn should_emit(record: &ServiceRecord, on_cdn: bool, web_ports: &[u16]) -> bool {
    match record.state {
        PortState::Open => true,
        PortState::OpenFiltered => {
            !(on_cdn && !web_ports.contains(&record.port) && !record.has_service_evidence())
        }
        _ => false,
    }
}
