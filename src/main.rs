// src/main.rs
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ipnetwork::IpNetwork;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use surfacewatch::config::Config;
use surfacewatch::context::Context;
use surfacewatch::core::{Deadline, ScanIntensity, ScanRequest, StageOutcome, SubdomainSet, TargetType, ToolOutcome};
use surfacewatch::leaks::LeakScanRequest;
use surfacewatch::stages::active::{network_targets, resolve_targets};
use surfacewatch::stages::ActiveTarget;
use surfacewatch::takedown::{abuse_report, summarize, takedown_request, BrandConfig, TakedownStatus, ThreatRepository};

#[derive(Parser)]
#[command(name = "surfacewatch")]
#[command(about = "Attack-surface discovery and monitoring")]
struct Args {
    #[command(subcommand)]
    command: Cli,

    #[arg(long, short, global = true, help = "Debug logging")]
    verbose: bool,

    #[arg(long, short, global = true, help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, short, global = true, help = "Write JSON results to this file instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Cli {
    /// Run the full passive, active, vulnerability and index pipeline
    Scan {
        #[arg(help = "Domain, IP, CIDR or ASN")]
        target: String,

        #[arg(long, help = "Overall time budget in seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "light, normal, intensive or aggressive")]
        intensity: Option<String>,

        #[arg(long, help = "Port range, e.g. 1-1000")]
        ports: Option<String>,

        #[arg(long, help = "Concurrent hosts during the active stage")]
        threads: Option<usize>,

        #[arg(long)]
        no_passive: bool,

        #[arg(long)]
        no_active: bool,

        #[arg(long)]
        no_vuln: bool,
    },

    /// Passive subdomain discovery only
    Passive {
        #[arg(help = "Root domain")]
        domain: String,

        #[arg(long, help = "Time budget in seconds")]
        timeout: Option<u64>,
    },

    /// Active service scan of a domain, IP or CIDR
    Active {
        target: String,

        #[arg(long)]
        ports: Option<String>,

        #[arg(long)]
        intensity: Option<String>,

        #[arg(long, help = "Time budget in seconds")]
        timeout: Option<u64>,
    },

    /// External surface scan through SpiderFoot
    External {
        target: String,

        #[arg(long, default_value = "mvp", help = "mvp, all, enrichment or passive")]
        scan_type: String,

        #[arg(long, help = "Maximum duration in seconds")]
        max_duration: Option<u64>,
    },

    /// Breach, exposed database and secret leak checks
    Leaks {
        #[arg(long)]
        domain: Option<String>,

        #[arg(long = "email")]
        emails: Vec<String>,

        #[arg(long)]
        org: Option<String>,

        #[arg(long = "repo")]
        repos: Vec<String>,

        #[arg(long, help = "Search Shodan for exposed databases")]
        databases: bool,

        #[arg(long = "path", help = "Local path to scan for secrets")]
        paths: Vec<String>,

        #[arg(long = "exclude-path")]
        exclude_paths: Vec<String>,

        #[arg(long, help = "Scan repositories and paths for secrets")]
        secrets: bool,

        #[arg(long, help = "Read a password from stdin and check it against Pwned Passwords")]
        password_stdin: bool,
    },

    /// Check candidate domains against a brand and store the threats found
    Typosquat {
        #[arg(long)]
        brand: String,

        #[arg(long = "official", help = "Official brand domain")]
        official: Vec<String>,

        #[arg(long = "keyword")]
        keywords: Vec<String>,

        #[arg(help = "Candidate domains")]
        domains: Vec<String>,

        #[arg(long, help = "Only print the generated typosquat patterns")]
        patterns: bool,
    },

    /// Manage stored threats
    Threats {
        #[command(subcommand)]
        command: ThreatsCli,
    },

    /// Initialize config
    Init {
        #[arg(short, long, help = "Force overwrite existing configuration")]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ThreatsCli {
    /// List stored threats
    List,

    /// Counts by status, type and platform
    Summary,

    /// Update the status of a threat
    Status {
        id: String,

        #[arg(help = "e.g. investigating, takedown_requested, false_positive")]
        status: String,
    },

    /// Print an abuse report and record a takedown request
    Report {
        id: String,

        #[arg(long, default_value = "abuse_report", help = "abuse_report, dmca, trademark or phishing")]
        request_type: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for results
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    if let Cli::Init { force } = args.command {
        let path = Config::init(args.config.as_deref(), force)?;
        println!("Configuration initialized at {}", path.display());
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;
    let mut context = Context::new(config).await?;
    info!("Application initialized successfully");

    let output = args.output.as_deref();
    match args.command {
        Cli::Scan { target, timeout, intensity, ports, threads, no_passive, no_active, no_vuln } => {
            let mut request = build_request(&context.config, &target, timeout, intensity.as_deref(), ports)?;
            if let Some(threads) = threads {
                request.max_threads = threads.max(1);
            }
            request.enable_passive = !no_passive;
            request.enable_active = !no_active;
            request.enable_vuln = !no_vuln;

            let result = context.orchestrator.run(&request).await;
            write_output(&result, output).await
        }
        Cli::Passive { domain, timeout } => {
            let secs = timeout.unwrap_or(context.config.scan.timeout_secs);
            let deadline = Deadline::new(Duration::from_secs(secs));
            info!("Passive sources: {}", context.passive.source_names().join(", "));
            let outcome = context.passive.run(&domain.trim().to_lowercase(), &deadline).await;
            write_output(&stage_json(outcome), output).await
        }
        Cli::Active { target, ports, intensity, timeout } => {
            let request = build_request(&context.config, &target, timeout, intensity.as_deref(), ports)?;
            let deadline = Deadline::new(request.timeout());
            let targets = active_targets(&context, &request, &deadline).await?;
            info!("Scanning {} host(s)", targets.len());
            let outcome = context.active.run(targets, &request, &deadline).await;
            write_output(&stage_json(outcome), output).await
        }
        Cli::External { target, scan_type, max_duration } => {
            let scan_id = uuid::Uuid::new_v4().to_string();
            let outcome = context
                .external
                .run(&scan_id, &target, &scan_type, max_duration.map(Duration::from_secs))
                .await;
            write_output(&stage_json(outcome), output).await
        }
        Cli::Leaks { domain, emails, org, repos, paths, exclude_paths, databases, secrets, password_stdin } => {
            let password = if password_stdin { Some(read_password().await?) } else { None };
            let request = LeakScanRequest {
                domain,
                emails,
                org,
                repo_urls: repos,
                paths,
                exclude_paths,
                include_db_scan: databases,
                include_secret_scan: secrets,
            };
            let mut report = context.leaks.comprehensive_scan(&request).await;
            if let Some(password) = password {
                match context.leaks.check_password(&password).await {
                    ToolOutcome::Success(check) => report.password_check = Some(check),
                    outcome => report.skipped.push(format!("pwned passwords: {}", outcome)),
                }
            }
            write_output(&report, output).await
        }
        Cli::Typosquat { brand, official, keywords, domains, patterns } => {
            let mut brand_keywords = keywords;
            if brand_keywords.is_empty() {
                brand_keywords.push(brand.to_lowercase().replace(' ', ""));
            }
            context.takedown.add_brand(BrandConfig::new(&brand, official, brand_keywords));

            if patterns {
                let patterns: Vec<String> = context
                    .takedown
                    .brands()
                    .flat_map(|b| b.typosquat_patterns.clone())
                    .collect();
                return write_output(&patterns, output).await;
            }

            let threats = context.takedown.scan_domains(&domains);
            for threat in &threats {
                context.threats.save(threat).await?;
            }
            write_output(&threats, output).await
        }
        Cli::Threats { command } => threats_command(&context, command, output).await,
        Cli::Init { .. } => Ok(()),
    }
}

async fn threats_command(context: &Context, command: ThreatsCli, output: Option<&Path>) -> Result<()> {
    let repo = context.threats.as_ref();
    match command {
        ThreatsCli::List => {
            let threats = repo.list().await?;
            write_output(&threats, output).await
        }
        ThreatsCli::Summary => {
            let threats = repo.list().await?;
            let requests = repo.list_requests().await?;
            write_output(&summarize(&threats, &requests), output).await
        }
        ThreatsCli::Status { id, status } => {
            let status: TakedownStatus = status.parse()?;
            let threat = repo.update_status(&id, status).await?;
            write_output(&threat, output).await
        }
        ThreatsCli::Report { id, request_type } => {
            let threat = repo
                .get(&id)
                .await?
                .with_context(|| format!("No threat with id {}", id))?;
            let request = takedown_request(&threat, &request_type);
            repo.save_request(&request).await?;
            repo.update_status(&id, TakedownStatus::TakedownRequested).await?;

            let report = json!({
                "request": request,
                "report": abuse_report(&threat),
            });
            write_output(&report, output).await
        }
    }
}

async fn read_password() -> Result<String> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("No password on stdin");
    }
    Ok(password.to_string())
}

fn build_request(config: &Config, target: &str, timeout: Option<u64>, intensity: Option<&str>, ports: Option<String>) -> Result<ScanRequest> {
    let mut request = ScanRequest::new(target);
    request.timeout_secs = timeout.unwrap_or(config.scan.timeout_secs);
    request.max_threads = config.scan.max_threads.max(1);
    request.scan_intensity = intensity.unwrap_or(config.scan.intensity.as_str()).parse::<ScanIntensity>()?;
    request.port_range = ports;
    Ok(request)
}

async fn active_targets(context: &Context, request: &ScanRequest, deadline: &Deadline) -> Result<Vec<ActiveTarget>> {
    let targets = match request.target_type {
        TargetType::Ip => {
            let ip: IpAddr = request.target.parse().context("Invalid IP address")?;
            vec![ActiveTarget::new(ip, &request.target)]
        }
        TargetType::Cidr => {
            let network: IpNetwork = request.target.parse().context("Invalid CIDR")?;
            network_targets(&network, context.config.scan.max_cidr_hosts)
        }
        TargetType::Domain => {
            let lookup_timeout = Duration::from_secs(context.config.passive.dns_timeout_secs.max(1));
            resolve_targets(&SubdomainSet::new(&request.target), lookup_timeout, deadline).await
        }
        TargetType::Asn => anyhow::bail!("Active scanning of an ASN is not supported"),
    };
    Ok(targets)
}

fn stage_json<T: Serialize>(outcome: StageOutcome<T>) -> serde_json::Value {
    let status = outcome.status();
    let message = outcome.message();
    json!({
        "status": status,
        "message": message,
        "result": outcome.into_value(),
    })
}

async fn write_output<T: Serialize + ?Sized>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write results to {}", path.display()))?;
            info!("Results written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
