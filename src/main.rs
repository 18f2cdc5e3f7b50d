//! fleetgate command-line entry point.
//!
//! Operator surface for the credential and broker-supervision core: issue and
//! revoke device credentials, seed the broker registry, evaluate ACL
//! decisions, probe the active broker and run the supervisory loop.

use clap::{Parser, Subcommand};
use fleetgate::config::GatewayConfig;
use fleetgate::device::DeviceIdentity;
use fleetgate::health::{run_probe_supervisor, HealthAggregator};
use fleetgate::logging::init_default_logging;
use fleetgate::topics::resolve_namespace;
use fleetgate::{
    probe, AccessType, BrokerRegistry, CredentialStore, Db, DeviceDirectory, GatewayError,
    TopicAuthorizer,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Device credential and broker supervision core for energy-community telemetry fleets
#[derive(Parser)]
#[command(name = "fleetgate")]
#[command(about = "Device credential issuance, topic authorization and broker supervision")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ./fleetgate.toml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the broker registry from the [broker] section of the config
    InitBroker,
    /// Register or update a device identity from explicit field=value pairs
    AddDevice {
        /// Fields: device_id=... [pod_code=...] [vendor=...] [topic_template=...]
        /// [legacy_pod_topics=true|false] [is_active=true|false]
        #[arg(required = true, value_parser = parse_key_val)]
        fields: Vec<(String, String)>,
    },
    /// Record a device heartbeat, updating its last-seen timestamp
    Heartbeat { device_id: String },
    /// Issue (or rotate) credentials for a device and print them once
    IssueCreds {
        device_id: String,
        /// Also print a Mosquitto ACL example for the device's namespace
        #[arg(long)]
        acl: bool,
    },
    /// Revoke the active credential for a device
    RevokeCreds { device_id: String },
    /// Evaluate a topic access decision the way the broker callback would
    CheckAcl {
        username: String,
        topic: String,
        #[arg(long, default_value = "publish")]
        access: String,
    },
    /// Probe the active broker once and print the verdict
    Probe {
        /// Override the configured probe timeout, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the aggregated health report
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Run the supervisory probe loop until interrupted
    Watch,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command, config).await {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(GatewayConfig::load_from_file(path)?)
        }
        None => {
            let default_path = Path::new("fleetgate.toml");
            if default_path.exists() {
                Ok(GatewayConfig::load_from_file(default_path)?)
            } else {
                Ok(GatewayConfig::default())
            }
        }
    }
}

async fn run_command(
    command: Commands,
    config: GatewayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Db::open(&config.storage.path)?;
    let devices = DeviceDirectory::new(db.clone());
    let credentials = CredentialStore::new(db.clone(), config.credentials.secret_length);
    let registry = BrokerRegistry::new(db);

    match command {
        Commands::InitBroker => {
            let section = config
                .broker
                .as_ref()
                .ok_or("no [broker] section in configuration")?;
            let broker = section.to_broker_config();
            registry.set_active(&broker)?;
            println!(
                "Active broker set to {}:{} (TLS={})",
                broker.host, broker.port, broker.use_tls
            );
        }
        Commands::AddDevice { fields } => {
            let fields: HashMap<String, String> = fields.into_iter().collect();
            let device = DeviceIdentity::from_fields(&fields)?;
            devices.upsert(&device)?;
            println!("Device '{}' registered", device.device_id);
        }
        Commands::Heartbeat { device_id } => {
            devices.record_heartbeat(&device_id, chrono::Utc::now())?;
            println!("Heartbeat recorded for '{device_id}'");
        }
        Commands::IssueCreds { device_id, acl } => {
            let issued = credentials.issue(&device_id)?;
            println!("Credentials issued");
            println!("  Device ID: {device_id}");
            println!("  Username:  {}", issued.username);
            println!("  Secret:    {}", issued.secret);
            println!("  Timestamp: {}", chrono::Utc::now().to_rfc3339());

            if acl {
                match devices.get(&device_id)?.map(|d| resolve_namespace(&d)) {
                    Some(Ok(base)) => {
                        println!();
                        println!("Mosquitto ACL example (read own namespace, write own status):");
                        println!("  topic read {base}/#");
                        println!("  topic write {base}/status/#");
                    }
                    Some(Err(e)) => {
                        println!();
                        println!("No ACL example: {e}");
                    }
                    None => {
                        println!();
                        println!("No ACL example: device not found in directory");
                    }
                }
            }
        }
        Commands::RevokeCreds { device_id } => {
            credentials.revoke(&device_id)?;
            println!("Credential for '{device_id}' revoked");
        }
        Commands::CheckAcl {
            username,
            topic,
            access,
        } => {
            let access = AccessType::parse(&access)
                .ok_or_else(|| format!("unknown access type '{access}', expected subscribe|publish"))?;
            let authorizer = TopicAuthorizer::new(credentials, devices);
            let decision = authorizer.authorize(&username, &topic, access);
            println!("{decision:?}");
        }
        Commands::Probe { timeout_secs } => {
            let broker = registry.get_active()?.ok_or(GatewayError::NoActiveBroker)?;
            let timeout =
                Duration::from_secs(timeout_secs.unwrap_or(config.probe.timeout_secs));
            let verdict = probe(&broker, timeout).await;
            println!("Broker {}:{}", broker.host, broker.port);
            println!("  Reachable: {}", verdict.success);
            println!("  Latency:   {} ms", verdict.latency_ms);
            if let Some(cause) = &verdict.error {
                println!("  Cause:     {cause}");
            }
        }
        Commands::Status { json } => {
            let aggregator = HealthAggregator::new(
                registry.clone(),
                devices,
                config.health.activity_window_secs,
            );
            // A CLI invocation has no supervisor feeding verdicts in, so take
            // one live sample first when a broker is configured
            if let Some(broker) = registry.get_active()? {
                let verdict = probe(&broker, Duration::from_secs(config.probe.timeout_secs)).await;
                aggregator.record_verdict(verdict);
            }
            let report = aggregator.current_health();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Status: {:?}", report.status);
                println!(
                    "Devices active in window: {}",
                    report.recent_device_activity_count
                );
                println!(
                    "Consecutive probe failures: {}",
                    report.consecutive_probe_failures
                );
                match &report.last_verdict {
                    Some(v) if v.success => {
                        println!("Last probe: ok ({} ms)", v.latency_ms)
                    }
                    Some(v) => println!(
                        "Last probe: failed ({})",
                        v.error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown".to_string())
                    ),
                    None => println!("Last probe: never attempted"),
                }
            }
        }
        Commands::Watch => {
            let aggregator = Arc::new(HealthAggregator::new(
                registry,
                devices,
                config.health.activity_window_secs,
            ));
            let interval = Duration::from_secs(config.probe.interval_secs);
            let timeout = Duration::from_secs(config.probe.timeout_secs);

            tokio::select! {
                _ = run_probe_supervisor(aggregator, interval, timeout) => {}
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
            }
        }
    }

    Ok(())
}
