//! Array Management CLI
//!
//! Runs management-plane operations against a block-storage array (and its
//! replication target) over SSH, or against an in-memory simulated pair of
//! arrays with `--simulate`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use array_mgmt_client::{
    ArrayAssistant, ArrayCommand, ArrayConfig, AssistantConfig, ChannelStatsSnapshot, DriverConfig,
    RcRelState, ReplicationManager, ReplicationTargetConfig, ReplicationType, SessionConnectorRef, SimulatedFabric,
    SimulatorConfig, SshConnector, VolumeRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Management client for SSH-driven block-storage arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "ARRAY_MGMT_CONFIG")]
    config: Option<PathBuf>,

    /// Run against an in-memory pair of simulated arrays
    #[arg(long, env = "ARRAY_MGMT_SIMULATE")]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print channel counters in Prometheus text format when done
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the identity of the local array
    System,
    /// Run an inquiry (lsvdisk, lshost, lslcmap, ...) and print the records
    Query {
        verb: String,
        object: Option<String>,
    },
    /// Establish the partnership with the replication target
    Partnership,
    /// Take a point-in-time snapshot of a vdisk
    Snapshot { source: String, name: String },
    /// Fail volumes over to the replication target
    Failover {
        backend_id: String,
        /// Volume as name[:sync|async]; without a mode it is not replicated
        #[arg(long = "volume", value_parser = parse_volume)]
        volumes: Vec<VolumeRef>,
    },
    /// Fail volumes back to the local array
    Failback {
        /// Backend the volumes currently run on
        #[arg(long)]
        active_backend_id: String,
        #[arg(long = "volume", value_parser = parse_volume)]
        volumes: Vec<VolumeRef>,
    },
}

fn parse_volume(raw: &str) -> std::result::Result<VolumeRef, String> {
    let (name, mode) = match raw.split_once(':') {
        Some((name, mode)) => (name, Some(mode)),
        None => (raw, None),
    };
    if name.is_empty() {
        return Err("volume name is empty".into());
    }
    let volume = VolumeRef::new(name, "available");
    match mode {
        None => Ok(volume),
        Some("sync") => Ok(volume.replicated(ReplicationType::Sync)),
        Some("async") => Ok(volume.replicated(ReplicationType::Async)),
        Some(other) => Err(format!("unknown replication mode '{}'", other)),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Array management client {}", array_mgmt_client::VERSION);

    let (config, connector) = if args.simulate {
        simulated_setup()
    } else {
        let path = args
            .config
            .as_ref()
            .context("--config is required unless --simulate is given")?;
        let config = DriverConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        let channel = &config.array.channel;
        let connector: SessionConnectorRef = Arc::new(SshConnector::new(
            channel.host_key_fingerprints.clone(),
            channel.command_timeout(),
        ));
        (config, connector)
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling pending waits");
                cancel.cancel();
            }
        });
    }

    // A failback resumes a manager that is already failed over
    let active_backend = match &args.command {
        Command::Failback {
            active_backend_id, ..
        } => Some(active_backend_id.clone()),
        _ => None,
    };
    let manager = match config.replication {
        Some(_) => Some(
            ReplicationManager::from_config(&config, Arc::clone(&connector))?.with_active_backend(active_backend),
        ),
        None => None,
    };
    let local = match &manager {
        Some(manager) => Arc::clone(manager.local()),
        None => Arc::new(ArrayAssistant::connect(
            &config.array,
            Arc::clone(&connector),
            config.assistant.clone(),
        )),
    };

    if args.simulate {
        if let Some(manager) = &manager {
            seed_simulation(manager, &cancel).await?;
        }
    }

    let require_manager = || manager.as_ref().context("no replication target configured");

    match args.command {
        Command::System => print_json(&local.system_info().await?)?,
        Command::Query { verb, object } => {
            let command = inquiry(&verb, object)?;
            print_json(&local.run_inquiry(&command).await?)?;
        }
        Command::Partnership => {
            require_manager()?.establish_partnership().await?;
            print_json(&local.list_partnerships().await?)?;
        }
        Command::Snapshot { source, name } => {
            let id = local.create_snapshot(&source, &name, &cancel).await?;
            print_json(&local.get_lcmap(&id).await?)?;
        }
        Command::Failover { backend_id, volumes } => {
            print_json(&require_manager()?.failover(&backend_id, &volumes).await?)?;
        }
        Command::Failback { volumes, .. } => {
            print_json(&require_manager()?.failback(&volumes, &cancel).await?)?;
        }
    }

    if args.print_metrics {
        let mut channels = vec![("local", local.channel().stats())];
        if let Some(manager) = &manager {
            channels.push(("target", manager.aux().channel().stats()));
        }
        print_metrics(&channels)?;
    }

    Ok(())
}

// =============================================================================
// Inquiries
// =============================================================================

fn inquiry(verb: &str, object: Option<String>) -> anyhow::Result<ArrayCommand> {
    let named = |kind: &str| object.clone().with_context(|| format!("{} needs a {} name", verb, kind));
    let command = match verb {
        "lssystem" => ArrayCommand::LsSystem,
        "lspartnership" => ArrayCommand::LsPartnership,
        "lsvdisk" => ArrayCommand::LsVdisk { name: named("vdisk")? },
        "lsvdisklcmappings" => ArrayCommand::LsVdiskLcMappings { vdisk: named("vdisk")? },
        "lsvdiskhostmap" => ArrayCommand::LsVdiskHostMap { vdisk: named("vdisk")? },
        "lshost" => ArrayCommand::LsHost { name: named("host")? },
        "lshostvdiskmap" => ArrayCommand::LsHostVdiskMap { host: named("host")? },
        "lslcmap" => ArrayCommand::LsLcMap { id: named("mapping")? },
        "lslcconsistgrp" => ArrayCommand::LsLcConsistGrp { name: named("group")? },
        "lsrcrelationship" => ArrayCommand::LsRcRelationship { name: named("relationship")? },
        other => bail!("'{}' is not a supported inquiry", other),
    };
    Ok(command)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Simulation
// =============================================================================

/// Two simulated arrays, `array-a` (local) and `array-b` (target)
fn simulated_setup() -> (DriverConfig, SessionConnectorRef) {
    let fabric = SimulatedFabric::new(SimulatorConfig::default());
    let local = fabric.add_array("array-a", "10.0.0.1");
    let target = fabric.add_array("array-b", "10.0.1.1");
    local.add_vdisk("vol-2", "pool0", 1);
    info!("Simulating {} and {}", local.system_id(), target.system_id());

    let assistant = AssistantConfig {
        lcmap_poll_interval_ms: 100,
        sync_poll_interval_ms: 100,
        ..AssistantConfig::default()
    };
    let config = DriverConfig {
        array: ArrayConfig::new(local.endpoint()),
        pool: "pool0".into(),
        assistant,
        replication: Some(ReplicationTargetConfig {
            backend_id: "array-b".into(),
            array: ArrayConfig::new(target.endpoint()),
            pool: "pool0".into(),
            link_bandwidth_mbits: 1000,
            background_copy_rate: 50,
        }),
    };
    (config, fabric.connector())
}

/// Partner the simulated arrays and replicate `vol-1` between them
async fn seed_simulation(manager: &ReplicationManager, cancel: &CancellationToken) -> anyhow::Result<()> {
    manager.establish_partnership().await?;
    let rel = manager
        .create_replicated_volume("vol-1", 1, ReplicationType::Sync)
        .await
        .context("seeding replicated volume vol-1")?;
    manager
        .local()
        .wait_for_relationship_state(&rel.name, RcRelState::ConsistentSynchronized, cancel)
        .await?;
    info!("Simulation seeded: vol-1 (replicated), vol-2");
    Ok(())
}

// =============================================================================
// Metrics
// =============================================================================

fn print_metrics(channels: &[(&str, ChannelStatsSnapshot)]) -> anyhow::Result<()> {
    use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

    let registry = Registry::new();
    let counter = |name: &str, help: &str| -> anyhow::Result<IntCounterVec> {
        let vec = IntCounterVec::new(Opts::new(name, help), &["array"])?;
        registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    };
    let commands = counter("array_channel_commands_total", "Commands sent to the array")?;
    let rejected = counter("array_channel_rejected_total", "Commands the array rejected")?;
    let transport = counter("array_channel_transport_errors_total", "Transport failures")?;
    let retries = counter("array_channel_retries_total", "Retry attempts")?;
    let switches = counter("array_channel_endpoint_switches_total", "Switches to the secondary endpoint")?;
    let sessions = counter("array_channel_sessions_opened_total", "Sessions opened")?;

    for &(array, stats) in channels {
        commands.with_label_values(&[array]).inc_by(stats.commands);
        rejected.with_label_values(&[array]).inc_by(stats.rejected);
        transport.with_label_values(&[array]).inc_by(stats.transport_errors);
        retries.with_label_values(&[array]).inc_by(stats.retries);
        switches.with_label_values(&[array]).inc_by(stats.endpoint_switches);
        sessions.with_label_values(&[array]).inc_by(stats.sessions_opened);
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    print!("{}", String::from_utf8(buffer)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["russh=warn", "russh_keys=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so command output stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
