//! segmgrd - segment manager for simulated network nodes
//!
//! One-shot CLI: each invocation restores the saved topology, applies one
//! request against the container runtime and saves the result.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use netsim_common::init_logging;
use netsim_segmgrd::{
    parse_destination, DockerProvider, InterfaceRequest, JsonStateStore, NodeKind, Outcome,
    OutcomeStatus, Route, SegMgr, SegMgrConfig, SegMgrOptions, DEFAULT_CONFIG_PATH,
};
use serde::Serialize;
use tracing::{debug, error};

/// Segment manager for simulated hosts and routers
#[derive(Parser, Debug)]
#[command(name = "segmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Configure or replace a node interface
    ConfigureInterface {
        node: String,

        /// Address as ip/prefix, ip/dotted-mask, or bare ip with --mask
        address: String,

        /// Dotted netmask for a bare address
        #[arg(short, long)]
        mask: Option<String>,

        /// Gateway (required for hosts)
        #[arg(short, long)]
        gateway: Option<String>,

        /// Interface name; defaults to the node kind's first interface
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Remove a node interface
    DeleteInterface { node: String, name: String },

    /// Add or replace a static route
    AddRoute {
        node: String,
        destination: String,
        next_hop: String,
    },

    /// Replace the route to OLD_DESTINATION
    EditRoute {
        node: String,
        old_destination: String,
        destination: String,
        next_hop: String,
    },

    /// Remove a static route
    DeleteRoute { node: String, destination: String },

    /// Reinstall the active routes of a node
    ReapplyRoutes { node: String },

    /// Rebuild the segment registry from the container runtime
    Reconcile,

    /// Start a node container
    Launch {
        /// host or router
        kind: NodeKind,
        index: u32,
    },

    /// Stop a node container
    Stop { node: String },

    /// Ping an address from inside a node
    Ping { node: String, target: Ipv4Addr },

    /// Print node records and segments as JSON
    Show {
        /// Only this node
        node: Option<String>,
    },
}

#[derive(Serialize)]
struct Topology {
    nodes: Vec<netsim_segmgrd::Node>,
    segments: Vec<netsim_segmgrd::Segment>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match SegMgrConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("segmgrd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, config.logging.json);
    debug!("Loaded configuration from {}", args.config.display());

    match run(args.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("segmgrd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: SegMgrConfig) -> anyhow::Result<ExitCode> {
    let provider = Arc::new(DockerProvider::new(
        config.provider.docker.clone(),
        config.provider_timeouts(),
    ));
    let store = Arc::new(JsonStateStore::new(config.state.path.clone()));
    let mgr = SegMgr::restore(provider, store, SegMgrOptions::from_config(&config))
        .await
        .with_context(|| format!("Failed to restore state from {}", config.state.path.display()))?;

    let outcome = match command {
        Command::ConfigureInterface {
            node,
            address,
            mask,
            gateway,
            name,
        } => {
            let mut request = match mask {
                Some(mask) => InterfaceRequest::with_mask(address, mask),
                None => InterfaceRequest::cidr(address),
            };
            if let Some(gateway) = gateway {
                request = request.gateway(gateway);
            }
            if let Some(name) = name {
                request = request.named(name);
            }
            mgr.configure_interface(&node, &request).await?
        }
        Command::DeleteInterface { node, name } => mgr.delete_interface(&node, &name).await?,
        Command::AddRoute {
            node,
            destination,
            next_hop,
        } => {
            let route = Route::parse(&destination, &next_hop)?;
            mgr.configure_route(&node, route).await?
        }
        Command::EditRoute {
            node,
            old_destination,
            destination,
            next_hop,
        } => {
            let old = parse_destination(&old_destination)?;
            let route = Route::parse(&destination, &next_hop)?;
            mgr.edit_route(&node, old, route).await?
        }
        Command::DeleteRoute { node, destination } => {
            let destination = parse_destination(&destination)?;
            mgr.delete_route(&node, destination).await?
        }
        Command::ReapplyRoutes { node } => mgr.reapply_routes(&node).await?,
        Command::Reconcile => {
            let report = mgr.reconcile_with_provider().await?;
            print_json(&report)?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Launch { kind, index } => mgr.launch_node(kind, index).await?,
        Command::Stop { node } => mgr.stop_node(&node).await?,
        Command::Ping { node, target } => {
            let report = mgr.ping(&node, target).await?;
            println!("{}", report.output.trim_end());
            return Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::Show { node } => {
            match node {
                Some(id) => {
                    let node = mgr
                        .node(&id)
                        .with_context(|| format!("Unknown node '{}'", id))?;
                    print_json(&node)?;
                }
                None => print_json(&Topology {
                    nodes: mgr.nodes(),
                    segments: mgr.registry_snapshot(),
                })?,
            }
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(report(&outcome))
}

fn report(outcome: &Outcome) -> ExitCode {
    println!("{}", outcome);
    match outcome.status {
        OutcomeStatus::Applied | OutcomeStatus::Unchanged => ExitCode::SUCCESS,
        OutcomeStatus::PartialSuccess => ExitCode::from(2),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
