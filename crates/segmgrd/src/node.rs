//! Node containers and in-node diagnostics

use std::net::Ipv4Addr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::commands::build_ping_cmd;
use crate::error::{SegMgrError, SegMgrResult};
use crate::provider::{ContainerSpec, ProviderError};
use crate::seg_mgr::SegMgr;
use crate::tables::NODE_PORT_STRIDE;
use crate::types::{Node, NodeKind, Outcome};

static PING_SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received").expect("Invalid regex pattern")
});

impl ContainerSpec {
    /// Launch parameters for the `index`-th node of `kind`
    pub fn for_node(kind: NodeKind, index: u32) -> Self {
        let container_port = kind.container_port();
        let offset = u16::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(NODE_PORT_STRIDE))
            .unwrap_or(u16::MAX - container_port);
        Self {
            name: Node::container_name(kind, index),
            image: kind.as_str().to_string(),
            host_port: container_port.saturating_add(offset),
            container_port,
            kind,
        }
    }
}

/// Result of a ping run inside a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingReport {
    pub node: String,
    pub target: Ipv4Addr,
    pub transmitted: u32,
    pub received: u32,
    pub success: bool,

    /// Raw command output
    pub output: String,
}

impl PingReport {
    /// Builds a report from `ping` output
    pub fn parse(node: &str, target: Ipv4Addr, exit_code: i32, output: &str) -> Self {
        let (transmitted, received) = PING_SUMMARY_RE
            .captures(output)
            .and_then(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
            .unwrap_or((0, 0));
        Self {
            node: node.to_string(),
            target,
            transmitted,
            received,
            success: exit_code == 0 && received > 0,
            output: output.to_string(),
        }
    }
}

impl SegMgr {
    /// Starts the container for the `index`-th node of `kind`
    ///
    /// The node image is built first when missing. A container that already
    /// exists is reported as unchanged.
    #[instrument(skip(self))]
    pub async fn launch_node(&self, kind: NodeKind, index: u32) -> SegMgrResult<Outcome> {
        let spec = ContainerSpec::for_node(kind, index);
        let _node_guard = self.node_locks.lock(&spec.name).await;

        let built = self.ensure_image(&spec.image).await?;
        let outcome = match self.provider.run_container(&spec).await {
            Ok(()) => {
                info!("Launched {} on host port {}", spec.name, spec.host_port);
                let mut message = format!(
                    "Started {} {} on port {}",
                    kind, spec.name, spec.host_port
                );
                if built {
                    message.push_str(&format!(" (built image {})", spec.image));
                }
                Outcome::applied(message)
            }
            Err(e) if e.is_already_exists() => {
                warn!("Container {} already exists", spec.name);
                return Ok(Outcome::unchanged(format!("{} is already running", spec.name)));
            }
            Err(e) => return Err(SegMgrError::provider("launch node", e)),
        };

        let added = self.ensure_node(&spec.name, kind);
        if added {
            if let Err(e) = self.persist().await {
                return Ok(Outcome::partial(format!("{}; state not saved: {}", outcome, e)));
            }
        }
        Ok(outcome)
    }

    /// Builds `image` from its context directory unless it exists; true if built
    async fn ensure_image(&self, image: &str) -> SegMgrResult<bool> {
        let exists = self
            .provider
            .image_exists(image)
            .await
            .map_err(|e| SegMgrError::provider("query image", e))?;
        if exists {
            return Ok(false);
        }

        let context = self.options.image_context.join(image);
        info!("Image {} missing, building from {}", image, context.display());
        self.provider
            .build_image(image, &context)
            .await
            .map_err(|e| SegMgrError::provider("build image", e))?;
        Ok(true)
    }

    /// Stops a node container; configuration is kept
    #[instrument(skip(self))]
    pub async fn stop_node(&self, node: &str) -> SegMgrResult<Outcome> {
        let _node_guard = self.node_locks.lock(&node.to_string()).await;
        match self.provider.stop_container(node).await {
            Ok(()) => Ok(Outcome::applied(format!("Stopped {}", node))),
            Err(e) if e.is_not_found() => Ok(Outcome::unchanged(format!("{} is not running", node))),
            Err(e) => Err(SegMgrError::provider("stop node", e)),
        }
    }

    /// Pings `target` from inside `node`
    #[instrument(skip(self))]
    pub async fn ping(&self, node: &str, target: Ipv4Addr) -> SegMgrResult<PingReport> {
        let args = build_ping_cmd(target, self.options.ping_count);
        let result = tokio::time::timeout(
            self.options.ping_timeout,
            self.provider.exec_in_container(node, &args),
        )
        .await
        .map_err(|_| {
            SegMgrError::provider(
                "ping",
                ProviderError::Timeout {
                    command: args.join(" "),
                    timeout: self.options.ping_timeout,
                },
            )
        })?
        .map_err(|e| SegMgrError::provider("ping", e))?;

        let report = PingReport::parse(node, target, result.exit_code, &result.combined_output());
        info!(
            "Ping {} -> {}: {}/{} received",
            node, target, report.received, report.transmitted
        );
        Ok(report)
    }
}
