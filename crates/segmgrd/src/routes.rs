//! Static routes inside node containers

use std::net::Ipv4Addr;

use netsim_common::shell::{render, ExecResult};
use tracing::{debug, info, instrument, warn};

use crate::address::Subnet;
use crate::commands::{
    build_default_route_add_cmd, build_default_route_del_cmd, build_route_add_cmd,
    build_route_del_cmd, is_missing_route,
};
use crate::conflict;
use crate::error::{SegMgrError, SegMgrResult};
use crate::provider::ProviderError;
use crate::seg_mgr::SegMgr;
use crate::types::{Node, Outcome, Route, RouteStatus};

/// Why a command run inside a node did not succeed
fn exec_failure(result: &ExecResult) -> String {
    let output = result.combined_output();
    if output.is_empty() {
        format!("exit code {}", result.exit_code)
    } else {
        output
    }
}

impl SegMgr {
    /// Runs a command inside a node container
    async fn exec_in_node(&self, node_id: &str, args: &[String]) -> Result<ExecResult, ProviderError> {
        debug!("{}: {}", node_id, render(args));
        self.provider.exec_in_container(node_id, args).await
    }

    /// Removes the kernel route to `destination`; absence counts as success
    async fn remove_kernel_route(&self, node_id: &str, destination: &Subnet) -> Result<(), String> {
        let result = self
            .exec_in_node(node_id, &build_route_del_cmd(destination))
            .await
            .map_err(|e| e.to_string())?;
        if result.success() || is_missing_route(&result.stderr) {
            Ok(())
        } else {
            Err(exec_failure(&result))
        }
    }

    /// Replaces the kernel route for `route.destination`
    async fn install_route(&self, node_id: &str, route: &Route) -> Result<(), String> {
        if let Err(e) = self.remove_kernel_route(node_id, &route.destination).await {
            debug!("Ignoring failed removal of {} on {}: {}", route.destination, node_id, e);
        }
        let result = self
            .exec_in_node(node_id, &build_route_add_cmd(&route.destination, route.next_hop))
            .await
            .map_err(|e| e.to_string())?;
        if result.success() {
            Ok(())
        } else {
            Err(exec_failure(&result))
        }
    }

    /// Points the default route of a node at `gateway`
    pub(crate) async fn install_default_route(
        &self,
        node_id: &str,
        gateway: Ipv4Addr,
    ) -> Result<(), String> {
        match self.exec_in_node(node_id, &build_default_route_del_cmd()).await {
            Ok(result) if !result.success() => {
                debug!("No default route to remove on {}", node_id)
            }
            Ok(_) => {}
            Err(e) => warn!("Could not remove default route on {}: {}", node_id, e),
        }

        let result = self
            .exec_in_node(node_id, &build_default_route_add_cmd(gateway))
            .await
            .map_err(|e| e.to_string())?;
        if result.success() {
            info!("Default route on {} via {}", node_id, gateway);
            Ok(())
        } else {
            Err(exec_failure(&result))
        }
    }

    /// Validates `route` against the node's interfaces
    fn check_route(node: &Node, route: &Route) -> SegMgrResult<()> {
        conflict::check_route(route, node.interfaces.values()).map_err(|source| {
            SegMgrError::RouteRejected {
                node: node.id.clone(),
                source,
            }
        })
    }

    /// Saves, then installs the route; a failed save becomes a note
    async fn commit_route(&self, node_id: &str, route: &Route, verb: &str) -> SegMgrResult<Outcome> {
        let mut notes = Vec::new();
        if let Err(e) = self.persist().await {
            warn!("Failed to save state: {}", e);
            notes.push(format!("state not saved: {}", e));
        }

        self.install_route(node_id, route)
            .await
            .map_err(|message| SegMgrError::RouteApplyFailed {
                node: node_id.to_string(),
                destination: route.destination.to_string(),
                message,
            })?;
        info!(
            "{} route {} via {} on {}",
            verb, route.destination, route.next_hop, node_id
        );

        Ok(Outcome::with_notes(
            format!(
                "{} route {} via {} on {}",
                verb, route.destination, route.next_hop, node_id
            ),
            notes,
        ))
    }

    /// Adds a static route, or replaces the one with the same destination
    #[instrument(skip(self, route), fields(destination = %route.destination, next_hop = %route.next_hop))]
    pub async fn configure_route(&self, node_id: &str, route: Route) -> SegMgrResult<Outcome> {
        let _gate = self.gate.read().await;
        let _node_guard = self.node_locks.lock(&node_id.to_string()).await;

        let mut node = self.node_record(node_id)?;
        Self::check_route(&node, &route)?;

        let route = Route {
            status: RouteStatus::Active,
            ..route
        };
        match node.route_index(&route.destination) {
            Some(index) => node.routes[index] = route.clone(),
            None => node.routes.push(route.clone()),
        }
        self.store_node(node);

        self.commit_route(node_id, &route, "Configured").await
    }

    /// Replaces the route to `old_destination` in place
    #[instrument(skip(self, route), fields(destination = %route.destination, next_hop = %route.next_hop))]
    pub async fn edit_route(
        &self,
        node_id: &str,
        old_destination: Subnet,
        route: Route,
    ) -> SegMgrResult<Outcome> {
        let _gate = self.gate.read().await;
        let _node_guard = self.node_locks.lock(&node_id.to_string()).await;

        let mut node = self.existing_node(node_id)?;
        let index = node
            .route_index(&old_destination)
            .ok_or_else(|| SegMgrError::UnknownRoute {
                node: node_id.to_string(),
                destination: old_destination.to_string(),
            })?;
        Self::check_route(&node, &route)?;

        let route = Route {
            status: RouteStatus::Active,
            ..route
        };
        node.routes[index] = route.clone();
        let mut position = 0;
        node.routes.retain(|r| {
            let keep = position == index || r.destination != route.destination;
            position += 1;
            keep
        });
        self.store_node(node);

        if old_destination != route.destination {
            if let Err(e) = self.remove_kernel_route(node_id, &old_destination).await {
                warn!("Old route {} left on {}: {}", old_destination, node_id, e);
            }
        }
        self.commit_route(node_id, &route, "Edited").await
    }

    /// Drops a static route from the node config and the kernel
    #[instrument(skip(self))]
    pub async fn delete_route(&self, node_id: &str, destination: Subnet) -> SegMgrResult<Outcome> {
        let _gate = self.gate.read().await;
        let _node_guard = self.node_locks.lock(&node_id.to_string()).await;

        let mut node = self.existing_node(node_id)?;
        let index = node
            .route_index(&destination)
            .ok_or_else(|| SegMgrError::UnknownRoute {
                node: node_id.to_string(),
                destination: destination.to_string(),
            })?;
        let removed = node.routes.remove(index);
        self.store_node(node);

        let mut notes = Vec::new();
        if let Err(e) = self.persist().await {
            warn!("Failed to save state: {}", e);
            notes.push(format!("state not saved: {}", e));
        }

        self.remove_kernel_route(node_id, &destination)
            .await
            .map_err(|message| SegMgrError::RouteRemoveFailed {
                node: node_id.to_string(),
                destination: destination.to_string(),
                message,
            })?;
        info!("Removed route {} via {} on {}", destination, removed.next_hop, node_id);

        Ok(Outcome::with_notes(
            format!("Removed route {} on {}", destination, node_id),
            notes,
        ))
    }

    /// Reinstalls the default route and every active route of a node
    ///
    /// Stale routes are skipped. Each failure is reported in the outcome.
    #[instrument(skip(self))]
    pub async fn reapply_routes(&self, node_id: &str) -> SegMgrResult<Outcome> {
        let _gate = self.gate.read().await;
        let _node_guard = self.node_locks.lock(&node_id.to_string()).await;

        let node = self.existing_node(node_id)?;
        let mut notes = Vec::new();
        let mut applied = 0;

        if node.kind.installs_default_route() {
            for gateway in node.interfaces.values().filter_map(|i| i.gateway) {
                match self.install_default_route(node_id, gateway).await {
                    Ok(()) => applied += 1,
                    Err(e) => notes.push(format!("default route via {} not installed: {}", gateway, e)),
                }
            }
        }

        for route in node.routes.iter().filter(|r| r.is_active()) {
            match self.install_route(node_id, route).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!("Route {} not reapplied on {}: {}", route.destination, node_id, e);
                    notes.push(format!("route {} not applied: {}", route.destination, e));
                }
            }
        }

        let stale = node.routes.iter().filter(|r| !r.is_active()).count();
        let mut message = format!("Reapplied {} route(s) on {}", applied, node_id);
        if stale > 0 {
            message.push_str(&format!(", skipped {} stale", stale));
        }
        if applied == 0 && notes.is_empty() {
            return Ok(Outcome::unchanged(format!("No routes to reapply on {}", node_id)));
        }
        Ok(Outcome::with_notes(message, notes))
    }
}
