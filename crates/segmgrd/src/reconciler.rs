//! Interface reconciliation
//!
//! Drives one interface change through
//! `Validated -> SegmentResolved -> OldDetached -> NewAttached ->
//! RouteReapplied -> Committed`. Every provider failure either is absorbed
//! as already-done or aborts the request, leaving the node fully on its old
//! segment or fully on its new one.

use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::address::Subnet;
use crate::conflict::{self, ConflictError};
use crate::error::{SegMgrError, SegMgrResult};
use crate::provider::{ProviderError, SegmentInfo, SegmentSummary};
use crate::seg_mgr::SegMgr;
use crate::types::{Interface, InterfaceRequest, Member, Outcome, Segment};

/// Completed step of an interface change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReconcileStep {
    Validated,
    SegmentResolved,
    OldDetached,
    NewAttached,
    RouteReapplied,
    Committed,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Live state of the segment a request targets
struct Resolved {
    name: String,
    info: SegmentInfo,

    /// Created by this request
    created: bool,
}

/// First listed segment whose subnet parses to `subnet`
fn carrier_of(listing: Vec<SegmentSummary>, subnet: &Subnet) -> Option<String> {
    listing
        .into_iter()
        .find(|s| {
            s.subnet
                .as_deref()
                .and_then(|raw| raw.parse::<Subnet>().ok())
                .is_some_and(|s| s == *subnet)
        })
        .map(|s| s.name)
}

fn segment_from_info(info: &SegmentInfo, subnet: Subnet) -> Segment {
    let mut segment = Segment::new(info.name.clone(), subnet);
    segment.members = info
        .members
        .iter()
        .map(|(node, ip)| Member::new(node.clone(), *ip))
        .collect();
    segment
}

impl SegMgr {
    /// Configures (or replaces) one interface of a node
    #[instrument(skip(self, request), fields(address = %request.address))]
    pub async fn configure_interface(
        &self,
        node_id: &str,
        request: &InterfaceRequest,
    ) -> SegMgrResult<Outcome> {
        let _gate = self.gate.read().await;
        let _node_guard = self.node_locks.lock(&node_id.to_string()).await;

        // Validated
        let mut node = self.node_record(node_id)?;
        let proposed = request.resolve(node.kind)?;
        {
            let registry = self.registry.read();
            conflict::check_interface(
                node_id,
                node.kind,
                &proposed,
                node.other_interfaces(&proposed.name),
                registry.find_segment_by_subnet(&proposed.subnet),
            )?;
        }
        let old = node.interfaces.get(&proposed.name).cloned();
        debug!("Validated {} {} as {}", node_id, proposed.name, proposed.cidr());

        if old.as_ref() == Some(&proposed) {
            if let Some(outcome) = self.confirm_unchanged(node_id, &proposed).await {
                return Ok(outcome);
            }
        }

        let mut lock_keys = vec![proposed.subnet];
        if let Some(old) = &old {
            lock_keys.push(old.subnet);
        }
        let _subnet_guards = self.subnet_locks.lock_many(&lock_keys).await;

        // SegmentResolved
        let resolved = self.resolve_segment(&proposed.subnet).await?;
        if let Some(holder) = resolved.info.holder_of(proposed.ip) {
            if holder != node_id {
                return Err(ConflictError::AddressInUse {
                    ip: proposed.ip,
                    segment: resolved.name.clone(),
                    holder: Some(holder.to_string()),
                }
                .into());
            }
        }

        let mut old_name = match &old {
            Some(old) => match self.locate_segment(&old.subnet).await {
                Ok(name) => Some(name),
                Err(e) => {
                    self.discard_created(&resolved, &proposed.subnet).await;
                    return Err(SegMgrError::provider("list segments", e));
                }
            },
            None => None,
        };
        let needs_detach = old
            .as_ref()
            .is_some_and(|o| o.subnet != proposed.subnet || o.ip != proposed.ip);
        let live_ip = resolved.info.address_of(node_id);

        if let Some(stale_ip) = live_ip.filter(|ip| *ip != proposed.ip) {
            let same_as_old = old_name.as_deref() == Some(resolved.name.as_str()) && needs_detach;
            if !same_as_old {
                warn!(
                    "{} holds stale address {} on {}, detaching",
                    node_id, stale_ip, resolved.name
                );
                if let Err(e) = self
                    .detach_tolerant(&resolved.name, &proposed.subnet, node_id)
                    .await
                {
                    return Err(SegMgrError::Aborted {
                        node: node_id.to_string(),
                        last_step: ReconcileStep::SegmentResolved,
                        restored_old: false,
                        attached_to: old_name.clone(),
                        source: Box::new(SegMgrError::provider("detach stale address", e)),
                    });
                }
            }
        }

        // OldDetached
        let mut last_step = ReconcileStep::SegmentResolved;
        let mut detached = false;
        if let (true, Some(old), Some(name)) = (needs_detach, &old, old_name.clone()) {
            match self.detach_tolerant(&name, &old.subnet, node_id).await {
                Ok(actual) => {
                    info!("Detached {} {} from {}", node_id, old.name, actual);
                    old_name = Some(actual);
                }
                Err(e) => {
                    self.discard_created(&resolved, &proposed.subnet).await;
                    return Err(SegMgrError::Aborted {
                        node: node_id.to_string(),
                        last_step,
                        restored_old: false,
                        attached_to: Some(name),
                        source: Box::new(SegMgrError::provider("detach old segment", e)),
                    });
                }
            }
            detached = true;
            last_step = ReconcileStep::OldDetached;
        }

        // NewAttached
        let detached_here = needs_detach && old_name.as_deref() == Some(resolved.name.as_str());
        let already_attached = live_ip == Some(proposed.ip) && !detached_here;
        if already_attached {
            debug!("{} already attached to {} as {}", node_id, resolved.name, proposed.ip);
        } else if let Err(e) = self.attach(&resolved.name, node_id, &proposed).await {
            let (restored_old, attached_to) = match (&old, &old_name) {
                (Some(old), Some(old_name)) if detached => {
                    let restored = self.restore_attachment(old_name, node_id, old).await;
                    (restored, restored.then(|| old_name.clone()))
                }
                (Some(_), Some(old_name)) => (false, Some(old_name.clone())),
                _ => (false, None),
            };
            self.discard_created(&resolved, &proposed.subnet).await;
            if let (false, Some(old), Some(old_name)) = (restored_old, &old, &old_name) {
                if detached {
                    self.registry.write().deregister_attachment(&old.subnet, node_id);
                    if let Some(note) = self.collect_segment(&old.subnet, old_name).await {
                        warn!("Old segment left behind: {}", note);
                    }
                    node.interfaces.remove(&old.name);
                    node.invalidate_unreachable_routes();
                    self.store_node(node);
                    if let Err(save) = self.persist().await {
                        warn!("Failed to save state: {}", save);
                    }
                }
            }
            return Err(SegMgrError::Aborted {
                node: node_id.to_string(),
                last_step,
                restored_old,
                attached_to,
                source: Box::new(e),
            });
        }
        let segment_name = resolved.name.clone();

        let mut notes = Vec::new();
        {
            let mut registry = self.registry.write();
            if let Some(old) = old.as_ref().filter(|_| detached) {
                registry.deregister_attachment(&old.subnet, node_id);
            }
            if registry.find_segment_by_subnet(&proposed.subnet).is_none() {
                registry.insert_segment(segment_from_info(&resolved.info, proposed.subnet));
            }
            registry.register_attachment(proposed.subnet, node_id, proposed.ip);
        }
        if let (true, Some(old), Some(old_name)) = (detached, &old, &old_name) {
            if old.subnet != proposed.subnet {
                if let Some(note) = self.collect_segment(&old.subnet, old_name).await {
                    notes.push(note);
                }
            }
        }

        node.interfaces.insert(proposed.name.clone(), proposed.clone());
        let stale = node.invalidate_unreachable_routes();
        let kind = node.kind;
        self.store_node(node);
        info!(
            "Attached {} {} to {} as {}",
            node_id,
            proposed.name,
            segment_name,
            proposed.cidr()
        );

        // RouteReapplied
        if let (true, Some(gateway)) = (kind.installs_default_route(), proposed.gateway) {
            if let Err(e) = self.install_default_route(node_id, gateway).await {
                warn!("Default route on {} not installed: {}", node_id, e);
                notes.push(format!("default route via {} not installed: {}", gateway, e));
            }
        }

        // Committed
        if let Err(e) = self.persist().await {
            warn!("Failed to save state: {}", e);
            notes.push(format!("state not saved: {}", e));
        }

        let mut message = format!(
            "Configured {} {} with {} on {}",
            node_id,
            proposed.name,
            proposed.cidr(),
            segment_name
        );
        if !stale.is_empty() {
            message.push_str(&format!(
                " ({} route(s) now stale: {})",
                stale.len(),
                stale
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        Ok(Outcome::with_notes(message, notes))
    }

    /// Removes one interface of a node and collects its segment if empty
    #[instrument(skip(self))]
    pub async fn delete_interface(&self, node_id: &str, name: &str) -> SegMgrResult<Outcome> {
        let _gate = self.gate.read().await;
        let _node_guard = self.node_locks.lock(&node_id.to_string()).await;

        let mut node = self.existing_node(node_id)?;
        let iface = node
            .interfaces
            .get(name)
            .cloned()
            .ok_or_else(|| SegMgrError::UnknownInterface {
                node: node_id.to_string(),
                interface: name.to_string(),
            })?;
        let _subnet_guard = self.subnet_locks.lock(&iface.subnet).await;

        let segment_name = self
            .locate_segment(&iface.subnet)
            .await
            .map_err(|e| SegMgrError::provider("list segments", e))?;
        let segment_name = self
            .detach_tolerant(&segment_name, &iface.subnet, node_id)
            .await
            .map_err(|e| SegMgrError::Aborted {
                node: node_id.to_string(),
                last_step: ReconcileStep::Validated,
                restored_old: false,
                attached_to: Some(segment_name.clone()),
                source: Box::new(SegMgrError::provider("detach segment", e)),
            })?;
        info!("Detached {} {} from {}", node_id, name, segment_name);

        let mut notes = Vec::new();
        self.registry
            .write()
            .deregister_attachment(&iface.subnet, node_id);
        if let Some(note) = self.collect_segment(&iface.subnet, &segment_name).await {
            notes.push(note);
        }

        node.interfaces.remove(name);
        let stale = node.invalidate_unreachable_routes();
        self.store_node(node);

        if let Err(e) = self.persist().await {
            warn!("Failed to save state: {}", e);
            notes.push(format!("state not saved: {}", e));
        }

        let mut message = format!("Removed {} {} from {}", node_id, name, segment_name);
        if !stale.is_empty() {
            message.push_str(&format!(" ({} route(s) now stale)", stale.len()));
        }
        Ok(Outcome::with_notes(message, notes))
    }

    /// Confirms an identical interface against live membership
    async fn confirm_unchanged(&self, node_id: &str, iface: &Interface) -> Option<Outcome> {
        let name = self
            .registry
            .read()
            .find_segment_by_subnet(&iface.subnet)
            .map(|s| s.name.clone())?;
        match self.provider.inspect_segment(&name).await {
            Ok(info) if info.address_of(node_id) == Some(iface.ip) => {
                debug!("{} {} unchanged on {}", node_id, iface.name, name);
                Some(Outcome::unchanged(format!(
                    "{} {} already configured with {} on {}",
                    node_id,
                    iface.name,
                    iface.cidr(),
                    name
                )))
            }
            Ok(_) => {
                warn!("{} recorded on {} but not attached, reapplying", node_id, name);
                None
            }
            Err(e) => {
                warn!("Could not confirm {} on {}: {}", node_id, name, e);
                None
            }
        }
    }

    /// Finds or creates the segment for `subnet` and inspects it live
    async fn resolve_segment(&self, subnet: &Subnet) -> SegMgrResult<Resolved> {
        let registered = self
            .registry
            .read()
            .find_segment_by_subnet(subnet)
            .map(|s| s.name.clone());

        if let Some(name) = registered {
            match self.provider.inspect_segment(&name).await {
                Ok(info) => {
                    return Ok(Resolved {
                        name,
                        info,
                        created: false,
                    })
                }
                Err(e) if e.is_not_found() => {
                    warn!("Registered segment {} is gone, resolving again", name);
                    self.registry.write().remove_segment(subnet);
                }
                Err(e) => return Err(SegMgrError::provider("inspect segment", e)),
            }
        }

        let listing = self
            .provider
            .list_segments()
            .await
            .map_err(|e| SegMgrError::provider("list segments", e))?;
        let (name, created) = match carrier_of(listing, subnet) {
            Some(name) => {
                debug!("Found unregistered segment {} for {}", name, subnet);
                (name, false)
            }
            None => {
                let name = subnet.segment_name();
                match self.provider.create_segment(&name, subnet).await {
                    Ok(()) => {
                        info!("Created segment {} for {}", name, subnet);
                        (name, true)
                    }
                    Err(e) if e.is_already_exists() => {
                        warn!("Segment {} already exists, reusing", name);
                        (name, false)
                    }
                    Err(e) => return Err(SegMgrError::provider("create segment", e)),
                }
            }
        };

        let info = self
            .provider
            .inspect_segment(&name)
            .await
            .map_err(|e| SegMgrError::provider("inspect segment", e))?;
        Ok(Resolved {
            name,
            info,
            created,
        })
    }

    /// Removes a segment this request created but never attached to
    async fn discard_created(&self, resolved: &Resolved, subnet: &Subnet) {
        if resolved.created {
            if let Some(note) = self.collect_segment(subnet, &resolved.name).await {
                warn!("Created segment left behind: {}", note);
            }
        }
    }

    /// Name of the segment carrying `subnet`
    ///
    /// Asks the provider when the registry has no record; the derived name
    /// is used only when no listed segment carries the subnet.
    async fn locate_segment(&self, subnet: &Subnet) -> Result<String, ProviderError> {
        let registered = self
            .registry
            .read()
            .find_segment_by_subnet(subnet)
            .map(|s| s.name.clone());
        if let Some(name) = registered {
            return Ok(name);
        }
        let listing = self.provider.list_segments().await?;
        Ok(carrier_of(listing, subnet).unwrap_or_else(|| {
            debug!("No segment carries {}", subnet);
            subnet.segment_name()
        }))
    }

    /// Disconnects from the segment carrying `subnet`
    ///
    /// "Not connected" counts as done. "Not found" counts as done only once
    /// the listing shows no other segment carrying `subnet`; otherwise the
    /// node is detached from that one. Returns the segment detached from.
    async fn detach_tolerant(
        &self,
        segment: &str,
        subnet: &Subnet,
        node_id: &str,
    ) -> Result<String, ProviderError> {
        let err = match self.provider.disconnect(segment, node_id).await {
            Ok(()) => return Ok(segment.to_string()),
            Err(e) if e.is_not_connected() => {
                warn!("{} was not attached to {}: {}", node_id, segment, e);
                return Ok(segment.to_string());
            }
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        match carrier_of(self.provider.list_segments().await?, subnet) {
            Some(actual) if actual != segment => {
                warn!("{} is gone, {} now carries {}", segment, actual, subnet);
                match self.provider.disconnect(&actual, node_id).await {
                    Ok(()) => Ok(actual),
                    Err(e) if e.is_not_connected() => {
                        warn!("{} was not attached to {}: {}", node_id, actual, e);
                        Ok(actual)
                    }
                    Err(e) => Err(e),
                }
            }
            _ => {
                warn!("{} was not attached to {}: {}", node_id, segment, err);
                Ok(segment.to_string())
            }
        }
    }

    /// Connects with the interface address
    async fn attach(&self, segment: &str, node_id: &str, iface: &Interface) -> SegMgrResult<()> {
        match self.provider.connect(segment, node_id, iface.ip).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                warn!("{} already attached to {}", node_id, segment);
                Ok(())
            }
            Err(ProviderError::AddressInUse { segment, ip }) => {
                Err(SegMgrError::Validation(ConflictError::AddressInUse {
                    ip,
                    segment,
                    holder: None,
                }))
            }
            Err(e) => Err(SegMgrError::provider("attach segment", e)),
        }
    }

    /// Best-effort reconnect of the previous attachment
    async fn restore_attachment(&self, segment: &str, node_id: &str, old: &Interface) -> bool {
        match self.provider.connect(segment, node_id, old.ip).await {
            Ok(()) => {
                info!("Restored {} on {} as {}", node_id, segment, old.ip);
                true
            }
            Err(e) if e.is_already_exists() => true,
            Err(e) => {
                warn!("Could not restore {} on {}: {}", node_id, segment, e);
                false
            }
        }
    }

    /// Deletes a segment once the provider reports it empty
    ///
    /// Returns a note when collection failed; never aborts the request.
    async fn collect_segment(&self, subnet: &Subnet, name: &str) -> Option<String> {
        if self.is_protected(name) {
            debug!("Segment {} is protected, keeping it", name);
            return None;
        }

        let info = match self.provider.inspect_segment(name).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                self.registry.write().remove_segment(subnet);
                return None;
            }
            Err(e) => {
                warn!("Could not inspect {} for collection: {}", name, e);
                return Some(format!("segment {} not collected: {}", name, e));
            }
        };
        if !info.members.is_empty() {
            debug!("Segment {} still has {} member(s)", name, info.members.len());
            return None;
        }

        match self.provider.delete_segment(name).await {
            Ok(()) => info!("Removed empty segment {}", name),
            Err(e) if e.is_not_found() => debug!("Segment {} already removed", name),
            Err(e) => {
                warn!("Could not remove segment {}: {}", name, e);
                return Some(format!("segment {} not removed: {}", name, e));
            }
        }
        self.registry.write().remove_segment(subnet);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FaultPoint, MockProvider, ProviderOp};
    use crate::registry::ConsistencyError;
    use crate::seg_mgr::SegMgrOptions;
    use crate::state::MemoryStateStore;
    use crate::types::{OutcomeStatus, Route, RouteStatus};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    struct Fixture {
        mock: Arc<MockProvider>,
        store: Arc<MemoryStateStore>,
        mgr: SegMgr,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let mgr = SegMgr::new(mock.clone(), store.clone(), SegMgrOptions::default());
        Fixture { mock, store, mgr }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn host_request(address: &str, gateway: &str) -> InterfaceRequest {
        InterfaceRequest::cidr(address).gateway(gateway)
    }

    #[tokio::test]
    async fn test_configure_host_creates_segment_and_default_route() {
        let f = fixture();
        let outcome = f
            .mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Applied);

        let segment = f.mock.segment("net_10_0_0_0_24").unwrap();
        assert_eq!(segment.members, vec![("host1".to_string(), ip("10.0.0.2"))]);
        assert_eq!(f.mock.routes("host1").get("default"), Some(&ip("10.0.0.1")));
        assert_eq!(
            f.mock.exec_commands("host1"),
            vec!["ip route del default", "ip route add default via 10.0.0.1"]
        );

        let node = f.mgr.node("host1").unwrap();
        assert_eq!(node.interfaces["eth0"].cidr(), "10.0.0.2/24");
        assert_eq!(f.store.saves(), 1);
    }

    #[tokio::test]
    async fn test_configure_twice_is_unchanged() {
        let f = fixture();
        let request = host_request("10.0.0.2/24", "10.0.0.1");
        f.mgr.configure_interface("host1", &request).await.unwrap();
        f.mock.clear_journal();

        let outcome = f.mgr.configure_interface("host1", &request).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Unchanged);
        assert!(f.mock.journal().iter().all(ProviderOp::is_read_only));
    }

    #[tokio::test]
    async fn test_validation_errors_make_no_provider_calls() {
        let f = fixture();
        let err = f
            .mgr
            .configure_interface("host2", &host_request("10.0.0.3/24", "10.0.1.1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.conflict(),
            Some(ConflictError::GatewayOutOfSubnet { .. })
        ));

        let err = f
            .mgr
            .configure_interface("host2", &InterfaceRequest::with_mask("10.0.0.3", "255.0.255.0"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(f.mock.journal().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_and_self_gateway_addresses_rejected() {
        let f = fixture();
        for (node, request) in [
            ("host1", host_request("10.0.0.0/24", "10.0.0.1")),
            ("host2", host_request("10.0.1.5/24", "10.0.1.5")),
            ("host3", host_request("10.0.2.255/24", "10.0.2.1")),
        ] {
            let err = f.mgr.configure_interface(node, &request).await.unwrap_err();
            assert!(err.is_validation(), "{} accepted: {}", node, err);
        }
        assert!(f.mock.journal().is_empty());
        assert!(f.mgr.registry_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ip_rejected_without_mutation() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mock.clear_journal();

        let err = f
            .mgr
            .configure_interface("host2", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.conflict(),
            Some(ConflictError::AddressInUse { holder: Some(h), .. }) if h == "host1"
        ));
        assert!(f.mock.journal().is_empty());
    }

    #[tokio::test]
    async fn test_live_holder_detected_when_registry_is_behind() {
        let f = fixture();
        f.mock.insert_segment("lab", Some("10.0.0.0/24"));
        f.mock.attach("lab", "host7", ip("10.0.0.2"));

        let err = f
            .mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.conflict(),
            Some(ConflictError::AddressInUse { holder: Some(h), segment, .. })
                if h == "host7" && segment == "lab"
        ));
        assert!(f.mock.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_replace_moves_segment_and_collects_old() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mgr
            .configure_interface("host1", &host_request("10.0.1.2/24", "10.0.1.1"))
            .await
            .unwrap();

        assert!(f.mock.segment("net_10_0_0_0_24").is_none());
        assert_eq!(
            f.mock.segment("net_10_0_1_0_24").unwrap().members,
            vec![("host1".to_string(), ip("10.0.1.2"))]
        );
        assert_eq!(f.mock.routes("host1").get("default"), Some(&ip("10.0.1.1")));
        assert_eq!(f.mgr.registry_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_ip_change_on_same_subnet_keeps_segment() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.9/24", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(
            f.mock.segment("net_10_0_0_0_24").unwrap().members,
            vec![("host1".to_string(), ip("10.0.0.9"))]
        );
        assert!(!f
            .mock
            .journal()
            .iter()
            .any(|op| matches!(op, ProviderOp::Delete { .. })));
    }

    #[tokio::test]
    async fn test_detach_failure_keeps_old_attachment() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mock.fail_next(
            FaultPoint::Disconnect,
            ProviderError::failed("docker network disconnect", "daemon busy"),
        );

        let err = f
            .mgr
            .configure_interface("host1", &host_request("10.0.1.2/24", "10.0.1.1"))
            .await
            .unwrap_err();
        match err {
            SegMgrError::Aborted {
                last_step,
                attached_to,
                restored_old,
                ..
            } => {
                assert_eq!(last_step, ReconcileStep::SegmentResolved);
                assert_eq!(attached_to.as_deref(), Some("net_10_0_0_0_24"));
                assert!(!restored_old);
            }
            other => panic!("Expected Aborted, got {:?}", other),
        }
        assert_eq!(
            f.mock.segment("net_10_0_0_0_24").unwrap().members,
            vec![("host1".to_string(), ip("10.0.0.2"))]
        );
        assert_eq!(
            f.mgr.node("host1").unwrap().interfaces["eth0"].ip,
            ip("10.0.0.2")
        );
    }

    #[tokio::test]
    async fn test_connect_failure_restores_old_attachment() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mock.fail_next(
            FaultPoint::Connect,
            ProviderError::failed("docker network connect", "endpoint create failed"),
        );

        let err = f
            .mgr
            .configure_interface("host1", &host_request("10.0.1.2/24", "10.0.1.1"))
            .await
            .unwrap_err();
        match &err {
            SegMgrError::Aborted {
                last_step,
                attached_to,
                restored_old,
                ..
            } => {
                assert_eq!(*last_step, ReconcileStep::OldDetached);
                assert_eq!(attached_to.as_deref(), Some("net_10_0_0_0_24"));
                assert!(restored_old);
            }
            other => panic!("Expected Aborted, got {:?}", other),
        }
        assert!(err.provider_error().is_some());
        assert_eq!(
            f.mock.segment("net_10_0_0_0_24").unwrap().members,
            vec![("host1".to_string(), ip("10.0.0.2"))]
        );
    }

    #[tokio::test]
    async fn test_detach_failure_discards_created_segment() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mock.fail_next(
            FaultPoint::Disconnect,
            ProviderError::failed("docker network disconnect", "daemon busy"),
        );
        assert!(f
            .mgr
            .configure_interface("host1", &host_request("10.0.1.2/24", "10.0.1.1"))
            .await
            .is_err());
        assert_eq!(f.mock.segment_names(), vec!["net_10_0_0_0_24"]);
    }

    #[tokio::test]
    async fn test_connect_and_restore_failure_clears_record() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mock.fail_next(
            FaultPoint::Connect,
            ProviderError::failed("docker network connect", "boom"),
        );
        f.mock.fail_next(
            FaultPoint::Connect,
            ProviderError::failed("docker network connect", "boom again"),
        );

        let err = f
            .mgr
            .configure_interface("host1", &host_request("10.0.1.2/24", "10.0.1.1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SegMgrError::Aborted {
                attached_to: None,
                restored_old: false,
                ..
            }
        ));
        assert!(f.mgr.node("host1").unwrap().interfaces.is_empty());
        assert!(f.mock.segment_names().is_empty());
        assert!(f.mgr.registry_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_same_subnet_restore_failure_collects_segment() {
        let f = fixture();
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mock.fail_next(
            FaultPoint::Connect,
            ProviderError::failed("docker network connect", "boom"),
        );
        f.mock.fail_next(
            FaultPoint::Connect,
            ProviderError::failed("docker network connect", "boom again"),
        );

        let err = f
            .mgr
            .configure_interface("host1", &host_request("10.0.0.3/24", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SegMgrError::Aborted {
                attached_to: None,
                ..
            }
        ));
        assert!(f.mgr.node("host1").unwrap().interfaces.is_empty());
        assert!(f.mock.segment_names().is_empty());
        assert!(f.mgr.registry_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_delete_after_inspect_failure_detaches_adopted_segment() {
        let f = fixture();
        f.mock.insert_segment("lab", Some("10.0.0.0/24"));
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(f.mgr.registry_snapshot()[0].name, "lab");

        f.mock.fail_next(FaultPoint::Inspect, ProviderError::parse("daemon busy"));
        let report = f.mgr.reconcile_with_provider().await.unwrap();
        assert!(report
            .problems
            .iter()
            .all(|p| !matches!(p, ConsistencyError::SegmentVanished { .. })));
        assert_eq!(f.mgr.registry_snapshot()[0].name, "lab");

        let outcome = f.mgr.delete_interface("host1", "eth0").await.unwrap();
        assert!(outcome.message.contains("lab"), "{}", outcome.message);
        assert!(f
            .mock
            .segment("lab")
            .map_or(true, |s| s.members.is_empty()));
        assert!(f.mgr.node("host1").unwrap().interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_old_segment_is_found_by_listing() {
        let f = fixture();
        f.mock.insert_segment("lab", Some("10.0.0.0/24"));
        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mgr
            .registry
            .write()
            .remove_segment(&"10.0.0.0/24".parse().unwrap());

        f.mgr
            .configure_interface("host1", &host_request("10.0.1.2/24", "10.0.1.1"))
            .await
            .unwrap();
        assert!(f
            .mock
            .segment("lab")
            .map_or(true, |s| s.members.is_empty()));
        assert_eq!(
            f.mock.segment("net_10_0_1_0_24").unwrap().members,
            vec![("host1".to_string(), ip("10.0.1.2"))]
        );
    }

    #[tokio::test]
    async fn test_delete_when_no_segment_carries_subnet() {
        let f = fixture();
        f.mgr
            .configure_interface("router1", &InterfaceRequest::cidr("10.0.0.254/24"))
            .await
            .unwrap();
        f.mock.remove_segment("net_10_0_0_0_24");

        let outcome = f.mgr.delete_interface("router1", "Ethernet0").await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Applied);
        assert!(f.mgr.node("router1").unwrap().interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_default_route_failure_is_partial() {
        let f = fixture();
        f.mock.reject_next_exec("RTNETLINK answers: No such process");
        f.mock
            .reject_next_exec("RTNETLINK answers: Operation not permitted");

        let outcome = f
            .mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        assert!(outcome.is_partial());
        assert!(outcome.message.contains("default route via 10.0.0.1"));
        assert!(f.mock.segment("net_10_0_0_0_24").is_some());
    }

    #[tokio::test]
    async fn test_save_failure_is_partial() {
        let f = fixture();
        f.store.set_fail_saves(true);
        let outcome = f
            .mgr
            .configure_interface("router1", &InterfaceRequest::cidr("10.0.0.254/24"))
            .await
            .unwrap();
        assert!(outcome.is_partial());
        assert!(f.mgr.node("router1").is_some());
    }

    #[tokio::test]
    async fn test_router_interface_has_no_default_route() {
        let f = fixture();
        f.mgr
            .configure_interface(
                "router1",
                &InterfaceRequest::cidr("10.0.0.254/24").gateway("10.0.0.1"),
            )
            .await
            .unwrap();
        assert!(f.mock.exec_commands("router1").is_empty());
    }

    #[tokio::test]
    async fn test_create_race_is_success() {
        let f = fixture();
        f.mock.fail_next(
            FaultPoint::Create,
            ProviderError::already_exists("Network net_10_0_0_0_24"),
        );

        let outcome = f
            .mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Applied);
        assert_eq!(f.mock.segment_names(), vec!["net_10_0_0_0_24"]);
    }

    #[tokio::test]
    async fn test_vanished_segment_is_recreated() {
        let f = fixture();
        f.mgr
            .configure_interface("router1", &InterfaceRequest::cidr("10.0.0.254/24"))
            .await
            .unwrap();
        f.mock.remove_segment("net_10_0_0_0_24");

        f.mgr
            .configure_interface("router1", &InterfaceRequest::cidr("10.0.0.253/24"))
            .await
            .unwrap();
        assert_eq!(
            f.mock.segment("net_10_0_0_0_24").unwrap().members,
            vec![("router1".to_string(), ip("10.0.0.253"))]
        );
    }

    #[tokio::test]
    async fn test_delete_interface_collects_segment_and_stales_routes() {
        let f = fixture();
        f.mgr
            .configure_interface("router1", &InterfaceRequest::cidr("10.0.0.254/24"))
            .await
            .unwrap();
        f.mgr
            .configure_route("router1", Route::parse("192.168.0.0/16", "10.0.0.1").unwrap())
            .await
            .unwrap();

        let outcome = f.mgr.delete_interface("router1", "Ethernet0").await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Applied);
        assert!(f.mock.segment("net_10_0_0_0_24").is_none());
        assert!(f.mgr.registry_snapshot().is_empty());

        let node = f.mgr.node("router1").unwrap();
        assert!(node.interfaces.is_empty());
        assert_eq!(node.routes[0].status, RouteStatus::Stale);
    }

    #[tokio::test]
    async fn test_delete_keeps_shared_and_protected_segments() {
        let f = fixture();
        f.mock.insert_segment("bridge", Some("172.17.0.0/16"));
        f.mgr
            .configure_interface("router1", &InterfaceRequest::cidr("172.17.0.10/16"))
            .await
            .unwrap();
        f.mgr.delete_interface("router1", "Ethernet0").await.unwrap();
        assert!(f.mock.segment("bridge").is_some());

        f.mgr
            .configure_interface("host1", &host_request("10.0.0.2/24", "10.0.0.1"))
            .await
            .unwrap();
        f.mgr
            .configure_interface("router1", &InterfaceRequest::cidr("10.0.0.1/24"))
            .await
            .unwrap();
        f.mgr.delete_interface("host1", "eth0").await.unwrap();
        assert_eq!(
            f.mock.segment("net_10_0_0_0_24").unwrap().members,
            vec![("router1".to_string(), ip("10.0.0.1"))]
        );
    }

    #[tokio::test]
    async fn test_delete_unknown() {
        let f = fixture();
        assert!(matches!(
            f.mgr.delete_interface("host1", "eth0").await,
            Err(SegMgrError::UnknownNode { .. })
        ));
        f.mgr.ensure_node("host1", crate::types::NodeKind::Host);
        assert!(matches!(
            f.mgr.delete_interface("host1", "eth0").await,
            Err(SegMgrError::UnknownInterface { .. })
        ));
    }

    #[test]
    fn test_step_order_and_display() {
        assert!(ReconcileStep::Validated < ReconcileStep::Committed);
        assert_eq!(ReconcileStep::NewAttached.to_string(), "NewAttached");
    }
}
