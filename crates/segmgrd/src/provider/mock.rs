//! In-memory provider
//!
//! Keeps segments, attachments and per-container routing tables in memory,
//! records every call in a journal and supports one-shot fault injection.
//! Used by unit tests and by the `netsim-test` integration suite.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use netsim_common::ExecResult;
use parking_lot::Mutex;

use super::*;
use crate::address::Subnet;

/// A recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOp {
    List,
    Inspect {
        segment: String,
    },
    Create {
        segment: String,
        subnet: String,
    },
    Delete {
        segment: String,
    },
    Connect {
        segment: String,
        container: String,
        ip: Ipv4Addr,
    },
    Disconnect {
        segment: String,
        container: String,
    },
    Exec {
        container: String,
        command: String,
    },
    ImageQuery {
        image: String,
    },
    Build {
        image: String,
        context: String,
    },
    Run {
        container: String,
    },
    Stop {
        container: String,
    },
}

impl ProviderOp {
    /// Listing and inspection only
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ProviderOp::List | ProviderOp::Inspect { .. } | ProviderOp::ImageQuery { .. }
        )
    }

    /// Changes segments, attachments or containers
    pub fn is_mutation(&self) -> bool {
        !self.is_read_only() && !matches!(self, ProviderOp::Exec { .. })
    }

    /// Removes something that existed before the call
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ProviderOp::Delete { .. } | ProviderOp::Disconnect { .. } | ProviderOp::Stop { .. }
        )
    }

    fn fault_point(&self) -> FaultPoint {
        match self {
            ProviderOp::List => FaultPoint::List,
            ProviderOp::Inspect { .. } => FaultPoint::Inspect,
            ProviderOp::Create { .. } => FaultPoint::Create,
            ProviderOp::Delete { .. } => FaultPoint::Delete,
            ProviderOp::Connect { .. } => FaultPoint::Connect,
            ProviderOp::Disconnect { .. } => FaultPoint::Disconnect,
            ProviderOp::Exec { .. } => FaultPoint::Exec,
            ProviderOp::ImageQuery { .. } => FaultPoint::ImageQuery,
            ProviderOp::Build { .. } => FaultPoint::Build,
            ProviderOp::Run { .. } => FaultPoint::Run,
            ProviderOp::Stop { .. } => FaultPoint::Stop,
        }
    }
}

/// Provider call that a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    List,
    Inspect,
    Create,
    Delete,
    Connect,
    Disconnect,
    Exec,
    ImageQuery,
    Build,
    Run,
    Stop,
}

#[derive(Debug, Default)]
struct MockSegment {
    /// Raw subnet text, as a real provider would report it
    subnet: Option<String>,
    members: BTreeMap<String, Ipv4Addr>,
}

impl MockSegment {
    fn parsed_subnet(&self) -> Option<Subnet> {
        self.subnet.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Default)]
struct MockContainer {
    running: bool,
    routes: BTreeMap<String, Ipv4Addr>,
}

#[derive(Debug, Default)]
struct MockState {
    segments: BTreeMap<String, MockSegment>,
    containers: BTreeMap<String, MockContainer>,
    images: BTreeSet<String>,
    journal: Vec<ProviderOp>,
    faults: HashMap<FaultPoint, VecDeque<ProviderError>>,
    exec_rejections: VecDeque<ExecResult>,
}

impl MockState {
    fn record(&mut self, op: ProviderOp) -> ProviderResult<()> {
        let point = op.fault_point();
        self.journal.push(op);
        match self.faults.get_mut(&point).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn segment_info(&self, name: &str, segment: &MockSegment) -> SegmentInfo {
        SegmentInfo {
            name: name.to_string(),
            subnet: segment.subnet.clone(),
            members: segment
                .members
                .iter()
                .map(|(c, ip)| (c.clone(), *ip))
                .collect(),
        }
    }

    /// Subnets `container` is attached to
    fn attached_subnets(&self, container: &str) -> Vec<Subnet> {
        self.segments
            .values()
            .filter(|s| s.members.contains_key(container))
            .filter_map(MockSegment::parsed_subnet)
            .collect()
    }

    /// Drops routes whose gateway lost its link
    fn prune_routes(&mut self, container: &str) {
        let subnets = self.attached_subnets(container);
        if let Some(c) = self.containers.get_mut(container) {
            c.routes
                .retain(|_, gw| subnets.iter().any(|s| s.contains(*gw)));
        }
    }

    fn container(&mut self, name: &str) -> &mut MockContainer {
        self.containers.entry(name.to_string()).or_default()
    }

    fn exec_route(&mut self, container: &str, args: &[String]) -> ExecResult {
        match args {
            [_, _, op, dest, via, gw] if op == "add" && via == "via" => {
                let gw: Ipv4Addr = match gw.parse() {
                    Ok(gw) => gw,
                    Err(_) => return ExecResult::new(1, "", format!("Error: inet address is expected rather than \"{}\".", gw)),
                };
                if !self.attached_subnets(container).iter().any(|s| s.contains(gw)) {
                    return ExecResult::new(2, "", "Error: Nexthop has invalid gateway.");
                }
                let routes = &mut self.container(container).routes;
                if routes.contains_key(dest) {
                    return ExecResult::new(2, "", "RTNETLINK answers: File exists");
                }
                routes.insert(dest.clone(), gw);
                ExecResult::new(0, "", "")
            }
            [_, _, op, dest] if op == "del" => {
                if self.container(container).routes.remove(dest).is_some() {
                    ExecResult::new(0, "", "")
                } else {
                    ExecResult::new(2, "", "RTNETLINK answers: No such process")
                }
            }
            _ => ExecResult::new(1, "", "Command line is not complete."),
        }
    }

    fn exec_ping(&self, container: &str, args: &[String]) -> ExecResult {
        let target = args.last().and_then(|t| t.parse::<Ipv4Addr>().ok());
        let count = args
            .windows(2)
            .find(|w| w[0] == "-c")
            .and_then(|w| w[1].parse::<u32>().ok())
            .unwrap_or(1);

        let reachable = target.is_some_and(|target| {
            self.segments.values().any(|s| {
                s.members.contains_key(container) && s.members.values().any(|ip| *ip == target)
            })
        });

        let dest = target.map(|t| t.to_string()).unwrap_or_default();
        if reachable {
            ExecResult::new(
                0,
                format!(
                    "PING {} 56(84) bytes of data.\n--- {} ping statistics ---\n{} packets transmitted, {} received, 0% packet loss",
                    dest, dest, count, count
                ),
                "",
            )
        } else {
            ExecResult::new(
                1,
                format!(
                    "PING {} 56(84) bytes of data.\n--- {} ping statistics ---\n{} packets transmitted, 0 received, 100% packet loss",
                    dest, dest, count
                ),
                "",
            )
        }
    }
}

/// In-memory [`NetworkProvider`]
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    latency: Mutex<Option<Duration>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment without recording a call
    pub fn insert_segment(&self, name: &str, subnet: Option<&str>) {
        self.state.lock().segments.insert(
            name.to_string(),
            MockSegment {
                subnet: subnet.map(String::from),
                members: BTreeMap::new(),
            },
        );
    }

    /// Attaches a container without recording a call
    pub fn attach(&self, segment: &str, container: &str, ip: Ipv4Addr) {
        let mut state = self.state.lock();
        state.container(container);
        state
            .segments
            .entry(segment.to_string())
            .or_default()
            .members
            .insert(container.to_string(), ip);
    }

    /// Detaches a container without recording a call
    pub fn detach(&self, segment: &str, container: &str) {
        let mut state = self.state.lock();
        if let Some(s) = state.segments.get_mut(segment) {
            s.members.remove(container);
        }
        state.prune_routes(container);
    }

    /// Makes an image available without recording a call
    pub fn insert_image(&self, image: &str) {
        self.state.lock().images.insert(image.to_string());
    }

    /// Removes a segment without recording a call
    pub fn remove_segment(&self, name: &str) {
        let mut state = self.state.lock();
        let removed = state.segments.remove(name);
        for container in removed.into_iter().flat_map(|s| s.members.into_keys()) {
            state.prune_routes(&container);
        }
    }

    /// Current view of a segment
    pub fn segment(&self, name: &str) -> Option<SegmentInfo> {
        let state = self.state.lock();
        state
            .segments
            .get(name)
            .map(|s| state.segment_info(name, s))
    }

    /// Names of all segments
    pub fn segment_names(&self) -> Vec<String> {
        self.state.lock().segments.keys().cloned().collect()
    }

    /// Routing table of a container, keyed by destination text
    pub fn routes(&self, container: &str) -> BTreeMap<String, Ipv4Addr> {
        self.state
            .lock()
            .containers
            .get(container)
            .map(|c| c.routes.clone())
            .unwrap_or_default()
    }

    /// Installs a route without recording a call
    pub fn insert_route(&self, container: &str, destination: &str, gateway: Ipv4Addr) {
        self.state
            .lock()
            .container(container)
            .routes
            .insert(destination.to_string(), gateway);
    }

    /// Flushes a container's routing table, as a restart would
    pub fn flush_routes(&self, container: &str) {
        self.state.lock().container(container).routes.clear();
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.state
            .lock()
            .containers
            .get(container)
            .is_some_and(|c| c.running)
    }

    /// All recorded calls
    pub fn journal(&self) -> Vec<ProviderOp> {
        self.state.lock().journal.clone()
    }

    /// Recorded calls that changed provider state
    pub fn mutations(&self) -> Vec<ProviderOp> {
        self.journal()
            .into_iter()
            .filter(ProviderOp::is_mutation)
            .collect()
    }

    /// Recorded in-container commands of `container`
    pub fn exec_commands(&self, container: &str) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|op| match op {
                ProviderOp::Exec {
                    container: c,
                    command,
                } if c == container => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Fails the next call at `point` with `err`
    ///
    /// An injected `AlreadyExists` on create still creates the segment, as
    /// a concurrent creator winning the race would.
    pub fn fail_next(&self, point: FaultPoint, err: ProviderError) {
        self.state
            .lock()
            .faults
            .entry(point)
            .or_default()
            .push_back(err);
    }

    /// Makes the next in-container command exit non-zero with `stderr`
    pub fn reject_next_exec(&self, stderr: &str) {
        self.state
            .lock()
            .exec_rejections
            .push_back(ExecResult::new(2, "", stderr));
    }

    /// Delays every call, letting concurrent requests interleave
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl NetworkProvider for MockProvider {
    async fn list_segments(&self) -> ProviderResult<Vec<SegmentSummary>> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::List)?;
        Ok(state
            .segments
            .iter()
            .map(|(name, s)| SegmentSummary {
                name: name.clone(),
                subnet: s.subnet.clone(),
            })
            .collect())
    }

    async fn inspect_segment(&self, name: &str) -> ProviderResult<SegmentInfo> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Inspect {
            segment: name.to_string(),
        })?;
        let segment = state
            .segments
            .get(name)
            .ok_or_else(|| ProviderError::not_found(format!("Network {}", name)))?;
        Ok(state.segment_info(name, segment))
    }

    async fn create_segment(&self, name: &str, subnet: &Subnet) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        if let Err(err) = state.record(ProviderOp::Create {
            segment: name.to_string(),
            subnet: subnet.to_string(),
        }) {
            if err.is_already_exists() {
                state
                    .segments
                    .entry(name.to_string())
                    .or_insert_with(|| MockSegment {
                        subnet: Some(subnet.to_string()),
                        members: BTreeMap::new(),
                    });
            }
            return Err(err);
        }
        if state.segments.contains_key(name) {
            return Err(ProviderError::already_exists(format!("Network {}", name)));
        }
        let overlaps = state.segments.values().filter_map(MockSegment::parsed_subnet).any(|s| {
            s.contains(subnet.network()) || subnet.contains(s.network())
        });
        if overlaps {
            return Err(ProviderError::failed(
                format!("docker network create --subnet {} {}", subnet, name),
                "Pool overlaps with other one on this address space",
            ));
        }
        state.segments.insert(
            name.to_string(),
            MockSegment {
                subnet: Some(subnet.to_string()),
                members: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_segment(&self, name: &str) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Delete {
            segment: name.to_string(),
        })?;
        match state.segments.get(name) {
            None => Err(ProviderError::not_found(format!("Network {}", name))),
            Some(s) if !s.members.is_empty() => Err(ProviderError::failed(
                format!("docker network rm {}", name),
                format!("error while removing network: network {} has active endpoints", name),
            )),
            Some(_) => {
                state.segments.remove(name);
                Ok(())
            }
        }
    }

    async fn connect(&self, segment: &str, container: &str, ip: Ipv4Addr) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Connect {
            segment: segment.to_string(),
            container: container.to_string(),
            ip,
        })?;
        let entry = state
            .segments
            .get(segment)
            .ok_or_else(|| ProviderError::not_found(format!("Network {}", segment)))?;
        if entry.members.contains_key(container) {
            return Err(ProviderError::already_exists(format!(
                "Endpoint {} on {}",
                container, segment
            )));
        }
        if entry.members.values().any(|held| *held == ip) {
            return Err(ProviderError::AddressInUse {
                segment: segment.to_string(),
                ip,
            });
        }
        if !entry.parsed_subnet().is_some_and(|s| s.contains(ip)) {
            return Err(ProviderError::failed(
                format!("docker network connect --ip {} {} {}", ip, segment, container),
                format!("no configured subnet contains IP address {}", ip),
            ));
        }
        state.container(container);
        if let Some(entry) = state.segments.get_mut(segment) {
            entry.members.insert(container.to_string(), ip);
        }
        Ok(())
    }

    async fn disconnect(&self, segment: &str, container: &str) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Disconnect {
            segment: segment.to_string(),
            container: container.to_string(),
        })?;
        let entry = state
            .segments
            .get_mut(segment)
            .ok_or_else(|| ProviderError::not_found(format!("Network {}", segment)))?;
        if entry.members.remove(container).is_none() {
            return Err(ProviderError::not_connected(segment, container));
        }
        state.prune_routes(container);
        Ok(())
    }

    async fn exec_in_container(
        &self,
        container: &str,
        args: &[String],
    ) -> ProviderResult<ExecResult> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Exec {
            container: container.to_string(),
            command: args.join(" "),
        })?;
        if let Some(rejection) = state.exec_rejections.pop_front() {
            return Ok(rejection);
        }
        let result = match args.first().map(String::as_str) {
            Some("ip") if args.get(1).map(String::as_str) == Some("route") => {
                state.exec_route(container, args)
            }
            Some("ping") => state.exec_ping(container, args),
            _ => ExecResult::new(0, "", ""),
        };
        Ok(result)
    }

    async fn image_exists(&self, image: &str) -> ProviderResult<bool> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::ImageQuery {
            image: image.to_string(),
        })?;
        Ok(state.images.contains(image))
    }

    async fn build_image(&self, image: &str, context: &Path) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Build {
            image: image.to_string(),
            context: context.display().to_string(),
        })?;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Run {
            container: spec.name.clone(),
        })?;
        let container = state.container(&spec.name);
        if container.running {
            return Err(ProviderError::already_exists(format!(
                "Container {}",
                spec.name
            )));
        }
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> ProviderResult<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(ProviderOp::Stop {
            container: name.to_string(),
        })?;
        match state.containers.get_mut(name) {
            Some(c) if c.running => {
                c.running = false;
                c.routes.clear();
                Ok(())
            }
            _ => Err(ProviderError::not_found(format!("Container {}", name))),
        }
    }
}
