//! Docker CLI provider
//!
//! Drives `docker network` and `docker exec` through argv command lines and
//! classifies the daemon's error text into [`ProviderError`] variants.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use netsim_common::shell::{self, DOCKER_CMD};
use netsim_common::{CmdError, ExecResult};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::*;
use crate::address::Subnet;
use crate::commands::*;

/// Time budgets per class of provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeouts {
    /// Listing and inspection
    pub list: Duration,

    /// Segment create/delete, connect/disconnect, container run/stop
    pub mutate: Duration,

    /// Commands executed inside a container
    pub exec: Duration,

    /// Node image builds
    pub build: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(10),
            mutate: Duration::from_secs(20),
            exec: Duration::from_secs(30),
            build: Duration::from_secs(600),
        }
    }
}

/// What a failing command was operating on
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Segment(&'a str),
    Attachment {
        segment: &'a str,
        container: &'a str,
        ip: Option<Ipv4Addr>,
    },
    Container(&'a str),
    Image(&'a str),
}

impl Target<'_> {
    fn describe(&self) -> String {
        match self {
            Target::Segment(name) => format!("Network {}", name),
            Target::Attachment {
                segment, container, ..
            } => format!("Endpoint {} on {}", container, segment),
            Target::Container(name) => format!("Container {}", name),
            Target::Image(name) => format!("Image {}", name),
        }
    }
}

/// Maps daemon error text onto a classified error
fn classify(command: String, output: &str, target: Target<'_>) -> ProviderError {
    let lower = output.to_ascii_lowercase();

    if lower.contains("is already in use by container") || lower.contains("already exists") {
        return ProviderError::already_exists(target.describe());
    }
    if lower.contains("no such network")
        || lower.contains("no such container")
        || lower.contains("not found")
    {
        return ProviderError::not_found(target.describe());
    }
    if lower.contains("is not connected") {
        if let Target::Attachment {
            segment, container, ..
        } = target
        {
            return ProviderError::not_connected(segment, container);
        }
    }
    if lower.contains("address already in use") || lower.contains("already in use") {
        if let Target::Attachment {
            segment,
            ip: Some(ip),
            ..
        } = target
        {
            return ProviderError::AddressInUse {
                segment: segment.to_string(),
                ip,
            };
        }
    }

    ProviderError::failed(command, output.trim())
}

#[derive(Debug, Deserialize)]
struct NetworkJson {
    #[serde(rename = "Name")]
    name: String,

    #[serde(rename = "IPAM", default)]
    ipam: Option<IpamJson>,

    #[serde(rename = "Containers", default)]
    containers: Option<HashMap<String, EndpointJson>>,
}

#[derive(Debug, Deserialize)]
struct IpamJson {
    #[serde(rename = "Config", default)]
    config: Option<Vec<IpamConfigJson>>,
}

#[derive(Debug, Deserialize)]
struct IpamConfigJson {
    #[serde(rename = "Subnet", default)]
    subnet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointJson {
    #[serde(rename = "Name")]
    name: String,

    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

impl From<NetworkJson> for SegmentInfo {
    fn from(network: NetworkJson) -> Self {
        let subnet = network
            .ipam
            .and_then(|ipam| ipam.config)
            .and_then(|configs| configs.into_iter().find_map(|c| c.subnet))
            .filter(|s| !s.contains(':'));

        let mut members: Vec<(String, Ipv4Addr)> = network
            .containers
            .unwrap_or_default()
            .into_values()
            .filter_map(|ep| {
                let addr = ep.ipv4_address.split('/').next()?.parse().ok()?;
                Some((ep.name, addr))
            })
            .collect();
        members.sort();

        SegmentInfo {
            name: network.name,
            subnet,
            members,
        }
    }
}

/// Parses `docker network inspect` output
pub(crate) fn parse_inspect(stdout: &str) -> ProviderResult<Vec<SegmentInfo>> {
    let networks: Vec<NetworkJson> = serde_json::from_str(stdout)
        .map_err(|e| ProviderError::parse(format!("network inspect: {}", e)))?;
    Ok(networks.into_iter().map(SegmentInfo::from).collect())
}

/// Docker-backed provider
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker: String,
    timeouts: ProviderTimeouts,
}

impl DockerProvider {
    pub fn new(docker: impl Into<String>, timeouts: ProviderTimeouts) -> Self {
        Self {
            docker: docker.into(),
            timeouts,
        }
    }

    async fn run(&self, argv: &[String], timeout: Duration) -> ProviderResult<ExecResult> {
        Ok(shell::exec(argv, timeout).await?)
    }

    async fn run_checked(
        &self,
        argv: &[String],
        timeout: Duration,
        target: Target<'_>,
    ) -> ProviderResult<String> {
        match shell::exec_or_throw(argv, timeout).await {
            Ok(stdout) => Ok(stdout),
            Err(CmdError::Failed {
                command, output, ..
            }) => Err(classify(command, &output, target)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for DockerProvider {
    fn default() -> Self {
        Self::new(DOCKER_CMD, ProviderTimeouts::default())
    }
}

#[async_trait]
impl NetworkProvider for DockerProvider {
    #[instrument(skip(self))]
    async fn list_segments(&self) -> ProviderResult<Vec<SegmentSummary>> {
        let ls = build_network_ls_cmd(&self.docker);
        let names: Vec<String> = self
            .run_checked(&ls, self.timeouts.list, Target::Segment("*"))
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        // A network removed between ls and inspect makes inspect exit
        // non-zero while still printing the others.
        let inspect = build_network_inspect_cmd(&self.docker, &names);
        let result = self.run(&inspect, self.timeouts.list).await?;
        if !result.success() {
            if result.stdout.is_empty() {
                return Err(classify(
                    shell::render(&inspect),
                    &result.combined_output(),
                    Target::Segment("*"),
                ));
            }
            warn!(stderr = %result.stderr, "Partial network inspect output");
        }

        let infos = parse_inspect(&result.stdout)?;
        debug!("Listed {} networks", infos.len());
        Ok(infos
            .into_iter()
            .map(|info| SegmentSummary {
                name: info.name,
                subnet: info.subnet,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn inspect_segment(&self, name: &str) -> ProviderResult<SegmentInfo> {
        let cmd = build_network_inspect_cmd(&self.docker, &[name.to_string()]);
        let stdout = self
            .run_checked(&cmd, self.timeouts.list, Target::Segment(name))
            .await?;
        parse_inspect(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::not_found(Target::Segment(name).describe()))
    }

    #[instrument(skip(self))]
    async fn create_segment(&self, name: &str, subnet: &Subnet) -> ProviderResult<()> {
        let cmd = build_network_create_cmd(&self.docker, name, subnet);
        self.run_checked(&cmd, self.timeouts.mutate, Target::Segment(name))
            .await?;
        info!("Created network {} on {}", name, subnet);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_segment(&self, name: &str) -> ProviderResult<()> {
        let cmd = build_network_rm_cmd(&self.docker, name);
        self.run_checked(&cmd, self.timeouts.mutate, Target::Segment(name))
            .await?;
        info!("Removed network {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn connect(&self, segment: &str, container: &str, ip: Ipv4Addr) -> ProviderResult<()> {
        let cmd = build_network_connect_cmd(&self.docker, segment, container, ip);
        let target = Target::Attachment {
            segment,
            container,
            ip: Some(ip),
        };
        self.run_checked(&cmd, self.timeouts.mutate, target).await?;
        info!("Connected {} to {} as {}", container, segment, ip);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn disconnect(&self, segment: &str, container: &str) -> ProviderResult<()> {
        let cmd = build_network_disconnect_cmd(&self.docker, segment, container);
        let target = Target::Attachment {
            segment,
            container,
            ip: None,
        };
        self.run_checked(&cmd, self.timeouts.mutate, target).await?;
        info!("Disconnected {} from {}", container, segment);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exec_in_container(
        &self,
        container: &str,
        args: &[String],
    ) -> ProviderResult<ExecResult> {
        let cmd = build_exec_cmd(&self.docker, container, args);
        let result = self.run(&cmd, self.timeouts.exec).await?;
        if !result.success() && result.stderr.contains("No such container") {
            return Err(ProviderError::not_found(Target::Container(container).describe()));
        }
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn image_exists(&self, image: &str) -> ProviderResult<bool> {
        let cmd = build_images_query_cmd(&self.docker, image);
        let ids = self
            .run_checked(&cmd, self.timeouts.list, Target::Image(image))
            .await?;
        Ok(!ids.trim().is_empty())
    }

    #[instrument(skip(self))]
    async fn build_image(&self, image: &str, context: &Path) -> ProviderResult<()> {
        let cmd = build_image_build_cmd(&self.docker, image, context);
        self.run_checked(&cmd, self.timeouts.build, Target::Image(image))
            .await?;
        info!("Built image {} from {}", image, context.display());
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn run_container(&self, spec: &ContainerSpec) -> ProviderResult<()> {
        let cmd = build_run_cmd(
            &self.docker,
            &spec.name,
            &spec.image,
            spec.host_port,
            spec.container_port,
        );
        self.run_checked(&cmd, self.timeouts.mutate, Target::Container(&spec.name))
            .await?;
        info!(
            "Started {} container {} on port {}",
            spec.kind, spec.name, spec.host_port
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, name: &str) -> ProviderResult<()> {
        let cmd = build_stop_cmd(&self.docker, name);
        self.run_checked(&cmd, self.timeouts.mutate, Target::Container(name))
            .await?;
        info!("Stopped container {}", name);
        Ok(())
    }
}
