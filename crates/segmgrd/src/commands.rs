//! Command builders for container network and in-node routing operations
//!
//! Every builder returns an argv vector; nothing is passed through a shell.

use std::net::Ipv4Addr;
use std::path::Path;

use netsim_common::shell::{IP_CMD, PING_CMD};

use crate::address::Subnet;
use crate::tables::{DEFAULT_ROUTE, DOCKER_SOCKET, NODE_CAPABILITY};

fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Build list networks command (one name per line)
pub fn build_network_ls_cmd(docker: &str) -> Vec<String> {
    argv([docker, "network", "ls", "--format", "{{.Name}}"])
}

/// Build inspect command for one or more networks
pub fn build_network_inspect_cmd(docker: &str, names: &[String]) -> Vec<String> {
    let mut cmd = argv([docker, "network", "inspect"]);
    cmd.extend(names.iter().cloned());
    cmd
}

/// Build network creation command
pub fn build_network_create_cmd(docker: &str, name: &str, subnet: &Subnet) -> Vec<String> {
    argv([
        docker.to_string(),
        "network".to_string(),
        "create".to_string(),
        "--subnet".to_string(),
        subnet.to_string(),
        name.to_string(),
    ])
}

/// Build network removal command
pub fn build_network_rm_cmd(docker: &str, name: &str) -> Vec<String> {
    argv([docker, "network", "rm", name])
}

/// Build container attach command with a fixed address
pub fn build_network_connect_cmd(
    docker: &str,
    network: &str,
    container: &str,
    ip: Ipv4Addr,
) -> Vec<String> {
    argv([
        docker.to_string(),
        "network".to_string(),
        "connect".to_string(),
        "--ip".to_string(),
        ip.to_string(),
        network.to_string(),
        container.to_string(),
    ])
}

/// Build container detach command
pub fn build_network_disconnect_cmd(docker: &str, network: &str, container: &str) -> Vec<String> {
    argv([docker, "network", "disconnect", network, container])
}

/// Build exec command running `args` inside `container`
pub fn build_exec_cmd(docker: &str, container: &str, args: &[String]) -> Vec<String> {
    let mut cmd = argv([docker, "exec", container]);
    cmd.extend(args.iter().cloned());
    cmd
}

/// Build detached container launch command
///
/// Prints the image id when `image` exists locally
pub fn build_images_query_cmd(docker: &str, image: &str) -> Vec<String> {
    argv([docker, "images", "-q", image])
}

/// Builds `image` from the directory `context`
pub fn build_image_build_cmd(docker: &str, image: &str, context: &Path) -> Vec<String> {
    argv([
        docker.to_string(),
        "build".to_string(),
        "-t".to_string(),
        image.to_string(),
        context.display().to_string(),
    ])
}

/// Publishes the node UI port, grants the routing capability and mounts the
/// docker socket.
pub fn build_run_cmd(
    docker: &str,
    name: &str,
    image: &str,
    host_port: u16,
    container_port: u16,
) -> Vec<String> {
    argv([
        docker.to_string(),
        "run".to_string(),
        "-dit".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-p".to_string(),
        format!("{}:{}", host_port, container_port),
        format!("--cap-add={}", NODE_CAPABILITY),
        "-v".to_string(),
        format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET),
        image.to_string(),
    ])
}

/// Build container stop command
pub fn build_stop_cmd(docker: &str, name: &str) -> Vec<String> {
    argv([docker, "stop", name])
}

/// Build route installation command (runs inside the node)
pub fn build_route_add_cmd(destination: &Subnet, next_hop: Ipv4Addr) -> Vec<String> {
    argv([
        IP_CMD.to_string(),
        "route".to_string(),
        "add".to_string(),
        destination.to_string(),
        "via".to_string(),
        next_hop.to_string(),
    ])
}

/// Build route removal command (runs inside the node)
pub fn build_route_del_cmd(destination: &Subnet) -> Vec<String> {
    argv([
        IP_CMD.to_string(),
        "route".to_string(),
        "del".to_string(),
        destination.to_string(),
    ])
}

/// Build default route installation command
pub fn build_default_route_add_cmd(gateway: Ipv4Addr) -> Vec<String> {
    argv([
        IP_CMD.to_string(),
        "route".to_string(),
        "add".to_string(),
        DEFAULT_ROUTE.to_string(),
        "via".to_string(),
        gateway.to_string(),
    ])
}

/// Build default route removal command
pub fn build_default_route_del_cmd() -> Vec<String> {
    argv([IP_CMD, "route", "del", DEFAULT_ROUTE])
}

/// Build ping command
pub fn build_ping_cmd(target: Ipv4Addr, count: u32) -> Vec<String> {
    argv([
        PING_CMD.to_string(),
        "-c".to_string(),
        count.to_string(),
        target.to_string(),
    ])
}

/// Whether `ip route del` failed only because the route was absent
pub fn is_missing_route(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such process") || stderr.contains("not found")
}

/// Whether `ip route add` failed because the route is already present
pub fn is_existing_route(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("file exists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_common::shell::render;
    use pretty_assertions::assert_eq;

    fn subnet(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn test_network_commands() {
        assert_eq!(
            render(&build_network_create_cmd("docker", "net_10_0_0_0_24", &subnet("10.0.0.0/24"))),
            "docker network create --subnet 10.0.0.0/24 net_10_0_0_0_24"
        );
        assert_eq!(
            render(&build_network_connect_cmd(
                "docker",
                "net_10_0_0_0_24",
                "host1",
                "10.0.0.2".parse().unwrap()
            )),
            "docker network connect --ip 10.0.0.2 net_10_0_0_0_24 host1"
        );
        assert_eq!(
            render(&build_network_disconnect_cmd("docker", "net_10_0_0_0_24", "host1")),
            "docker network disconnect net_10_0_0_0_24 host1"
        );
        assert_eq!(
            build_network_inspect_cmd("docker", &["a".to_string(), "b".to_string()]),
            vec!["docker", "network", "inspect", "a", "b"]
        );
    }

    #[test]
    fn test_run_command() {
        assert_eq!(
            render(&build_run_cmd("docker", "router2", "router", 5022, 5002)),
            "docker run -dit --name router2 -p 5022:5002 --cap-add=NET_ADMIN \
             -v /var/run/docker.sock:/var/run/docker.sock router"
        );
    }

    #[test]
    fn test_image_commands() {
        assert_eq!(
            render(&build_images_query_cmd("docker", "host")),
            "docker images -q host"
        );
        assert_eq!(
            render(&build_image_build_cmd("docker", "host", Path::new("../host"))),
            "docker build -t host ../host"
        );
    }

    #[test]
    fn test_route_commands() {
        let next_hop = "10.0.0.1".parse().unwrap();
        assert_eq!(
            build_route_add_cmd(&subnet("192.168.0.0/16"), next_hop),
            vec!["ip", "route", "add", "192.168.0.0/16", "via", "10.0.0.1"]
        );
        assert_eq!(
            build_route_del_cmd(&subnet("192.168.0.0/16")),
            vec!["ip", "route", "del", "192.168.0.0/16"]
        );
        assert_eq!(
            build_default_route_add_cmd(next_hop),
            vec!["ip", "route", "add", "default", "via", "10.0.0.1"]
        );
        assert_eq!(build_default_route_del_cmd(), vec!["ip", "route", "del", "default"]);
    }

    #[test]
    fn test_exec_and_ping() {
        let cmd = build_exec_cmd("docker", "host1", &build_ping_cmd("10.0.0.1".parse().unwrap(), 4));
        assert_eq!(render(&cmd), "docker exec host1 ping -c 4 10.0.0.1");
    }

    #[test]
    fn test_route_error_classification() {
        assert!(is_missing_route("RTNETLINK answers: No such process"));
        assert!(!is_missing_route("RTNETLINK answers: Operation not permitted"));
        assert!(is_existing_route("RTNETLINK answers: File exists"));
    }
}
