//! Idempotence, segment reuse and registry drift

use netsim_segmgrd::{ConsistencyError, OutcomeStatus, ProviderOp, RouteStatus};
use netsim_test::{host_fixtures, router_fixtures, RouteVerifier, SimEnv, TopologyVerifier};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_configure_twice_is_idempotent() {
    let env = SimEnv::start();
    let step = host_fixtures::host_interface("host1", "10.0.0.5/24", "10.0.0.1");

    env.apply(&step).await.unwrap();
    let nodes = env.mgr.nodes();
    let segments = env.mgr.registry_snapshot();
    env.mock.clear_journal();

    let outcome = env.apply(&step).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Unchanged);
    assert_eq!(env.mgr.nodes(), nodes);
    assert_eq!(env.mgr.registry_snapshot(), segments);
    TopologyVerifier::new(&env.mock).assert_no_destructive_op().unwrap();
}

#[tokio::test]
async fn test_mask_notation_is_the_same_subnet() {
    let env = SimEnv::start();
    env.apply(&router_fixtures::router_interface("router1", "Ethernet0", "10.0.0.5/24"))
        .await
        .unwrap();
    env.apply(&host_fixtures::host_interface_with_mask(
        "host1",
        "10.0.0.9",
        "255.255.255.0",
        "10.0.0.5",
    ))
    .await
    .unwrap();

    let topology = TopologyVerifier::new(&env.mock);
    topology.assert_segment_count(1).unwrap();
    topology
        .assert_members(
            "net_10_0_0_0_24",
            &[("host1", "10.0.0.9"), ("router1", "10.0.0.5")],
        )
        .unwrap();
}

#[tokio::test]
async fn test_attach_detach_reattach_reuses_segment() {
    let env = SimEnv::start();
    let topology = TopologyVerifier::new(&env.mock);

    env.apply(&router_fixtures::router_interface("router1", "Ethernet0", "10.0.0.1/24"))
        .await
        .unwrap();
    env.apply(&host_fixtures::host_interface("host1", "10.0.0.2/24", "10.0.0.1"))
        .await
        .unwrap();
    env.apply(&host_fixtures::delete_host_interface("host1"))
        .await
        .unwrap();
    topology
        .assert_members("net_10_0_0_0_24", &[("router1", "10.0.0.1")])
        .unwrap();

    env.apply(&host_fixtures::host_interface("host1", "10.0.0.2/24", "10.0.0.1"))
        .await
        .unwrap();
    topology.assert_segment_count(1).unwrap();
    let creates = env
        .mock
        .journal()
        .into_iter()
        .filter(|op| matches!(op, ProviderOp::Create { .. }))
        .count();
    assert_eq!(creates, 1);

    env.apply(&host_fixtures::delete_host_interface("host1"))
        .await
        .unwrap();
    env.apply(&router_fixtures::delete_router_interface("router1", "Ethernet0"))
        .await
        .unwrap();
    topology.assert_segment_absent("net_10_0_0_0_24").unwrap();
}

#[tokio::test]
async fn test_interface_replacement_stales_routes() {
    let env = SimEnv::start();
    env.apply(&router_fixtures::router_interface("router1", "Ethernet0", "10.0.0.254/24"))
        .await
        .unwrap();
    env.apply(&router_fixtures::static_route("router1", "192.168.0.0/16", "10.0.0.1"))
        .await
        .unwrap();

    let outcome = env
        .apply(&router_fixtures::router_interface("router1", "Ethernet0", "10.0.5.254/24"))
        .await
        .unwrap();
    assert!(outcome.message.contains("stale"));

    let routes = RouteVerifier::new(&env.mgr);
    routes
        .assert_status("router1", "192.168.0.0/16", RouteStatus::Stale)
        .unwrap();

    // Reconfiguring through a reachable next hop revives the route.
    env.apply(&router_fixtures::static_route("router1", "192.168.0.0/16", "10.0.5.1"))
        .await
        .unwrap();
    routes
        .assert_status("router1", "192.168.0.0/16", RouteStatus::Active)
        .unwrap();
}

#[tokio::test]
async fn test_reconcile_adopts_provider_view() {
    let env = SimEnv::start();
    env.apply(&host_fixtures::host_interface("host1", "10.0.0.2/24", "10.0.0.1"))
        .await
        .unwrap();

    env.mock.detach("net_10_0_0_0_24", "host1");
    env.mock.insert_segment("lab", Some("10.9.0.0/24"));
    env.mock.attach("lab", "host9", "10.9.0.9".parse().unwrap());

    let report = env.mgr.reconcile_with_provider().await.unwrap();
    assert_eq!(report.segments, 2);
    assert_eq!(report.problems.len(), 2);
    assert!(report
        .problems
        .iter()
        .any(|p| matches!(p, ConsistencyError::MembersDrifted { missing, .. } if missing.len() == 1)));
    assert!(report
        .problems
        .iter()
        .any(|p| matches!(p, ConsistencyError::SegmentAppeared { name, .. } if name == "lab")));
    env.mock.clear_journal();

    // The adopted registry now knows 10.9.0.9 is taken.
    let err = env
        .apply(&host_fixtures::host_interface("host2", "10.9.0.9/24", "10.9.0.1"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("by host9"));
    TopologyVerifier::new(&env.mock).assert_no_mutation().unwrap();
}

#[tokio::test]
async fn test_reconcile_reports_vanished_segment() {
    let env = SimEnv::start();
    env.apply(&router_fixtures::router_interface("router1", "Ethernet0", "10.0.0.1/24"))
        .await
        .unwrap();
    env.mock.remove_segment("net_10_0_0_0_24");

    let report = env.mgr.reconcile_with_provider().await.unwrap();
    assert_eq!(report.segments, 0);
    assert!(matches!(
        report.problems.as_slice(),
        [ConsistencyError::SegmentVanished { .. }]
    ));
    assert!(env.mgr.registry_snapshot().is_empty());
}

#[tokio::test]
async fn test_segment_renamed_outside_is_still_detached() {
    let env = SimEnv::start();
    let topology = TopologyVerifier::new(&env.mock);
    env.apply(&host_fixtures::host_interface("host1", "10.0.0.2/24", "10.0.0.1"))
        .await
        .unwrap();
    env.apply(&host_fixtures::host_interface("host2", "10.0.0.3/24", "10.0.0.1"))
        .await
        .unwrap();

    // Recreated by hand under another name, members carried over.
    env.mock.remove_segment("net_10_0_0_0_24");
    env.mock.insert_segment("lab", Some("10.0.0.0/24"));
    env.mock.attach("lab", "host1", "10.0.0.2".parse().unwrap());
    env.mock.attach("lab", "host2", "10.0.0.3".parse().unwrap());

    let outcome = env
        .apply(&host_fixtures::host_interface("host1", "10.0.1.2/24", "10.0.1.1"))
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Applied);
    topology.assert_members("lab", &[("host2", "10.0.0.3")]).unwrap();
    topology
        .assert_members("net_10_0_1_0_24", &[("host1", "10.0.1.2")])
        .unwrap();

    let outcome = env
        .apply(&host_fixtures::delete_host_interface("host2"))
        .await
        .unwrap();
    assert!(outcome.message.contains("lab"), "{}", outcome.message);
    topology.assert_segment_absent("lab").unwrap();
    assert!(env.mgr.node("host2").unwrap().interfaces.is_empty());
}
