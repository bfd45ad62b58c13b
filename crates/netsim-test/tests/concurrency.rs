//! Concurrent requests against one manager

use std::sync::Arc;
use std::time::Duration;

use netsim_segmgrd::{ConflictError, InterfaceRequest, ProviderOp};
use netsim_test::{SimEnv, TopologyVerifier};

fn slow_env() -> Arc<SimEnv> {
    let env = SimEnv::start();
    env.mock.set_latency(Duration::from_millis(2));
    Arc::new(env)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hosts_on_one_subnet_share_one_segment() {
    let env = slow_env();

    let mut handles = Vec::new();
    for i in 1..=8u8 {
        let env = env.clone();
        handles.push(tokio::spawn(async move {
            let request =
                InterfaceRequest::cidr(format!("10.0.0.{}/24", i + 10)).gateway("10.0.0.1");
            env.mgr
                .configure_interface(&format!("host{}", i), &request)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let creates = env
        .mock
        .journal()
        .into_iter()
        .filter(|op| matches!(op, ProviderOp::Create { .. }))
        .count();
    assert_eq!(creates, 1);
    TopologyVerifier::new(&env.mock)
        .assert_segment_count(1)
        .unwrap();
    assert_eq!(
        env.mock.segment("net_10_0_0_0_24").unwrap().members.len(),
        8
    );
    assert_eq!(env.mgr.registry_snapshot()[0].members.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_address_race_has_one_winner() {
    let env = slow_env();

    let mut handles = Vec::new();
    for node in ["host1", "host2", "host3"] {
        let env = env.clone();
        handles.push(tokio::spawn(async move {
            let request = InterfaceRequest::cidr("10.0.0.2/24").gateway("10.0.0.1");
            env.mgr.configure_interface(node, &request).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert!(matches!(
                err.conflict(),
                Some(ConflictError::AddressInUse { .. })
            )),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(
        env.mock.segment("net_10_0_0_0_24").unwrap().members.len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_subnets_proceed_in_parallel() {
    let env = slow_env();

    let mut handles = Vec::new();
    for i in 0..6u8 {
        let env = env.clone();
        handles.push(tokio::spawn(async move {
            let request = InterfaceRequest::cidr(format!("10.0.{}.254/24", i))
                .named(format!("Ethernet{}", i % 5));
            env.mgr
                .configure_interface(&format!("router{}", i + 1), &request)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    TopologyVerifier::new(&env.mock)
        .assert_segment_count(6)
        .unwrap();
    assert_eq!(env.mgr.nodes().len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_waits_for_in_flight_requests() {
    let env = slow_env();

    let configure = {
        let env = env.clone();
        tokio::spawn(async move {
            let request = InterfaceRequest::cidr("10.0.0.2/24").gateway("10.0.0.1");
            env.mgr.configure_interface("host1", &request).await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let report = env.mgr.reconcile_with_provider().await.unwrap();
    configure.await.unwrap().unwrap();

    // Either ordering leaves registry and provider in agreement.
    let again = env.mgr.reconcile_with_provider().await.unwrap();
    assert!(again.problems.is_empty(), "{:?}", again.problems);
    assert!(report.segments <= 1);
}
