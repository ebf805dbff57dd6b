//! Restart and re-IP of vertica nodes against the mock cluster.

use std::time::Duration;

use vertica_operator::client::ClusterApi;
use vertica_operator::controller::events::{EventKind, reasons};
use vertica_operator::controller::pipeline::StepResult;
use vertica_operator::controller::restart::RestartReconciler;
use vertica_operator::crd::{ConditionType, VerticaDB};

use crate::mock_state::*;

fn three_node_vdb() -> VerticaDB {
    let mut vdb = vdb(vec![subcluster("main", 3, true)]);
    vdb.spec.image = OLD_IMAGE.to_string();
    vdb
}

// ============================================================================
// Node restart
// ============================================================================

/// Vertica may not have noticed a node went down when the restart is
/// attempted. The restart is retried after a fixed delay and then succeeds.
#[tokio::test]
async fn test_restart_node_retries_until_detected_down() {
    let vdb = three_node_vdb();
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();
    let down = "vertdb-main-1";
    cluster.set_node_up(down, false);
    cluster.state().restart_node_refusals = 1;

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::RequeueAfter(Duration::from_secs(10)));
    assert!(!cluster.node(down).up);
    assert_eq!(
        events.reasons(),
        vec![reasons::NODE_RESTART_STARTED, reasons::NODE_RESTART_FAILED]
    );
    assert_eq!(events.all()[1].kind, EventKind::Warning);

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Done);
    assert!(cluster.node(down).up);
    assert_eq!(cluster.admintools_calls("restart_node"), 2);
    assert_eq!(events.count(reasons::NODE_RESTART_SUCCEEDED), 1);

    // Only the down node was named
    let state = cluster.state();
    let (_, cmd) = state
        .commands
        .iter()
        .rev()
        .find(|(_, cmd)| cmd.iter().any(|a| a == "restart_node"))
        .unwrap();
    assert!(cmd.iter().any(|a| a == "--hosts=v_vertdb_node0002"));
}

/// Nothing is run when every node is already up.
#[tokio::test]
async fn test_restart_with_all_nodes_up_is_a_no_op() {
    let vdb = three_node_vdb();
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Done);
    assert_eq!(cluster.admintools_calls("restart_node"), 0);
    assert_eq!(cluster.admintools_calls("start_db"), 0);
    assert_eq!(cluster.admintools_calls("re_ip"), 0);
    assert!(events.all().is_empty());
    assert!(cluster.vdb().is_condition_set(ConditionType::AutoRestartVertica));
}

/// With autoRestartVertica off only the condition is written.
#[tokio::test]
async fn test_restart_disabled() {
    let mut vdb = three_node_vdb();
    vdb.spec.auto_restart_vertica = false;
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();
    cluster.set_node_up("vertdb-main-0", false);

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Done);
    assert!(!cluster.node("vertdb-main-0").up);
    assert!(cluster.state().commands.is_empty());
    let stored = cluster.vdb();
    assert!(stored.condition(ConditionType::AutoRestartVertica).is_some());
    assert!(!stored.is_condition_set(ConditionType::AutoRestartVertica));
}

// ============================================================================
// Cluster restart
// ============================================================================

/// Every pod was rescheduled with a new IP. admintools.conf is rewritten
/// with re_ip and the database is started with start_db.
#[tokio::test]
async fn test_cluster_restart_after_reschedule() {
    let vdb = three_node_vdb();
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();
    cluster.reschedule_all_pods();

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Done);
    assert_eq!(cluster.admintools_calls("re_ip"), 1);
    assert_eq!(cluster.admintools_calls("start_db"), 1);
    assert_eq!(cluster.admintools_calls("restart_node"), 0);

    for (i, pod) in pods_of(&vdb, "main").iter().enumerate() {
        assert!(cluster.node(pod).up);
        let compat21 = format!("node{:04}", i + 1);
        let recorded = cluster.state().conf_ips[&compat21].clone();
        assert_eq!(recorded, cluster.pod_ip(pod));
    }
    assert_eq!(
        events.reasons(),
        vec![
            reasons::CLUSTER_RESTART_STARTED,
            reasons::CLUSTER_RESTART_SUCCEEDED
        ]
    );
}

/// When the pods kept their IPs the re_ip is skipped.
#[tokio::test]
async fn test_cluster_restart_without_ip_change() {
    let vdb = three_node_vdb();
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();
    for pod in pods_of(&vdb, "main") {
        cluster.set_node_up(&pod, false);
    }

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Done);
    assert_eq!(cluster.admintools_calls("re_ip"), 0);
    assert_eq!(cluster.admintools_calls("start_db"), 1);
}

/// No pod is running, so there is nowhere to run admintools from.
#[tokio::test]
async fn test_cluster_restart_waits_for_pods() {
    let vdb = three_node_vdb();
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();
    cluster.state().pods.clear();

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Requeue);
    assert!(events.all().is_empty());
}

// ============================================================================
// Re-IP
// ============================================================================

/// An installed pod that never made it into the database is re-IPed while
/// the rest of the cluster stays up.
#[tokio::test]
async fn test_reip_installed_pod_without_db() {
    let vdb = three_node_vdb();
    let cluster = MockCluster::running(&vdb, OLD_IMAGE);
    let events = MockEvents::new();
    let pod = "vertdb-main-2";
    cluster.state().nodes.get_mut(pod).unwrap().db_exists = false;
    cluster.delete_pod(pod).await.unwrap();
    let new_ip = cluster.pod_ip(pod);
    assert_ne!(cluster.state().conf_ips["node0003"], new_ip);

    let mut scope = cluster.scope(&events);
    let result = RestartReconciler::new().reconcile(&mut scope).await.unwrap();
    assert_eq!(result, StepResult::Done);
    assert_eq!(cluster.admintools_calls("re_ip"), 1);
    assert_eq!(cluster.admintools_calls("restart_node"), 0);
    assert_eq!(cluster.state().conf_ips["node0003"], new_ip);
}
