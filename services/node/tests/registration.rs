//! Birth registration over the in-memory cluster.

mod common;

use common::{agent, container, Cluster};

use serde_json::json;

use caravan_node::AgentInstance;
use caravan_wire::MobilityError;

#[tokio::test]
async fn test_born_agent_registered_with_main() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;

    // The birth went over the wire to the main container's directory, so
    // peers can resolve and route to the agent immediately.
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c1")));
    cluster.send("trader-7", json!("hello")).await.unwrap();
    assert_eq!(cluster.queued("c1", "trader-7"), vec![json!("hello")]);
}

#[tokio::test]
async fn test_born_agent_on_main_registers_directly() {
    let cluster = Cluster::new(&["main", "c1"]);
    cluster.spawn("main", "overseer").await;

    assert_eq!(cluster.whereis("overseer").await, Some(container("main")));
    assert!(cluster.hosts("main", "overseer"));
}

#[tokio::test]
async fn test_birth_name_clash_leaves_nothing_behind() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;

    let err = cluster
        .node("c2")
        .register_agent(AgentInstance::new(agent("trader-7"), None))
        .await
        .unwrap_err();
    assert!(matches!(err, MobilityError::NameClash { .. }));

    // The refused instance was not kept locally and the directory still
    // points at the live holder.
    assert!(!cluster.hosts("c2", "trader-7"));
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c1")));
}
