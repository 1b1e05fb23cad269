//! End-to-end move transactions over the in-memory cluster.

mod common;

use common::{agent, container, Cluster};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use caravan_id::ContainerName;
use caravan_node::{
    AgentInstance, AgentState, Config, ContainerNode, DenyAll, Movable, Transport,
};
use caravan_wire::{
    Command, LifeCycleState, MobilityError, RelocateMode, RelocateOutcome, Reply, TransferVerdict,
};

fn abort_cause(outcome: &RelocateOutcome) -> &MobilityError {
    match outcome {
        RelocateOutcome::Aborted { cause } => cause,
        RelocateOutcome::Committed => panic!("expected an aborted outcome"),
    }
}

#[tokio::test]
async fn test_move_commits_and_relocates() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    let mut instance = AgentInstance::new(agent("trader-7"), Some("ops".to_string()));
    instance
        .fields_mut()
        .insert("balance".to_string(), json!(42));
    cluster.spawn_instance("c1", instance).await;

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(outcome.is_committed());

    assert_eq!(cluster.whereis("trader-7").await, Some(container("c2")));
    assert!(!cluster.hosts("c1", "trader-7"));
    assert!(cluster.hosts("c2", "trader-7"));
    assert_eq!(
        cluster.node("c2").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );

    // Private state survived the hop.
    let guard = cluster
        .node("c2")
        .directory()
        .acquire(&agent("trader-7"))
        .await
        .unwrap();
    assert_eq!(guard.fields()["balance"], json!(42));
    assert_eq!(guard.owner(), Some("ops"));
}

#[tokio::test]
async fn test_move_preserves_message_order() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;

    // Two messages are already queued when the transaction starts.
    cluster.send("trader-7", json!("m1")).await.unwrap();
    cluster.send("trader-7", json!("m2")).await.unwrap();

    // A third arrives mid-transaction, injected when the identity transfer
    // passes through the network.
    let injected = Arc::new(AtomicBool::new(false));
    let c1 = cluster.node("c1");
    cluster.net.set_tap(Box::new({
        let injected = Arc::clone(&injected);
        move |_to, command| {
            if matches!(command, Command::TransferIdentity { .. })
                && !injected.swap(true, Ordering::SeqCst)
            {
                c1.deliver_local(
                    &agent("trader-7"),
                    caravan_wire::AgentMessage::new(agent("tester"), json!("mid")),
                )
                .unwrap();
            }
        }
    }));

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(outcome.is_committed());
    assert!(injected.load(Ordering::SeqCst));

    // A message sent after the commit lands behind everything buffered.
    cluster.send("trader-7", json!("post")).await.unwrap();

    assert_eq!(
        cluster.queued("c2", "trader-7"),
        vec![json!("m1"), json!("m2"), json!("mid"), json!("post")]
    );
}

#[tokio::test]
async fn test_delivery_refused_while_commit_ships() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;
    cluster.send("trader-7", json!("m1")).await.unwrap();

    // A delivery racing the commit window: it arrives after the transfer
    // buffer was drained but before the verdict lands on the destination.
    // It must be refused, never absorbed into the departing instance.
    let refused = Arc::new(AtomicBool::new(false));
    let c1 = cluster.node("c1");
    cluster.net.set_tap(Box::new({
        let refused = Arc::clone(&refused);
        move |_to, command| {
            if matches!(
                command,
                Command::HandleTransferResult {
                    verdict: TransferVerdict::Commit,
                    ..
                }
            ) {
                let result = c1.deliver_local(
                    &agent("trader-7"),
                    caravan_wire::AgentMessage::new(agent("tester"), json!("straggler")),
                );
                refused.store(result.is_err(), Ordering::SeqCst);
            }
        }
    }));

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(outcome.is_committed());
    assert!(refused.load(Ordering::SeqCst));

    // Nothing was silently dropped: the destination has exactly what was
    // buffered, and the refused sender re-routes through the directory.
    assert_eq!(cluster.queued("c2", "trader-7"), vec![json!("m1")]);
    cluster.send("trader-7", json!("straggler")).await.unwrap();
    assert_eq!(
        cluster.queued("c2", "trader-7"),
        vec![json!("m1"), json!("straggler")]
    );
}

#[tokio::test]
async fn test_move_to_current_container_is_trivial() {
    let cluster = Cluster::new(&["main", "c1"]);
    cluster.spawn("c1", "trader-7").await;
    cluster.send("trader-7", json!("m1")).await.unwrap();

    let outcome = cluster.move_agent("trader-7", "c1", "c1").await;
    assert!(outcome.is_committed());

    assert!(cluster.hosts("c1", "trader-7"));
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c1")));
    assert_eq!(
        cluster.node("c1").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
    assert_eq!(cluster.queued("c1", "trader-7"), vec![json!("m1")]);
}

#[tokio::test]
async fn test_move_unknown_agent() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    let outcome = cluster.move_agent("ghost", "c1", "c2").await;
    assert!(matches!(
        abort_cause(&outcome),
        MobilityError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_move_aborts_when_destination_down() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;
    cluster.send("trader-7", json!("m1")).await.unwrap();
    cluster.net.take_down("c2");

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(matches!(
        abort_cause(&outcome),
        MobilityError::LinkFailure { .. }
    ));

    // Full local rollback: directory untouched, agent active, queue intact.
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c1")));
    assert_eq!(
        cluster.node("c1").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
    assert_eq!(cluster.queued("c1", "trader-7"), vec![json!("m1")]);
    assert!(!cluster.hosts("c2", "trader-7"));
}

#[tokio::test]
async fn test_move_aborts_on_failed_readiness_probe() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;
    cluster.send("trader-7", json!("m1")).await.unwrap();

    // Provisioning (c1 -> c2) succeeds, but the coordinator cannot reach
    // the destination: both the probe and its retry fail.
    cluster.net.fail_link("main", "c2", 2);

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(matches!(
        abort_cause(&outcome),
        MobilityError::LinkFailure { .. }
    ));

    // No directory mutation, no residual copy, queue untouched.
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c1")));
    assert!(cluster.hosts("c1", "trader-7"));
    assert!(!cluster.hosts("c2", "trader-7"));
    assert_eq!(cluster.queued("c1", "trader-7"), vec![json!("m1")]);
    assert_eq!(
        cluster.node("c1").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
}

#[tokio::test]
async fn test_transient_link_failure_is_retried_once() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;

    // The first provisioning attempt fails; the retry goes through.
    cluster.net.fail_link("c1", "c2", 1);

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(outcome.is_committed());

    // Exactly one live instance exists.
    assert!(cluster.hosts("c2", "trader-7"));
    assert!(!cluster.hosts("c1", "trader-7"));
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c2")));
}

#[tokio::test]
async fn test_lost_provisioning_reply_does_not_duplicate() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;

    // The first creation executes on the destination but its reply is
    // lost; the retry must be acknowledged, not provisioned a second time.
    cluster.net.drop_reply("c1", "c2", 1);

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(outcome.is_committed());

    assert!(cluster.hosts("c2", "trader-7"));
    assert!(!cluster.hosts("c1", "trader-7"));
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c2")));
    assert_eq!(
        cluster.node("c2").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
}

#[tokio::test]
async fn test_failing_pre_hook_aborts_before_anything_leaves() {
    struct Refusing;
    impl Movable for Refusing {
        fn before_move(&mut self, _state: &mut AgentState) -> Result<(), MobilityError> {
            Err(MobilityError::Interrupted {
                detail: "busy".to_string(),
            })
        }
    }

    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster
        .spawn_instance(
            "c1",
            AgentInstance::new(agent("trader-7"), None).with_hooks(Box::new(Refusing)),
        )
        .await;

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(matches!(
        abort_cause(&outcome),
        MobilityError::Interrupted { .. }
    ));
    assert!(!cluster.hosts("c2", "trader-7"));
    assert_eq!(
        cluster.node("c1").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
}

#[tokio::test]
async fn test_request_move_indirection_through_main() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster.spawn("c1", "trader-7").await;

    // The request goes to the main container, which resolves the owner and
    // forwards the move there.
    let reply = cluster
        .main_node()
        .handle(
            &container("c2"),
            Command::RequestMove {
                agent: agent("trader-7"),
                destination: container("c2"),
            },
        )
        .await
        .unwrap();
    match reply {
        Reply::Relocated { outcome } => assert!(outcome.is_committed()),
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c2")));
}

#[tokio::test]
async fn test_move_fetches_code_from_class_site() {
    let cluster = Cluster::new(&["main", "c1", "c2", "c3"]);

    // The module lives only in c1's registry.
    let registry = cluster.registry_dir("c1");
    std::fs::create_dir_all(registry.join("trader")).unwrap();
    std::fs::write(registry.join("trader/core.mod"), b"bytecode").unwrap();

    cluster
        .spawn_instance(
            "c1",
            AgentInstance::new(agent("trader-7"), None)
                .with_code_modules(vec!["trader.core".to_string()]),
        )
        .await;

    assert!(cluster.move_agent("trader-7", "c1", "c2").await.is_committed());

    // The second hop still resolves code against the origin site, c1.
    assert!(cluster.move_agent("trader-7", "c2", "c3").await.is_committed());
    assert_eq!(cluster.whereis("trader-7").await, Some(container("c3")));
}

#[tokio::test]
async fn test_missing_code_module_aborts_with_rollback() {
    let cluster = Cluster::new(&["main", "c1", "c2"]);
    cluster
        .spawn_instance(
            "c1",
            AgentInstance::new(agent("trader-7"), None)
                .with_code_modules(vec!["trader.core".to_string()]),
        )
        .await;

    let outcome = cluster.move_agent("trader-7", "c1", "c2").await;
    assert!(matches!(
        abort_cause(&outcome),
        MobilityError::CodeNotFound { .. }
    ));
    assert!(cluster.hosts("c1", "trader-7"));
    assert!(!cluster.hosts("c2", "trader-7"));
    assert_eq!(
        cluster.node("c1").agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
}

#[tokio::test]
async fn test_policy_denial_aborts_untouched() {
    // A standalone main node with a denying policy; the transport must
    // never be reached.
    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn call(
            &self,
            _to: &ContainerName,
            _command: Command,
        ) -> Result<Reply, MobilityError> {
            panic!("denied relocation must not touch the transport");
        }

        async fn refresh(&self, _to: &ContainerName) {}
    }

    let config = Config {
        node_name: container("c1"),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        main_container: container("c1"),
        peers: Vec::new(),
        code_registry_dir: std::env::temp_dir(),
        code_paths: Vec::new(),
        probe_timeout_ms: 200,
        call_timeout_ms: 1000,
        log_level: "info".to_string(),
    };
    let node = ContainerNode::new(&config, Arc::new(Unreachable)).with_policy(Box::new(DenyAll {
        reason: "frozen".to_string(),
    }));
    node.register_agent(AgentInstance::new(agent("trader-7"), None))
        .await
        .unwrap();

    let outcome = node
        .relocate(
            &agent("trader-7"),
            &container("c2"),
            RelocateMode::Move,
            None,
        )
        .await;
    match outcome {
        RelocateOutcome::Aborted {
            cause: MobilityError::SecurityDenied { reason },
        } => assert_eq!(reason, "frozen"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        node.agent_state(&agent("trader-7")).await,
        Some(LifeCycleState::Active)
    );
}
