mod common;

use common::{wait_until, TestNet};
use ledgerflow::rpc::{start_flow_permission, FlowRpcService, RpcUser, ALL_FLOWS_PERMISSION};
use ledgerflow::{FlowContext, FlowError, Party, StateMachineUpdate};
use std::time::Duration;

fn trade_value_permissions() -> Vec<String> {
    vec![start_flow_permission("test.TradeValue")]
}

async fn two_party_setup(net: &TestNet) -> (common::TestNode, common::TestNode) {
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.TradeValue",
            1,
            true,
            |value: u64, mut ctx: FlowContext| async move {
                ctx.progress_to("Proposing");
                let accepted: u64 = ctx
                    .send_and_receive(&Party::new("BankB"), &value)
                    .await?;
                ctx.progress_to("Done");
                Ok(accepted)
            },
        )
        .expect("Should register initiator");
    node_a
        .manager
        .register_initiator(
            "test.Internal",
            1,
            false,
            |value: u64, _ctx: FlowContext| async move { Ok(value) },
        )
        .expect("Should register internal flow");
    node_b
        .manager
        .register_responder("test.TradeValue", 1, |mut ctx: FlowContext, party: Party| async move {
            let proposed: u64 = ctx
                .init_payload()?
                .ok_or_else(|| FlowError::Fatal("Expected a proposal".to_string()))?;
            ctx.send(&party, &(proposed * 2)).await?;
            Ok(())
        })
        .expect("Should register responder");

    node_a.open(net).await;
    node_b.open(net).await;
    (node_a, node_b)
}

#[tokio::test]
async fn test_permissioned_start_runs_flow() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    let alice = RpcUser::new("alice", trade_value_permissions());
    let handle = rpc
        .start_flow::<u64, u64>(&alice, "test.TradeValue", 21)
        .await
        .expect("Permitted start should succeed");
    let result = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("Flow should finish in time")
        .expect("Flow should succeed");
    assert_eq!(result, 42);
}

#[tokio::test]
async fn test_start_without_permission_is_denied() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    let mallory = RpcUser::new("mallory", Vec::<String>::new());
    let result = rpc.start_flow::<u64, u64>(&mallory, "test.TradeValue", 21).await;
    match result {
        Err(FlowError::PermissionDenied(message)) => {
            assert!(message.contains("mallory"));
            assert!(message.contains("test.TradeValue"));
        }
        other => panic!("Expected PermissionDenied, got {:?}", other.map(|_| ())),
    }
    // Nothing was started.
    assert!(node_a.manager.state_machines().is_empty());
}

#[tokio::test]
async fn test_global_override_grants_all_flows() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    let admin = RpcUser::new("admin", vec![ALL_FLOWS_PERMISSION.to_string()]);
    let handle = rpc
        .start_flow::<u64, u64>(&admin, "test.TradeValue", 5)
        .await
        .expect("Override should grant the start");
    assert_eq!(handle.result().await.expect("Flow should succeed"), 10);
}

#[tokio::test]
async fn test_flow_without_rpc_marker_is_not_startable() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    // Even the override cannot start a flow that lacks the marker.
    let admin = RpcUser::new("admin", vec![ALL_FLOWS_PERMISSION.to_string()]);
    let result = rpc.start_flow::<u64, u64>(&admin, "test.Internal", 1).await;
    assert!(matches!(result, Err(FlowError::NotStartableByRpc(_))));

    let unknown = rpc.start_flow::<u64, u64>(&admin, "test.Missing", 1).await;
    assert!(matches!(unknown, Err(FlowError::NotFound(_))));
}

#[tokio::test]
async fn test_state_machines_feed_reports_added_then_removed() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    let mut feed = rpc.state_machines_feed();
    assert!(feed.snapshot.is_empty());

    let alice = RpcUser::new("alice", trade_value_permissions());
    let handle = rpc
        .start_flow::<u64, u64>(&alice, "test.TradeValue", 1)
        .await
        .expect("Start should succeed");
    let run_id = handle.run_id();

    let added = tokio::time::timeout(Duration::from_secs(5), feed.updates.recv())
        .await
        .expect("Added should arrive")
        .expect("Stream should stay open");
    match added {
        StateMachineUpdate::Added { descriptor } => {
            assert_eq!(descriptor.run_id, run_id);
            assert_eq!(descriptor.flow_name, "test.TradeValue");
        }
        other => panic!("Expected Added first, got {:?}", other),
    }

    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), feed.updates.recv())
            .await
            .expect("Removed should arrive")
            .expect("Stream should stay open");
        match update {
            StateMachineUpdate::Removed { run_id: removed, .. } if removed == run_id => break,
            _ => continue,
        }
    }
    handle.result().await.expect("Flow should succeed");
}

#[tokio::test]
async fn test_tracked_start_streams_progress() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    let alice = RpcUser::new("alice", trade_value_permissions());
    let tracked = rpc
        .start_tracked_flow::<u64, u64>(&alice, "test.TradeValue", 3)
        .await
        .expect("Tracked start should succeed");

    let mut progress = tracked.progress;
    let mut labels: Vec<String> = progress.snapshot.0.clone();
    while !labels.contains(&"Done".to_string()) {
        let step = tokio::time::timeout(Duration::from_secs(5), progress.updates.recv())
            .await
            .expect("Progress should arrive")
            .expect("Stream should stay open");
        labels.push(step.label);
    }
    assert!(labels.contains(&"Proposing".to_string()));

    assert_eq!(tracked.handle.result().await.expect("Flow should succeed"), 6);
}

#[tokio::test]
async fn test_registered_flows_lists_initiators() {
    let net = TestNet::new();
    let (node_a, _node_b) = two_party_setup(&net).await;
    let rpc = FlowRpcService::new(node_a.manager.clone());

    let registered = rpc.registered_flows();
    assert_eq!(
        registered,
        vec!["test.Internal".to_string(), "test.TradeValue".to_string()]
    );
}
