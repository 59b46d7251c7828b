mod common;

use common::{wait_until, TestNet};
use ledgerflow::{BusinessError, FlowContext, FlowError, InitiatedBy, Party};
use std::time::Duration;

/// A declared business error crosses the wire and re-raises at the peer
/// as an equal, peer-typed copy. No checkpoint survives on the thrower.
#[tokio::test]
async fn test_business_error_propagates_to_initiator() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.Doomed",
            1,
            true,
            |_input: (), mut ctx: FlowContext| async move {
                let reply: String = ctx
                    .send_and_receive(&Party::new("BankB"), &"anything".to_string())
                    .await?;
                Ok(reply)
            },
        )
        .expect("Should register initiator");
    node_b
        .manager
        .register_responder("test.Doomed", 1, |_ctx: FlowContext, _party: Party| async move {
            Err::<String, _>(FlowError::Business(BusinessError::new(
                "MyFlowException",
                "Nothing useful",
            )))
        })
        .expect("Should register responder");

    node_a.open(&net).await;
    node_b.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<(), String>("test.Doomed", (), InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    let result = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("Flow should finish in time");

    match result {
        Err(FlowError::Counterparty(error)) => {
            assert_eq!(error.class_name, "MyFlowException");
            assert_eq!(error.message, "Nothing useful");
        }
        other => panic!("Expected a counterparty business error, got {:?}", other),
    }
    assert!(
        wait_until(|| node_b.store.is_empty(), Duration::from_secs(5)).await,
        "No checkpoint may remain on the thrower"
    );
}

/// Undeclared errors are masked: the peer sees a bare error end and none
/// of the original message text.
#[tokio::test]
async fn test_non_business_error_is_masked() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.Buggy",
            1,
            true,
            |_input: (), mut ctx: FlowContext| async move {
                let reply: String = ctx
                    .send_and_receive(&Party::new("BankB"), &"anything".to_string())
                    .await?;
                Ok(reply)
            },
        )
        .expect("Should register initiator");
    node_b
        .manager
        .register_responder("test.Buggy", 1, |_ctx: FlowContext, _party: Party| async move {
            Err::<String, _>(FlowError::Fatal("evil bug!".to_string()))
        })
        .expect("Should register responder");

    node_a.open(&net).await;
    node_b.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<(), String>("test.Buggy", (), InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    let result = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("Flow should finish in time");

    match result {
        Err(FlowError::UnexpectedFlowEnd(message)) => {
            assert!(
                !message.contains("evil bug!"),
                "Local error detail must not cross the wire: {}",
                message
            );
        }
        other => panic!("Expected UnexpectedFlowEnd, got {:?}", other),
    }

    // The error end on the wire carries no body.
    let bare_error_ends = net
        .bus
        .trace()
        .iter()
        .filter(|t| match &t.message {
            ledgerflow::session::SessionMessage::ErrorEnd(end) => end.error.is_none(),
            _ => false,
        })
        .count();
    assert!(bare_error_ends >= 1, "Expected a bare error end on the wire");
}

/// The receive error names the expected type when the counterparty ends
/// without sending.
#[tokio::test]
async fn test_unexpected_end_names_expected_type() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.Silent",
            1,
            true,
            |_input: (), mut ctx: FlowContext| async move {
                let reply: u64 = ctx
                    .send_and_receive(&Party::new("BankB"), &"hello".to_string())
                    .await?;
                Ok(reply)
            },
        )
        .expect("Should register initiator");
    node_b
        .manager
        .register_responder("test.Silent", 1, |_ctx: FlowContext, _party: Party| async move {
            // Finishes without ever sending.
            Ok(())
        })
        .expect("Should register responder");

    node_a.open(&net).await;
    node_b.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<(), u64>("test.Silent", (), InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    match handle.result().await {
        Err(FlowError::UnexpectedFlowEnd(message)) => {
            assert!(message.contains("u64"), "Expected type hint in: {}", message);
        }
        other => panic!("Expected UnexpectedFlowEnd, got {:?}", other),
    }
}

/// Kill requests take effect at the next suspension point and leave no
/// checkpoint behind.
#[tokio::test]
async fn test_kill_flow_at_suspension_point() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");

    node_a
        .manager
        .register_initiator("test.Parked", 1, true, |_input: (), mut ctx: FlowContext| async move {
            ctx.wait_for_ledger_commit("tx-never").await?;
            Ok(())
        })
        .expect("Should register initiator");
    node_a.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<(), ()>("test.Parked", (), InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    let run_id = handle.run_id();
    assert!(node_a.manager.kill_flow(&run_id));

    // Killing an unknown flow reports false.
    assert!(!node_a.manager.kill_flow(&ledgerflow::RunId::new()));

    // The flow is parked on the ledger, not on its inbound queue, so it
    // notices the abort when the wait resolves.
    net.ledger.record_commit("tx-never");
    match tokio::time::timeout(Duration::from_secs(5), handle.result())
        .await
        .expect("Flow should finish in time")
    {
        Err(FlowError::Killed) => {}
        other => panic!("Expected Killed, got {:?}", other),
    }
    assert!(
        wait_until(|| node_a.store.is_empty(), Duration::from_secs(5)).await,
        "Killed flow must delete its checkpoint"
    );
}

/// A receive timeout surfaces as UnexpectedFlowEnd.
#[tokio::test]
async fn test_receive_timeout_converts_to_unexpected_end() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.Impatient",
            1,
            true,
            |_input: (), mut ctx: FlowContext| async move {
                let peer = Party::new("BankB");
                ctx.send(&peer, &"ping".to_string()).await?;
                let reply: String = ctx.receive_within(&peer, Duration::from_millis(200)).await?;
                Ok(reply)
            },
        )
        .expect("Should register initiator");
    node_b
        .manager
        .register_responder("test.Impatient", 1, |mut ctx: FlowContext, party: Party| async move {
            // Waits for a second message that never comes; the initiator's
            // timeout tears the session down instead.
            let unreachable: String = ctx.receive(&party).await?;
            Ok(unreachable)
        })
        .expect("Should register responder");

    node_a.open(&net).await;
    node_b.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<(), String>("test.Impatient", (), InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    match tokio::time::timeout(Duration::from_secs(5), handle.result())
        .await
        .expect("Flow should finish in time")
    {
        Err(FlowError::UnexpectedFlowEnd(message)) => {
            assert!(message.contains("Timed out"), "Unexpected message: {}", message);
        }
        other => panic!("Expected a timeout, got {:?}", other),
    }
}
