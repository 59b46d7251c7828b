mod common;

use common::{wait_until, TestNet};
use ledgerflow::session::SessionMessage;
use ledgerflow::{FlowContext, InitiatedBy, Party};
use std::time::Duration;

/// Two-party ping-pong: A sends 10 expecting two replies, B answers 20,
/// echoes, answers 21. Verifies the final result and the exact wire trace.
#[tokio::test]
async fn test_ping_pong_between_two_nodes() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.PingPong",
            1,
            true,
            |start: u32, mut ctx: FlowContext| async move {
                let peer = Party::new("BankB");
                let first: u32 = ctx.send_and_receive(&peer, &start).await?;
                let second: u32 = ctx.send_and_receive(&peer, &(start + 1)).await?;
                Ok((first, second))
            },
        )
        .expect("Should register initiator");
    node_b
        .manager
        .register_responder("test.PingPong", 1, |mut ctx: FlowContext, party: Party| async move {
            ctx.send(&party, &20u32).await?;
            let echoed: u32 = ctx.receive(&party).await?;
            ctx.send(&party, &(echoed + 10)).await?;
            Ok(())
        })
        .expect("Should register responder");

    node_a.open(&net).await;
    node_b.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<u32, (u32, u32)>("test.PingPong", 10, InitiatedBy::Shell)
        .await
        .expect("Flow should start");

    let result = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("Flow should finish in time")
        .expect("Flow should succeed");
    assert_eq!(result, (20, 21));

    // Both checkpoints are gone once both flows are terminal.
    assert!(
        wait_until(
            || node_a.store.is_empty() && node_b.store.is_empty(),
            Duration::from_secs(5)
        )
        .await,
        "Terminal flows must leave no checkpoint behind"
    );

    // Exact transfers on the wire: init with the first payload, confirm,
    // three data messages, then one normal end in each direction (their
    // relative order is racy).
    assert!(
        wait_until(|| net.bus.tags().len() == 7, Duration::from_secs(5)).await,
        "Expected seven transfers, got {:?}",
        net.bus.tags()
    );
    let tags = net.bus.tags();
    assert_eq!(
        &tags[..5],
        &["Init", "Confirm", "Data", "Data", "Data"],
        "Unexpected wire prefix: {:?}",
        tags
    );
    assert_eq!(tags.len(), 7, "Unexpected wire trace: {:?}", tags);
    assert_eq!(tags[5..].iter().filter(|t| *t == "NormalEnd").count(), 2);

    let trace = net.bus.trace();
    match &trace[0].message {
        SessionMessage::Init(init) => {
            assert_eq!(init.flow_name, "test.PingPong");
            assert_eq!(init.flow_version, 1);
            assert_eq!(init.first_payload.as_deref(), Some(b"10".as_ref()));
        }
        other => panic!("Expected init first, got {:?}", other),
    }
    let payloads: Vec<(String, Vec<u8>)> = trace
        .iter()
        .filter_map(|t| match &t.message {
            SessionMessage::Data(d) => Some((t.from.clone(), d.payload.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        payloads,
        vec![
            ("bank-b-0".to_string(), b"20".to_vec()),
            ("bank-a-0".to_string(), b"11".to_vec()),
            ("bank-b-0".to_string(), b"21".to_vec()),
        ]
    );
}

/// Messages on one session arrive in send order.
#[tokio::test]
async fn test_session_delivery_preserves_send_order() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");
    let node_b = net.node("bank-b-0", "BankB");

    node_a
        .manager
        .register_initiator(
            "test.Burst",
            1,
            true,
            |count: u32, mut ctx: FlowContext| async move {
                let peer = Party::new("BankB");
                ctx.send(&peer, &count).await?;
                for i in 0..count {
                    ctx.send(&peer, &i).await?;
                }
                let echoed: Vec<u32> = ctx.receive(&peer).await?;
                Ok(echoed)
            },
        )
        .expect("Should register initiator");
    node_b
        .manager
        .register_responder("test.Burst", 1, |mut ctx: FlowContext, party: Party| async move {
            let count: u32 = ctx.init_payload()?.expect("Init should carry the count");
            let mut seen = Vec::new();
            for _ in 0..count {
                seen.push(ctx.receive::<u32>(&party).await?);
            }
            ctx.send(&party, &seen).await?;
            Ok(())
        })
        .expect("Should register responder");

    node_a.open(&net).await;
    node_b.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<u32, Vec<u32>>("test.Burst", 8, InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    let echoed = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("Flow should finish in time")
        .expect("Flow should succeed");
    assert_eq!(echoed, (0..8).collect::<Vec<u32>>());
}

/// A flow that only sleeps still checkpoints and completes.
#[tokio::test]
async fn test_sleep_suspension() {
    let net = TestNet::new();
    let node_a = net.node("bank-a-0", "BankA");

    node_a
        .manager
        .register_initiator("test.Nap", 1, true, |_input: (), mut ctx: FlowContext| async move {
            ctx.sleep_for(Duration::from_millis(20)).await?;
            Ok("rested".to_string())
        })
        .expect("Should register initiator");
    node_a.open(&net).await;

    let handle = node_a
        .manager
        .start_flow::<(), String>("test.Nap", (), InitiatedBy::Shell)
        .await
        .expect("Flow should start");
    let result = tokio::time::timeout(Duration::from_secs(5), handle.result())
        .await
        .expect("Flow should finish in time")
        .expect("Flow should succeed");
    assert_eq!(result, "rested");
    assert!(wait_until(|| node_a.store.is_empty(), Duration::from_secs(5)).await);
}
