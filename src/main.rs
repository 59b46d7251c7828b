use ledgerflow::{
    FlowContext, InMemoryCheckpointStore, InMemoryNetwork, LedgerTracker, NetworkDirectory,
    NodeConfig, Party,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting two in-process ledgerflow nodes...");

    let network = Arc::new(InMemoryNetwork::new());
    let directory = Arc::new(NetworkDirectory::new());
    directory.register(Party::new("BankA"), "bank-a-0".to_string());
    directory.register(Party::new("BankB"), "bank-b-0".to_string());

    let node_a = ledgerflow::FlowManager::new(
        NodeConfig::new("bank-a-0", "BankA"),
        Arc::new(InMemoryCheckpointStore::new()),
        network.clone(),
        directory.clone(),
        Arc::new(LedgerTracker::new()),
    );
    let node_b = ledgerflow::FlowManager::new(
        NodeConfig::new("bank-b-0", "BankB"),
        Arc::new(InMemoryCheckpointStore::new()),
        network.clone(),
        directory.clone(),
        Arc::new(LedgerTracker::new()),
    );

    node_a.register_initiator(
        "demo.PingPong",
        1,
        true,
        |start: u32, mut ctx: FlowContext| async move {
            let peer = Party::new("BankB");
            let first: u32 = ctx.send_and_receive(&peer, &start).await?;
            let second: u32 = ctx.send_and_receive(&peer, &(start + 1)).await?;
            Ok((first, second))
        },
    )?;
    node_b.register_responder("demo.PingPong", 1, |mut ctx: FlowContext, party: Party| async move {
        ctx.send(&party, &20u32).await?;
        let echoed: u32 = ctx.receive(&party).await?;
        ctx.send(&party, &(echoed + 10)).await?;
        Ok(())
    })?;

    let inbox_a = network.register("bank-a-0");
    let inbox_b = network.register("bank-b-0");
    node_a.start(inbox_a).await?;
    node_b.start(inbox_b).await?;

    println!("Starting demo.PingPong flow...");
    let handle = node_a
        .start_flow::<u32, (u32, u32)>("demo.PingPong", 10, ledgerflow::InitiatedBy::Shell)
        .await?;
    let (first, second) = handle.result().await?;
    println!("Flow completed: received {} and {}", first, second);

    node_a.shutdown().await;
    node_b.shutdown().await;
    println!("Demo completed successfully!");
    Ok(())
}
