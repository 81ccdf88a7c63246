//! End-to-end demonstration of the Conclave consensus core.
//!
//! Spins up the full runtime against the scriptable mock executor, walks
//! a handful of transactions through their lifecycle, and prints what the
//! explorer would show: status traces, consensus journals, votes,
//! snapshots. No network, no external executor, no persistence — a clean
//! room for watching the machinery move.
//!
//! Run with:
//!
//! ```text
//! cargo run --example demo -p conclave-core
//! ```

use std::sync::Arc;
use std::time::Duration;

use conclave_core::config::CoreConfig;
use conclave_core::events::Topic;
use conclave_core::executor::{MockBehavior, MockExecutor, ValidatorExecutor};
use conclave_core::primitives::ids::Address;
use conclave_core::primitives::keys::Keypair;
use conclave_core::runtime::CoreRuntime;
use conclave_core::transaction::envelope::{SignedEnvelope, TxPayload};
use conclave_core::transaction::types::{TransactionKind, TransactionStatus};

const CONTRACT: Address = Address([0xC0; 20]);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("conclave_core=info")
        .init();

    banner("1. Boot");

    let executor = Arc::new(MockExecutor::new());
    let executor_dyn: Arc<dyn ValidatorExecutor> = executor.clone();
    let config = CoreConfig {
        finality_window: Duration::from_secs(2),
        crawler_period: Duration::from_millis(50),
        leader_timeout: Duration::from_millis(500),
        validator_timeout: Duration::from_millis(500),
        worker_count: 4,
        ..CoreConfig::default()
    };
    let runtime = CoreRuntime::start_temporary(config, executor_dyn)?;

    for i in 1..=5u8 {
        let keypair = Keypair::from_seed(&[i; 32]);
        runtime.registry().add(
            keypair.address(),
            1_000 * i as u64,
            "ollama",
            "llama3",
            serde_json::json!({ "temperature": 0.0 }),
        )?;
    }
    println!("  {} validators registered, stake-weighted draw", runtime.registry().len());

    banner("2. Happy path");

    let alice = Keypair::generate();
    let events = runtime.subscribe(Topic::Global);

    let raw = call(&alice, 0, b"method:greet");
    let hash = runtime.submit_raw(&raw)?;
    println!("  submitted {}", hash);

    wait_until(&runtime, &hash, TransactionStatus::Finalized).await;
    println!("  status trace:");
    while let Some(event) = events.try_recv() {
        println!("    {:>18}  round {}", event.status.to_string(), event.round_index);
    }

    let tx = runtime.get_transaction(&hash)?;
    let round = &tx.consensus_history[0];
    println!(
        "  round 0 closed {:?} with {} votes, leader {}",
        round.consensus_round,
        round.validator_results.len(),
        round.leader.map(|l| l.short()).unwrap_or_default(),
    );

    banner("3. Leader timeout and rotation");

    let bob = Keypair::generate();
    let raw = call(&bob, 0, b"method:slow");
    let hash = SignedEnvelope::hash_raw(&raw);

    // The committee draw is deterministic, so the round-0 leader can be
    // sabotaged before submission.
    let committee = runtime.registry().select_committee(&hash, 0, 5, &[])?;
    executor.script(committee.leader().address, MockBehavior::Hang);
    println!("  scripted leader {} to hang", committee.leader().address.short());

    runtime.submit_raw(&raw)?;
    wait_until(&runtime, &hash, TransactionStatus::Accepted).await;

    let tx = runtime.get_transaction(&hash)?;
    println!(
        "  recovered after {} rotation(s): round 0 = {:?}, round 1 = {:?}",
        tx.rotation_count,
        tx.consensus_history[0].consensus_round,
        tx.consensus_history[1].consensus_round,
    );

    banner("4. Appeal with a doubled committee");

    let receipt = runtime.appeal(&tx.hash)?;
    println!(
        "  appeal #{} accepted, committee grows to {}",
        receipt.appeal_count, receipt.committee_size
    );
    wait_until(&runtime, &tx.hash, TransactionStatus::Accepted).await;
    let tx = runtime.get_transaction(&tx.hash)?;
    println!(
        "  appeal round {} closed {:?} (appeal flag: {})",
        tx.consensus_history.len() - 1,
        tx.last_round().unwrap().consensus_round,
        tx.last_round().unwrap().appeal,
    );

    banner("5. Shut down");

    runtime.shutdown().await;
    println!("  clean exit");
    Ok(())
}

fn call(keypair: &Keypair, nonce: u64, input: &[u8]) -> Vec<u8> {
    SignedEnvelope::sign(
        TxPayload {
            from: keypair.address(),
            to: Some(CONTRACT),
            kind: TransactionKind::Call,
            nonce,
            value: 0,
            input: input.to_vec(),
            committee_size: Some(5),
            execution_mode: None,
            max_rotations: None,
        },
        keypair,
    )
    .encode()
}

async fn wait_until(
    runtime: &CoreRuntime,
    hash: &conclave_core::primitives::ids::TxHash,
    status: TransactionStatus,
) {
    loop {
        match runtime.get_status(hash) {
            Ok(current) if current == status => return,
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
}

fn banner(title: &str) {
    println!();
    println!("=== {title} ===");
}
