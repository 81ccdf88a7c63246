// Transaction store benchmarks.
//
// Ingress and the CAS transition are the store's two hot paths: every
// submission hits `insert`, and every phase of every round hits
// `cas_status`. Both carry a flush, so these numbers are dominated by
// sled's write path — which is exactly what a capacity plan needs.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use conclave_core::primitives::ids::{Address, TxHash};
use conclave_core::store::tx_store::{TransactionStore, TxPatch};
use conclave_core::transaction::types::{
    ConsensusRoundEntry, ExecutionMode, Transaction, TransactionKind, TransactionStatus,
};

fn make_tx(seq: u64) -> Transaction {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&seq.to_be_bytes());
    let mut from = [0u8; 20];
    from[..8].copy_from_slice(&seq.to_be_bytes());
    Transaction {
        hash: TxHash(hash),
        from: Address(from),
        to: Some(Address([0xC0; 20])),
        kind: TransactionKind::Call,
        nonce: 0,
        input: vec![0u8; 128],
        value: 0,
        status: TransactionStatus::Pending,
        execution_mode: ExecutionMode::Normal,
        committee_size: 5,
        max_rotations: 3,
        rotation_count: 0,
        appeal_count: 0,
        consensus_history: Vec::new(),
        triggered_by_hash: None,
        current_worker: None,
        timestamp_awaiting_finalization: None,
        blocked_at: None,
        last_vote_timestamp: None,
        created_at: 0,
    }
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/insert");
    group.throughput(Throughput::Elements(1));
    group.bench_function("pending_row", |b| {
        let store = TransactionStore::open_temporary().unwrap();
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            store.insert(&make_tx(seq)).unwrap();
        });
    });
    group.finish();
}

fn bench_cas_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/cas");
    group.throughput(Throughput::Elements(1));
    group.bench_function("pending_to_activated", |b| {
        let store = TransactionStore::open_temporary().unwrap();
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            let tx = make_tx(seq);
            store.insert(&tx).unwrap();
            store
                .append_round(&tx.hash, ConsensusRoundEntry::new(0))
                .unwrap();
            store
                .cas_status(
                    &tx.hash,
                    TransactionStatus::Pending,
                    TransactionStatus::Activated,
                    TxPatch::none(),
                    1,
                )
                .unwrap();
        });
    });
    group.finish();
}

fn bench_journal_append(c: &mut Criterion) {
    let store = TransactionStore::open_temporary().unwrap();
    let tx = make_tx(1);
    store.insert(&tx).unwrap();

    let mut round = 0u32;
    c.bench_function("store/append_round", |b| {
        b.iter(|| {
            store
                .append_round(&tx.hash, ConsensusRoundEntry::new(round))
                .unwrap();
            round += 1;
        });
    });
}

criterion_group!(benches, bench_insert, bench_cas_transition, bench_journal_append);
criterion_main!(benches);
