use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use notecanvas_collab::broadcast::BroadcastGroup;
use notecanvas_collab::ot::{apply, transform, Document, Operation};
use notecanvas_collab::protocol::SyncMessage;
use notecanvas_collab::sequencer::{Sequenced, Sequencer, Submission};
use notecanvas_collab::storage::{NoteSnapshot, PersistenceStore, RocksStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_transform(c: &mut Criterion) {
    let a = Uuid::from_u128(1);
    let b = Uuid::from_u128(2);
    let ins = Operation::insert(40, "hello", a, 1);
    let del = Operation::delete(10, 60, b, 2);

    c.bench_function("transform_insert_vs_insert", |bench| {
        let other = Operation::insert(40, "world", b, 1);
        bench.iter(|| black_box(transform(black_box(&ins), black_box(&other))))
    });

    c.bench_function("transform_delete_splits_around_insert", |bench| {
        bench.iter(|| black_box(transform(black_box(&del), black_box(&ins))))
    });
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_insert_middle");
    for size in [1_000usize, 10_000, 100_000] {
        let doc = Document::new("x".repeat(size));
        let op = Operation::insert(size / 2, "inserted", Uuid::nil(), 0);
        group.bench_with_input(BenchmarkId::from_parameter(size), &doc, |b, doc| {
            b.iter(|| black_box(apply(doc, &op).unwrap()))
        });
    }
    group.finish();
}

fn bench_sequencer_stale_submissions(c: &mut Criterion) {
    // Each submission is 50 versions behind and must be transformed past
    // the intervening log.
    c.bench_function("sequencer_submit_50_behind", |b| {
        b.iter_batched(
            || {
                let mut seq = Sequencer::with_document(Document::new("seed"));
                let author = Uuid::from_u128(7);
                for i in 0..50u64 {
                    seq.receive_operation(Operation::insert(0, "a", author, i), i).unwrap();
                }
                seq
            },
            |mut seq| {
                let author = Uuid::from_u128(9);
                let result = seq.submit(Submission {
                    id: Uuid::new_v4(),
                    client_id: author,
                    operation: Operation::insert(2, "zz", author, 99),
                    base_version: 0,
                });
                black_box(result.unwrap());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_remote_op_encode(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let entry = Sequenced {
        operation: Operation::insert(120, "typed text", Uuid::new_v4(), 1),
        version: 4_000,
        client_id: Some(Uuid::new_v4()),
        submission_id: Some(Uuid::new_v4()),
    };

    c.bench_function("remote_op_encode", |b| {
        b.iter(|| black_box(SyncMessage::remote_op(doc, black_box(&entry)).unwrap().encode().unwrap()))
    });

    let encoded = SyncMessage::remote_op(doc, &entry).unwrap().encode().unwrap();
    c.bench_function("remote_op_decode", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap().sequenced().unwrap()))
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let _receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let payload = Arc::new(vec![0u8; 96]);

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| black_box(group.broadcast_raw(payload.clone())))
    });
}

fn bench_version_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("bench_db"))).unwrap();
    let note = Uuid::new_v4();
    let snapshot = NoteSnapshot {
        title: "Bench".into(),
        content: "lorem ipsum dolor sit amet ".repeat(400),
        tags: vec!["bench".into()],
    };

    c.bench_function("rocks_append_version_10KB", |b| {
        b.iter(|| black_box(store.append_version(note, &snapshot).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_transform,
    bench_apply,
    bench_sequencer_stale_submissions,
    bench_remote_op_encode,
    bench_broadcast_fan_out,
    bench_version_snapshot,
);
criterion_main!(benches);
