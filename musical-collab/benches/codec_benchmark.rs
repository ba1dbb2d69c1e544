use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use musical_collab::broadcast::{Channel, ClientLink, FanOut};
use musical_collab::{
    AuthorId, BirdsEyeView, Contribution, DesignId, EntityId, Instruction, LogReporter, LogStore,
    NullObserver, Rgba, Vec3,
};
use tokio::sync::mpsc;

fn full_contribution() -> Instruction {
    Contribution {
        author: AuthorId(3),
        entity: EntityId::new(3, 42),
        design: DesignId::new(0, 7),
        offset: Vec3::new(1.0, 2.0, 3.0),
        bounds: Vec3::new(0.5, 0.5, 0.5),
        angles: Vec3::new(0.0, 90.0, 0.0),
        colour: Rgba::new(0.2, 0.6, 0.1, 1.0),
        timing: 1_700_000_000_000_000_000,
        tweens: true,
        commit: true,
        ..Default::default()
    }
    .into()
}

fn bench_contribution_encode(c: &mut Criterion) {
    let instruction = full_contribution();
    c.bench_function("contribution_encode", |b| {
        b.iter(|| black_box(black_box(&instruction).encode().unwrap()))
    });
}

fn bench_contribution_decode(c: &mut Criterion) {
    let encoded = full_contribution().encode().unwrap();
    c.bench_function("contribution_decode", |b| {
        b.iter(|| black_box(Instruction::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_sparse_viewpoint_encode(c: &mut Criterion) {
    let view = Instruction::from(BirdsEyeView {
        author: AuthorId::HOST,
        timing: 1_700_000_000_000_000_000,
        ..Default::default()
    });
    c.bench_function("viewpoint_encode_sparse", |b| {
        b.iter(|| black_box(black_box(&view).encode().unwrap()))
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut store =
        LogStore::open(dir.path().join("bench.log"), 0, Arc::new(NullObserver)).unwrap();
    let instruction = Instruction::from(Contribution {
        author: AuthorId::HOST,
        entity: EntityId::new(0, 1),
        offset: Vec3::new(1.0, 2.0, 3.0),
        commit: true,
        ..Default::default()
    });

    c.bench_function("log_append_contribution", |b| {
        b.iter(|| black_box(store.write(black_box(&instruction)).unwrap()))
    });
}

fn bench_fan_out_100_clients(c: &mut Criterion) {
    let packet = Arc::new(full_contribution().encode_packet().unwrap());
    let mut fanout = FanOut::new();
    let mut queues = Vec::new();
    for author in 1..=100u16 {
        let (instructions_tx, instructions_rx) = mpsc::channel(1024);
        let (uploads_tx, uploads_rx) = mpsc::channel(1);
        fanout.insert(ClientLink::new(AuthorId(author), instructions_tx, uploads_tx));
        queues.push((instructions_rx, uploads_rx));
    }

    c.bench_function("fan_out_100_clients", |b| {
        b.iter(|| {
            let delivered = fanout.broadcast(Channel::Instructions, packet.clone(), &LogReporter);
            for (queue, _) in queues.iter_mut() {
                while queue.try_recv().is_ok() {}
            }
            black_box(delivered)
        })
    });
}

criterion_group!(
    benches,
    bench_contribution_encode,
    bench_contribution_decode,
    bench_sparse_viewpoint_encode,
    bench_log_append,
    bench_fan_out_100_clients,
);
criterion_main!(benches);
