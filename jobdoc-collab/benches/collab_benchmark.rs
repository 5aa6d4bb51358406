use criterion::{criterion_group, criterion_main, Criterion};
use jobdoc_collab::broadcast::BroadcastGroup;
use jobdoc_collab::protocol::{ClientMessage, ConnectionId, Frame, ServerMessage};
use jobdoc_collab::session::Session;
use jobdoc_ot::Operation;
use std::hint::black_box;
use tokio::sync::mpsc;

fn bench_decode_operation(c: &mut Criterion) {
    let text = r#"{"type":"operation","operation":{"type":"insert","position":120,"text":"Rust"},"base_sequence":41}"#;

    c.bench_function("client_message_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(text)).unwrap()))
    });
}

fn bench_submit_stale(c: &mut Criterion) {
    // Every submission is 100 operations behind
    c.bench_function("session_submit_100_behind", |b| {
        b.iter_batched(
            || {
                let mut session = Session::new("bench", "job-1", "x".repeat(2_000));
                for i in 0..100 {
                    session
                        .submit(Operation::insert(i * 7, "ab"), i as u64, "writer")
                        .unwrap();
                }
                session
            },
            |mut session| {
                black_box(
                    session
                        .submit(Operation::insert(500, "late"), 0, "reader")
                        .unwrap(),
                )
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let mut group = BroadcastGroup::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1_024);
        group.add_peer(ConnectionId::new(), format!("user-{i}"), tx);
        receivers.push(rx);
    }
    let frame: Frame = ServerMessage::pong().frame().unwrap();

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            let dropped = group.broadcast(black_box(&frame), None);
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            black_box(dropped)
        })
    });
}

criterion_group!(
    benches,
    bench_decode_operation,
    bench_submit_stale,
    bench_broadcast_100_peers,
);
criterion_main!(benches);
