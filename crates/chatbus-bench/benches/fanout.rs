//! Fan-out benchmarks for the chatbus broker.
//!
//! Publishes go through `Broker::post` and every subscriber queue is drained
//! inside the measured loop, so queues never fill up.

use chatbus_core::{Broker, BrokerConfig, ChannelStore, ConnectionId, MessageDraft, Outbound};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Instant;
use tokio::sync::mpsc::Receiver;

const CHANNEL: &str = "broadcast";

/// A broker with `subscribers` connections on one channel.
fn broker_with(subscribers: usize) -> (Broker, Vec<Receiver<Outbound>>) {
    let broker = Broker::with_config(BrokerConfig {
        max_messages: 50,
        ..BrokerConfig::default()
    });
    broker.create_channel(CHANNEL, "bench").unwrap();

    let receivers = (0..subscribers)
        .map(|i| {
            let handle = ConnectionId::new(format!("conn-{i}"));
            let (sink, mut rx) = broker.sink();
            broker.connect(&handle, sink);
            broker
                .subscribe(&handle, CHANNEL, &format!("user-{i}"))
                .unwrap();
            while rx.try_recv().is_ok() {}
            rx
        })
        .collect();

    (broker, receivers)
}

fn drain(receivers: &mut [Receiver<Outbound>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// Benchmark publish fan-out by subscriber count.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (broker, mut receivers) = broker_with(size);
            let text = "x".repeat(64);

            b.iter(|| {
                let published = broker.post(CHANNEL, black_box(&text), "publisher").unwrap();
                drain(&mut receivers);
                published.recipients
            });
        });
    }

    group.finish();
}

/// Benchmark subscribe including the history replay.
fn bench_subscribe(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscribe");

    group.bench_function("with_full_history", |b| {
        b.iter_custom(|iters| {
            let (broker, _) = broker_with(0);
            for i in 0..50 {
                broker.post(CHANNEL, &format!("message {i}"), "seed").unwrap();
            }

            let start = Instant::now();
            for i in 0..iters {
                let handle = ConnectionId::new(format!("conn-{i}"));
                let (sink, rx) = broker.sink();
                broker.connect(&handle, sink);
                broker.subscribe(&handle, CHANNEL, "reader").unwrap();
                broker.teardown(&handle);
                drop(rx);
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark appends to a full ring.
fn bench_channel_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_store");

    group.bench_function("append_at_capacity", |b| {
        let store = ChannelStore::new(50);
        store.create(CHANNEL, "bench").unwrap();
        for i in 0..50 {
            store
                .add_message(CHANNEL, MessageDraft::new("seed", format!("message {i}")))
                .unwrap();
        }

        b.iter(|| {
            store
                .add_message(CHANNEL, black_box(MessageDraft::new("alice", "hello")))
                .unwrap()
        });
    });

    group.bench_function("recent_20", |b| {
        let store = ChannelStore::new(50);
        store.create(CHANNEL, "bench").unwrap();
        for i in 0..50 {
            store
                .add_message(CHANNEL, MessageDraft::new("seed", format!("message {i}")))
                .unwrap();
        }

        b.iter(|| store.messages(black_box(CHANNEL), Some(20)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_fanout, bench_subscribe, bench_channel_store);
criterion_main!(benches);
