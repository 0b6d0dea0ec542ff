use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rust_broker_core::broker::Broker;
use rust_broker_core::broker::config::BrokerConfig;
use rust_broker_core::broker::router::{Destination, ExchangeKind};
use rust_broker_core::message::ack::AckMode;
use rust_broker_core::message::record::ProducerRecord;
use rust_broker_core::subscriber::types::JoinOptions;
use std::collections::BTreeMap;

fn broker_with_topic(partitions: u32) -> Broker {
    let broker = Broker::new("bench", BrokerConfig::default()).unwrap();
    broker.create_topic("orders", Some(partitions)).unwrap();
    broker
}

fn broker_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker");

    group.bench_function("append", |b| {
        let broker = broker_with_topic(1);
        let payload = vec![0u8; 128];
        b.iter(|| {
            broker
                .store()
                .append("orders", 0, None, payload.clone(), BTreeMap::new())
                .unwrap()
        })
    });

    group.bench_function("publish_topic_exchange", |b| {
        let broker = broker_with_topic(4);
        broker.create_topic("payments", Some(1)).unwrap();
        broker.declare_exchange("events", ExchangeKind::Topic, None).unwrap();
        broker
            .create_binding("events", "order.#", Destination::topic("orders"))
            .unwrap();
        broker
            .create_binding("events", "#.payments", Destination::topic("payments"))
            .unwrap();
        b.iter(|| {
            let record = ProducerRecord::new(vec![0u8; 128]).with_routing_key("order.eu.payments");
            broker.publish("events", record).unwrap()
        })
    });

    group.bench_function("poll_ack_cycle", |b| {
        b.iter_batched(
            || {
                let broker = broker_with_topic(1);
                for _ in 0..64 {
                    broker
                        .publish("orders", ProducerRecord::new(vec![0u8; 64]))
                        .unwrap();
                }
                broker
                    .join("bench", "c1", &["orders"], JoinOptions::new().with_prefetch(16))
                    .unwrap();
                broker
            },
            |broker| loop {
                let batch = broker.poll("c1", 16).unwrap();
                let Some(last) = batch.last() else {
                    break;
                };
                broker
                    .ack("c1", &last.partition, last.offset(), AckMode::Cumulative)
                    .unwrap();
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, broker_benchmark);
criterion_main!(benches);
