//! Benchmarks for queue naming and the envelope codec.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use stagequeue::core::{Envelope, Priority, TaskMeta};
use stagequeue::queues::QueueTopology;

fn topology_benchmark(c: &mut Criterion) {
    let topology = QueueTopology::new("shop", "resize", true, 5, false);

    c.bench_function("queue_name", |b| {
        b.iter(|| topology.queue_name(black_box(3)));
    });
    c.bench_function("output_queue_names", |b| {
        b.iter(|| topology.output_queue_names().len());
    });
}

fn envelope_benchmark(c: &mut Criterion) {
    let value = json!({"sku": "A-1001", "sizes": [64, 128, 256], "source": "s3://bucket/key.png"});
    let meta = TaskMeta::new(Priority::dynamic(|v| v["sizes"].as_array().map_or(0, Vec::len)))
        .with_attribute("trace", json!("abc123"));
    let body = Envelope::new(meta.resolve(&value), value.clone())
        .encode()
        .unwrap_or_default();

    c.bench_function("envelope_encode", |b| {
        b.iter(|| Envelope::new(meta.resolve(black_box(&value)), value.clone()).encode());
    });
    c.bench_function("envelope_decode", |b| {
        b.iter(|| Envelope::decode(black_box(&body)));
    });
}

criterion_group!(benches, topology_benchmark, envelope_benchmark);
criterion_main!(benches);
