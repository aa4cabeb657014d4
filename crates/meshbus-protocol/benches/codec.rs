//! Codec benchmarks for meshbus-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use meshbus_protocol::{codec, Message, NameEntry};

fn session_payload(size: usize) -> Message {
    Message::method_call(":1a2b3c4d.2", ":5e6f7a8b.3", "org.bench", "Echo")
        .with_session(77)
        .with_payload(vec![0u8; size])
}

fn bench_encode_small(c: &mut Criterion) {
    let msg = session_payload(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&msg))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&session_payload(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_exchange_names(c: &mut Criterion) {
    let names = (2..202)
        .map(|n| NameEntry::new(format!(":1a2b3c4d.{n}"), vec![format!("org.bench.Service{n}")]))
        .collect();
    let msg = Message::exchange_names(":1a2b3c4d.1", names);

    c.bench_function("exchange_names_200", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&msg)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_exchange_names
);
criterion_main!(benches);
