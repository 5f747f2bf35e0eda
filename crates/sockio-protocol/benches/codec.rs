//! Codec benchmarks for sockio-protocol.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sockio_protocol::{codec, Map, Packet, PacketCodec, Revision, Value};

fn chat_packet() -> Packet {
    let mut body = Map::new();
    body.insert("user".into(), Value::from("alice"));
    body.insert("text".into(), Value::from("x".repeat(64)));
    body.insert("ts".into(), Value::Int(1_700_000_000_000));
    Packet::event("/chat", "message", vec![Value::Object(body)]).with_id(42)
}

fn binary_packet() -> Packet {
    Packet::event(
        "/",
        "upload",
        vec![
            Value::from("file.bin"),
            Value::Binary(Bytes::from(vec![0u8; 4096])),
        ],
    )
}

fn bench_encode_text(c: &mut Criterion) {
    let packet = chat_packet();

    let mut group = c.benchmark_group("encode");
    group.bench_function("event_text", |b| {
        b.iter(|| codec::encode(black_box(&packet), Revision::V4))
    });
    group.finish();
}

fn bench_decode_text(c: &mut Criterion) {
    let frames = codec::encode(&chat_packet(), Revision::V4).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frames[0].len() as u64));
    group.bench_function("event_text", |b| {
        let mut decoder = PacketCodec::new(Revision::V4);
        b.iter(|| decoder.feed(black_box(frames[0].clone())).unwrap())
    });
    group.finish();
}

fn bench_roundtrip_binary(c: &mut Criterion) {
    let packet = binary_packet();

    c.bench_function("roundtrip_binary_4KiB", |b| {
        let mut decoder = PacketCodec::new(Revision::V4);
        b.iter(|| {
            let frames = codec::encode(black_box(&packet), Revision::V4).unwrap();
            frames
                .into_iter()
                .find_map(|frame| decoder.feed(frame).unwrap())
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_text,
    bench_decode_text,
    bench_roundtrip_binary
);
criterion_main!(benches);
