//! Benchmarks for the wire codecs and per-packet crypto.
//!
//! Covers the receive hot path:
//! - Packet encode/decode
//! - Chat message encode/decode
//! - Padding
//! - Signature verification and duplicate filtering

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bitchat_protocol::{
    generate_signature, pad_to_optimal, unpad, verify_signature, ChatMessage, DuplicateFilter,
    Packet, PacketType, PeerId,
};

const KEY: &[u8] = b"bench-network-key";

fn sample_packet(payload_len: usize) -> Packet {
    Packet::new(
        PacketType::Message,
        PeerId::from_name("sender"),
        PeerId::BROADCAST,
        7,
        vec![0xAB; payload_len],
    )
    .signed(KEY)
}

/// Benchmark packet framing.
fn bench_packet_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_codec");

    for (name, len) in [("small_64B", 64), ("mtu_512B", 512), ("large_4KB", 4096)] {
        let packet = sample_packet(len);
        let encoded = packet.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| black_box(&packet).encode());
        });
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| Packet::decode(black_box(&encoded)));
        });
    }

    group.finish();
}

/// Benchmark chat message payloads.
fn bench_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_codec");

    let message = ChatMessage::new("alice", "Hello @bob, see you in #general", "peer1")
        .with_channel("#general")
        .with_mentions();
    let encoded = message.encode().unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&message).encode().unwrap());
    });
    group.bench_function("decode", |b| {
        b.iter(|| ChatMessage::decode(black_box(&encoded)).unwrap());
    });

    group.finish();
}

/// Benchmark padding.
fn bench_padding(c: &mut Criterion) {
    let mut group = c.benchmark_group("padding");

    let data = vec![0u8; 200];
    let padded = pad_to_optimal(&data).unwrap();
    group.throughput(Throughput::Bytes(padded.len() as u64));

    group.bench_function("pad_200B", |b| {
        b.iter(|| pad_to_optimal(black_box(&data)).unwrap());
    });
    group.bench_function("unpad_256B", |b| {
        b.iter(|| unpad(black_box(&padded)));
    });

    group.finish();
}

/// Benchmark the per-packet checks on receive.
fn bench_receive_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("receive_checks");

    let packet = sample_packet(256);
    let signing_bytes = packet.signing_bytes();
    let signature = generate_signature(&signing_bytes, KEY);

    group.bench_function("verify_signature", |b| {
        b.iter(|| verify_signature(black_box(&signing_bytes), signature.as_bytes(), KEY));
    });

    group.bench_function("dedup_check_and_insert", |b| {
        let mut filter = DuplicateFilter::adaptive(1000).unwrap();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            black_box(filter.check_and_insert(counter.to_be_bytes()))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_codec,
    bench_message_codec,
    bench_padding,
    bench_receive_checks
);
criterion_main!(benches);
