//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use waltz_protocol::checksum;
use waltz_protocol::frame::Frame;
use waltz_protocol::message::{AppendRequest, FeedData};
use waltz_protocol::{
    Decoder, Encoder, Message, MessageCodecV1, ReqId, MESSAGE_MAGIC, MESSAGE_VERSION,
};

fn create_append_request(payload_size: usize) -> Message {
    let data = Bytes::from("x".repeat(payload_size));
    AppendRequest {
        req_id: ReqId::new(17, 3, 1024),
        client_high_water_mark: 123_456,
        write_locks: vec![11, 12],
        read_locks: vec![21],
        append_locks: vec![],
        header: 0,
        checksum: checksum::compute(&data),
        data,
    }
    .into()
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(MESSAGE_MAGIC, MESSAGE_VERSION, Bytes::from("x".repeat(size)));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [100, 1000, 10000] {
        let frame = Frame::new(MESSAGE_MAGIC, MESSAGE_VERSION, Bytes::from("x".repeat(size)));
        let encoded = frame.encode().unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = encoded.clone();
                black_box(Frame::decode(&mut buf).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_append_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_encode");

    for size in [100, 1000, 10000] {
        let message = create_append_request(size);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| black_box(Encoder::encode_message(&MessageCodecV1, message).unwrap()));
        });
    }

    group.finish();
}

fn bench_append_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_decode");

    for size in [100, 1000, 10000] {
        let message = create_append_request(size);
        let encoded = Encoder::encode_message(&MessageCodecV1, &message).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_message(&MessageCodecV1).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_feed_batch_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed_batch_decode");

    for batch in [10, 100, 1000] {
        let mut stream = Vec::new();
        for transaction_id in 0..batch {
            let message: Message = FeedData {
                req_id: ReqId::new(17, 0, 1),
                transaction_id,
                header: 0,
            }
            .into();
            stream.extend_from_slice(&Encoder::encode_message(&MessageCodecV1, &message).unwrap());
        }

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(stream);
                let mut count = 0;
                while let Some(message) = decoder.decode_message(&MessageCodecV1).unwrap() {
                    black_box(message);
                    count += 1;
                }
                count
            });
        });
    }

    group.finish();
}

fn bench_crc32c(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc32c");

    for size in [100, 1000, 10000, 100000] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(crc32c::crc32c(data)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_append_encode,
    bench_append_decode,
    bench_feed_batch_decode,
    bench_crc32c,
);

criterion_main!(benches);
