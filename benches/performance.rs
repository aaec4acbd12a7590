use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memring::protocol::{Command, Frame, FrameCodec, Opcode, Status, HEADER_LEN};

/// Response frame carrying a value of `size` bytes
fn get_response(size: usize, opaque: u32) -> Frame {
    let mut frame = Frame::response(Opcode::Get.as_u8(), Status::NoError.as_u16(), opaque);
    frame.extras = vec![0u8; 4].into();
    frame.value = vec![b'x'; size].into();
    frame.cas = 42;
    frame
}

/// Command encoding benchmarks
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [16usize, 1024, 64 * 1024].iter() {
        let command = Command::set("bench:key", vec![b'v'; *size]).with_expiration(300);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("set", size), size, |b, _| {
            let mut buf = BytesMut::with_capacity(size + 64);
            b.iter(|| {
                buf.clear();
                let frame = command.to_frame(black_box(7));
                FrameCodec::encode_into(&mut buf, &frame).unwrap();
                black_box(buf.len());
            });
        });
    }

    group.bench_function("get", |b| {
        let command = Command::get("bench:key");
        b.iter(|| black_box(FrameCodec::encode(&command.to_frame(black_box(7))).unwrap()));
    });

    group.finish();
}

/// Response decoding benchmarks
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in [16usize, 1024, 64 * 1024].iter() {
        let encoded = FrameCodec::encode(&get_response(*size, 1)).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("get_response", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                black_box(FrameCodec::decode_buf(&mut buf).unwrap());
            });
        });
    }

    // a read buffer holding a full pipeline of replies
    for depth in [16usize, 256].iter() {
        let mut pipeline = BytesMut::new();
        for opaque in 0..*depth {
            FrameCodec::encode_into(&mut pipeline, &get_response(128, opaque as u32)).unwrap();
        }
        let pipeline = pipeline.freeze();
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::new("pipeline", depth), &pipeline, |b, pipeline| {
            b.iter(|| {
                let mut buf = BytesMut::from(&pipeline[..]);
                let mut frames = 0;
                while let Some(frame) = FrameCodec::decode_buf(&mut buf).unwrap() {
                    black_box(&frame);
                    frames += 1;
                }
                assert_eq!(frames, pipeline.len() / (HEADER_LEN + 4 + 128));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
