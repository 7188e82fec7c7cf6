use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bacnet_mstp::datalink::mstp::crc::{data_crc, header_crc};
use bacnet_mstp::datalink::mstp::frame::{FrameType, MstpFrame};

fn crc_benchmark(c: &mut Criterion) {
    let payload = vec![0xA5u8; 501];

    c.bench_function("header_crc", |b| {
        b.iter(|| header_crc(black_box(&[0x05, 0x0A, 0x14, 0x01, 0xF5])))
    });

    c.bench_function("data_crc_501", |b| b.iter(|| data_crc(black_box(&payload))));
}

fn frame_benchmark(c: &mut Criterion) {
    let payload = vec![0x42u8; 480];
    let frame = MstpFrame::npdu(10, 20, payload, false).unwrap();
    let wire = frame.encode();

    c.bench_function("frame_encode_480", |b| {
        b.iter(|| black_box(&frame).encode())
    });

    c.bench_function("frame_decode_480", |b| {
        b.iter(|| MstpFrame::decode(black_box(&wire)).unwrap())
    });

    let token = MstpFrame::new(FrameType::Token, 1, 2, Vec::new()).unwrap();
    c.bench_function("frame_encode_token", |b| b.iter(|| black_box(&token).encode()));
}

criterion_group!(benches, crc_benchmark, frame_benchmark);
criterion_main!(benches);
