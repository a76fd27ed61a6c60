//! Frame codec throughput.
//!
//! Run with:
//! ```sh
//! cargo bench -p scanrust-core --bench frame_codec
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use scanrust_core::{Command, RequestFrame, ResponseFrame, Status};
use std::hint::black_box;

const SIZES: [usize; 4] = [0, 64, 4 * 1024, 32 * 1024];

fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");

    for size in SIZES {
        let frame = RequestFrame::with_payload(Command::WriteRegisterWord, vec![0xA5; size]).unwrap();
        group.throughput(Throughput::Bytes(frame.size() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode()));
        });
    }

    group.finish();
}

fn bench_decode_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_response");

    for size in SIZES {
        let encoded = ResponseFrame::with_payload(Status::Ok, vec![0x5A; size])
            .unwrap()
            .encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| ResponseFrame::decode(black_box(encoded.clone())).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_request, bench_decode_response);
criterion_main!(benches);
