//! Benchmarks for range playback.
//!
//! Measures `Range` header handling and the cost of draining a bounded
//! `ReaderStream` at different read sizes.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use futures::StreamExt;
use reelforge::streaming::RangeSpec;
use std::io::Cursor;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

fn bench_parse_and_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_resolution");
    let size = 4 * 1024 * 1024 * 1024u64;

    for header in ["bytes=0-499", "bytes=1048576-", "bytes=-65536", "bytes=900-99999999999"] {
        group.bench_function(header, |b| {
            b.iter(|| {
                let spec = RangeSpec::parse(black_box(header)).unwrap();
                black_box(spec.resolve(black_box(size)).unwrap())
            });
        });
    }

    group.bench_function("malformed", |b| {
        b.iter(|| black_box(RangeSpec::parse(black_box("bytes=abc-def")).is_err()));
    });

    group.finish();
}

fn bench_bounded_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("bounded_stream");

    let data = vec![7u8; 8 * 1024 * 1024];
    let range_len = 2 * 1024 * 1024u64;
    group.throughput(Throughput::Bytes(range_len));

    for capacity in [8 * 1024, 64 * 1024, 256 * 1024] {
        group.bench_function(format!("drain_{}", capacity), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(data.as_slice());
                    cursor.set_position(1024 * 1024);
                    let mut stream = ReaderStream::with_capacity(cursor.take(range_len), capacity);
                    let mut total = 0usize;
                    while let Some(chunk) = stream.next().await {
                        total += chunk.unwrap().len();
                    }
                    black_box(total)
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_and_resolve, bench_bounded_stream);
criterion_main!(benches);
