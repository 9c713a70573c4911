use canopy_collab::{Envelope, Frame, DEFAULT_BINARY_THRESHOLD};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use uuid::Uuid;

fn bench_envelope_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("Envelope");
    group.throughput(Throughput::Elements(1));
    let doc_id = Uuid::new_v4();

    // Typical keystroke-sized update goes out as JSON.
    let small = Envelope::update(doc_id, vec![7u8; 64]);
    group.bench_function("encode_small_update", |b| {
        b.iter(|| black_box(small.encode(DEFAULT_BINARY_THRESHOLD).unwrap()))
    });

    let small_frame = small.encode(DEFAULT_BINARY_THRESHOLD).unwrap();
    group.bench_function("decode_small_update", |b| {
        b.iter(|| black_box(small_frame.decode().unwrap()))
    });

    // Snapshots switch to the binary frame.
    let large = Envelope::Snapshot {
        doc_id,
        snapshot: vec![42u8; 256 * 1024],
    };
    let large_frame: Frame = large.encode(DEFAULT_BINARY_THRESHOLD).unwrap();
    group.bench_function("encode_snapshot_binary", |b| {
        b.iter(|| black_box(large.encode(DEFAULT_BINARY_THRESHOLD).unwrap()))
    });
    group.bench_function("decode_snapshot_binary", |b| {
        b.iter(|| black_box(large_frame.decode().unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_envelope_encoding);
criterion_main!(benches);
