use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vaultfs_core::frame::{decrypt, encrypt, FrameKey};

fn bench_round_trip(c: &mut Criterion) {
    let key = FrameKey::new([0x11u8; 32]);
    let mut group = c.benchmark_group("frame_round_trip");

    for size in [4 * 1024usize, 256 * 1024, 1024 * 1024] {
        let plaintext = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &plaintext, |b, pt| {
            b.iter(|| black_box(encrypt(&key, pt).unwrap()));
        });

        let envelope = encrypt(&key, &plaintext).unwrap();
        group.bench_with_input(BenchmarkId::new("decrypt", size), &envelope, |b, env| {
            b.iter(|| black_box(decrypt(&key, env, size as u64).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
