// BDHKE benchmarks for the ecash mint.
//
// Covers hash-to-curve, the full blind/sign/unblind/verify round trip, and
// what the mint pays per proof when it verifies a split of growing size.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ecash_protocol::crypto::bdhke::{blind_message, hash_to_curve, sign, unblind, verify};
use ecash_protocol::crypto::KeySet;

fn bench_hash_to_curve(c: &mut Criterion) {
    c.bench_function("bdhke/hash_to_curve", |b| {
        b.iter(|| hash_to_curve(b"test_message"));
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let keyset = KeySet::derive("bench master", "0/0/0/0").unwrap();
    let a = *keyset.private_key(8).unwrap();
    let big_a = *keyset.public_key(8).unwrap();

    c.bench_function("bdhke/blind_sign_unblind_verify", |b| {
        b.iter(|| {
            let (b_, r) = blind_message(b"bench secret", None).unwrap();
            let c_ = sign(&b_, &a).unwrap();
            let c = unblind(&c_, &r, &big_a).unwrap();
            verify(b"bench secret", &c, &a).unwrap()
        });
    });
}

fn bench_verify_batch(c: &mut Criterion) {
    let keyset = KeySet::derive("bench master", "0/0/0/0").unwrap();
    let mut group = c.benchmark_group("bdhke/verify_proofs");

    for size in [1usize, 8, 64] {
        let proofs: Vec<_> = (0..size)
            .map(|i| {
                let secret = format!("secret-{i}");
                let (b_, r) = blind_message(secret.as_bytes(), None).unwrap();
                let c_ = sign(&b_, keyset.private_key(1).unwrap()).unwrap();
                let c = unblind(&c_, &r, keyset.public_key(1).unwrap()).unwrap();
                (secret, c)
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &proofs, |b, proofs| {
            b.iter(|| {
                proofs
                    .iter()
                    .all(|(secret, c)| verify(secret.as_bytes(), c, keyset.private_key(1).unwrap()).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_keyset_derivation(c: &mut Criterion) {
    c.bench_function("keyset/derive_64_keys", |b| {
        b.iter(|| KeySet::derive("bench master", "0/0/0/0"));
    });
}

criterion_group!(
    benches,
    bench_hash_to_curve,
    bench_round_trip,
    bench_verify_batch,
    bench_keyset_derivation
);
criterion_main!(benches);
