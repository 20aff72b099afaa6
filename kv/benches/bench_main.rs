use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use meshkv::affinity::AffinityFunction;
use meshkv::encoding::{codec_for, EncodingFormat};
use meshkv::eviction::BlockLru;
use meshkv::topology::NodeId;
use meshkv::version::VersionOracle;

fn random_key(rng: &mut impl Rng) -> Vec<u8> {
    (0..16).map(|_| rng.gen()).collect()
}

fn bench_affinity_assignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("affinity_assignment");
    let mut rng = rand::thread_rng();

    for partitions in [64u32, 256, 1024] {
        let affinity = AffinityFunction::new(partitions, 2);
        let members: Vec<NodeId> = (0..12).collect();
        let key = random_key(&mut rng);

        group.bench_with_input(BenchmarkId::new("assign_for_key", partitions), &key, |b, key| {
            b.iter(|| affinity.assign_for_key(black_box(key), black_box(&members)));
        });
    }

    group.finish();
}

fn bench_version_oracle(c: &mut Criterion) {
    let oracle = VersionOracle::new(1, 0);
    c.bench_function("version_oracle_next", |b| {
        b.iter(|| black_box(oracle.next()));
    });
}

fn bench_block_lru(c: &mut Criterion) {
    c.bench_function("block_lru_put_and_evict", |b| {
        b.iter(|| {
            let mut lru = BlockLru::new(4096).with_block_size(64);
            for block in 0..128u64 {
                lru.on_put(black_box(block), 64);
            }
            black_box(lru.evict_while_over_budget())
        });
    });
}

fn bench_value_codecs(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_codecs");
    let mut rng = rand::thread_rng();

    for size in [64usize, 1024, 16384] {
        let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        group.throughput(Throughput::Bytes(size as u64));

        for format in [EncodingFormat::Base64, EncodingFormat::Hex] {
            let codec = codec_for(format);
            let encoded = codec.encode(&data).unwrap();

            group.bench_with_input(BenchmarkId::new(format!("{format}_encode"), size), &data, |b, data| {
                b.iter(|| codec.encode(black_box(data)).unwrap());
            });
            group.bench_with_input(BenchmarkId::new(format!("{format}_decode"), size), &encoded, |b, encoded| {
                b.iter(|| codec.decode(black_box(encoded)).unwrap());
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_affinity_assignment, bench_version_oracle, bench_block_lru, bench_value_codecs);
criterion_main!(benches);
