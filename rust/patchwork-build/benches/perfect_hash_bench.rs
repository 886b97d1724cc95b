use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use patchwork_build::PerfectHashTable;
use patchwork_core::TypeId;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Every (type, type, bool) tuple: the shape of a binary-operator family.
fn binary_op_tuples(types: u64) -> Vec<Vec<u64>> {
    let mut tuples = Vec::new();
    for lhs in 0..types {
        for rhs in 0..types {
            for spill in 0..2 {
                tuples.push(vec![lhs, rhs, spill]);
            }
        }
    }
    tuples
}

fn perfect_hash_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("perfect_hash");

    for types in [4, 12, TypeId::COUNT] {
        let tuples = binary_op_tuples(types);

        group.bench_with_input(BenchmarkId::new("build", tuples.len()), &tuples, |b, tuples| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(7);
                let table = PerfectHashTable::build("bench", 3, black_box(tuples), &mut rng)
                    .expect("build failed");
                black_box(table)
            });
        });

        let mut rng = StdRng::seed_from_u64(7);
        let table = PerfectHashTable::build("bench", 3, &tuples, &mut rng).expect("build failed");
        group.bench_with_input(BenchmarkId::new("lookup", tuples.len()), &tuples, |b, tuples| {
            let index = table.as_index();
            b.iter(|| {
                for tuple in tuples {
                    black_box(index.lookup(black_box(tuple)));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, perfect_hash_benchmark);
criterion_main!(benches);
