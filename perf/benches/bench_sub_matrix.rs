use basalt_matrix::hashing::MAX_SHIFT;
use basalt_matrix::{Mapper, SubMatrix, SubMatrixLayout};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

const LIVE: usize = 2;

fn layout() -> SubMatrixLayout {
    SubMatrixLayout {
        step: 4,
        obj_step: 0,
        payload_offset: LIVE,
    }
}

fn filled(rows: usize) -> (SubMatrix, Vec<i32>) {
    let mapper = Arc::new(Mapper::new().expect("mapper"));
    let m = SubMatrix::new(mapper, layout(), 1, rows, 0, MAX_SHIFT).expect("matrix");
    let keys: Vec<i32> = (0..rows as i32).map(|i| 0x4000_0001 + i * 7).collect();
    for &key in &keys {
        let index = m.add_index_begin(key, 0).expect("add");
        m.set_int(index + LIVE, 1);
        m.update_added_payload(0).expect("payload");
        m.add_index_complete(index, key, 0);
    }
    (m, keys)
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("sub_matrix");
    group.throughput(Throughput::Elements(1));

    for rows in [1_000usize, 100_000] {
        let (m, keys) = filled(rows);
        let mut idx = 0usize;
        group.bench_with_input(BenchmarkId::new("get_index_hit", rows), &rows, |b, _| {
            b.iter(|| {
                let key = keys[idx % keys.len()];
                idx += 1;
                black_box(m.get_index(black_box(key), 0))
            });
        });
        group.bench_with_input(BenchmarkId::new("get_index_miss", rows), &rows, |b, _| {
            b.iter(|| black_box(m.get_volatile_index(black_box(0x4000_0000), 0)));
        });
    }

    group.finish();
}

fn bench_rehash(c: &mut Criterion) {
    let (m, _) = filled(10_000);
    let mut group = c.benchmark_group("sub_matrix");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("rehash_10k_rows", |b| {
        b.iter(|| black_box(m.rehash(MAX_SHIFT).expect("rehash")));
    });
    group.finish();
}

criterion_group!(benches, bench_lookup, bench_rehash);
criterion_main!(benches);
