use std::{hint::black_box, sync::Arc};

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use libtestmirror::{
    mirror::insert_sorted, BackingStore, ChangeNotifier, Comparator, MemoryStore, MirrorTree,
    TestOutcome, TestStatus,
};

fn shuffled_names(count: usize) -> Vec<String> {
    // A fixed stride walk, so runs are comparable without a seeded RNG.
    (0..count)
        .map(|index| format!("test_{:05}", (index * 7919) % count))
        .collect()
}

fn insert_sorted_benchmark(c: &mut Criterion) {
    let comparator = Comparator::lexical();
    let names = shuffled_names(2000);

    c.bench_function("insert 2000 siblings sorted", |b| {
        b.iter_batched(
            || names.clone(),
            |names| {
                let mut siblings = Vec::with_capacity(names.len());
                for name in names {
                    insert_sorted(&mut siblings, name, Some(&comparator), |name: &String| {
                        name.as_str()
                    });
                }
                black_box(siblings)
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("insert 2000 siblings unsorted", |b| {
        b.iter_batched(
            || names.clone(),
            |names| {
                let mut siblings = Vec::with_capacity(names.len());
                for name in names {
                    insert_sorted(&mut siblings, name, None, |name: &String| name.as_str());
                }
                black_box(siblings)
            },
            BatchSize::SmallInput,
        )
    });
}

fn materialize_benchmark(c: &mut Criterion) {
    let store = Arc::new(MemoryStore::new("results"));
    for suite in 0..20 {
        for name in shuffled_names(200) {
            store.record(TestOutcome::new(
                format!("suite{:02}/{}", suite, name),
                TestStatus::Passed,
            ));
        }
    }

    c.bench_function("materialize 20 x 200 leaves", |b| {
        b.iter_batched(
            || {
                MirrorTree::new(
                    Arc::clone(&store) as Arc<dyn BackingStore>,
                    Some(Comparator::lexical()),
                    Arc::new(ChangeNotifier::new()),
                )
            },
            |tree| {
                let errors = tree.materialize_all(None);
                black_box((tree, errors))
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, insert_sorted_benchmark, materialize_benchmark);
criterion_main!(benches);
