use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_ccnd_common::name::{compare_flatnames, Name};

fn bench_compare(c: &mut Criterion) {
    let a = Name::from_uri("ccnx:/bench/some/longish/name/prefix/000123").unwrap();
    let b = Name::from_uri("ccnx:/bench/some/longish/name/prefix/000124").unwrap();
    c.bench_function("compare_flatnames", |bench| {
        bench.iter(|| compare_flatnames(black_box(a.flat()), black_box(b.flat())))
    });
}

fn bench_uri(c: &mut Criterion) {
    c.bench_function("name_from_uri", |bench| {
        bench.iter(|| Name::from_uri(black_box("ccnx:/bench/%C1.M.FACE/%00%01%02/data")).unwrap())
    });
}

criterion_group!(benches, bench_compare, bench_uri);
criterion_main!(benches);
