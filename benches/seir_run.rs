use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use stageflow::{Model, ModelInput};

static SEIR: &str = include_str!("../tests/data/seir.json");

fn seir_run(input: &ModelInput) -> Model {
    let mut model = input.build().expect("failed to build the SEIR model");
    model.run().expect("failed to run the SEIR model");
    model
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let input = ModelInput::from_json_str(SEIR).expect("failed to parse the SEIR model");
    c.bench_function("seir run", |bencher| {
        bencher.iter_with_large_drop(|| seir_run(black_box(&input)))
    });
    c.bench_function("seir build", |bencher| {
        bencher.iter_with_large_drop(|| black_box(&input).build())
    });
}

criterion_group!(seir_benches, criterion_benchmark);
criterion_main!(seir_benches);
