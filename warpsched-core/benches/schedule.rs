use criterion::{criterion_group, criterion_main, Criterion};
use warpsched_core::{
    CudaCatalog, DType, HostDevice, LocalTransport, Model, ScheduleOptions, Scheduler,
};

fn wide_model(layers: usize, width: usize) -> Model {
    let mut m = Model::new("bench");
    let mut prev: Vec<_> = (0..width)
        .map(|i| m.tensor(&format!("in{i}"), &[16, 2048], DType::F32).unwrap())
        .collect();
    for l in 0..layers {
        prev = (0..width)
            .map(|i| {
                m.add(&format!("l{l}_{i}"), prev[i], prev[(i + 1) % width])
                    .unwrap()
            })
            .collect();
    }
    m
}

fn bench_schedule_16x8(c: &mut Criterion) {
    c.bench_function("schedule_16_layers_8_wide", |bencher| {
        bencher.iter(|| {
            let mut s = Scheduler::new(
                HostDevice::new(16, 32, 8 << 30),
                LocalTransport::new(0),
                CudaCatalog::new(),
                ScheduleOptions::default(),
            );
            s.schedule(wide_model(16, 8), 0, 0, 1).unwrap()
        });
    });
}

criterion_group!(benches, bench_schedule_16x8);
criterion_main!(benches);
