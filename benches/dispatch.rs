use criterion::{black_box, criterion_group, criterion_main, Criterion};
use station::{Priority, Registry, Station};

fn registry() -> Registry<u64, u64> {
    let mut registry = Registry::new();
    registry.register("add", |x: u64| x + 1).unwrap();
    registry.register_workgroup("sum", |x: &u64, i| x + i as u64, |a, b| a + b).unwrap();

    registry
}

fn dispatch(c: &mut Criterion) {
    let station = Station::builder()
        .with_workers(3)
        .build(registry())
        .unwrap();
    station.wait_ready();

    c.bench_function("1000 small jobs", |b| b.iter(|| {
        let handles: Vec<_> = (0..1000)
            .map(|i| station.call("add", black_box(i)).unwrap())
            .collect();
        for handle in handles {
            black_box(handle.resolve());
        }
    }));

    c.bench_function("100 priority jobs", |b| b.iter(|| {
        let handles: Vec<_> = (0..100)
            .map(|i| station.job("add").with_priority(Priority::High).run(black_box(i)).unwrap())
            .collect();
        for handle in handles {
            black_box(handle.resolve());
        }
    }));

    c.bench_function("workgroup of 10k items", |b| b.iter(|| {
        black_box(station.call_workgroup("sum", 0, 10_000).unwrap().resolve())
    }));

    station.shut_down().wait();
}

criterion_group!(benches, dispatch);
criterion_main!(benches);
