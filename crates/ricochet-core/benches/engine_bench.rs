use criterion::{criterion_group, criterion_main, Criterion};
use ricochet_core::{CollisionEngine, EngineConfig};
use std::time::Duration;

fn bench_engine_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_step");
    // Allow env overrides for longer local runs.
    let samples: usize = std::env::var("RICOCHET_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(20);
    let warm: u64 = std::env::var("RICOCHET_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("RICOCHET_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(8);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));

    let circle_counts: Vec<usize> = std::env::var("RICOCHET_BENCH_CIRCLES")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![1024, 4096, 16384]);

    for &circle_count in &circle_counts {
        let config = EngineConfig {
            circle_count,
            rng_seed: Some(0x5EED),
            ..EngineConfig::default()
        };
        let mut engine = CollisionEngine::new(config).expect("engine");
        group.bench_function(format!("circles_{circle_count}"), |b| {
            b.iter(|| engine.step(16.0));
        });
        engine.shutdown();
    }
    group.finish();
}

criterion_group!(benches, bench_engine_step);
criterion_main!(benches);
