use ricochet_core::{CircleSeed, CollisionEngine, EngineConfig, EngineError};

fn sparse_grid(count: usize) -> Vec<CircleSeed> {
    (0..count)
        .map(|index| {
            let col = (index % 24) as f32;
            let row = (index / 24) as f32;
            CircleSeed::stationary(40.0 + 50.0 * col, 40.0 + 60.0 * row, 10.0)
        })
        .collect()
}

fn two_batch_config(workers: usize) -> EngineConfig {
    EngineConfig {
        circle_count: 16,
        min_radius: 5.0,
        max_radius: 20.0,
        workers,
        rng_seed: Some(1),
        ..EngineConfig::default()
    }
}

#[test]
fn end_to_end_two_batch_collision() {
    // Sixteen circles form exactly two batches. Circle 3 (batch 0) and
    // circle 13 (batch 1) are the only overlapping pair: centers 30 units
    // apart on a horizontal line, radii summing to 40.
    let mut seeds = sparse_grid(16);
    seeds[3] = CircleSeed::stationary(100.0, 100.0, 20.0);
    seeds[13] = CircleSeed::stationary(130.0, 100.0, 20.0);

    let mut engine = CollisionEngine::with_circles(two_batch_config(2), &seeds).expect("engine");
    engine.step(0.0);

    let records = engine.last_frame_records();
    assert_eq!(records.len(), 1, "expected exactly one collision record");
    assert_eq!(records[0].batch_i, 0);
    assert_eq!(records[0].batch_j, 1);

    // Resolution pushes each circle half the overlap along the connecting
    // line, leaving them exactly touching.
    engine.with_state(|batches| {
        let (ax, ay) = batches.position_of(3).expect("circle 3");
        let (bx, by) = batches.position_of(13).expect("circle 13");
        assert!((ay - 100.0).abs() < 1e-4, "motion must stay on the x axis");
        assert!((by - 100.0).abs() < 1e-4, "motion must stay on the x axis");
        let separation = (bx - ax).abs();
        assert!(
            (separation - 40.0).abs() < 1e-4,
            "expected 40 units of separation, got {separation}"
        );
    });

    // Exactly touching circles still satisfy the `<=` overlap compare, but
    // with zero overlap the resolution pass no longer moves them.
    engine.step(0.0);
    engine.with_state(|batches| {
        let (ax, _) = batches.position_of(3).expect("circle 3");
        let (bx, _) = batches.position_of(13).expect("circle 13");
        assert!(((bx - ax).abs() - 40.0).abs() < 1e-4);
    });
    engine.shutdown();
}

#[test]
fn random_population_stays_finite_and_bounded() {
    let config = EngineConfig {
        circle_count: 256,
        workers: 4,
        rng_seed: Some(0xC0FFEE),
        ..EngineConfig::default()
    };
    let width = config.bounds_width;
    let height = config.bounds_height;
    let mut engine = CollisionEngine::new(config).expect("engine");
    for _ in 0..8 {
        engine.step(16.0);
    }
    assert_eq!(engine.frame(), 8);

    // Resolution may push a circle slightly past a wall; the next frame's
    // boundary pass pulls it back. Positions must stay finite and near the
    // bounds at all times.
    engine.with_state(|batches| {
        for index in 0..batches.count() {
            let (x, y) = batches.position_of(index).expect("position");
            let (vx, vy) = batches.velocity_of(index).expect("velocity");
            assert!(x.is_finite() && y.is_finite(), "circle {index} position");
            assert!(vx.is_finite() && vy.is_finite(), "circle {index} velocity");
            assert!((-100.0..=width + 100.0).contains(&x), "circle {index} x={x}");
            assert!(
                (-100.0..=height + 100.0).contains(&y),
                "circle {index} y={y}"
            );
        }
    });
    engine.shutdown();
}

#[test]
fn shutdown_is_bounded_without_a_start_signal() {
    // Workers are parked waiting for a frame that never comes; dropping the
    // engine must still join them promptly.
    let engine = CollisionEngine::with_circles(two_batch_config(2), &sparse_grid(16))
        .expect("engine");
    drop(engine);
}

#[test]
fn shutdown_is_idempotent() {
    let mut engine =
        CollisionEngine::with_circles(two_batch_config(1), &sparse_grid(16)).expect("engine");
    engine.step(0.0);
    engine.shutdown();
    engine.shutdown();
}

#[test]
fn engine_rejects_more_workers_than_batches() {
    let result = CollisionEngine::with_circles(two_batch_config(3), &sparse_grid(16));
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn engine_rejects_mismatched_seed_count() {
    let result = CollisionEngine::with_circles(two_batch_config(2), &sparse_grid(12));
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}
