use anyhow::Result;
use ricochet_core::{CollisionEngine, EngineConfig};
use ricochet_render::{FrameSnapshot, InstanceBuffers, RenderSink};
use std::time::{Duration, Instant};
use tracing::info;

/// How long to accumulate frames before reporting an FPS figure.
const FPS_WINDOW: Duration = Duration::from_millis(300);

/// How many frames between rolling average-frame-time reports.
const AVERAGE_REPORT_INTERVAL: u64 = 500;

fn main() -> Result<()> {
    init_tracing();
    let config = build_config();
    let frames = env_parse::<u64>("RICOCHET_FRAMES").unwrap_or(600);
    info!(
        circles = config.circle_count,
        workers = config.workers,
        frames,
        "starting ricochet simulation shell",
    );

    let mut engine = CollisionEngine::new(config)?;
    run_frames(&mut engine, frames);
    engine.shutdown();
    info!("simulation shell finished");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn build_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(circles) = env_parse::<usize>("RICOCHET_CIRCLES") {
        config.circle_count = circles;
        // Re-derive the radius range the way the default does, so density
        // stays comparable across population sizes.
        let max_radius =
            ((config.bounds_width * config.bounds_height) / circles as f32).sqrt() * 0.5;
        config.max_radius = max_radius;
        config.min_radius = max_radius / 3.0;
    }
    if let Some(workers) = env_parse::<usize>("RICOCHET_WORKERS") {
        config.workers = workers;
    }
    if let Some(seed) = env_parse::<u64>("RICOCHET_SEED") {
        config.rng_seed = Some(seed);
    }
    config
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn run_frames(engine: &mut CollisionEngine, frames: u64) {
    let mut sink = InstanceBuffers::new();
    let mut snapshot = FrameSnapshot::default();

    // The previous frame's wall time, in milliseconds, is the dt fed into
    // the next integration step.
    let mut frame_timer = 0.0f32;
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;
    let mut accumulated_ms = 0.0f64;
    let mut accumulated_frames = 0u64;

    for _ in 0..frames {
        let frame_start = Instant::now();

        engine.step(frame_timer);
        snapshot.capture(engine);
        sink.present(&snapshot);

        frame_timer = frame_start.elapsed().as_secs_f32() * 1_000.0;
        window_frames += 1;
        accumulated_ms += f64::from(frame_timer);
        accumulated_frames += 1;

        let window_elapsed = window_start.elapsed();
        if window_elapsed > FPS_WINDOW {
            let fps = (f64::from(window_frames) / window_elapsed.as_secs_f64()).round();
            info!(
                fps,
                frame_ms = frame_timer,
                collisions = engine.last_frame_records().len(),
                "frame window",
            );
            window_frames = 0;
            window_start = Instant::now();
        }

        if accumulated_frames.is_multiple_of(AVERAGE_REPORT_INTERVAL) {
            info!(
                avg_frame_ms = accumulated_ms / accumulated_frames as f64,
                frames = accumulated_frames,
                "rolling frame-time average",
            );
        }
    }

    info!(
        frames = engine.frame(),
        presented = sink.frames_presented(),
        "frame loop complete",
    );
}
