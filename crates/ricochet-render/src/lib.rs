//! Rendering seam for Ricochet.
//!
//! The engine knows nothing about buffers or frames-in-flight; it only
//! guarantees its arrays are stable between frames. This crate defines the
//! flattened per-frame snapshot the engine hands out and the sink interface a
//! renderer implements to receive it.

use ricochet_core::CollisionEngine;
use tracing::debug;

/// Flattened, per-circle copy of the state a renderer needs for one frame.
///
/// Positions change every frame; radii and colors are fixed for the lifetime
/// of the simulation.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub x_positions: Vec<f32>,
    pub y_positions: Vec<f32>,
    pub radii: Vec<f32>,
    pub colors: Vec<[f32; 3]>,
}

impl FrameSnapshot {
    /// Refill the snapshot from the engine's current state, reusing the
    /// existing allocations.
    pub fn capture(&mut self, engine: &CollisionEngine) {
        engine.with_state(|batches| {
            batches.fill_positions(&mut self.x_positions, &mut self.y_positions);
            batches.fill_radii(&mut self.radii);
            self.colors.clear();
            self.colors.extend_from_slice(batches.colors());
        });
    }

    /// Number of circles captured.
    #[must_use]
    pub fn circle_count(&self) -> usize {
        self.x_positions.len()
    }
}

/// Consumer of per-frame snapshots.
pub trait RenderSink {
    /// Accept one frame's state. Called after resolution completes, while the
    /// snapshot is stable.
    fn present(&mut self, frame: &FrameSnapshot);
}

/// Sink that discards every frame; useful for headless runs and benches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn present(&mut self, _frame: &FrameSnapshot) {}
}

/// CPU-side stand-in for GPU-visible instance buffers.
///
/// Positions are re-uploaded every frame; radii and colors only when the
/// population changes, mirroring how a renderer would stage a static scale
/// buffer once and stream positions.
#[derive(Debug, Default)]
pub struct InstanceBuffers {
    x_positions: Vec<f32>,
    y_positions: Vec<f32>,
    radii: Vec<f32>,
    colors: Vec<[f32; 3]>,
    frames_presented: u64,
}

impl InstanceBuffers {
    /// Create empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames uploaded so far.
    #[must_use]
    pub const fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Number of instances currently staged.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.x_positions.len()
    }

    /// Staged x positions.
    #[must_use]
    pub fn x_positions(&self) -> &[f32] {
        &self.x_positions
    }

    /// Staged y positions.
    #[must_use]
    pub fn y_positions(&self) -> &[f32] {
        &self.y_positions
    }

    /// Staged radii.
    #[must_use]
    pub fn radii(&self) -> &[f32] {
        &self.radii
    }

    /// Staged colors.
    #[must_use]
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }
}

impl RenderSink for InstanceBuffers {
    fn present(&mut self, frame: &FrameSnapshot) {
        if self.radii.len() != frame.radii.len() {
            self.radii.clone_from(&frame.radii);
            self.colors.clone_from(&frame.colors);
        }
        self.x_positions.clone_from(&frame.x_positions);
        self.y_positions.clone_from(&frame.y_positions);
        self.frames_presented += 1;
        debug!(
            instances = self.instance_count(),
            frame = self.frames_presented,
            "instance buffers refreshed",
        );
    }
}
