//! Core collision engine shared across the Ricochet workspace.
//!
//! Circles live in structure-of-arrays batches of eight, one `f32x8` register
//! per attribute per batch. Every frame the main thread integrates positions,
//! reflects circles off the simulation bounds, and hands detection to a fixed
//! pool of worker threads, each scanning a statically assigned slice of the
//! batch-pair space. Detected overlaps are merged into a shared ledger and
//! resolved (positional separation plus elastic impulse exchange) on the main
//! thread before the frame's state is exposed to the rendering collaborator.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use wide::{f32x8, CmpEq, CmpGe, CmpGt, CmpLe};

/// Number of scalar lanes per circle batch.
pub const LANE_WIDTH: usize = 8;

/// Number of rotation patterns needed to pair every lane of one batch against
/// every lane of another.
pub const CROSS_ROTATIONS: usize = 8;

/// Number of rotation patterns needed to cover every unordered lane pair
/// within a single batch.
pub const SELF_ROTATIONS: usize = 4;

/// Floor applied to center distances before computing contact normals.
const DISTANCE_EPSILON: f32 = 1e-6;

/// Mass factor applied to radii in the cross-batch impulse. The factor
/// cancels between the two `m · p` products, so it tunes nothing on its own;
/// it is deliberately kept distinct from the self-batch path, which weighs
/// mass as the bare radius, until the mass model is settled product-side.
const CROSS_MASS_FACTOR: f32 = 5.0;

/// How long a parked worker sleeps between polls of its start flag.
const WORKER_PARK_INTERVAL: Duration = Duration::from_millis(1);

// 8x8 Latin square: pattern `k` aligns lane `l` of one batch with lane
// `CROSS_PATTERNS[k][l]` of the other, so the eight patterns together pair
// every lane combination exactly once.
const CROSS_PATTERNS: [[usize; LANE_WIDTH]; CROSS_ROTATIONS] = [
    [0, 1, 7, 2, 6, 3, 5, 4],
    [1, 2, 0, 3, 7, 4, 6, 5],
    [2, 3, 1, 4, 0, 5, 7, 6],
    [3, 4, 2, 5, 1, 6, 0, 7],
    [4, 5, 3, 6, 2, 7, 1, 0],
    [5, 6, 4, 7, 3, 0, 2, 1],
    [6, 7, 5, 0, 4, 1, 3, 2],
    [7, 0, 6, 1, 5, 2, 4, 3],
];

// Intra-batch rotations. Four suffice for the 28 unordered lane pairs:
// rotation k pairs each lane with the lane k+1 to its right (mod 8), and a
// rotation past the halfway point would only revisit pairs mirrored.
const SELF_PATTERNS: [[usize; LANE_WIDTH]; SELF_ROTATIONS] = [
    [1, 2, 3, 4, 5, 6, 7, 0],
    [2, 3, 4, 5, 6, 7, 0, 1],
    [3, 4, 5, 6, 7, 0, 1, 2],
    [4, 5, 6, 7, 0, 1, 2, 3],
];

const fn invert_pattern(pattern: [usize; LANE_WIDTH]) -> [usize; LANE_WIDTH] {
    let mut inverse = [0usize; LANE_WIDTH];
    let mut lane = 0;
    while lane < LANE_WIDTH {
        inverse[pattern[lane]] = lane;
        lane += 1;
    }
    inverse
}

const fn invert_patterns<const N: usize>(
    patterns: [[usize; LANE_WIDTH]; N],
) -> [[usize; LANE_WIDTH]; N] {
    let mut inverses = [[0usize; LANE_WIDTH]; N];
    let mut index = 0;
    while index < N {
        inverses[index] = invert_pattern(patterns[index]);
        index += 1;
    }
    inverses
}

const CROSS_INVERSES: [[usize; LANE_WIDTH]; CROSS_ROTATIONS] = invert_patterns(CROSS_PATTERNS);
const SELF_INVERSES: [[usize; LANE_WIDTH]; SELF_ROTATIONS] = invert_patterns(SELF_PATTERNS);

/// Reorder the lanes of `value` so output lane `l` holds input lane
/// `pattern[l]`.
#[inline]
#[must_use]
pub fn permute(value: f32x8, pattern: &[usize; LANE_WIDTH]) -> f32x8 {
    let lanes = value.to_array();
    let mut shuffled = [0.0f32; LANE_WIDTH];
    for (slot, &source) in shuffled.iter_mut().zip(pattern.iter()) {
        *slot = lanes[source];
    }
    f32x8::from(shuffled)
}

/// Expand an 8-bit lane mask into a vector select mask (all bits set per
/// flagged lane), suitable for `blend`.
#[inline]
#[must_use]
pub fn mask_from_lanes(lanes: u8) -> f32x8 {
    let set = f32::from_bits(u32::MAX);
    let mut mask = [0.0f32; LANE_WIDTH];
    for (lane, slot) in mask.iter_mut().enumerate() {
        if lanes & (1 << lane) != 0 {
            *slot = set;
        }
    }
    f32x8::from(mask)
}

#[inline]
fn lane_bits(mask: f32x8) -> u8 {
    (mask.move_mask() & 0xff) as u8
}

/// Errors raised while building or running the collision engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicates a configuration value the engine cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Batch storage could not be allocated.
    #[error("batch storage allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
    /// A collision worker thread could not be spawned.
    #[error("failed to spawn collision worker {worker}: {source}")]
    ThreadSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Static configuration for a collision simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of circles simulated.
    pub circle_count: usize,
    /// Width of the simulation bounds in world units.
    pub bounds_width: f32,
    /// Height of the simulation bounds in world units.
    pub bounds_height: f32,
    /// Smallest radius assigned during random initialization.
    pub min_radius: f32,
    /// Largest radius assigned during random initialization.
    pub max_radius: f32,
    /// Scale applied to initial speeds; actual speed is divided by the
    /// square root of the radius, so smaller circles move faster.
    pub velocity_scale: f32,
    /// Number of persistent detection worker threads.
    pub workers: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let circle_count = 1 << 14;
        let bounds_width = 1280.0_f32;
        let bounds_height = 720.0_f32;
        // Size circles so the population roughly tiles half the area.
        let max_radius = ((bounds_width * bounds_height) / circle_count as f32).sqrt() * 0.5;
        Self {
            circle_count,
            bounds_width,
            bounds_height,
            min_radius: max_radius / 3.0,
            max_radius,
            velocity_scale: 1.5,
            workers: 8,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Number of eight-lane batches needed for `circle_count` circles.
    #[must_use]
    pub const fn batch_count(&self) -> usize {
        self.circle_count.div_ceil(LANE_WIDTH)
    }

    /// Validates the configuration before any allocation happens.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.circle_count == 0 {
            return Err(EngineError::InvalidConfig("circle_count must be non-zero"));
        }
        if !(self.bounds_width.is_finite() && self.bounds_width > 0.0)
            || !(self.bounds_height.is_finite() && self.bounds_height > 0.0)
        {
            return Err(EngineError::InvalidConfig(
                "bounds must be positive and finite",
            ));
        }
        if !(self.min_radius.is_finite() && self.min_radius > 0.0) {
            return Err(EngineError::InvalidConfig("min_radius must be positive"));
        }
        if !(self.max_radius.is_finite() && self.max_radius >= self.min_radius) {
            return Err(EngineError::InvalidConfig(
                "max_radius must be at least min_radius",
            ));
        }
        if self.max_radius * 2.0 >= self.bounds_width.min(self.bounds_height) {
            return Err(EngineError::InvalidConfig(
                "largest circle diameter must fit within the bounds",
            ));
        }
        if !(self.velocity_scale.is_finite() && self.velocity_scale >= 0.0) {
            return Err(EngineError::InvalidConfig(
                "velocity_scale must be non-negative and finite",
            ));
        }
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be non-zero"));
        }
        if self.workers > self.batch_count() {
            return Err(EngineError::InvalidConfig(
                "workers must not exceed the batch count",
            ));
        }
        Ok(())
    }
}

/// Scalar description of one circle, used for deterministic setups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircleSeed {
    pub x: f32,
    pub y: f32,
    pub x_velocity: f32,
    pub y_velocity: f32,
    pub radius: f32,
    pub color: [f32; 3],
}

impl CircleSeed {
    /// A stationary circle at the given position.
    #[must_use]
    pub const fn stationary(x: f32, y: f32, radius: f32) -> Self {
        Self {
            x,
            y,
            x_velocity: 0.0,
            y_velocity: 0.0,
            radius,
            color: [1.0, 1.0, 1.0],
        }
    }
}

/// Structure-of-arrays storage for the circle population.
///
/// Lane `l` of batch `b` holds circle index `b * LANE_WIDTH + l`. Lanes past
/// `count` in the final batch are padding: their radius is zero and their
/// position is parked at infinity, so distance math can never flag them as a
/// collision partner. Colors are display-only and stay in scalar order.
#[derive(Debug, Clone)]
pub struct CircleBatches {
    count: usize,
    batch_count: usize,
    x_positions: Vec<f32x8>,
    y_positions: Vec<f32x8>,
    x_velocities: Vec<f32x8>,
    y_velocities: Vec<f32x8>,
    radii: Vec<f32x8>,
    colors: Vec<[f32; 3]>,
}

fn batch_column(len: usize) -> Result<Vec<f32x8>, EngineError> {
    let mut column = Vec::new();
    column.try_reserve_exact(len)?;
    column.resize(len, f32x8::ZERO);
    Ok(column)
}

impl CircleBatches {
    /// Allocate zeroed storage for `count` circles.
    pub fn allocate(count: usize) -> Result<Self, EngineError> {
        if count == 0 {
            return Err(EngineError::InvalidConfig("circle_count must be non-zero"));
        }
        let batch_count = count.div_ceil(LANE_WIDTH);
        let mut colors = Vec::new();
        colors.try_reserve_exact(count)?;
        colors.resize(count, [0.0; 3]);
        Ok(Self {
            count,
            batch_count,
            x_positions: batch_column(batch_count)?,
            y_positions: batch_column(batch_count)?,
            x_velocities: batch_column(batch_count)?,
            y_velocities: batch_column(batch_count)?,
            radii: batch_column(batch_count)?,
            colors,
        })
    }

    /// Build batches from explicit per-circle state.
    pub fn from_seeds(seeds: &[CircleSeed]) -> Result<Self, EngineError> {
        let mut batches = Self::allocate(seeds.len())?;
        for batch in 0..batches.batch_count {
            let mut xs = [0.0f32; LANE_WIDTH];
            let mut ys = [0.0f32; LANE_WIDTH];
            let mut vxs = [0.0f32; LANE_WIDTH];
            let mut vys = [0.0f32; LANE_WIDTH];
            let mut rs = [0.0f32; LANE_WIDTH];
            for lane in 0..LANE_WIDTH {
                let index = batch * LANE_WIDTH + lane;
                let Some(seed) = seeds.get(index) else {
                    break;
                };
                xs[lane] = seed.x;
                ys[lane] = seed.y;
                vxs[lane] = seed.x_velocity;
                vys[lane] = seed.y_velocity;
                rs[lane] = seed.radius;
                batches.colors[index] = seed.color;
            }
            batches.x_positions[batch] = f32x8::from(xs);
            batches.y_positions[batch] = f32x8::from(ys);
            batches.x_velocities[batch] = f32x8::from(vxs);
            batches.y_velocities[batch] = f32x8::from(vys);
            batches.radii[batch] = f32x8::from(rs);
        }
        batches.seal_padding();
        Ok(batches)
    }

    /// Fill every lane with a random radius, a position whose bounding box
    /// starts inside the bounds, and a velocity inversely proportional to the
    /// square root of the radius.
    pub fn initialize_random(&mut self, config: &EngineConfig, rng: &mut SmallRng) {
        for batch in 0..self.batch_count {
            let mut xs = [0.0f32; LANE_WIDTH];
            let mut ys = [0.0f32; LANE_WIDTH];
            let mut vxs = [0.0f32; LANE_WIDTH];
            let mut vys = [0.0f32; LANE_WIDTH];
            let mut rs = [0.0f32; LANE_WIDTH];
            for lane in 0..LANE_WIDTH {
                let index = batch * LANE_WIDTH + lane;
                if index >= self.count {
                    break;
                }
                let radius = rng.gen_range(config.min_radius..=config.max_radius);
                let speed_scale = config.velocity_scale / radius.sqrt();
                rs[lane] = radius;
                xs[lane] = rng.gen_range(radius..config.bounds_width - radius);
                ys[lane] = rng.gen_range(radius..config.bounds_height - radius);
                vxs[lane] = rng.gen_range(0.0..0.5) * random_sign(rng) * speed_scale;
                vys[lane] = rng.gen_range(0.0..0.5) * random_sign(rng) * speed_scale;
                self.colors[index] = [
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                    rng.gen_range(0.0..1.0),
                ];
            }
            self.x_positions[batch] = f32x8::from(xs);
            self.y_positions[batch] = f32x8::from(ys);
            self.x_velocities[batch] = f32x8::from(vxs);
            self.y_velocities[batch] = f32x8::from(vys);
            self.radii[batch] = f32x8::from(rs);
        }
        self.seal_padding();
    }

    // Padding lanes park at infinity with zero radius and zero velocity:
    // any distance involving them is non-finite and fails every overlap
    // compare, and the wall resolver skips zero-radius lanes entirely.
    fn seal_padding(&mut self) {
        let tail = self.count % LANE_WIDTH;
        if tail == 0 {
            return;
        }
        let mut live = [0.0f32; LANE_WIDTH];
        for slot in live.iter_mut().take(tail) {
            *slot = 1.0;
        }
        let live_mask = f32x8::from(live).cmp_eq(f32x8::splat(1.0));
        let far = f32x8::splat(f32::INFINITY);
        let last = self.batch_count - 1;
        self.radii[last] = live_mask.blend(self.radii[last], f32x8::ZERO);
        self.x_positions[last] = live_mask.blend(self.x_positions[last], far);
        self.y_positions[last] = live_mask.blend(self.y_positions[last], far);
        self.x_velocities[last] = live_mask.blend(self.x_velocities[last], f32x8::ZERO);
        self.y_velocities[last] = live_mask.blend(self.y_velocities[last], f32x8::ZERO);
    }

    /// Logical circle count.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Number of eight-lane batches, including the padded tail batch.
    #[must_use]
    pub const fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Position of circle `index`, if it exists.
    #[must_use]
    pub fn position_of(&self, index: usize) -> Option<(f32, f32)> {
        if index >= self.count {
            return None;
        }
        let (batch, lane) = (index / LANE_WIDTH, index % LANE_WIDTH);
        Some((
            self.x_positions[batch].to_array()[lane],
            self.y_positions[batch].to_array()[lane],
        ))
    }

    /// Velocity of circle `index`, if it exists.
    #[must_use]
    pub fn velocity_of(&self, index: usize) -> Option<(f32, f32)> {
        if index >= self.count {
            return None;
        }
        let (batch, lane) = (index / LANE_WIDTH, index % LANE_WIDTH);
        Some((
            self.x_velocities[batch].to_array()[lane],
            self.y_velocities[batch].to_array()[lane],
        ))
    }

    /// Radius of circle `index`, if it exists.
    #[must_use]
    pub fn radius_of(&self, index: usize) -> Option<f32> {
        if index >= self.count {
            return None;
        }
        Some(self.radii[index / LANE_WIDTH].to_array()[index % LANE_WIDTH])
    }

    /// Display colors in scalar circle order.
    #[must_use]
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    /// Flatten positions back to per-circle scalar arrays for copy-out.
    pub fn fill_positions(&self, xs: &mut Vec<f32>, ys: &mut Vec<f32>) {
        xs.clear();
        ys.clear();
        xs.reserve(self.count);
        ys.reserve(self.count);
        'batches: for batch in 0..self.batch_count {
            let lane_x = self.x_positions[batch].to_array();
            let lane_y = self.y_positions[batch].to_array();
            for lane in 0..LANE_WIDTH {
                if batch * LANE_WIDTH + lane >= self.count {
                    break 'batches;
                }
                xs.push(lane_x[lane]);
                ys.push(lane_y[lane]);
            }
        }
    }

    /// Flatten radii back to a per-circle scalar array for copy-out.
    pub fn fill_radii(&self, radii: &mut Vec<f32>) {
        radii.clear();
        radii.reserve(self.count);
        'batches: for batch in 0..self.batch_count {
            let lanes = self.radii[batch].to_array();
            for lane in 0..LANE_WIDTH {
                if batch * LANE_WIDTH + lane >= self.count {
                    break 'batches;
                }
                radii.push(lanes[lane]);
            }
        }
    }

    /// Advance every position by its velocity scaled by `dt`.
    pub fn advance(&mut self, dt: f32) {
        let dt = f32x8::splat(dt);
        for batch in 0..self.batch_count {
            self.x_positions[batch] = self.x_velocities[batch].mul_add(dt, self.x_positions[batch]);
            self.y_positions[batch] = self.y_velocities[batch].mul_add(dt, self.y_positions[batch]);
        }
    }

    /// Reflect circles off the four bounds, vectorized per batch.
    ///
    /// Each boundary builds a mask of lanes whose edge has crossed it, flips
    /// the matching velocity component for those lanes, and clamps their
    /// position to sit exactly on the boundary offset by the radius. The four
    /// checks are independent: each only touches lanes it flagged, and a lane
    /// cannot cross opposite bounds of one axis in a single frame.
    pub fn resolve_walls(&mut self, width: f32, height: f32) {
        let zero = f32x8::ZERO;
        let one = f32x8::splat(1.0);
        let reverse = f32x8::splat(-1.0);
        let width = f32x8::splat(width);
        let height = f32x8::splat(height);
        for batch in 0..self.batch_count {
            let radius = self.radii[batch];
            // Zero-radius lanes are padding; leave them parked.
            let live = radius.cmp_gt(zero);

            let left = (self.x_positions[batch] - radius).cmp_le(zero) & live;
            if left.any() {
                self.x_velocities[batch] *= left.blend(reverse, one);
                self.x_positions[batch] = left.blend(radius, self.x_positions[batch]);
            }

            let right = (self.x_positions[batch] + radius).cmp_ge(width) & live;
            if right.any() {
                self.x_velocities[batch] *= right.blend(reverse, one);
                self.x_positions[batch] = right.blend(width - radius, self.x_positions[batch]);
            }

            let bottom = (self.y_positions[batch] - radius).cmp_le(zero) & live;
            if bottom.any() {
                self.y_velocities[batch] *= bottom.blend(reverse, one);
                self.y_positions[batch] = bottom.blend(radius, self.y_positions[batch]);
            }

            let top = (self.y_positions[batch] + radius).cmp_ge(height) & live;
            if top.any() {
                self.y_velocities[batch] *= top.blend(reverse, one);
                self.y_positions[batch] = top.blend(height - radius, self.y_positions[batch]);
            }
        }
    }
}

fn random_sign(rng: &mut SmallRng) -> f32 {
    if rng.gen_bool(0.5) {
        1.0
    } else {
        -1.0
    }
}

/// One detected overlap between a rotated lane pairing, valid for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CollisionRecord {
    /// First batch of the pair; equals `batch_j` for intra-batch overlaps.
    pub batch_i: u32,
    /// Second batch of the pair.
    pub batch_j: u32,
    /// Index into the self or cross rotation tables, depending on the pair.
    pub rotation: u8,
    /// Per-lane hit mask after rotation (bit `l` = lane `l` overlaps).
    pub lanes: u8,
}

impl CollisionRecord {
    /// Whether this record describes two lanes of the same batch.
    #[must_use]
    pub const fn is_self(&self) -> bool {
        self.batch_i == self.batch_j
    }
}

/// Contiguous slice of the flattened upper-triangular batch-pair space
/// (diagonal included) assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    start_row: usize,
    start_col: usize,
    end_row: usize,
    /// Exclusive column bound on `end_row`.
    end_col: usize,
}

impl WorkRange {
    fn from_linear(start: usize, end: usize, batch_count: usize) -> Self {
        debug_assert!(start < end);
        let (start_row, start_col) = unflatten_pair(start, batch_count);
        let (end_row, last_col) = unflatten_pair(end - 1, batch_count);
        Self {
            start_row,
            start_col,
            end_row,
            end_col: last_col + 1,
        }
    }

    /// Visit every `(batch_i, batch_j)` pair in the range, diagonal included.
    pub fn for_each_pair(&self, batch_count: usize, mut visit: impl FnMut(usize, usize)) {
        for row in self.start_row..=self.end_row {
            let first = if row == self.start_row {
                self.start_col
            } else {
                row
            };
            let last = if row == self.end_row {
                self.end_col
            } else {
                batch_count
            };
            for col in first..last {
                visit(row, col);
            }
        }
    }

    /// Number of batch pairs in the range.
    #[must_use]
    pub fn pair_count(&self, batch_count: usize) -> usize {
        let mut pairs = 0;
        self.for_each_pair(batch_count, |_, _| pairs += 1);
        pairs
    }
}

// Row `r` owns the `batch_count - r` entries (r, r), (r, r+1), ... so a
// linear index is recovered by walking rows until its offset falls inside.
fn unflatten_pair(linear: usize, batch_count: usize) -> (usize, usize) {
    let mut row = 0;
    let mut offset = 0;
    loop {
        let row_width = batch_count - row;
        if linear < offset + row_width {
            return (row, row + (linear - offset));
        }
        offset += row_width;
        row += 1;
    }
}

/// Split the batch-pair comparison space into `workers` contiguous ranges of
/// approximately equal pair count.
///
/// The space is the upper triangle of the `batch_count²` pair grid including
/// the diagonal (each batch is compared against itself with the reduced
/// rotation set), flattened row-major. Ranges partition it exactly: no pair
/// is visited twice, none is skipped.
#[must_use]
pub fn partition_pairs(batch_count: usize, workers: usize) -> Vec<WorkRange> {
    debug_assert!(workers >= 1);
    debug_assert!(workers <= batch_count);
    let total = batch_count * (batch_count + 1) / 2;
    (0..workers)
        .map(|worker| {
            let start = worker * total / workers;
            let end = (worker + 1) * total / workers;
            WorkRange::from_linear(start, end, batch_count)
        })
        .collect()
}

/// Scan one work range for overlaps, appending records to `out`.
pub fn scan_range(batches: &CircleBatches, range: &WorkRange, out: &mut Vec<CollisionRecord>) {
    range.for_each_pair(batches.batch_count(), |batch_i, batch_j| {
        if batch_i == batch_j {
            detect_self(batches, batch_i, out);
        } else {
            detect_cross(batches, batch_i, batch_j, out);
        }
    });
}

fn detect_self(batches: &CircleBatches, batch: usize, out: &mut Vec<CollisionRecord>) {
    let x1 = batches.x_positions[batch];
    let y1 = batches.y_positions[batch];
    let r1 = batches.radii[batch];
    for (rotation, pattern) in SELF_PATTERNS.iter().enumerate() {
        let x2 = permute(x1, pattern);
        let y2 = permute(y1, pattern);
        let r2 = permute(r1, pattern);
        let dx = x2 - x1;
        let dy = y2 - y1;
        let distance_sq = dy.mul_add(dy, dx * dx);
        let radii = r1 + r2;
        let lanes = lane_bits(distance_sq.cmp_le(radii * radii));
        if lanes != 0 {
            out.push(CollisionRecord {
                batch_i: batch as u32,
                batch_j: batch as u32,
                rotation: rotation as u8,
                lanes,
            });
        }
    }
}

fn detect_cross(
    batches: &CircleBatches,
    batch_i: usize,
    batch_j: usize,
    out: &mut Vec<CollisionRecord>,
) {
    let xj = batches.x_positions[batch_j];
    let yj = batches.y_positions[batch_j];
    let rj = batches.radii[batch_j];
    for (rotation, pattern) in CROSS_PATTERNS.iter().enumerate() {
        let x1 = permute(batches.x_positions[batch_i], pattern);
        let y1 = permute(batches.y_positions[batch_i], pattern);
        let r1 = permute(batches.radii[batch_i], pattern);
        let dx = x1 - xj;
        let dy = y1 - yj;
        let distance_sq = dy.mul_add(dy, dx * dx);
        let radii = rj + r1;
        let lanes = lane_bits(distance_sq.cmp_le(radii * radii));
        if lanes != 0 {
            out.push(CollisionRecord {
                batch_i: batch_i as u32,
                batch_j: batch_j as u32,
                rotation: rotation as u8,
                lanes,
            });
        }
    }
}

/// Shared, frame-scoped collection of collision records.
///
/// Workers bulk-append their local list once per frame under a single short
/// critical section; the main thread clears it before signaling a new frame
/// and drains it for resolution after all workers report.
#[derive(Debug, Default)]
pub struct CollisionLedger {
    records: Mutex<Vec<CollisionRecord>>,
}

impl CollisionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<CollisionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discard any records left over from the previous frame.
    pub fn begin_frame(&self) {
        self.guard().clear();
    }

    /// Move all records from `local` into the shared list.
    pub fn merge(&self, local: &mut Vec<CollisionRecord>) {
        self.guard().append(local);
    }

    /// Exchange the shared list with `into`, leaving the ledger with the
    /// (cleared) buffer the caller passed in.
    pub fn swap_into(&self, into: &mut Vec<CollisionRecord>) {
        std::mem::swap(&mut *self.guard(), into);
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Whether the ledger holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

/// Resolve every aggregated record: separate overlapping circles and exchange
/// elastic impulses, sequentially on the calling thread.
///
/// Records are applied in aggregation order; a later record touching a circle
/// already moved this frame sees the updated state. That is an accepted
/// approximation, not a fixed-point solve.
pub fn resolve_collisions(batches: &mut CircleBatches, records: &[CollisionRecord]) {
    for record in records {
        if record.is_self() {
            resolve_self(batches, record);
        } else {
            resolve_cross(batches, record);
        }
    }
}

fn resolve_self(batches: &mut CircleBatches, record: &CollisionRecord) {
    let batch = record.batch_i as usize;
    let pattern = &SELF_PATTERNS[record.rotation as usize];
    let inverse = &SELF_INVERSES[record.rotation as usize];
    let mask = mask_from_lanes(record.lanes);
    let zero = f32x8::ZERO;

    let x1 = batches.x_positions[batch];
    let y1 = batches.y_positions[batch];
    let r1 = batches.radii[batch];
    let x2 = permute(x1, pattern);
    let y2 = permute(y1, pattern);
    let r2 = permute(r1, pattern);

    let dx = x2 - x1;
    let dy = y2 - y1;
    let radii = r1 + r2;
    let distance = dy
        .mul_add(dy, dx * dx)
        .sqrt()
        .max(f32x8::splat(DISTANCE_EPSILON));
    let half_overlap = (radii - distance) * f32x8::splat(0.5);
    let normal_x = dx / distance;
    let normal_y = dy / distance;

    // Each flagged lane retreats half the overlap; its partner advances the
    // same amount through the inverse permutation.
    let move_x = mask.blend(normal_x * half_overlap, zero);
    let move_y = mask.blend(normal_y * half_overlap, zero);
    batches.x_positions[batch] = batches.x_positions[batch] - move_x + permute(move_x, inverse);
    batches.y_positions[batch] = batches.y_positions[batch] - move_y + permute(move_y, inverse);

    // One lane at a time: several lanes of the same batch may be colliding,
    // and their impulse write-backs would otherwise stack in one register.
    for lane in 0..LANE_WIDTH {
        if record.lanes & (1 << lane) == 0 {
            continue;
        }
        let gate = mask_from_lanes(1 << lane);
        let v1_x = batches.x_velocities[batch];
        let v1_y = batches.y_velocities[batch];
        let v2_x = permute(v1_x, pattern);
        let v2_y = permute(v1_y, pattern);

        let mass_1 = r1;
        let mass_2 = r2;
        let mass_sum = mass_1 + mass_2;
        let along_1 = normal_x.mul_add(v1_x, normal_y * v1_y);
        let along_2 = normal_x.mul_add(v2_x, normal_y * v2_y);
        let impulse = (along_1 - along_2) * f32x8::splat(2.0) / mass_sum;

        let dv1_x = gate.blend(impulse * mass_2 * normal_x, zero);
        let dv1_y = gate.blend(impulse * mass_2 * normal_y, zero);
        let dv2_x = gate.blend(impulse * mass_1 * normal_x, zero);
        let dv2_y = gate.blend(impulse * mass_1 * normal_y, zero);

        batches.x_velocities[batch] =
            batches.x_velocities[batch] - dv1_x + permute(dv2_x, inverse);
        batches.y_velocities[batch] =
            batches.y_velocities[batch] - dv1_y + permute(dv2_y, inverse);
    }
}

fn resolve_cross(batches: &mut CircleBatches, record: &CollisionRecord) {
    let batch_i = record.batch_i as usize;
    let batch_j = record.batch_j as usize;
    let pattern = &CROSS_PATTERNS[record.rotation as usize];
    let inverse = &CROSS_INVERSES[record.rotation as usize];
    let mask = mask_from_lanes(record.lanes);
    let zero = f32x8::ZERO;

    let x1 = permute(batches.x_positions[batch_i], pattern);
    let y1 = permute(batches.y_positions[batch_i], pattern);
    let r1 = permute(batches.radii[batch_i], pattern);

    let dx = x1 - batches.x_positions[batch_j];
    let dy = y1 - batches.y_positions[batch_j];
    let radii = batches.radii[batch_j] + r1;
    let distance = dy
        .mul_add(dy, dx * dx)
        .sqrt()
        .max(f32x8::splat(DISTANCE_EPSILON));
    let half_overlap = (radii - distance) * f32x8::splat(0.5);
    let normal_x = dx / distance;
    let normal_y = dy / distance;

    let move_x = mask.blend(normal_x * half_overlap, zero);
    let move_y = mask.blend(normal_y * half_overlap, zero);
    batches.x_positions[batch_j] -= move_x;
    batches.y_positions[batch_j] -= move_y;
    batches.x_positions[batch_i] += permute(move_x, inverse);
    batches.y_positions[batch_i] += permute(move_y, inverse);

    let mass_1 = r1 * f32x8::splat(CROSS_MASS_FACTOR);
    let mass_2 = batches.radii[batch_j] * f32x8::splat(CROSS_MASS_FACTOR);
    let mass_sum = mass_1 + mass_2;

    let v1_x = permute(batches.x_velocities[batch_i], pattern);
    let v1_y = permute(batches.y_velocities[batch_i], pattern);
    let along_1 = normal_x.mul_add(v1_x, normal_y * v1_y);
    let along_2 = normal_x.mul_add(
        batches.x_velocities[batch_j],
        normal_y * batches.y_velocities[batch_j],
    );
    let impulse = (along_1 - along_2) * f32x8::splat(2.0) / mass_sum;

    let dv1_x = mask.blend(normal_x * mass_2 * impulse, zero);
    let dv1_y = mask.blend(normal_y * mass_2 * impulse, zero);
    let dv2_x = mask.blend(normal_x * mass_1 * impulse, zero);
    let dv2_y = mask.blend(normal_y * mass_1 * impulse, zero);

    batches.x_velocities[batch_i] -= permute(dv1_x, inverse);
    batches.y_velocities[batch_i] -= permute(dv1_y, inverse);
    batches.x_velocities[batch_j] += dv2_x;
    batches.y_velocities[batch_j] += dv2_y;
}

/// Start/finish handshake between the main thread and the worker pool.
///
/// Ordering contract: `signal_start` happens-before any worker's scan;
/// every worker's merge and finished-report happen-before
/// `wait_all_finished` returning; a shutdown request is observed by parked
/// and scanning workers alike within one poll interval.
#[derive(Debug)]
pub struct WorkerCoordinator {
    start_flags: Vec<AtomicBool>,
    finished: AtomicUsize,
    shutdown: AtomicBool,
}

impl WorkerCoordinator {
    /// Coordinator for `workers` persistent threads.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            start_flags: (0..workers).map(|_| AtomicBool::new(false)).collect(),
            finished: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Number of workers the coordinator was built for.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.start_flags.len()
    }

    /// Release every worker into its scan phase.
    pub fn signal_start(&self) {
        for flag in &self.start_flags {
            flag.store(true, Ordering::Release);
        }
    }

    /// Park until this worker's start flag is raised. Returns `false` once
    /// shutdown has been requested.
    pub fn await_start(&self, worker: usize) -> bool {
        let flag = &self.start_flags[worker];
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            if flag.swap(false, Ordering::Acquire) {
                return true;
            }
            thread::sleep(WORKER_PARK_INTERVAL);
        }
    }

    /// Mark this worker's frame contribution as merged.
    pub fn report_finished(&self) {
        self.finished.fetch_add(1, Ordering::Release);
    }

    /// Spin until every worker has reported, then reset the counter for the
    /// next frame. Returns `false` if shutdown interrupted the wait.
    pub fn wait_all_finished(&self) -> bool {
        while self.finished.load(Ordering::Acquire) < self.start_flags.len() {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            std::hint::spin_loop();
        }
        self.finished.store(0, Ordering::Release);
        true
    }

    /// Ask all workers to exit their loops.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

fn read_state(batches: &RwLock<CircleBatches>) -> RwLockReadGuard<'_, CircleBatches> {
    batches.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(batches: &RwLock<CircleBatches>) -> RwLockWriteGuard<'_, CircleBatches> {
    batches.write().unwrap_or_else(PoisonError::into_inner)
}

fn worker_loop(
    worker: usize,
    range: WorkRange,
    batches: &RwLock<CircleBatches>,
    ledger: &CollisionLedger,
    coordinator: &WorkerCoordinator,
) {
    let mut local = Vec::new();
    while coordinator.await_start(worker) {
        {
            let state = read_state(batches);
            scan_range(&state, &range, &mut local);
        }
        if !local.is_empty() {
            ledger.merge(&mut local);
        }
        coordinator.report_finished();
    }
}

/// The simulation engine: batch store, worker pool, and frame pipeline.
///
/// Per frame: integrate positions, reflect off the walls, signal the workers,
/// wait for detection to complete, then resolve the aggregated collisions.
/// No phase overlaps the next; workers only ever read the batch store while
/// the main thread holds no write access.
#[derive(Debug)]
pub struct CollisionEngine {
    config: EngineConfig,
    batches: Arc<RwLock<CircleBatches>>,
    ledger: Arc<CollisionLedger>,
    coordinator: Arc<WorkerCoordinator>,
    workers: Vec<JoinHandle<()>>,
    frame_records: Vec<CollisionRecord>,
    frame: u64,
}

impl CollisionEngine {
    /// Build an engine with a randomly initialized population.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let mut rng = match config.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let mut batches = CircleBatches::allocate(config.circle_count)?;
        batches.initialize_random(&config, &mut rng);
        Self::with_batches(config, batches)
    }

    /// Build an engine over an explicit population, for deterministic setups.
    pub fn with_circles(config: EngineConfig, seeds: &[CircleSeed]) -> Result<Self, EngineError> {
        if seeds.len() != config.circle_count {
            return Err(EngineError::InvalidConfig(
                "circle_count must match the seed list length",
            ));
        }
        config.validate()?;
        let batches = CircleBatches::from_seeds(seeds)?;
        Self::with_batches(config, batches)
    }

    fn with_batches(config: EngineConfig, batches: CircleBatches) -> Result<Self, EngineError> {
        let ranges = partition_pairs(batches.batch_count(), config.workers);
        let batches = Arc::new(RwLock::new(batches));
        let ledger = Arc::new(CollisionLedger::new());
        let coordinator = Arc::new(WorkerCoordinator::new(config.workers));

        let mut workers = Vec::with_capacity(config.workers);
        for (worker, range) in ranges.into_iter().enumerate() {
            let batches = Arc::clone(&batches);
            let ledger = Arc::clone(&ledger);
            let worker_coordinator = Arc::clone(&coordinator);
            let spawned = thread::Builder::new()
                .name(format!("collision-worker-{worker}"))
                .spawn(move || worker_loop(worker, range, &batches, &ledger, &worker_coordinator));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    // No partial pool: tear down what was already spawned.
                    coordinator.request_shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(EngineError::ThreadSpawn { worker, source });
                }
            }
        }

        Ok(Self {
            config,
            batches,
            ledger,
            coordinator,
            workers,
            frame_records: Vec::new(),
            frame: 0,
        })
    }

    /// Run one frame of the simulation pipeline with the given delta time.
    pub fn step(&mut self, dt: f32) {
        {
            let mut state = write_state(&self.batches);
            state.advance(dt);
            state.resolve_walls(self.config.bounds_width, self.config.bounds_height);
        }

        self.frame_records.clear();
        self.ledger.begin_frame();
        self.coordinator.signal_start();
        if !self.coordinator.wait_all_finished() {
            return;
        }
        self.ledger.swap_into(&mut self.frame_records);

        {
            let mut state = write_state(&self.batches);
            resolve_collisions(&mut state, &self.frame_records);
        }
        self.frame += 1;
    }

    /// Number of frames stepped so far.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Logical circle count.
    #[must_use]
    pub fn circle_count(&self) -> usize {
        self.config.circle_count
    }

    /// Records resolved during the most recent frame.
    #[must_use]
    pub fn last_frame_records(&self) -> &[CollisionRecord] {
        &self.frame_records
    }

    /// Run `visit` against the batch store. The state is stable for the
    /// duration of the call: no pipeline phase runs concurrently with it.
    pub fn with_state<R>(&self, visit: impl FnOnce(&CircleBatches) -> R) -> R {
        visit(&read_state(&self.batches))
    }

    /// Stop and join every worker thread. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.coordinator.request_shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CollisionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
