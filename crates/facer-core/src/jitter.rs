//! Randomized chip augmentation for descriptor averaging.
//!
//! Each jittered copy is the chip with a small random zoom, rotation and
//! translation, a coin-flip mirror and a mild per-channel color gain. The
//! recognizer averages the descriptors of all copies.

use crate::chip::warp_affine;
use image::{imageops, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Max translation as a fraction of the chip side.
const MAX_SHIFT: f32 = 0.02;
/// Zoom-in range; values below 1 crop a slightly smaller box.
const SCALE_RANGE: (f32, f32) = (0.97, 0.99999);
/// Max rotation in degrees.
const MAX_ROTATION_DEG: f32 = 3.0;
/// Per-channel gain range.
const GAIN_RANGE: (f32, f32) = (0.95, 1.05);
/// Border excluded before jittering, in pixels.
const BORDER: f32 = 3.0;

/// Produces augmented copies of a face chip.
pub trait Jitter: Send + Sync {
    fn jitter(&self, chip: &RgbImage, count: usize) -> Vec<RgbImage>;
}

impl<T: Jitter + ?Sized> Jitter for Box<T> {
    fn jitter(&self, chip: &RgbImage, count: usize) -> Vec<RgbImage> {
        (**self).jitter(chip, count)
    }
}

/// Parameters of a single jittered copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterParams {
    /// Translation in pixels.
    pub shift: (f32, f32),
    /// Output size over sampled box size; 1.0 keeps the scale.
    pub scale: f32,
    /// Rotation in radians.
    pub angle: f32,
    pub mirror: bool,
    /// RGB gains.
    pub gain: [f32; 3],
}

impl JitterParams {
    /// Parameters that reproduce the chip unchanged.
    pub fn identity() -> Self {
        Self {
            shift: (0.0, 0.0),
            scale: 1.0,
            angle: 0.0,
            mirror: false,
            gain: [1.0; 3],
        }
    }

    fn sample(rng: &mut impl Rng, side: f32) -> Self {
        let box_side = (side - 2.0 * BORDER).max(1.0);
        let max_shift = MAX_SHIFT * box_side;
        let max_angle = MAX_ROTATION_DEG.to_radians();
        Self {
            shift: (
                rng.gen_range(-max_shift..=max_shift),
                rng.gen_range(-max_shift..=max_shift),
            ),
            scale: 1.0 / rng.gen_range(SCALE_RANGE.0..SCALE_RANGE.1),
            angle: rng.gen_range(-max_angle..=max_angle),
            mirror: rng.gen_bool(0.5),
            gain: std::array::from_fn(|_| rng.gen_range(GAIN_RANGE.0..=GAIN_RANGE.1)),
        }
    }

    /// Render one copy of `chip` with these parameters.
    pub fn apply(&self, chip: &RgbImage) -> RgbImage {
        let side = chip.width();
        let center = (side as f32 - 1.0) / 2.0;

        // Rotate and zoom about the shifted center, then move it back to the chip center
        let (sin, cos) = self.angle.sin_cos();
        let a = self.scale * cos;
        let b = self.scale * sin;
        let (cx, cy) = (center + self.shift.0, center + self.shift.1);
        let tx = center - (a * cx - b * cy);
        let ty = center - (b * cx + a * cy);

        let mut out = warp_affine(chip, &[a, -b, tx, b, a, ty], side);
        if self.mirror {
            imageops::flip_horizontal_in_place(&mut out);
        }
        if self.gain != [1.0; 3] {
            for px in out.pixels_mut() {
                for (c, g) in px.0.iter_mut().zip(self.gain) {
                    *c = (*c as f32 * g).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        out
    }
}

/// [`Jitter`] backed by a locked PRNG.
///
/// Parameters are drawn under the lock; the warps run outside it.
pub struct RandomJitter {
    rng: Mutex<StdRng>,
}

impl RandomJitter {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible sequence, for tests and offline evaluation.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn draw(&self, side: f32, count: usize) -> Vec<JitterParams> {
        // A poisoned PRNG is still a valid PRNG
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        (0..count).map(|_| JitterParams::sample(&mut *rng, side)).collect()
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl Jitter for RandomJitter {
    fn jitter(&self, chip: &RgbImage, count: usize) -> Vec<RgbImage> {
        self.draw(chip.width() as f32, count)
            .iter()
            .map(|params| params.apply(chip))
            .collect()
    }
}
