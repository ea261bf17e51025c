//! Face chip extraction via 4-DOF similarity transform.
//!
//! Warps a face to a canonical square chip: the landmarks are mapped by
//! least-squares onto a reference layout that is shrunk by a padding ratio
//! and scaled to the chip size.

use crate::types::FaceLandmarks;
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Side of the chip fed to the recognition model.
pub const CHIP_SIZE: u32 = 150;
/// Padding around the landmark-derived face boundary, as a fraction of its size.
pub const CHIP_PADDING: f32 = 0.25;

/// Reference positions for the 5-point layout, in the unit face square:
/// [right eye outer, right eye inner, left eye outer, left eye inner, nose base].
const REFERENCE_5: [(f32, f32); 5] = [
    (0.859_567_45, 0.213_498_15),
    (0.646_060_5, 0.228_967_44),
    (0.120_575_06, 0.213_727_45),
    (0.334_085_06, 0.229_064_24),
    (0.490_112_3, 0.627_797_5),
];

/// Mean face positions for points 17..=67 of the 68-point layout.
const MEAN_FACE_68_X: [f32; 51] = [
    0.000213256, 0.0752622, 0.18113, 0.29077, 0.393397, 0.586856, 0.689483, 0.799124, 0.904991,
    0.98004, 0.490127, 0.490127, 0.490127, 0.490127, 0.36688, 0.426036, 0.490127, 0.554217,
    0.613373, 0.121737, 0.187122, 0.265825, 0.334606, 0.260918, 0.182743, 0.645647, 0.714428,
    0.793132, 0.858516, 0.79751, 0.719335, 0.254149, 0.340985, 0.428858, 0.490127, 0.551395,
    0.639268, 0.726104, 0.642159, 0.556721, 0.490127, 0.423532, 0.338094, 0.290379, 0.428096,
    0.490127, 0.552157, 0.689874, 0.553364, 0.490127, 0.42689,
];
const MEAN_FACE_68_Y: [f32; 51] = [
    0.106454, 0.038915, 0.0187482, 0.0344891, 0.0773906, 0.0773906, 0.0344891, 0.0187482,
    0.038915, 0.106454, 0.203352, 0.307009, 0.409805, 0.515625, 0.587326, 0.609345, 0.628106,
    0.609345, 0.587326, 0.216423, 0.178758, 0.179852, 0.231733, 0.245099, 0.244077, 0.231733,
    0.179852, 0.178758, 0.216423, 0.244077, 0.245099, 0.780233, 0.745405, 0.727388, 0.742578,
    0.727388, 0.745405, 0.780233, 0.864805, 0.902192, 0.909281, 0.902192, 0.864805, 0.784792,
    0.778746, 0.785343, 0.778746, 0.784792, 0.824182, 0.831803, 0.824182,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChipError {
    #[error("unsupported landmark layout: {0} points (expected 5 or 68)")]
    UnsupportedLandmarks(usize),
}

/// Pairs of (landmark index, reference position in chip pixels).
pub(crate) fn reference_points(num_points: usize, size: u32, padding: f32) -> Result<Vec<(usize, (f32, f32))>, ChipError> {
    let place = |(x, y): (f32, f32)| {
        let s = size as f32;
        ((padding + x) / (2.0 * padding + 1.0) * s, (padding + y) / (2.0 * padding + 1.0) * s)
    };

    match num_points {
        5 => Ok(REFERENCE_5.iter().enumerate().map(|(i, &p)| (i, place(p))).collect()),
        68 => Ok((17..68)
            // eyebrows and lower lip are too mobile to anchor the pose
            .filter(|i| !(17..=26).contains(i) && !(55..=59).contains(i) && !(65..=67).contains(i))
            .map(|i| (i, place((MEAN_FACE_68_X[i - 17], MEAN_FACE_68_Y[i - 17]))))
            .collect()),
        n => Err(ChipError::UnsupportedLandmarks(n)),
    }
}

/// Check that a shape model's landmark count has a chip reference layout.
pub fn check_landmark_count(num_points: usize) -> Result<(), ChipError> {
    reference_points(num_points, CHIP_SIZE, CHIP_PADDING).map(|_| ())
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` points to `dst` points using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub(crate) fn estimate_similarity_transform(src: &[(f32, f32)], dst: &[(f32, f32)]) -> [f32; 6] {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16]; // 4x4, row-major
    let mut atb = [0.0f32; 4]; // 4x1

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // fallback: identity-ish
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Apply a 2×3 similarity warp (source → output) to produce a square image.
///
/// Each output pixel is mapped back through the inverse transform and
/// sampled bilinearly. Out-of-bounds samples are black.
pub(crate) fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);
    let (src_width, src_height) = (image.width() as i64, image.height() as i64);

    // Invert the 2x2 part: M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < src_width && y >= 0 && y < src_height {
            image.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        Rgb(std::array::from_fn(|c| {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            val.round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Transform from image space to chip space for the given landmarks.
pub fn chip_transform(landmarks: &FaceLandmarks, size: u32, padding: f32) -> Result<[f32; 6], ChipError> {
    let pairs = reference_points(landmarks.len(), size, padding)?;
    let (src, dst): (Vec<_>, Vec<_>) = pairs
        .into_iter()
        .map(|(i, reference)| (landmarks.points[i], reference))
        .unzip();
    Ok(estimate_similarity_transform(&src, &dst))
}

/// Extract a `size`×`size` face chip aligned by the landmarks.
pub fn extract_face_chip(
    image: &RgbImage,
    landmarks: &FaceLandmarks,
    size: u32,
    padding: f32,
) -> Result<RgbImage, ChipError> {
    let matrix = chip_transform(landmarks, size, padding)?;
    Ok(warp_affine(image, &matrix, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_point_reference(size: u32, padding: f32) -> FaceLandmarks {
        let points = reference_points(5, size, padding)
            .unwrap()
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        FaceLandmarks { points }
    }

    #[test]
    fn test_identity_transform() {
        // When src == dst, transform should be identity-like (a≈1, b≈0)
        let pts: Vec<(f32, f32)> = REFERENCE_5.iter().map(|&(x, y)| (x * 112.0, y * 112.0)).collect();
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let dst: Vec<(f32, f32)> = REFERENCE_5.iter().map(|&(x, y)| (x * 150.0, y * 150.0)).collect();
        let src: Vec<(f32, f32)> = dst.iter().map(|&(x, y)| (x * 2.0 + 7.0, y * 2.0 - 3.0)).collect();
        let m = estimate_similarity_transform(&src, &dst);

        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}, expected ~0.5", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_rotated_transform() {
        // 90° rotation: (x, y) → (-y, x) gives a = 0, b = 1
        let src = [(1.0, 0.0), (0.0, 1.0), (2.0, 3.0), (-1.0, 4.0), (5.0, -2.0)];
        let dst: Vec<(f32, f32)> = src.iter().map(|&(x, y): &(f32, f32)| (-y, x)).collect();
        let m = estimate_similarity_transform(&src, &dst);
        assert!(m[0].abs() < 1e-4, "a = {}", m[0]);
        assert!((m[3] - 1.0).abs() < 1e-4, "b = {}", m[3]);
    }

    #[test]
    fn test_reference_points_padding() {
        // With zero padding the unit square maps straight onto the chip
        let pts = reference_points(5, 100, 0.0).unwrap();
        assert!(((pts[4].1).0 - 49.01123).abs() < 1e-3);
        // Padding shrinks the layout towards the center
        let padded = reference_points(5, 100, 0.25).unwrap();
        assert!(((padded[4].1).0 - (0.25 + 0.4901123) / 1.5 * 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_reference_points_68_skips_brows_and_lower_lip() {
        let pts = reference_points(68, 150, 0.25).unwrap();
        let indices: Vec<usize> = pts.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices.first(), Some(&27));
        assert!(!indices.iter().any(|i| (55..=59).contains(i) || (65..=67).contains(i)));
        assert_eq!(indices.len(), 51 - 10 - 5 - 3);
    }

    #[test]
    fn test_unsupported_landmark_count() {
        let landmarks = FaceLandmarks { points: vec![(0.0, 0.0); 7] };
        let err = extract_face_chip(&RgbImage::new(10, 10), &landmarks, CHIP_SIZE, CHIP_PADDING).unwrap_err();
        assert_eq!(err, ChipError::UnsupportedLandmarks(7));
    }

    #[test]
    fn test_check_landmark_count() {
        assert!(check_landmark_count(5).is_ok());
        assert!(check_landmark_count(68).is_ok());
        assert_eq!(check_landmark_count(2), Err(ChipError::UnsupportedLandmarks(2)));
    }

    #[test]
    fn test_warp_output_size() {
        let image = RgbImage::from_pixel(64, 48, Rgb([128, 128, 128]));
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]; // identity
        let out = warp_affine(&image, &m, 32);
        assert_eq!(out.dimensions(), (32, 32));
        assert_eq!(out.get_pixel(5, 5), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_chip_at_reference_is_identity() {
        // Landmarks already at their chip positions: the chip is the image itself
        let image = RgbImage::from_fn(CHIP_SIZE, CHIP_SIZE, |x, y| Rgb([x as u8, y as u8, 7]));
        let landmarks = five_point_reference(CHIP_SIZE, CHIP_PADDING);
        let chip = extract_face_chip(&image, &landmarks, CHIP_SIZE, CHIP_PADDING).unwrap();
        assert_eq!(chip.dimensions(), (CHIP_SIZE, CHIP_SIZE));
        for (x, y) in [(10, 10), (75, 75), (140, 20)] {
            let (a, b) = (chip.get_pixel(x, y), image.get_pixel(x, y));
            for c in 0..3 {
                assert!((a[c] as i32 - b[c] as i32).abs() <= 1, "({x},{y}) {a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the nose landmark lands on the reference nose position.
        let mut image = RgbImage::new(300, 300);
        let landmarks = FaceLandmarks {
            points: five_point_reference(CHIP_SIZE, CHIP_PADDING)
                .points
                .iter()
                .map(|&(x, y)| (x * 1.6 + 40.0, y * 1.6 + 25.0))
                .collect(),
        };

        let (nx, ny) = landmarks.points[4];
        for dy in 0..7u32 {
            for dx in 0..7u32 {
                image.put_pixel(nx as u32 + dx - 3, ny as u32 + dy - 3, Rgb([255, 255, 255]));
            }
        }

        let chip = extract_face_chip(&image, &landmarks, CHIP_SIZE, CHIP_PADDING).unwrap();
        let (rx, ry) = five_point_reference(CHIP_SIZE, CHIP_PADDING).points[4];
        let max_val = (0..3)
            .flat_map(|dy| (0..3).map(move |dx| (dx, dy)))
            .map(|(dx, dy)| chip.get_pixel(rx.round() as u32 + dx - 1, ry.round() as u32 + dy - 1)[0])
            .max()
            .unwrap_or(0);
        assert!(max_val > 100, "expected bright patch near reference nose ({rx}, {ry}), max={max_val}");
    }
}
