//! Facial landmark (shape) prediction.
//!
//! [`RegressionTreeShapePredictor`] is a cascade of regression-tree forests
//! (one-millisecond face alignment, Kazemi & Sullivan 2014). Each cascade
//! level samples pixel intensities at points anchored to the current shape
//! estimate, walks every tree on pixel-difference splits and adds the leaf
//! offsets to the shape. Prediction only reads the model, so one predictor is
//! shared across threads without locking.

use crate::chip::estimate_similarity_transform;
use crate::types::{FaceLandmarks, Rectangle};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed shape model: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid shape model: {0}")]
    InvalidModel(String),
}

/// Landmark predictor over a face rectangle.
///
/// Implementations must be safe to call concurrently through `&self`.
pub trait ShapePredictor: Send + Sync {
    fn predict(&self, image: &RgbImage, rect: &Rectangle) -> Result<FaceLandmarks, ShapeError>;
}

impl<T: ShapePredictor + ?Sized> ShapePredictor for Box<T> {
    fn predict(&self, image: &RgbImage, rect: &Rectangle) -> Result<FaceLandmarks, ShapeError> {
        (**self).predict(image, rect)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SplitFeature {
    idx1: usize,
    idx2: usize,
    thresh: f32,
}

/// Complete binary tree stored breadth-first: node `i` has children
/// `2i + 1` (difference above threshold) and `2i + 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressionTree {
    splits: Vec<SplitFeature>,
    /// One shape offset (interleaved x, y) per leaf.
    leaf_values: Vec<Vec<f32>>,
}

impl RegressionTree {
    fn evaluate(&self, features: &[f32]) -> &[f32] {
        let mut i = 0;
        while i < self.splits.len() {
            let s = &self.splits[i];
            i = if features[s.idx1] - features[s.idx2] > s.thresh {
                2 * i + 1
            } else {
                2 * i + 2
            };
        }
        &self.leaf_values[i - self.splits.len()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Cascade {
    /// Landmark each feature point is anchored to.
    anchor_idx: Vec<usize>,
    /// Feature point offset from its anchor, in mean-shape coordinates.
    deltas: Vec<(f32, f32)>,
    forest: Vec<RegressionTree>,
}

/// Regression-tree cascade loaded from a JSON model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTreeShapePredictor {
    /// Mean shape in the unit face square, interleaved x, y.
    initial_shape: Vec<f32>,
    cascades: Vec<Cascade>,
}

impl RegressionTreeShapePredictor {
    /// Load a predictor from a JSON model file.
    pub fn load(model_path: &str) -> Result<Self, ShapeError> {
        if !Path::new(model_path).exists() {
            return Err(ShapeError::ModelNotFound(model_path.to_string()));
        }

        let text = std::fs::read_to_string(model_path)?;
        let predictor: Self = serde_json::from_str(&text)?;
        predictor.validate()?;

        tracing::info!(
            path = model_path,
            parts = predictor.num_parts(),
            cascades = predictor.cascades.len(),
            trees = predictor.cascades.iter().map(|c| c.forest.len()).sum::<usize>(),
            "loaded shape predictor"
        );

        Ok(predictor)
    }

    pub fn num_parts(&self) -> usize {
        self.initial_shape.len() / 2
    }

    /// Check every index in the model so prediction can't go out of bounds.
    fn validate(&self) -> Result<(), ShapeError> {
        let invalid = |msg: String| Err(ShapeError::InvalidModel(msg));

        if self.initial_shape.is_empty() || self.initial_shape.len() % 2 != 0 {
            return invalid(format!("initial shape has {} values", self.initial_shape.len()));
        }
        let parts = self.num_parts();

        for (level, cascade) in self.cascades.iter().enumerate() {
            let features = cascade.anchor_idx.len();
            if cascade.deltas.len() != features {
                return invalid(format!(
                    "cascade {level}: {features} anchors but {} deltas",
                    cascade.deltas.len()
                ));
            }
            if let Some(&bad) = cascade.anchor_idx.iter().find(|&&a| a >= parts) {
                return invalid(format!("cascade {level}: anchor {bad} >= {parts} parts"));
            }
            for (t, tree) in cascade.forest.iter().enumerate() {
                if tree.leaf_values.len() != tree.splits.len() + 1 {
                    return invalid(format!(
                        "cascade {level} tree {t}: {} splits need {} leaves, got {}",
                        tree.splits.len(),
                        tree.splits.len() + 1,
                        tree.leaf_values.len()
                    ));
                }
                if tree.splits.iter().any(|s| s.idx1 >= features || s.idx2 >= features) {
                    return invalid(format!("cascade {level} tree {t}: split feature out of range"));
                }
                if tree.leaf_values.iter().any(|l| l.len() != self.initial_shape.len()) {
                    return invalid(format!("cascade {level} tree {t}: leaf size mismatch"));
                }
            }
        }

        Ok(())
    }

    /// Sample pixel intensities at the feature points of one cascade level.
    fn feature_pixel_values(
        &self,
        image: &RgbImage,
        rect: &Rectangle,
        shape: &[(f32, f32)],
        mean_shape: &[(f32, f32)],
        cascade: &Cascade,
    ) -> Vec<f32> {
        // Only the rotation/scale part is applied to the deltas
        let m = estimate_similarity_transform(mean_shape, shape);
        let (a, b) = (m[0], m[3]);

        cascade
            .anchor_idx
            .iter()
            .zip(cascade.deltas.iter())
            .map(|(&anchor, &(dx, dy))| {
                let (ax, ay) = shape[anchor];
                let (px, py) = unnormalize(rect, (ax + a * dx - b * dy, ay + b * dx + a * dy));
                let (x, y) = (px.round() as i64, py.round() as i64);
                if x >= 0 && y >= 0 && x < image.width() as i64 && y < image.height() as i64 {
                    let p = image.get_pixel(x as u32, y as u32);
                    (p[0] as f32 + p[1] as f32 + p[2] as f32) / 3.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

/// Map a point of the unit face square onto the rectangle.
fn unnormalize(rect: &Rectangle, (x, y): (f32, f32)) -> (f32, f32) {
    (
        rect.left as f32 + x * (rect.right - rect.left) as f32,
        rect.top as f32 + y * (rect.bottom - rect.top) as f32,
    )
}

impl ShapePredictor for RegressionTreeShapePredictor {
    fn predict(&self, image: &RgbImage, rect: &Rectangle) -> Result<FaceLandmarks, ShapeError> {
        let mean_shape: Vec<(f32, f32)> = self
            .initial_shape
            .chunks_exact(2)
            .map(|p| (p[0], p[1]))
            .collect();
        let mut shape = mean_shape.clone();

        for cascade in &self.cascades {
            let features = self.feature_pixel_values(image, rect, &shape, &mean_shape, cascade);
            for tree in &cascade.forest {
                let offsets = tree.evaluate(&features);
                for (p, d) in shape.iter_mut().zip(offsets.chunks_exact(2)) {
                    p.0 += d[0];
                    p.1 += d[1];
                }
            }
        }

        Ok(FaceLandmarks {
            points: shape.into_iter().map(|p| unnormalize(rect, p)).collect(),
        })
    }
}
