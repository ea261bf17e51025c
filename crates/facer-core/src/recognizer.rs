//! Face recognizer: landmarks, aligned chip, descriptor network.
//!
//! [`FaceRecognizer`] combines a shape predictor, a chip jitterer and one
//! recognition network. Only the network forward pass runs under the
//! handle's mutex; landmark prediction, chip extraction and jittering run on
//! the calling thread.

use crate::bitmap::{self, BitmapRef, FaceCrop, ImageError};
use crate::chip::{self, ChipError, CHIP_PADDING, CHIP_SIZE};
use crate::jitter::{Jitter, RandomJitter};
use crate::shape::{RegressionTreeShapePredictor, ShapeError, ShapePredictor};
use crate::types::{Descriptor, Rectangle, DESCRIPTOR_SIZE};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (ResNet-29 metric network, dlib layout) ---
const EMBEDDING_INPUT_SIZE: usize = CHIP_SIZE as usize;
/// Per-channel RGB means subtracted before scaling.
const EMBEDDING_MEAN: [f32; 3] = [122.782, 117.001, 104.298];
const EMBEDDING_SCALE: f32 = 256.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("shape predictor: {0}")]
    Shape(#[from] ShapeError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unsupported landmark layout: {0} points (expected 5 or 68)")]
    UnsupportedLandmarks(usize),
    #[error("image conversion failed: {0}")]
    Conversion(#[from] ImageError),
    #[error("recognizer state poisoned by an earlier failed inference")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ChipError> for RecognizerError {
    fn from(e: ChipError) -> Self {
        match e {
            ChipError::UnsupportedLandmarks(n) => Self::UnsupportedLandmarks(n),
        }
    }
}

/// A loaded descriptor network.
///
/// `forward` takes `&mut self` and is serialized by [`FaceRecognizer`].
pub trait EmbeddingModel: Send {
    /// One output row per chip, in input order.
    fn forward(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>, RecognizerError>;
}

impl<T: EmbeddingModel + ?Sized> EmbeddingModel for Box<T> {
    fn forward(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>, RecognizerError> {
        (**self).forward(chips)
    }
}

/// Thread-safe recognizer handle.
pub struct FaceRecognizer<S = RegressionTreeShapePredictor, M = OnnxEmbeddingModel, J = RandomJitter> {
    shaper: S,
    model: Mutex<M>,
    jitter: J,
    jitter_count: u32,
}

impl FaceRecognizer {
    /// Load the shape predictor and the recognition network.
    ///
    /// `jitter_count == 0` disables augmentation. A shape model whose landmark
    /// count has no chip layout is rejected before the network is loaded.
    pub fn load(shaper_path: &str, recognizer_path: &str, jitter_count: u32) -> Result<Self, RecognizerError> {
        let shaper = RegressionTreeShapePredictor::load(shaper_path)?;
        chip::check_landmark_count(shaper.num_parts())?;
        let model = OnnxEmbeddingModel::load(recognizer_path)?;
        Ok(Self::new(shaper, model, RandomJitter::from_entropy(), jitter_count))
    }
}

impl<S: ShapePredictor, M: EmbeddingModel, J: Jitter> FaceRecognizer<S, M, J> {
    pub fn new(shaper: S, model: M, jitter: J, jitter_count: u32) -> Self {
        Self {
            shaper,
            model: Mutex::new(model),
            jitter,
            jitter_count,
        }
    }

    pub fn jitter_count(&self) -> u32 {
        self.jitter_count
    }

    /// Compute the descriptor of an aligned face crop.
    ///
    /// With a non-zero jitter count the result is the elementwise mean over
    /// that many jittered copies of the chip.
    pub fn recognize(&self, face: &FaceCrop) -> Result<Descriptor, RecognizerError> {
        let image = face.image();
        let landmarks = self
            .shaper
            .predict(image, &Rectangle::covering(image.width(), image.height()))?;
        let chip = chip::extract_face_chip(image, &landmarks, CHIP_SIZE, CHIP_PADDING)?;

        if self.jitter_count == 0 {
            let mut descriptors = self.forward(std::slice::from_ref(&chip))?;
            return descriptors
                .pop()
                .ok_or_else(|| RecognizerError::InferenceFailed("no descriptor produced".into()));
        }

        let expected = self.jitter_count as usize;
        let chips = self.jitter.jitter(&chip, expected);
        if chips.len() != expected {
            return Err(RecognizerError::InferenceFailed(format!(
                "jitter produced {} chips, expected {expected}",
                chips.len()
            )));
        }

        let descriptors = self.forward(&chips)?;
        Descriptor::mean(&descriptors)
            .ok_or_else(|| RecognizerError::InferenceFailed("no descriptor produced".into()))
    }

    /// Convert a host bitmap holding one face crop and recognize it.
    pub fn recognize_bitmap(&self, image: &BitmapRef<'_>) -> Result<Descriptor, RecognizerError> {
        let face = FaceCrop::from_bitmap(image)?;
        self.recognize(&face)
    }

    /// Recognize the face inside `rect` of a scene bitmap.
    ///
    /// The rectangle is clipped to the image, as detector output may reach
    /// past the frame edge.
    pub fn recognize_region(&self, image: &BitmapRef<'_>, rect: &Rectangle) -> Result<Descriptor, RecognizerError> {
        let scene = bitmap::to_rgb(image)?;
        let face = FaceCrop::from_detection(&scene, rect)?;
        self.recognize(&face)
    }

    fn forward(&self, chips: &[RgbImage]) -> Result<Vec<Descriptor>, RecognizerError> {
        let result = {
            let mut model = self.model.lock().map_err(|_| RecognizerError::Poisoned)?;
            model.forward(chips)
        };

        if let Err(e) = &result {
            tracing::warn!(error = %e, batch = chips.len(), "recognizer forward pass failed");
        }
        let rows = result?;

        if rows.len() != chips.len() {
            return Err(RecognizerError::InferenceFailed(format!(
                "model returned {} rows for {} chips",
                rows.len(),
                chips.len()
            )));
        }

        let descriptors = rows
            .iter()
            .map(|row| {
                Descriptor::from_slice(row).ok_or_else(|| {
                    RecognizerError::InferenceFailed(format!(
                        "expected {DESCRIPTOR_SIZE}-dim descriptor, got {}",
                        row.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(batch = chips.len(), "recognize complete");
        Ok(descriptors)
    }
}

/// Descriptor network loaded into an ONNX Runtime session.
///
/// Expects a `[N, 3, 150, 150]` input and a `[N, 128]` output; the batch
/// dimension must be dynamic when jittering.
pub struct OnnxEmbeddingModel {
    session: Session,
}

impl OnnxEmbeddingModel {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self { session })
    }

    /// Write one chip into slot `batch_idx` of the NCHW input tensor.
    fn preprocess_into(tensor: &mut Array4<f32>, batch_idx: usize, chip: &RgbImage) {
        let size = EMBEDDING_INPUT_SIZE;
        let resized;
        let chip = if chip.dimensions() == (size as u32, size as u32) {
            chip
        } else {
            resized = image::imageops::resize(chip, size as u32, size as u32, FilterType::Triangle);
            &resized
        };

        for (x, y, pixel) in chip.enumerate_pixels() {
            for c in 0..3 {
                tensor[[batch_idx, c, y as usize, x as usize]] = (pixel[c] as f32 - EMBEDDING_MEAN[c]) / EMBEDDING_SCALE;
            }
        }
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn forward(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>, RecognizerError> {
        let batch = chips.len();
        if batch == 0 {
            return Ok(Vec::new());
        }

        let size = EMBEDDING_INPUT_SIZE;
        let mut input = Array4::<f32>::zeros((batch, 3, size, size));
        for (i, chip) in chips.iter().enumerate() {
            Self::preprocess_into(&mut input, i, chip);
        }

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.len() % batch != 0 {
            return Err(RecognizerError::InferenceFailed(format!(
                "{} output values do not split into {batch} rows",
                raw.len()
            )));
        }

        Ok(raw.chunks_exact(raw.len() / batch).map(<[f32]>::to_vec).collect())
    }
}
