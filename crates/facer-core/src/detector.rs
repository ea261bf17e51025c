//! SCRFD face detector via ONNX Runtime.
//!
//! [`FaceDetector`] owns one loaded detection model behind a mutex. Bitmap
//! conversion happens outside the lock; only the forward pass is serialized.
//! The production model runs SCRFD (Sample and Computation Redistribution
//! for Efficient Face Detection) with 3-stride anchor-free decoding and NMS,
//! batching all images of a call into one session run.

use crate::bitmap::{self, BitmapRef, ImageError};
use crate::types::{Detection, Rectangle};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image conversion failed: {0}")]
    Conversion(#[from] ImageError),
    #[error("detector state poisoned by an earlier failed inference")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A loaded detection network.
///
/// `forward` takes `&mut self`: implementations are not reentrant, and
/// [`FaceDetector`] serializes calls with its own lock.
pub trait DetectionModel: Send {
    /// Detect faces in every image, returning one list per image in input order.
    fn forward(&mut self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError>;
}

impl<T: DetectionModel + ?Sized> DetectionModel for Box<T> {
    fn forward(&mut self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
        (**self).forward(images)
    }
}

/// Thread-safe handle around one detection model.
pub struct FaceDetector<M = OnnxDetectionModel> {
    model: Mutex<M>,
}

impl FaceDetector<OnnxDetectionModel> {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        Ok(Self::new(OnnxDetectionModel::load(model_path)?))
    }
}

impl<M: DetectionModel> FaceDetector<M> {
    pub fn new(model: M) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    /// Detect faces in one host bitmap.
    pub fn detect(&self, image: &BitmapRef<'_>) -> Result<Vec<Detection>, DetectorError> {
        let rgb = bitmap::to_rgb(image)?;
        self.detect_rgb(&rgb)
    }

    /// Detect faces in an already converted image.
    pub fn detect_rgb(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let mut per_image = self.forward(std::slice::from_ref(image))?;
        Ok(per_image.pop().unwrap_or_default())
    }

    /// Detect faces in a batch of host bitmaps with a single forward pass.
    ///
    /// Every bitmap is converted before the model runs; one bad bitmap fails
    /// the whole call without touching the model.
    pub fn batch_detect(&self, images: &[BitmapRef<'_>]) -> Result<Vec<Vec<Detection>>, DetectorError> {
        let rgb = images
            .iter()
            .map(bitmap::to_rgb)
            .collect::<Result<Vec<_>, _>>()?;
        self.batch_detect_rgb(&rgb)
    }

    /// Batch detection over already converted images.
    pub fn batch_detect_rgb(&self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        self.forward(images)
    }

    fn forward(&self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
        let result = {
            let mut model = self.model.lock().map_err(|_| DetectorError::Poisoned)?;
            model.forward(images)
        };

        if let Err(e) = &result {
            tracing::warn!(error = %e, batch = images.len(), "detector forward pass failed");
        }
        let detections = result?;

        if detections.len() != images.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "model returned {} result lists for {} images",
                detections.len(),
                images.len()
            )));
        }

        tracing::debug!(
            batch = images.len(),
            faces = detections.iter().map(Vec::len).sum::<usize>(),
            "detect complete"
        );

        Ok(detections)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Float box used during decoding and suppression.
#[derive(Debug, Clone)]
struct FaceBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
}

impl FaceBox {
    fn into_detection(self) -> Detection {
        Detection {
            rect: Rectangle::from_corners(self.x, self.y, self.x + self.width, self.y + self.height),
            confidence: self.confidence as f64,
        }
    }
}

/// SCRFD network loaded into an ONNX Runtime session.
///
/// The model must be exported with a dynamic batch dimension for
/// multi-image calls.
pub struct OnnxDetectionModel {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl OnnxDetectionModel {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // With landmarks: 3 strides × score/bbox/kps. Without: score/bbox only.
        if num_outputs != 6 && num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 6 or 9 outputs (3 strides × score/bbox[/kps]), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Letterbox one image into slot `batch_idx` of the NCHW input tensor.
    ///
    /// Resizes with bilinear filtering, pads with the mean value (which
    /// normalizes to 0.0) and normalizes to the SCRFD input distribution.
    fn letterbox_into(&self, tensor: &mut Array4<f32>, batch_idx: usize, image: &RgbImage) -> LetterboxInfo {
        let (width, height) = (image.width() as usize, image.height() as usize);

        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = ((width as f32 * scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let resized = image::imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        for y in 0..self.input_height {
            for x in 0..self.input_width {
                let inside = y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w;
                for c in 0..3 {
                    let pixel = if inside {
                        resized.get_pixel((x - pad_x_start) as u32, (y - pad_y_start) as u32)[c] as f32
                    } else {
                        SCRFD_MEAN
                    };
                    tensor[[batch_idx, c, y, x]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        LetterboxInfo { scale, pad_x, pad_y }
    }
}

impl DetectionModel for OnnxDetectionModel {
    fn forward(&mut self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
        let batch = images.len();
        let mut input = Array4::<f32>::zeros((batch, 3, self.input_height, self.input_width));
        let letterboxes: Vec<LetterboxInfo> = images
            .iter()
            .enumerate()
            .map(|(i, img)| self.letterbox_into(&mut input, i, img))
            .collect();

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut per_image: Vec<Vec<FaceBox>> = vec![Vec::new(); batch];

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            let scores = split_batch(scores, batch, "scores", stride)?;
            let bboxes = split_batch(bboxes, batch, "bboxes", stride)?;

            for (i, letterbox) in letterboxes.iter().enumerate() {
                per_image[i].extend(decode_stride(
                    scores[i],
                    bboxes[i],
                    stride,
                    self.input_width,
                    self.input_height,
                    letterbox,
                    SCRFD_CONFIDENCE_THRESHOLD,
                ));
            }
        }

        Ok(per_image
            .into_iter()
            .map(|candidates| {
                let mut kept = nms(candidates, SCRFD_NMS_THRESHOLD);
                kept.sort_by(|a, b| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                kept.into_iter().map(FaceBox::into_detection).collect()
            })
            .collect())
    }
}

/// Split a batched output tensor into equal per-image slices.
fn split_batch<'a>(
    data: &'a [f32],
    batch: usize,
    what: &str,
    stride: usize,
) -> Result<Vec<&'a [f32]>, DetectorError> {
    if batch == 0 || data.len() % batch != 0 {
        return Err(DetectorError::InferenceFailed(format!(
            "{what} stride {stride}: {} values do not split into {batch} images",
            data.len()
        )));
    }
    Ok(data.chunks_exact(data.len() / batch).collect())
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If the named pattern is detected, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32, unused)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level of one image.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<FaceBox> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w * stride) as f32;
        let anchor_cy = (anchor_idx / grid_w * stride) as f32;

        // Decode bbox: [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[bbox_off] * stride as f32;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * stride as f32;

        // Map from letterboxed space to original frame space
        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        detections.push(FaceBox {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
