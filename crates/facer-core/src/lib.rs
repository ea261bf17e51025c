//! facer-core: face detection and recognition engine.
//!
//! SCRFD detection and a 128-d metric descriptor network run via ONNX
//! Runtime; landmarks come from a regression-tree cascade. Each handle
//! serializes its own model forward pass and is otherwise safe to share
//! across threads.

pub mod bitmap;
pub mod chip;
pub mod detector;
pub mod jitter;
pub mod recognizer;
pub mod shape;
pub mod types;

pub use bitmap::{BitmapRef, FaceCrop, ImageError};
pub use detector::{DetectionModel, DetectorError, FaceDetector};
pub use jitter::{Jitter, RandomJitter};
pub use recognizer::{EmbeddingModel, FaceRecognizer, RecognizerError};
pub use shape::{ShapeError, ShapePredictor};
pub use types::{Descriptor, Detection, FaceLandmarks, Rectangle, DESCRIPTOR_SIZE};
