use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of floats in a face descriptor.
pub const DESCRIPTOR_SIZE: usize = 128;

/// Axis-aligned rectangle in source-image pixel coordinates (inclusive corners).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Rectangle {
    pub fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self { left, top, right, bottom }
    }

    /// Build a rectangle from two float corners produced by a model.
    ///
    /// Corners are rounded to the nearest pixel and reordered, so the result
    /// always satisfies `left <= right` and `top <= bottom`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, x2) = (x1.round() as i64, x2.round() as i64);
        let (y1, y2) = (y1.round() as i64, y2.round() as i64);
        Self {
            left: x1.min(x2),
            top: y1.min(y2),
            right: x1.max(x2),
            bottom: y1.max(y2),
        }
    }

    /// The rectangle covering a whole `width` x `height` image.
    pub fn covering(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i64 - 1,
            bottom: height as i64 - 1,
        }
    }

    pub fn width(&self) -> i64 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top + 1
    }

    /// Clip to the bounds of a `width` x `height` image.
    ///
    /// Returns `None` when the rectangle lies entirely outside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        let max_x = width as i64 - 1;
        let max_y = height as i64 - 1;
        if self.right < 0 || self.bottom < 0 || self.left > max_x || self.top > max_y {
            return None;
        }
        Some(Self {
            left: self.left.max(0),
            top: self.top.max(0),
            right: self.right.min(max_x),
            bottom: self.bottom.min(max_y),
        })
    }
}

/// A detected face: rectangle plus the detector's confidence score.
///
/// The score scale is defined by the loaded model and is only meaningful for
/// ordering detections produced by the same model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub rect: Rectangle,
    pub confidence: f64,
}

/// Facial landmark positions in image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    pub points: Vec<(f32, f32)>,
}

impl FaceLandmarks {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Fixed-length face descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descriptor(pub [f32; DESCRIPTOR_SIZE]);

impl Descriptor {
    /// Copy a model output row into a descriptor. Returns `None` unless the
    /// row has exactly [`DESCRIPTOR_SIZE`] values.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let array: [f32; DESCRIPTOR_SIZE] = values.try_into().ok()?;
        Some(Self(array))
    }

    /// Elementwise arithmetic mean of several descriptors.
    ///
    /// Returns `None` for an empty input.
    pub fn mean(descriptors: &[Descriptor]) -> Option<Self> {
        if descriptors.is_empty() {
            return None;
        }
        let mut sum = [0.0f64; DESCRIPTOR_SIZE];
        for d in descriptors {
            for (acc, v) in sum.iter_mut().zip(d.0.iter()) {
                *acc += *v as f64;
            }
        }
        let n = descriptors.len() as f64;
        Some(Self(std::array::from_fn(|i| (sum[i] / n) as f32)))
    }

    /// Euclidean distance between two descriptors.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

// serde only derives arrays up to 32 elements.
impl Serialize for Descriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for Descriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<f32>::deserialize(deserializer)?;
        Descriptor::from_slice(&values).ok_or_else(|| {
            D::Error::invalid_length(values.len(), &"a descriptor of 128 floats")
        })
    }
}
