//! Host bitmap adapter.
//!
//! Converts a borrowed host bitmap (8-bit gray, BGR or BGRA rows with an
//! arbitrary row stride) into the RGB buffer both models consume, and
//! defines the face-crop input contract of the recognizer.

use crate::types::Rectangle;
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Smallest accepted side of a face crop, in pixels.
pub const MIN_FACE_CROP_SIDE: u32 = 16;
/// Largest accepted ratio between the long and the short side of a face crop.
pub const MAX_FACE_CROP_ASPECT: f32 = 2.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("bitmap pixel buffer is null")]
    NullData,
    #[error("invalid bitmap dimensions {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },
    #[error("unsupported channel count {0} (expected 1, 3 or 4)")]
    UnsupportedChannels(i64),
    #[error("row stride {stride} is smaller than a row of {row_bytes} bytes")]
    InvalidStride { stride: usize, row_bytes: usize },
    #[error("bitmap buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },
    #[error("{width}x{height} image is not a face crop (min side {MIN_FACE_CROP_SIDE}, max aspect {MAX_FACE_CROP_ASPECT})")]
    NotAFaceCrop { width: u32, height: u32 },
    #[error("region {0:?} lies outside the image")]
    RegionOutside(Rectangle),
    #[error("region {0:?} has inverted corners")]
    InvalidRegion(Rectangle),
}

/// Pixel layout selected by the bitmap's channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// One 8-bit intensity channel.
    Gray,
    /// Packed blue, green, red.
    Bgr,
    /// Packed blue, green, red, alpha. Alpha is dropped.
    Bgra,
}

impl ChannelLayout {
    pub fn from_channels(channels: u32) -> Result<Self, ImageError> {
        match channels {
            1 => Ok(Self::Gray),
            3 => Ok(Self::Bgr),
            4 => Ok(Self::Bgra),
            other => Err(ImageError::UnsupportedChannels(other as i64)),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Bgr => 3,
            Self::Bgra => 4,
        }
    }
}

/// A host-owned bitmap borrowed for the duration of one call.
#[derive(Debug, Clone, Copy)]
pub struct BitmapRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows.
    pub stride: usize,
    pub channels: u32,
}

impl<'a> BitmapRef<'a> {
    /// Borrow a bitmap, checking its layout against the buffer.
    pub fn new(data: &'a [u8], width: u32, height: u32, stride: usize, channels: u32) -> Result<Self, ImageError> {
        let bitmap = Self {
            data,
            width,
            height,
            stride,
            channels,
        };
        bitmap.validate()?;
        Ok(bitmap)
    }

    /// A bitmap whose rows are tightly packed (`stride == width * channels`).
    pub fn packed(data: &'a [u8], width: u32, height: u32, channels: u32) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * channels as usize,
            channels,
        }
    }

    /// Check dimensions, stride and buffer length; returns the pixel layout.
    pub fn validate(&self) -> Result<ChannelLayout, ImageError> {
        let layout = ChannelLayout::from_channels(self.channels)?;

        if self.width == 0 || self.height == 0 {
            return Err(ImageError::InvalidDimensions {
                width: self.width as i64,
                height: self.height as i64,
            });
        }

        let row_bytes = self.width as usize * layout.bytes_per_pixel();
        if self.stride < row_bytes {
            return Err(ImageError::InvalidStride {
                stride: self.stride,
                row_bytes,
            });
        }

        let required = self
            .stride
            .checked_mul(self.height as usize - 1)
            .and_then(|n| n.checked_add(row_bytes))
            .unwrap_or(usize::MAX);
        if self.data.len() < required {
            return Err(ImageError::BufferTooSmall {
                required,
                actual: self.data.len(),
            });
        }

        Ok(layout)
    }
}

/// Convert a host bitmap into an RGB image.
///
/// Multi-channel bitmaps take the color path (BGR order, as OpenCV hands
/// them over); single-channel bitmaps are replicated into all three channels.
pub fn to_rgb(bitmap: &BitmapRef<'_>) -> Result<RgbImage, ImageError> {
    let layout = bitmap.validate()?;
    let bpp = layout.bytes_per_pixel();
    let row_bytes = bitmap.width as usize * bpp;

    let mut out = RgbImage::new(bitmap.width, bitmap.height);
    for y in 0..bitmap.height {
        let start = y as usize * bitmap.stride;
        let row = &bitmap.data[start..start + row_bytes];
        for (x, px) in row.chunks_exact(bpp).enumerate() {
            let rgb = match layout {
                ChannelLayout::Gray => Rgb([px[0], px[0], px[0]]),
                ChannelLayout::Bgr | ChannelLayout::Bgra => Rgb([px[2], px[1], px[0]]),
            };
            out.put_pixel(x as u32, y, rgb);
        }
    }

    Ok(out)
}

/// An image that is already a single, roughly aligned face region.
///
/// The recognizer runs its shape predictor over the whole image, so it only
/// accepts this type. Construction rejects images that are too small or too
/// elongated to be a face crop.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    image: RgbImage,
}

impl FaceCrop {
    pub fn new(image: RgbImage) -> Result<Self, ImageError> {
        let (w, h) = image.dimensions();
        let short = w.min(h);
        let long = w.max(h);
        if short < MIN_FACE_CROP_SIDE || long as f32 / short as f32 > MAX_FACE_CROP_ASPECT {
            return Err(ImageError::NotAFaceCrop { width: w, height: h });
        }
        Ok(Self { image })
    }

    /// Convert a host bitmap and validate it as a face crop.
    pub fn from_bitmap(bitmap: &BitmapRef<'_>) -> Result<Self, ImageError> {
        Self::new(to_rgb(bitmap)?)
    }

    /// Cut a detector rectangle out of a scene image.
    ///
    /// The rectangle is clipped to the image first. Corners must be ordered.
    pub fn from_detection(scene: &RgbImage, rect: &Rectangle) -> Result<Self, ImageError> {
        if rect.left > rect.right || rect.top > rect.bottom {
            return Err(ImageError::InvalidRegion(*rect));
        }
        let (w, h) = scene.dimensions();
        let r = rect.clamp_to(w, h).ok_or(ImageError::RegionOutside(*rect))?;
        let crop = image::imageops::crop_imm(
            scene,
            r.left as u32,
            r.top as u32,
            r.width() as u32,
            r.height() as u32,
        )
        .to_image();
        Self::new(crop)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}
