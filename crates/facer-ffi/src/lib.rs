//! facer: C ABI over the detector and recognizer handles.
//!
//! Every call returns a heap-allocated result envelope that carries either a
//! payload or an error string, never both. Each envelope has a matching
//! `*_result_free` function; handles are released separately with
//! `detector_free` / `recognizer_free`.
//!
//! # Safety
//!
//! All Rust logic is wrapped in `catch_unwind`: a panic unwinding across the
//! `extern "C"` boundary is undefined behavior, so it is reported as an error
//! envelope instead.

// Enforce explicit `unsafe {}` blocks inside `unsafe fn` bodies.
#![warn(unsafe_op_in_unsafe_fn)]

use facer_core::bitmap::ChannelLayout;
use facer_core::chip;
use facer_core::detector::OnnxDetectionModel;
use facer_core::recognizer::OnnxEmbeddingModel;
use facer_core::shape::RegressionTreeShapePredictor;
use facer_core::{
    BitmapRef, DetectionModel, Detection, EmbeddingModel, FaceDetector, FaceRecognizer, ImageError, Jitter,
    RandomJitter, RecognizerError, Rectangle, ShapePredictor, DESCRIPTOR_SIZE,
};
use libc::{c_char, c_double, c_int, c_long, size_t};
use std::any::Any;
use std::ffi::{CStr, CString};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

/// Floats in a descriptor returned by `recognizer_recognize`.
pub const FACE_DESCRIPTOR_SIZE: usize = DESCRIPTOR_SIZE;

/// Mirrors `Rectangle` from `facer.h` (note the left, right, top, bottom order).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacerRectangle {
    pub left: c_long,
    pub right: c_long,
    pub top: c_long,
    pub bottom: c_long,
}

impl From<Rectangle> for FacerRectangle {
    fn from(r: Rectangle) -> Self {
        Self {
            left: saturating_long(r.left),
            right: saturating_long(r.right),
            top: saturating_long(r.top),
            bottom: saturating_long(r.bottom),
        }
    }
}

/// `c_long` is 32-bit on LLP64 targets; out-of-range coordinates clamp.
fn saturating_long(v: i64) -> c_long {
    c_long::try_from(v).unwrap_or(if v < 0 { c_long::MIN } else { c_long::MAX })
}

impl From<FacerRectangle> for Rectangle {
    fn from(r: FacerRectangle) -> Self {
        Rectangle::new(i64::from(r.left), i64::from(r.top), i64::from(r.right), i64::from(r.bottom))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacerDetection {
    pub rectangle: FacerRectangle,
    pub confidence: c_double,
}

impl From<Detection> for FacerDetection {
    fn from(d: Detection) -> Self {
        Self {
            rectangle: d.rect.into(),
            confidence: d.confidence,
        }
    }
}

/// Host-owned 8-bit bitmap: 1 (gray), 3 (BGR) or 4 (BGRA) interleaved channels.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FacerBitmap {
    pub data: *const u8,
    pub width: c_int,
    pub height: c_int,
    /// Bytes between row starts.
    pub stride: size_t,
    pub channels: c_int,
}

/// Opaque detector handle.
pub struct FacerDetector {
    inner: FaceDetector<Box<dyn DetectionModel>>,
}

impl FacerDetector {
    fn from_model(model: Box<dyn DetectionModel>) -> Self {
        Self {
            inner: FaceDetector::new(model),
        }
    }
}

/// Opaque recognizer handle.
pub struct FacerRecognizer {
    inner: FaceRecognizer<Box<dyn ShapePredictor>, Box<dyn EmbeddingModel>, Box<dyn Jitter>>,
}

impl FacerRecognizer {
    fn from_parts(
        shaper: Box<dyn ShapePredictor>,
        model: Box<dyn EmbeddingModel>,
        jitter: Box<dyn Jitter>,
        jitter_count: u32,
    ) -> Self {
        Self {
            inner: FaceRecognizer::new(shaper, model, jitter, jitter_count),
        }
    }
}

#[repr(C)]
pub struct DetectorInitResult {
    pub detector: *mut FacerDetector,
    pub err_str: *mut c_char,
}

#[repr(C)]
pub struct DetectorDetectResult {
    pub detections_count: c_int,
    pub detections: *mut FacerDetection,
    pub err_str: *mut c_char,
}

#[repr(C)]
pub struct BatchDetection {
    pub detections_count: c_int,
    pub detections: *mut FacerDetection,
}

#[repr(C)]
pub struct DetectorBatchDetectResult {
    /// One entry per input image, in input order.
    pub detections: *mut BatchDetection,
    pub detections_count: c_int,
    pub err_str: *mut c_char,
}

#[repr(C)]
pub struct RecognizerInitResult {
    pub recognizer: *mut FacerRecognizer,
    pub err_str: *mut c_char,
}

#[repr(C)]
pub struct RecognizerRecognizeResult {
    /// `FACE_DESCRIPTOR_SIZE` floats.
    pub descriptor: *mut f32,
    pub err_str: *mut c_char,
}

// --- Marshaling helpers ---

fn error_string(msg: impl Display) -> *mut c_char {
    let msg = msg.to_string().replace('\0', " ");
    CString::new(msg).unwrap_or_default().into_raw()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f`, turning a panic into an error message.
fn guard<T>(op: &str, f: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    let result = panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(format!("panic in {op}: {}", panic_message(payload))));
    if let Err(e) = &result {
        tracing::warn!(op, error = %e, "facer call failed");
    }
    result
}

/// Pair a vector with its length as a C count, refusing lengths `c_int` can't hold.
fn counted<T>(items: Vec<T>) -> Result<(Vec<T>, c_int), String> {
    let count = c_int::try_from(items.len())
        .map_err(|_| format!("{} entries exceed the C array limit", items.len()))?;
    Ok((items, count))
}

/// Hand a vector to C. An empty vector still yields a non-null pointer.
fn into_raw_array<T>(items: Vec<T>) -> *mut T {
    Box::into_raw(items.into_boxed_slice()) as *mut T
}

/// Reclaim an array produced by [`into_raw_array`].
///
/// # Safety
///
/// `items` must be null or come from `into_raw_array` with this `count`.
unsafe fn free_raw_array<T>(items: *mut T, count: c_int) {
    if items.is_null() {
        return;
    }
    let slice = ptr::slice_from_raw_parts_mut(items, count.max(0) as usize);
    // SAFETY: the caller guarantees the pointer came from a boxed slice of this length.
    drop(unsafe { Box::from_raw(slice) });
}

/// # Safety
///
/// `err` must be null or come from [`error_string`].
unsafe fn free_error(err: *mut c_char) {
    if !err.is_null() {
        // SAFETY: produced by CString::into_raw.
        drop(unsafe { CString::from_raw(err) });
    }
}

/// # Safety
///
/// `path` must be null or point to a NUL-terminated string.
unsafe fn c_path<'a>(path: *const c_char, what: &str) -> Result<&'a str, String> {
    if path.is_null() {
        return Err(format!("{what} is null"));
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    unsafe { CStr::from_ptr(path) }
        .to_str()
        .map_err(|_| format!("{what} is not valid UTF-8"))
}

/// Borrow the pixels of a host bitmap.
///
/// # Safety
///
/// `bitmap` must be null or point to a `FacerBitmap` whose `data` holds at
/// least `stride * (height - 1) + width * channels` bytes.
unsafe fn bitmap_ref<'a>(bitmap: *const FacerBitmap) -> Result<BitmapRef<'a>, String> {
    // SAFETY: null is checked; otherwise valid per the caller contract.
    let bitmap = unsafe { bitmap.as_ref() }.ok_or_else(|| "bitmap is null".to_string())?;

    if bitmap.data.is_null() {
        return Err(ImageError::NullData.to_string());
    }
    if bitmap.width <= 0 || bitmap.height <= 0 {
        return Err(ImageError::InvalidDimensions {
            width: bitmap.width as i64,
            height: bitmap.height as i64,
        }
        .to_string());
    }
    let channels = u32::try_from(bitmap.channels)
        .map_err(|_| ImageError::UnsupportedChannels(bitmap.channels as i64).to_string())?;
    let layout = ChannelLayout::from_channels(channels).map_err(|e| e.to_string())?;

    let (width, height) = (bitmap.width as u32, bitmap.height as u32);
    let row_bytes = width as usize * layout.bytes_per_pixel();
    if bitmap.stride < row_bytes {
        return Err(ImageError::InvalidStride {
            stride: bitmap.stride,
            row_bytes,
        }
        .to_string());
    }
    let len = bitmap
        .stride
        .checked_mul(height as usize - 1)
        .and_then(|n| n.checked_add(row_bytes))
        .ok_or_else(|| format!("bitmap of {width}x{height} with stride {} overflows", bitmap.stride))?;

    // SAFETY: data is non-null and holds `len` bytes per the caller contract.
    let data = unsafe { std::slice::from_raw_parts(bitmap.data, len) };
    BitmapRef::new(data, width, height, bitmap.stride, channels).map_err(|e| e.to_string())
}

fn jitter_count_from_c(jitter_count: c_int) -> u32 {
    // Only a positive count enables jittering
    jitter_count.max(0) as u32
}

fn detect_envelope(result: Result<Vec<Detection>, String>) -> *mut DetectorDetectResult {
    let envelope = match result.and_then(counted) {
        Ok((detections, detections_count)) => {
            let detections = into_raw_array(detections.into_iter().map(FacerDetection::from).collect());
            DetectorDetectResult {
                detections_count,
                detections,
                err_str: ptr::null_mut(),
            }
        }
        Err(e) => DetectorDetectResult {
            detections_count: 0,
            detections: ptr::null_mut(),
            err_str: error_string(e),
        },
    };
    Box::into_raw(Box::new(envelope))
}

fn recognize_envelope(result: Result<facer_core::Descriptor, String>) -> *mut RecognizerRecognizeResult {
    let envelope = match result {
        Ok(descriptor) => {
            let values: Box<[f32]> = Box::new(descriptor.0);
            RecognizerRecognizeResult {
                descriptor: Box::into_raw(values) as *mut f32,
                err_str: ptr::null_mut(),
            }
        }
        Err(e) => RecognizerRecognizeResult {
            descriptor: ptr::null_mut(),
            err_str: error_string(e),
        },
    };
    Box::into_raw(Box::new(envelope))
}

// --- Detector ---

/// Load a detection model.
///
/// # Safety
///
/// `model_path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn detector_init(model_path: *const c_char) -> *mut DetectorInitResult {
    let result = guard("detector_init", || {
        // SAFETY: forwarded caller contract.
        let path = unsafe { c_path(model_path, "model_path") }?;
        let model = OnnxDetectionModel::load(path).map_err(|e| e.to_string())?;
        tracing::debug!(path, "detector handle created");
        Ok(FacerDetector::from_model(Box::new(model)))
    });

    let envelope = match result {
        Ok(detector) => DetectorInitResult {
            detector: Box::into_raw(Box::new(detector)),
            err_str: ptr::null_mut(),
        },
        Err(e) => DetectorInitResult {
            detector: ptr::null_mut(),
            err_str: error_string(e),
        },
    };
    Box::into_raw(Box::new(envelope))
}

/// Detect faces in one bitmap.
///
/// # Safety
///
/// `detector` must be null or a live handle from `detector_init`; `image`
/// must satisfy the `FacerBitmap` contract.
#[no_mangle]
pub unsafe extern "C" fn detector_detect(
    detector: *mut FacerDetector,
    image: *const FacerBitmap,
) -> *mut DetectorDetectResult {
    detect_envelope(guard("detector_detect", || {
        // SAFETY: null or a live handle per the caller contract.
        let detector = unsafe { detector.as_ref() }.ok_or_else(|| "detector handle is null".to_string())?;
        // SAFETY: forwarded caller contract.
        let bitmap = unsafe { bitmap_ref(image) }?;
        detector.inner.detect(&bitmap).map_err(|e| e.to_string())
    }))
}

/// Detect faces in `images_count` bitmaps with one forward pass.
///
/// # Safety
///
/// `images` must point to `images_count` bitmap pointers, each satisfying
/// the `FacerBitmap` contract.
#[no_mangle]
pub unsafe extern "C" fn detector_batch_detect(
    detector: *mut FacerDetector,
    images: *const *const FacerBitmap,
    images_count: c_int,
) -> *mut DetectorBatchDetectResult {
    let result = guard("detector_batch_detect", || {
        // SAFETY: null or a live handle per the caller contract.
        let detector = unsafe { detector.as_ref() }.ok_or_else(|| "detector handle is null".to_string())?;
        let count = usize::try_from(images_count).map_err(|_| format!("negative image count {images_count}"))?;
        if count == 0 {
            return Ok(Vec::new());
        }
        if images.is_null() {
            return Err("image array is null".to_string());
        }

        // SAFETY: images holds `count` pointers per the caller contract.
        let pointers = unsafe { std::slice::from_raw_parts(images, count) };
        let bitmaps = pointers
            .iter()
            // SAFETY: forwarded caller contract.
            .map(|&p| unsafe { bitmap_ref(p) })
            .collect::<Result<Vec<_>, _>>()?;
        detector.inner.batch_detect(&bitmaps).map_err(|e| e.to_string())
    });

    let counts = result.and_then(|per_image| {
        let inner = per_image.into_iter().map(counted).collect::<Result<Vec<_>, _>>()?;
        counted(inner)
    });

    let envelope = match counts {
        Ok((per_image, detections_count)) => {
            let batches = per_image
                .into_iter()
                .map(|(detections, detections_count)| BatchDetection {
                    detections_count,
                    detections: into_raw_array(detections.into_iter().map(FacerDetection::from).collect()),
                })
                .collect();
            let detections = into_raw_array(batches);
            DetectorBatchDetectResult {
                detections,
                detections_count,
                err_str: ptr::null_mut(),
            }
        }
        Err(e) => DetectorBatchDetectResult {
            detections: ptr::null_mut(),
            detections_count: 0,
            err_str: error_string(e),
        },
    };
    Box::into_raw(Box::new(envelope))
}

/// Release a detector handle. Null is ignored.
///
/// # Safety
///
/// `detector` must be null or a handle from `detector_init` that no call is
/// still using; it must not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn detector_free(detector: *mut FacerDetector) {
    if detector.is_null() {
        return;
    }
    // SAFETY: the caller hands back ownership of the handle.
    let handle = unsafe { Box::from_raw(detector) };
    if panic::catch_unwind(AssertUnwindSafe(move || drop(handle))).is_err() {
        tracing::error!("panic while releasing detector");
    }
}

// --- Recognizer ---

/// Load a shape predictor and a recognition model. A `jitter_count` of zero
/// or less disables jittering.
///
/// # Safety
///
/// Both paths must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn recognizer_init(
    shaper_model_path: *const c_char,
    recognizer_model_path: *const c_char,
    jitter_count: c_int,
) -> *mut RecognizerInitResult {
    let result = guard("recognizer_init", || {
        // SAFETY: forwarded caller contract.
        let shaper_path = unsafe { c_path(shaper_model_path, "shaper_model_path") }?;
        // SAFETY: forwarded caller contract.
        let recognizer_path = unsafe { c_path(recognizer_model_path, "recognizer_model_path") }?;

        let shaper = RegressionTreeShapePredictor::load(shaper_path)
            .map_err(|e| RecognizerError::from(e).to_string())?;
        chip::check_landmark_count(shaper.num_parts()).map_err(|e| RecognizerError::from(e).to_string())?;
        let model = OnnxEmbeddingModel::load(recognizer_path).map_err(|e| e.to_string())?;
        let jitter_count = jitter_count_from_c(jitter_count);

        tracing::debug!(shaper_path, recognizer_path, jitter_count, "recognizer handle created");
        Ok(FacerRecognizer::from_parts(
            Box::new(shaper),
            Box::new(model),
            Box::new(RandomJitter::from_entropy()),
            jitter_count,
        ))
    });

    let envelope = match result {
        Ok(recognizer) => RecognizerInitResult {
            recognizer: Box::into_raw(Box::new(recognizer)),
            err_str: ptr::null_mut(),
        },
        Err(e) => RecognizerInitResult {
            recognizer: ptr::null_mut(),
            err_str: error_string(e),
        },
    };
    Box::into_raw(Box::new(envelope))
}

/// Compute the descriptor of a bitmap holding one aligned face crop.
///
/// # Safety
///
/// `recognizer` must be null or a live handle; `image` must satisfy the
/// `FacerBitmap` contract.
#[no_mangle]
pub unsafe extern "C" fn recognizer_recognize(
    recognizer: *mut FacerRecognizer,
    image: *const FacerBitmap,
) -> *mut RecognizerRecognizeResult {
    recognize_envelope(guard("recognizer_recognize", || {
        // SAFETY: null or a live handle per the caller contract.
        let recognizer =
            unsafe { recognizer.as_ref() }.ok_or_else(|| "recognizer handle is null".to_string())?;
        // SAFETY: forwarded caller contract.
        let bitmap = unsafe { bitmap_ref(image) }?;
        recognizer.inner.recognize_bitmap(&bitmap).map_err(|e| e.to_string())
    }))
}

/// Compute the descriptor of the face inside `rect` of a scene bitmap.
///
/// # Safety
///
/// Same contract as [`recognizer_recognize`].
#[no_mangle]
pub unsafe extern "C" fn recognizer_recognize_region(
    recognizer: *mut FacerRecognizer,
    image: *const FacerBitmap,
    rect: FacerRectangle,
) -> *mut RecognizerRecognizeResult {
    recognize_envelope(guard("recognizer_recognize_region", || {
        // SAFETY: null or a live handle per the caller contract.
        let recognizer =
            unsafe { recognizer.as_ref() }.ok_or_else(|| "recognizer handle is null".to_string())?;
        // SAFETY: forwarded caller contract.
        let bitmap = unsafe { bitmap_ref(image) }?;
        recognizer
            .inner
            .recognize_region(&bitmap, &rect.into())
            .map_err(|e| e.to_string())
    }))
}

/// Release a recognizer handle. Null is ignored.
///
/// # Safety
///
/// `recognizer` must be null or a handle from `recognizer_init` that no call
/// is still using; it must not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn recognizer_free(recognizer: *mut FacerRecognizer) {
    if recognizer.is_null() {
        return;
    }
    // SAFETY: the caller hands back ownership of the handle.
    let handle = unsafe { Box::from_raw(recognizer) };
    if panic::catch_unwind(AssertUnwindSafe(move || drop(handle))).is_err() {
        tracing::error!("panic while releasing recognizer");
    }
}

// --- Envelope release ---

/// Release an init envelope. The detector handle it carries stays alive.
///
/// # Safety
///
/// `result` must be null or an envelope from `detector_init`, released once.
#[no_mangle]
pub unsafe extern "C" fn detector_init_result_free(result: *mut DetectorInitResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: produced by Box::into_raw in detector_init.
    let result = unsafe { Box::from_raw(result) };
    // SAFETY: produced by error_string.
    unsafe { free_error(result.err_str) };
}

/// # Safety
///
/// `result` must be null or an envelope from `detector_detect`, released once.
#[no_mangle]
pub unsafe extern "C" fn detector_detect_result_free(result: *mut DetectorDetectResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: produced by Box::into_raw in detect_envelope.
    let result = unsafe { Box::from_raw(result) };
    // SAFETY: both fields were produced by this crate with these counts.
    unsafe {
        free_raw_array(result.detections, result.detections_count);
        free_error(result.err_str);
    }
}

/// # Safety
///
/// `result` must be null or an envelope from `detector_batch_detect`,
/// released once.
#[no_mangle]
pub unsafe extern "C" fn detector_batch_detect_result_free(result: *mut DetectorBatchDetectResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: produced by Box::into_raw in detector_batch_detect.
    let result = unsafe { Box::from_raw(result) };
    if !result.detections.is_null() {
        let count = result.detections_count.max(0) as usize;
        // SAFETY: the outer array holds `count` initialized entries.
        let batches = unsafe { std::slice::from_raw_parts(result.detections, count) };
        for batch in batches {
            // SAFETY: inner arrays were produced by into_raw_array.
            unsafe { free_raw_array(batch.detections, batch.detections_count) };
        }
    }
    // SAFETY: produced by this crate.
    unsafe {
        free_raw_array(result.detections, result.detections_count);
        free_error(result.err_str);
    }
}

/// Release an init envelope. The recognizer handle it carries stays alive.
///
/// # Safety
///
/// `result` must be null or an envelope from `recognizer_init`, released once.
#[no_mangle]
pub unsafe extern "C" fn recognizer_init_result_free(result: *mut RecognizerInitResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: produced by Box::into_raw in recognizer_init.
    let result = unsafe { Box::from_raw(result) };
    // SAFETY: produced by error_string.
    unsafe { free_error(result.err_str) };
}

/// # Safety
///
/// `result` must be null or an envelope from a recognize call, released once.
#[no_mangle]
pub unsafe extern "C" fn recognizer_recognize_result_free(result: *mut RecognizerRecognizeResult) {
    if result.is_null() {
        return;
    }
    // SAFETY: produced by Box::into_raw in recognize_envelope.
    let result = unsafe { Box::from_raw(result) };
    // SAFETY: the descriptor is a boxed slice of FACE_DESCRIPTOR_SIZE floats.
    unsafe {
        free_raw_array(result.descriptor, FACE_DESCRIPTOR_SIZE as c_int);
        free_error(result.err_str);
    }
}

/// Install a `tracing` formatter filtered by `RUST_LOG`.
///
/// Optional; later calls and hosts that already installed a subscriber are
/// left untouched.
#[no_mangle]
pub extern "C" fn facer_log_init() {
    let _ = panic::catch_unwind(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use facer_core::{DetectorError, FaceLandmarks, ShapeError};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// One detection around the bright pixels, if any.
    struct BrightBoxModel {
        calls: Arc<AtomicUsize>,
    }

    impl DetectionModel for BrightBoxModel {
        fn forward(&mut self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(images
                .iter()
                .map(|img| {
                    let bright: Vec<(u32, u32)> = img
                        .enumerate_pixels()
                        .filter(|(_, _, p)| p[0] > 128)
                        .map(|(x, y, _)| (x, y))
                        .collect();
                    match (bright.first(), bright.last()) {
                        (Some(&(x0, y0)), Some(&(x1, y1))) => vec![Detection {
                            rect: Rectangle::new(x0 as i64, y0 as i64, x1 as i64, y1 as i64),
                            confidence: 0.9,
                        }],
                        _ => Vec::new(),
                    }
                })
                .collect())
        }
    }

    struct PanickingDetector;

    impl DetectionModel for PanickingDetector {
        fn forward(&mut self, _images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
            panic!("runtime aborted");
        }
    }

    /// Five landmarks at fixed fractions of the crop.
    struct FractionShape;

    impl ShapePredictor for FractionShape {
        fn predict(&self, image: &RgbImage, _rect: &Rectangle) -> Result<FaceLandmarks, ShapeError> {
            let (w, h) = (image.width() as f32, image.height() as f32);
            let points = [(0.8, 0.35), (0.62, 0.36), (0.2, 0.35), (0.38, 0.36), (0.5, 0.6)]
                .iter()
                .map(|&(x, y)| (x * w, y * h))
                .collect();
            Ok(FaceLandmarks { points })
        }
    }

    struct ConstantModel;

    impl EmbeddingModel for ConstantModel {
        fn forward(&mut self, chips: &[RgbImage]) -> Result<Vec<Vec<f32>>, RecognizerError> {
            Ok(chips.iter().map(|_| vec![0.25; DESCRIPTOR_SIZE]).collect())
        }
    }

    fn detector_handle() -> (*mut FacerDetector, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = BrightBoxModel { calls: calls.clone() };
        (Box::into_raw(Box::new(FacerDetector::from_model(Box::new(model)))), calls)
    }

    fn recognizer_handle() -> *mut FacerRecognizer {
        Box::into_raw(Box::new(FacerRecognizer::from_parts(
            Box::new(FractionShape),
            Box::new(ConstantModel),
            Box::new(RandomJitter::seeded(3)),
            0,
        )))
    }

    /// Gray pixels with a bright square at (x, y).
    fn gray_pixels(w: usize, h: usize, square: Option<(usize, usize, usize)>) -> Vec<u8> {
        let mut data = vec![0u8; w * h];
        if let Some((x, y, side)) = square {
            for row in y..y + side {
                data[row * w + x..row * w + x + side].fill(255);
            }
        }
        data
    }

    fn bitmap(data: &[u8], width: c_int, height: c_int, channels: c_int) -> FacerBitmap {
        FacerBitmap {
            data: data.as_ptr(),
            width,
            height,
            stride: (width * channels) as size_t,
            channels,
        }
    }

    unsafe fn err_text(err: *const c_char) -> String {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }

    #[test]
    fn test_detector_init_missing_model_reports_error() {
        let path = CString::new("/nonexistent/det.onnx").unwrap();
        unsafe {
            let result = detector_init(path.as_ptr());
            assert!((*result).detector.is_null());
            assert!(!(*result).err_str.is_null());
            assert!(err_text((*result).err_str).contains("not found"));
            detector_init_result_free(result);
        }
    }

    #[test]
    fn test_detector_init_null_path() {
        unsafe {
            let result = detector_init(ptr::null());
            assert!((*result).detector.is_null());
            assert!(err_text((*result).err_str).contains("null"));
            detector_init_result_free(result);
        }
    }

    #[test]
    fn test_recognizer_init_missing_models_reports_error() {
        let shaper = CString::new("/nonexistent/shape.json").unwrap();
        let model = CString::new("/nonexistent/rec.onnx").unwrap();
        unsafe {
            let result = recognizer_init(shaper.as_ptr(), model.as_ptr(), -4);
            assert!((*result).recognizer.is_null());
            assert!(err_text((*result).err_str).contains("shape.json"));
            recognizer_init_result_free(result);
        }
    }

    #[test]
    fn test_recognizer_init_rejects_unsupported_shape_layout() {
        let path = std::env::temp_dir().join(format!("facer-ffi-two-part-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"initial_shape":[0.25,0.5,0.75,0.5],"cascades":[]}"#).unwrap();
        let shaper = CString::new(path.to_string_lossy().into_owned()).unwrap();
        let model = CString::new("/nonexistent/rec.onnx").unwrap();
        unsafe {
            let result = recognizer_init(shaper.as_ptr(), model.as_ptr(), 0);
            assert!((*result).recognizer.is_null());
            assert!(err_text((*result).err_str).contains("2 points"));
            recognizer_init_result_free(result);
        }
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_rectangle_coordinates_saturate() {
        let wide = Rectangle::new(i64::MIN, -1, i64::MAX, 1);
        let r = FacerRectangle::from(wide);
        assert_eq!((r.left, r.right), (c_long::MIN, c_long::MAX));
        assert_eq!((r.top, r.bottom), (-1, 1));
    }

    #[test]
    fn test_counted_refuses_lengths_beyond_c_int() {
        let (_, count) = counted(vec![(); 3]).unwrap();
        assert_eq!(count, 3);
        let too_many = vec![(); c_int::MAX as usize + 1];
        assert!(counted(too_many).unwrap_err().contains("C array limit"));
    }

    #[test]
    fn test_negative_jitter_count_disables_jitter() {
        assert_eq!(jitter_count_from_c(-4), 0);
        assert_eq!(jitter_count_from_c(0), 0);
        assert_eq!(jitter_count_from_c(10), 10);
    }

    #[test]
    fn test_detect_envelope_carries_detection() {
        let (detector, _) = detector_handle();
        let data = gray_pixels(64, 48, Some((10, 5, 20)));
        let image = bitmap(&data, 64, 48, 1);
        unsafe {
            let result = detector_detect(detector, &image);
            assert!((*result).err_str.is_null());
            assert_eq!((*result).detections_count, 1);
            let d = *(*result).detections;
            assert_eq!(d.rectangle, FacerRectangle { left: 10, right: 29, top: 5, bottom: 24 });
            assert!(d.rectangle.left <= d.rectangle.right && d.rectangle.top <= d.rectangle.bottom);
            detector_detect_result_free(result);
            detector_free(detector);
        }
    }

    #[test]
    fn test_no_faces_is_success_with_empty_list() {
        let (detector, _) = detector_handle();
        let data = gray_pixels(32, 32, None);
        let image = bitmap(&data, 32, 32, 1);
        unsafe {
            let result = detector_detect(detector, &image);
            assert!((*result).err_str.is_null());
            assert!(!(*result).detections.is_null());
            assert_eq!((*result).detections_count, 0);
            detector_detect_result_free(result);
            detector_free(detector);
        }
    }

    #[test]
    fn test_invalid_channels_never_reach_model() {
        let (detector, calls) = detector_handle();
        let data = vec![0u8; 32 * 32 * 2];
        let image = bitmap(&data, 32, 32, 2);
        unsafe {
            let result = detector_detect(detector, &image);
            assert!((*result).detections.is_null());
            assert!(err_text((*result).err_str).contains("channel"));
            detector_detect_result_free(result);
            detector_free(detector);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_null_inputs_are_error_envelopes() {
        let (detector, _) = detector_handle();
        let data = gray_pixels(8, 8, None);
        let image = bitmap(&data, 8, 8, 1);
        let no_data = FacerBitmap { data: ptr::null(), ..image };
        unsafe {
            for result in [
                detector_detect(ptr::null_mut(), &image),
                detector_detect(detector, ptr::null()),
                detector_detect(detector, &no_data),
            ] {
                assert!((*result).detections.is_null());
                assert!(!(*result).err_str.is_null());
                detector_detect_result_free(result);
            }

            let result = recognizer_recognize(ptr::null_mut(), &image);
            assert!((*result).descriptor.is_null());
            assert!(err_text((*result).err_str).contains("null"));
            recognizer_recognize_result_free(result);
            detector_free(detector);
        }
    }

    #[test]
    fn test_batch_detect_preserves_order() {
        let (detector, calls) = detector_handle();
        let with_face = gray_pixels(40, 40, Some((4, 4, 8)));
        let empty = gray_pixels(40, 40, None);
        let images = [bitmap(&with_face, 40, 40, 1), bitmap(&empty, 40, 40, 1), bitmap(&with_face, 40, 40, 1)];
        let pointers: Vec<*const FacerBitmap> = images.iter().map(|b| b as *const _).collect();
        unsafe {
            let result = detector_batch_detect(detector, pointers.as_ptr(), 3);
            assert!((*result).err_str.is_null());
            assert_eq!((*result).detections_count, 3);
            let batches = std::slice::from_raw_parts((*result).detections, 3);
            let counts: Vec<c_int> = batches.iter().map(|b| b.detections_count).collect();
            assert_eq!(counts, vec![1, 0, 1]);
            detector_batch_detect_result_free(result);
            detector_free(detector);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_detect_empty_and_negative_counts() {
        let (detector, calls) = detector_handle();
        unsafe {
            let result = detector_batch_detect(detector, ptr::null(), 0);
            assert!((*result).err_str.is_null());
            assert!(!(*result).detections.is_null());
            assert_eq!((*result).detections_count, 0);
            detector_batch_detect_result_free(result);

            let result = detector_batch_detect(detector, ptr::null(), -1);
            assert!((*result).detections.is_null());
            assert!(err_text((*result).err_str).contains("negative"));
            detector_batch_detect_result_free(result);
            detector_free(detector);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_becomes_error_envelope() {
        let detector = Box::into_raw(Box::new(FacerDetector::from_model(Box::new(PanickingDetector))));
        let data = gray_pixels(16, 16, None);
        let image = bitmap(&data, 16, 16, 1);
        unsafe {
            let result = detector_detect(detector, &image);
            assert!(err_text((*result).err_str).contains("panic"));
            detector_detect_result_free(result);

            // The lock is poisoned now; the handle keeps reporting errors
            let result = detector_detect(detector, &image);
            assert!(err_text((*result).err_str).contains("poisoned"));
            detector_detect_result_free(result);
            detector_free(detector);
        }
    }

    #[test]
    fn test_recognize_returns_full_descriptor() {
        let recognizer = recognizer_handle();
        let data = vec![90u8; 64 * 64 * 3];
        let image = bitmap(&data, 64, 64, 3);
        unsafe {
            let result = recognizer_recognize(recognizer, &image);
            assert!((*result).err_str.is_null());
            let values = std::slice::from_raw_parts((*result).descriptor, FACE_DESCRIPTOR_SIZE);
            assert!(values.iter().all(|&v| v == 0.25));
            recognizer_recognize_result_free(result);
            recognizer_free(recognizer);
        }
    }

    #[test]
    fn test_recognize_region_and_outside_region() {
        let recognizer = recognizer_handle();
        let data = vec![120u8; 200 * 100 * 4];
        let image = bitmap(&data, 200, 100, 4);
        let inside = FacerRectangle { left: 20, right: 99, top: 10, bottom: 89 };
        let outside = FacerRectangle { left: 300, right: 380, top: 10, bottom: 90 };
        unsafe {
            let result = recognizer_recognize_region(recognizer, &image, inside);
            assert!((*result).err_str.is_null());
            assert!(!(*result).descriptor.is_null());
            recognizer_recognize_result_free(result);

            let result = recognizer_recognize_region(recognizer, &image, outside);
            assert!((*result).descriptor.is_null());
            assert!(err_text((*result).err_str).contains("outside"));
            recognizer_recognize_result_free(result);

            let inverted = FacerRectangle { left: 99, right: 20, top: 10, bottom: 89 };
            let result = recognizer_recognize_region(recognizer, &image, inverted);
            assert!((*result).descriptor.is_null());
            assert!(err_text((*result).err_str).contains("inverted"));
            recognizer_recognize_result_free(result);
            recognizer_free(recognizer);
        }
    }

    #[test]
    fn test_release_functions_accept_null() {
        unsafe {
            detector_init_result_free(ptr::null_mut());
            detector_detect_result_free(ptr::null_mut());
            detector_batch_detect_result_free(ptr::null_mut());
            recognizer_init_result_free(ptr::null_mut());
            recognizer_recognize_result_free(ptr::null_mut());
            detector_free(ptr::null_mut());
            recognizer_free(ptr::null_mut());
        }
    }

    #[test]
    fn test_concurrent_detects_on_one_handle() {
        let (detector, calls) = detector_handle();
        let handle = detector as usize;

        let threads: Vec<_> = (0..4)
            .map(|t| {
                std::thread::spawn(move || {
                    let data = gray_pixels(32, 32, Some((t * 4, t * 4, 6)));
                    let image = bitmap(&data, 32, 32, 1);
                    for _ in 0..10 {
                        unsafe {
                            let result = detector_detect(handle as *mut FacerDetector, &image);
                            assert!((*result).err_str.is_null());
                            let d = *(*result).detections;
                            assert_eq!(d.rectangle.left, (t * 4) as c_long);
                            detector_detect_result_free(result);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 40);
        unsafe { detector_free(detector) };
    }

    #[test]
    fn test_log_init_is_idempotent() {
        facer_log_init();
        facer_log_init();
    }
}
