use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: optional TOML file, then `FACER_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the model files.
    pub model_dir: PathBuf,
    /// SCRFD detection model file name.
    pub detector_model: String,
    /// Regression-tree shape predictor file name.
    pub shaper_model: String,
    /// Descriptor network file name.
    pub recognizer_model: String,
    /// Jittered copies averaged per descriptor; 0 disables jittering.
    pub jitter_count: u32,
    /// Detections scoring below this are not recognized.
    pub confidence_limit: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            detector_model: "det_10g.onnx".to_string(),
            shaper_model: "shape_predictor_5_face_landmarks.json".to_string(),
            recognizer_model: "dlib_face_recognition_resnet_model_v1.onnx".to_string(),
            jitter_count: 0,
            confidence_limit: 0.5,
        }
    }
}

impl Config {
    /// Load the file at `path` (defaults when `None`) and apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                Self::from_toml_str(&text).with_context(|| format!("parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACER_*` overrides from `var`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACER_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(name) = var("FACER_DETECTOR_MODEL") {
            self.detector_model = name;
        }
        if let Some(name) = var("FACER_SHAPER_MODEL") {
            self.shaper_model = name;
        }
        if let Some(name) = var("FACER_RECOGNIZER_MODEL") {
            self.recognizer_model = name;
        }
        self.jitter_count = parse_or(var("FACER_JITTER_COUNT"), self.jitter_count);
        self.confidence_limit = parse_or(var("FACER_CONFIDENCE_LIMIT"), self.confidence_limit);
    }

    pub fn validate(&self) -> Result<()> {
        if self.detector_model.is_empty() {
            bail!("detector_model is empty");
        }
        if self.shaper_model.is_empty() {
            bail!("shaper_model is empty");
        }
        if self.recognizer_model.is_empty() {
            bail!("recognizer_model is empty");
        }
        if self.confidence_limit.is_nan() || self.confidence_limit < 0.0 {
            bail!("confidence_limit {} is invalid", self.confidence_limit);
        }
        Ok(())
    }

    pub fn detector_model_path(&self) -> String {
        self.model_path(&self.detector_model)
    }

    pub fn shaper_model_path(&self) -> String {
        self.model_path(&self.shaper_model)
    }

    pub fn recognizer_model_path(&self) -> String {
        self.model_path(&self.recognizer_model)
    }

    fn model_path(&self, name: &str) -> String {
        self.model_dir.join(name).to_string_lossy().into_owned()
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
