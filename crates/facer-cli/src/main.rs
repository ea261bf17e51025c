use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facer_core::{Descriptor, Detection, FaceCrop, FaceDetector, FaceRecognizer};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

/// Descriptor distance under which two faces are reported as the same person.
const SAME_PERSON_DISTANCE: f32 = 0.6;

#[derive(Parser)]
#[command(name = "facer", about = "Face detection and recognition harness")]
struct Cli {
    /// TOML config file (FACER_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in one or more images with a single batch call
    Detect {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Detect faces and compute a descriptor for each confident detection
    Recognize { image: PathBuf },
    /// Compare the most confident face of two images
    Compare { a: PathBuf, b: PathBuf },
}

#[derive(Serialize)]
struct ImageDetections<'a> {
    image: &'a Path,
    detections: Vec<Detection>,
}

#[derive(Serialize)]
struct RecognizedFace {
    detection: Detection,
    descriptor: Descriptor,
}

#[derive(Serialize)]
struct Comparison {
    distance: f32,
    same_person: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate().context("invalid config")?;
    tracing::debug!(?config, "config loaded");

    match cli.command {
        Commands::Detect { images } => {
            let detector = load_detector(&config)?;
            let scenes = images.iter().map(|p| open_rgb(p)).collect::<Result<Vec<_>>>()?;
            let per_image = detector.batch_detect_rgb(&scenes).context("batch detect")?;

            let out: Vec<ImageDetections> = images
                .iter()
                .zip(per_image)
                .map(|(image, detections)| ImageDetections { image, detections })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Recognize { image } => {
            let detector = load_detector(&config)?;
            let recognizer = load_recognizer(&config)?;
            let faces = recognize_all(&detector, &recognizer, &open_rgb(&image)?, config.confidence_limit)?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Compare { a, b } => {
            let detector = load_detector(&config)?;
            let recognizer = load_recognizer(&config)?;
            let da = best_face(&detector, &recognizer, &a)?;
            let db = best_face(&detector, &recognizer, &b)?;

            let distance = da.distance(&db);
            let out = Comparison {
                distance,
                same_person: distance < SAME_PERSON_DISTANCE,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

fn load_detector(config: &Config) -> Result<FaceDetector> {
    let path = config.detector_model_path();
    FaceDetector::load(&path).with_context(|| format!("load detector {path}"))
}

fn load_recognizer(config: &Config) -> Result<FaceRecognizer> {
    let shaper = config.shaper_model_path();
    let model = config.recognizer_model_path();
    FaceRecognizer::load(&shaper, &model, config.jitter_count)
        .with_context(|| format!("load recognizer {shaper} + {model}"))
}

fn open_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("open image {}", path.display()))?
        .to_rgb8())
}

/// Detections scoring at least `confidence_limit`, most confident first.
fn confident(mut detections: Vec<Detection>, confidence_limit: f64) -> Vec<Detection> {
    detections.retain(|d| d.confidence >= confidence_limit);
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    detections
}

fn recognize_all(
    detector: &FaceDetector,
    recognizer: &FaceRecognizer,
    scene: &RgbImage,
    confidence_limit: f64,
) -> Result<Vec<RecognizedFace>> {
    let detections = confident(detector.detect_rgb(scene)?, confidence_limit);
    tracing::info!(faces = detections.len(), "faces above confidence limit");

    let mut faces = Vec::with_capacity(detections.len());
    for detection in detections {
        let crop = match FaceCrop::from_detection(scene, &detection.rect) {
            Ok(crop) => crop,
            Err(e) => {
                tracing::warn!(rect = ?detection.rect, error = %e, "skipping detection");
                continue;
            }
        };
        let descriptor = recognizer
            .recognize(&crop)
            .with_context(|| format!("recognize face at {:?}", detection.rect))?;
        faces.push(RecognizedFace { detection, descriptor });
    }
    Ok(faces)
}

fn best_face(detector: &FaceDetector, recognizer: &FaceRecognizer, path: &Path) -> Result<Descriptor> {
    let scene = open_rgb(path)?;
    recognize_all(detector, recognizer, &scene, 0.0)?
        .into_iter()
        .next()
        .map(|face| face.descriptor)
        .with_context(|| format!("no face found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use facer_core::Rectangle;

    fn detection(confidence: f64) -> Detection {
        Detection {
            rect: Rectangle::new(0, 0, 10, 10),
            confidence,
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_detect_requires_an_image() {
        assert!(Cli::try_parse_from(["facer", "detect"]).is_err());
        let cli = Cli::try_parse_from(["facer", "detect", "a.jpg", "b.jpg", "-c", "facer.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("facer.toml")));
        assert!(matches!(cli.command, Commands::Detect { images } if images.len() == 2));
    }

    #[test]
    fn test_compare_takes_two_images() {
        assert!(Cli::try_parse_from(["facer", "compare", "a.jpg"]).is_err());
        assert!(Cli::try_parse_from(["facer", "compare", "a.jpg", "b.jpg"]).is_ok());
    }

    #[test]
    fn test_confident_filters_and_orders() {
        let kept = confident(vec![detection(0.4), detection(0.9), detection(0.5)], 0.5);
        let scores: Vec<f64> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.5]);
    }
}
