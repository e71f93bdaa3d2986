//! Embedding providers.
//!
//! [`FaceEmbedder`] is the production pipeline: decode the frame, find
//! faces with SCRFD, keep the largest, align it to a 112x112 chip, and
//! embed the chip with the w600k_r50 ArcFace model via ONNX Runtime.

use crate::alignment::{self, CHIP_SIZE};
use crate::detector::FaceDetector;
use crate::types::{Embedding, FaceBox};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ARCFACE_INPUT_SIZE: usize = CHIP_SIZE as usize;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric: (p - 127.5) / 127.5, not 128
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface)")]
    ModelNotFound(String),
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFace,
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns an encoded image into a face embedding.
pub trait EmbeddingProvider: Send {
    fn embed(&mut self, image: &[u8]) -> Result<Embedding, EmbedError>;

    /// Dimension of every embedding this provider returns.
    fn dimension(&self) -> usize;
}

/// ArcFace recognizer over aligned face chips.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Embed an aligned face chip. Chips of another size are resized first.
    pub fn embed_chip(&mut self, chip: &RgbImage) -> Result<Embedding, EmbedError> {
        let size = ARCFACE_INPUT_SIZE as u32;
        let input = if chip.dimensions() == (size, size) {
            Self::preprocess(chip)
        } else {
            Self::preprocess(&image::imageops::resize(chip, size, size, FilterType::Triangle))
        };

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: normalize(raw)?,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    /// Preprocess a 112x112 RGB face crop into a NCHW float tensor.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

/// L2-normalize a raw model output, rejecting zero vectors.
fn normalize(raw: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbedError::ZeroNorm);
    }
    Ok(raw.into_iter().map(|x| x / norm).collect())
}

/// Decode an encoded image into RGB.
fn decode(image_bytes: &[u8]) -> Result<RgbImage, EmbedError> {
    let decoded =
        image::load_from_memory(image_bytes).map_err(|e| EmbedError::Decode(e.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(EmbedError::NoFace);
    }
    Ok(decoded.to_rgb8())
}

/// The face to embed: the largest box, the more confident one on equal area.
fn select_face(faces: &[FaceBox]) -> Result<&FaceBox, EmbedError> {
    faces
        .iter()
        .filter(|f| f.area() > 0.0)
        .max_by(|a, b| {
            a.area()
                .total_cmp(&b.area())
                .then(a.confidence.total_cmp(&b.confidence))
        })
        .ok_or(EmbedError::NoFace)
}

/// Detect, align and embed: the provider the daemon runs.
pub struct FaceEmbedder {
    detector: FaceDetector,
    recognizer: ArcFaceEmbedder,
}

impl FaceEmbedder {
    /// Load both models. A missing file is fatal.
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, EmbedError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            recognizer: ArcFaceEmbedder::load(recognizer_path)?,
        })
    }
}

impl EmbeddingProvider for FaceEmbedder {
    fn embed(&mut self, image: &[u8]) -> Result<Embedding, EmbedError> {
        let frame = decode(image)?;
        let faces = self.detector.detect(&frame)?;
        let face = select_face(&faces)?;
        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            width = face.width,
            height = face.height,
            "face selected"
        );
        let chip = alignment::face_chip(&frame, face).ok_or(EmbedError::NoFace)?;
        self.recognizer.embed_chip(&chip)
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn detection(x: f32, width: f32, confidence: f32) -> FaceBox {
        FaceBox {
            x,
            y: 0.0,
            width,
            height: width,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_decode_keeps_frame_size() {
        let frame = decode(&png(40, 60, [10, 20, 30])).unwrap();
        assert_eq!(frame.dimensions(), (40, 60));
        assert_eq!(frame.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode(b"not an image").unwrap_err();
        assert!(matches!(err, EmbedError::Decode(_)));
    }

    #[test]
    fn test_no_detection_is_no_face() {
        assert!(matches!(select_face(&[]), Err(EmbedError::NoFace)));
        assert!(matches!(
            select_face(&[detection(0.0, 0.0, 0.99)]),
            Err(EmbedError::NoFace)
        ));
    }

    #[test]
    fn test_largest_face_wins_over_most_confident() {
        let faces = [
            detection(0.0, 40.0, 0.95),
            detection(100.0, 90.0, 0.60),
            detection(300.0, 60.0, 0.80),
        ];
        assert_eq!(select_face(&faces).unwrap().x, 100.0);

        let tied = [detection(0.0, 50.0, 0.7), detection(100.0, 50.0, 0.9)];
        assert_eq!(select_face(&tied).unwrap().x, 100.0);
    }

    #[test]
    fn test_load_missing_detector() {
        let err = FaceEmbedder::load("/nonexistent/det_10g.onnx", "/nonexistent/w600k_r50.onnx")
            .err()
            .unwrap();
        assert!(matches!(err, EmbedError::ModelNotFound(p) if p.contains("det_10g")));
    }

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let face = RgbImage::from_pixel(112, 112, Rgb([0, 128, 255]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert!((tensor[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 1, 5, 5]] - expected).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize(vec![3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_is_error() {
        assert!(matches!(normalize(vec![0.0; 8]), Err(EmbedError::ZeroNorm)));
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceEmbedder::load("/nonexistent/w600k_r50.onnx").err().unwrap();
        assert!(matches!(err, EmbedError::ModelNotFound(_)));
    }
}
