//! Image -> embedding.
//!
//! The embedding model is treated as an opaque function. [`OnnxEmbedder`]
//! runs a single ONNX model that takes a square RGB crop and returns the
//! embedding, optionally followed by a face-confidence output.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
pub const DEFAULT_INPUT_SIZE: u32 = 112;
pub const DEFAULT_MIN_FACE_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("invalid image data: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// The external embedding function: encoded image bytes in, embedding out.
///
/// Implementations hold inference sessions and need `&mut self`; the daemon
/// keeps one on a dedicated thread.
pub trait Embedder: Send {
    fn embed(&mut self, image: &[u8]) -> Result<Embedding, EmbedError>;
}

/// Decode an encoded image (any format the `image` crate supports) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EmbedError> {
    if bytes.is_empty() {
        return Err(EmbedError::Decode("empty image".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| EmbedError::Decode(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(EmbedError::Decode("image has zero size".into()));
    }
    Ok(img.to_rgb8())
}

/// L2-normalize in place. Returns `false` for a zero or non-finite vector.
pub fn l2_normalize(values: &mut [f32]) -> bool {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return false;
    }
    values.iter_mut().for_each(|x| *x /= norm);
    true
}

/// Tunables for [`OnnxEmbedder`].
#[derive(Debug, Clone, Copy)]
pub struct EmbedderOptions {
    /// Side length of the square model input.
    pub input_size: u32,
    /// Minimum face score when the model exposes one.
    pub min_face_confidence: f32,
}

impl Default for EmbedderOptions {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            min_face_confidence: DEFAULT_MIN_FACE_CONFIDENCE,
        }
    }
}

/// ONNX-backed embedder.
pub struct OnnxEmbedder {
    session: Session,
    options: EmbedderOptions,
    model_version: String,
    /// Model exposes a face-confidence tensor as its second output.
    has_face_score: bool,
}

impl OnnxEmbedder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str, options: EmbedderOptions) -> Result<Self, EmbedError> {
        let path = Path::new(model_path);
        if !path.exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let has_face_score = session.outputs().len() > 1;
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = options.input_size,
            has_face_score,
            "loaded embedding model"
        );

        let model_version = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            session,
            options,
            model_version,
            has_face_score,
        })
    }

    /// Resize to the model input and convert to a normalized NCHW float tensor.
    fn preprocess(rgb: &RgbImage, size: u32) -> Array4<f32> {
        let resized = image::imageops::resize(rgb, size, size, FilterType::Triangle);
        let s = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, s, s));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
            }
        }

        tensor
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, encoded: &[u8]) -> Result<Embedding, EmbedError> {
        let rgb = decode_image(encoded)?;
        let input = Self::preprocess(&rgb, self.options.input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        if self.has_face_score {
            let (_, scores) = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbedError::InferenceFailed(format!("face score: {e}")))?;
            let score = scores.first().copied().unwrap_or(0.0);
            if score < self.options.min_face_confidence {
                tracing::debug!(score, min = self.options.min_face_confidence, "face score below minimum");
                return Err(EmbedError::NoFaceDetected);
            }
        }

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;
        let mut values = raw.to_vec();
        if values.is_empty() {
            return Err(EmbedError::InferenceFailed("model returned an empty embedding".into()));
        }

        if !l2_normalize(&mut values) {
            return Err(EmbedError::NoFaceDetected);
        }

        Ok(Embedding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_decode_valid_png() {
        let img = decode_image(&png_bytes(8, 6, [10, 20, 30])).unwrap();
        assert_eq!(img.dimensions(), (8, 6));
        assert_eq!(img.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(b"definitely not an image"), Err(EmbedError::Decode(_))));
        assert!(matches!(decode_image(&[]), Err(EmbedError::Decode(_))));
    }

    #[test]
    fn test_preprocess_output_shape() {
        let img = RgbImage::from_pixel(50, 30, image::Rgb([128, 128, 128]));
        let tensor = OnnxEmbedder::preprocess(&img, DEFAULT_INPUT_SIZE);
        let s = DEFAULT_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, s, s]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([0, 255, 128]));
        let tensor = OnnxEmbedder::preprocess(&img, 4);
        assert!((tensor[[0, 0, 1, 1]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 1]] - 1.0).abs() < 1e-6);
        let expected = (128.0 - PIXEL_MEAN) / PIXEL_STD;
        assert!((tensor[[0, 2, 3, 2]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = [3.0f32, 4.0];
        assert!(l2_normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);

        let mut zero = [0.0f32; 3];
        assert!(!l2_normalize(&mut zero));
        let mut nan = [f32::NAN, 1.0];
        assert!(!l2_normalize(&mut nan));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxEmbedder::load("/nonexistent/model.onnx", EmbedderOptions::default());
        assert!(matches!(err, Err(EmbedError::ModelNotFound(_))));
    }
}
