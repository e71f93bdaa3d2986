//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the det_10g SCRFD model on a letterboxed RGB frame, decodes the
//! three anchor-free stride heads, and suppresses overlaps with NMS.

use crate::recognizer::EmbedError;
use crate::types::FaceBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    fn to_source(self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(EmbedError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps for 3 strides), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = output_layout(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output mapping");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect faces, most confident first. Coordinates are in `frame` pixels.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>, EmbedError> {
        let letterbox = Letterbox::fit(frame.width(), frame.height());
        let input = preprocess(frame, letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in
            SCRFD_STRIDES.iter().zip(self.stride_outputs.iter())
        {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| EmbedError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            faces.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(faces, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox `frame` into a 640x640 NCHW tensor. Padding normalizes to 0.
fn preprocess(frame: &RgbImage, letterbox: Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
    let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (pad_x, pad_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + pad_x, y as usize + pad_y);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

/// Map output tensors to strides.
///
/// Exports that name their heads `score_8`, `bbox_16`, `kps_32`... are
/// mapped by name; anything else uses the standard layout of scores, then
/// boxes, then keypoints, each ordered 8/16/32.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0, 0); 3];
    for (slot, &stride) in named.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => *slot = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD output names not recognized, using positional layout");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    named
}

/// Decode one stride head into source-frame face boxes above `threshold`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<FaceBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut faces = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * step;
        let ay = (cell / grid_w) as f32 * step;

        let (x1, y1) = letterbox.to_source(ax - offsets[0] * step, ay - offsets[1] * step);
        let (x2, y2) = letterbox.to_source(ax + offsets[2] * step, ay + offsets[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|points| {
            let mut out = [(0.0f32, 0.0f32); 5];
            for (i, point) in out.iter_mut().enumerate() {
                *point = letterbox.to_source(
                    ax + points[i * 2] * step,
                    ay + points[i * 2 + 1] * step,
                );
            }
            out
        });

        faces.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    faces
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
fn nms(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::with_capacity(faces.len());
    for face in faces {
        if keep.iter().all(|kept| iou(kept, &face) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
