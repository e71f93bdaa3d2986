//! Face chip extraction.
//!
//! With landmarks, the face is warped onto the five InsightFace reference
//! points by a least-squares similarity transform. Without them, the box is
//! clamped to the frame and cropped.

use crate::types::FaceBox;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112x112 chip.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const CHIP_SIZE: u32 = 112;

/// Similarity transform `[a, b, tx, ty]` mapping `(x, y)` to
/// `(a*x - b*y + tx, b*x + a*y + ty)`.
type Similarity = [f32; 4];

/// Least-squares similarity transform from `src` points onto `dst` points.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Similarity> {
    // Normal equations of [x -y 1 0; y x 0 1] * [a b tx ty]' = [u; v]
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];
    for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
        for (row, target) in [([x, -y, 1.0, 0.0], u), ([y, x, 0.0, 1.0], v)] {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * target;
            }
        }
    }
    solve4(ata, atb)
}

/// Gaussian elimination with partial pivoting. `None` when singular.
fn solve4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-9 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in col + 1..4 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Warp `frame` through the inverse of `t` into a square chip. Pixels that
/// fall outside the frame are black.
fn warp(frame: &RgbImage, t: Similarity, size: u32) -> Option<RgbImage> {
    let [a, b, tx, ty] = t;
    let det = a * a + b * b;
    if det < 1e-12 {
        return None;
    }
    let (ia, ib) = (a / det, b / det);
    let (w, h) = (frame.width() as i64, frame.height() as i64);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            frame.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    Some(RgbImage::from_fn(size, size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
        let mut out = [0u8; 3];
        for (c, channel) in out.iter_mut().enumerate() {
            let v = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *channel = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    }))
}

/// Crop `face` out of `frame`, clamped to the frame bounds. `None` when
/// nothing of the box lies inside the frame.
fn crop_clamped(frame: &RgbImage, face: &FaceBox) -> Option<RgbImage> {
    let (w, h) = (frame.width() as f32, frame.height() as f32);
    let x1 = face.x.clamp(0.0, w).floor();
    let y1 = face.y.clamp(0.0, h).floor();
    let x2 = (face.x + face.width).clamp(0.0, w).ceil();
    let y2 = (face.y + face.height).clamp(0.0, h).ceil();
    if !(x2 - x1 >= 1.0 && y2 - y1 >= 1.0) {
        return None;
    }
    let crop = image::imageops::crop_imm(
        frame,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    );
    Some(crop.to_image())
}

/// Produce the 112x112 chip the recognizer consumes.
pub fn face_chip(frame: &RgbImage, face: &FaceBox) -> Option<RgbImage> {
    if let Some(landmarks) = &face.landmarks {
        if let Some(chip) = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112)
            .and_then(|t| warp(frame, t, CHIP_SIZE))
        {
            return Some(chip);
        }
        tracing::debug!("degenerate landmarks, falling back to box crop");
    }
    let crop = crop_clamped(frame, face)?;
    Some(image::imageops::resize(
        &crop,
        CHIP_SIZE,
        CHIP_SIZE,
        FilterType::Triangle,
    ))
}
