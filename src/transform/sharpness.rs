//! Focus metrics used to rank candidate reconstructions.

use crate::config::SharpnessMetric;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SharpnessError {
    #[error("no images to evaluate")]
    EmptyInput,

    #[error("image {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Scores of a set of images and the index of the sharpest one.
#[derive(Debug, Clone, PartialEq)]
pub struct SharpnessRanking {
    pub best: usize,
    pub scores: Vec<f64>,
}

impl SharpnessRanking {
    pub fn best_score(&self) -> f64 {
        self.scores[self.best]
    }
}

/// Score a single image; higher is sharper.
pub fn sharpness(image: ArrayView2<'_, f32>, metric: SharpnessMetric) -> f64 {
    match metric {
        SharpnessMetric::Gradient => mean_gradient(image),
        SharpnessMetric::Std => std_dev(image),
    }
}

/// Mean magnitude of forward differences over pixels that have both neighbours.
fn mean_gradient(image: ArrayView2<'_, f32>) -> f64 {
    let (h, w) = image.dim();
    if h < 2 || w < 2 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let v = image[[y, x]] as f64;
            let gx = image[[y, x + 1]] as f64 - v;
            let gy = image[[y + 1, x]] as f64 - v;
            sum += (gx * gx + gy * gy).sqrt();
        }
    }
    sum / ((h - 1) * (w - 1)) as f64
}

fn std_dev(image: ArrayView2<'_, f32>) -> f64 {
    let n = image.len();
    if n == 0 {
        return 0.0;
    }
    let mean = image.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = image
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    var.sqrt()
}

/// Rank images by sharpness. Ties resolve to the lowest index.
pub fn rank_by_sharpness(
    images: &[Array2<f32>],
    metric: SharpnessMetric,
) -> Result<SharpnessRanking, SharpnessError> {
    let first = images.first().ok_or(SharpnessError::EmptyInput)?;
    let expected = first.dim();
    if let Some((index, image)) = images.iter().enumerate().find(|(_, img)| img.dim() != expected) {
        return Err(SharpnessError::ShapeMismatch {
            index,
            expected,
            found: image.dim(),
        });
    }

    let scores: Vec<f64> = images
        .par_iter()
        .map(|img| sharpness(img.view(), metric))
        .collect();

    let mut best = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }
    Ok(SharpnessRanking { best, scores })
}
