//! Axis estimate from the mirror correlation of the first and last projection.
//!
//! The last projection of a 180 degree scan is the mirror image of the first
//! about the rotation axis. Convolving the two along x (with the last image
//! flipped vertically so that rows correlate instead) peaks at the column
//! offset of that mirror axis.

use crate::transform::flat_field::log_ratio;
use ndarray::{s, Array2, ArrayView2, Axis};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Flat-field corrected first/last projections ready for correlation.
#[derive(Debug, Clone)]
pub struct ProjectionPair {
    pub first: Array2<f64>,
    pub last: Array2<f64>,
}

impl ProjectionPair {
    /// Build the pair from raw frames.
    ///
    /// `flat2` corrects the last projection when present, `flat` otherwise.
    pub fn from_raw(
        first: ArrayView2<'_, f32>,
        last: ArrayView2<'_, f32>,
        dark: ArrayView2<'_, f32>,
        flat: ArrayView2<'_, f32>,
        flat2: Option<ArrayView2<'_, f32>>,
    ) -> Self {
        let dark = dark.mapv(|v| v as f64);
        let flat1 = flat.mapv(|v| v as f64) - &dark;
        let first = log_ratio(flat1.view(), (first.mapv(|v| v as f64) - &dark).view());
        let last_radio = last.mapv(|v| v as f64) - &dark;
        let last = match flat2 {
            Some(flat2) => {
                let flat2 = flat2.mapv(|v| v as f64) - &dark;
                log_ratio(flat2.view(), last_radio.view())
            }
            None => log_ratio(flat1.view(), last_radio.view()),
        };
        Self { first, last }
    }

    /// Keep rows `y..min(y + height, rows)`.
    pub fn crop_rows(self, y: usize, height: usize) -> Self {
        let rows = self.first.nrows();
        let start = y.min(rows);
        let stop = (y + height).min(rows);
        Self {
            first: self.first.slice(s![start..stop, ..]).to_owned(),
            last: self.last.slice(s![start..stop, ..]).to_owned(),
        }
    }
}

/// Axis position in pixels, `None` when the images are empty or differ in shape.
pub fn correlation_axis(first: ArrayView2<'_, f64>, last: ArrayView2<'_, f64>) -> Option<f64> {
    let (h, w) = first.dim();
    if h == 0 || w == 0 || last.dim() != (h, w) {
        return None;
    }

    let first = &first - first.mean()?;
    let mut last = &last - last.mean()?;
    last.invert_axis(Axis(0));

    let conv = fft_convolve_same(first.view(), last.view());

    let mut best = (0usize, f64::NEG_INFINITY);
    for ((_, col), &v) in conv.indexed_iter() {
        if v > best.1 {
            best = (col, v);
        }
    }
    Some((w as f64 / 2.0 + best.0 as f64) / 2.0)
}

/// 2-D linear convolution cropped to the size of `a`, centred on the full result.
pub fn fft_convolve_same(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Array2<f64> {
    let (ah, aw) = a.dim();
    let (bh, bw) = b.dim();
    let full_h = ah + bh - 1;
    let full_w = aw + bw - 1;

    let mut planner = FftPlanner::<f64>::new();
    let mut fa = padded_complex(a, full_h, full_w);
    let mut fb = padded_complex(b, full_h, full_w);
    fft2(&mut planner, &mut fa, false);
    fft2(&mut planner, &mut fb, false);
    fa.zip_mut_with(&fb, |x, y| *x *= *y);
    fft2(&mut planner, &mut fa, true);

    let scale = 1.0 / (full_h * full_w) as f64;
    let top = (full_h - ah) / 2;
    let left = (full_w - aw) / 2;
    fa.slice(s![top..top + ah, left..left + aw])
        .mapv(|c| c.re * scale)
}

fn padded_complex(src: ArrayView2<'_, f64>, h: usize, w: usize) -> Array2<Complex<f64>> {
    let mut out = Array2::from_elem((h, w), Complex::new(0.0, 0.0));
    let (sh, sw) = src.dim();
    out.slice_mut(s![..sh, ..sw])
        .zip_mut_with(&src, |o, &v| *o = Complex::new(v, 0.0));
    out
}

/// In-place unnormalised 2-D FFT, rows then columns.
fn fft2(planner: &mut FftPlanner<f64>, data: &mut Array2<Complex<f64>>, inverse: bool) {
    let (h, w) = data.dim();
    let row_fft = if inverse {
        planner.plan_fft_inverse(w)
    } else {
        planner.plan_fft_forward(w)
    };
    let col_fft = if inverse {
        planner.plan_fft_inverse(h)
    } else {
        planner.plan_fft_forward(h)
    };

    let mut buf = vec![Complex::new(0.0, 0.0); w.max(h)];
    for mut row in data.rows_mut() {
        for (b, v) in buf.iter_mut().zip(row.iter()) {
            *b = *v;
        }
        row_fft.process(&mut buf[..w]);
        for (v, b) in row.iter_mut().zip(buf.iter()) {
            *v = *b;
        }
    }
    for mut col in data.columns_mut() {
        for (b, v) in buf.iter_mut().zip(col.iter()) {
            *b = *v;
        }
        col_fft.process(&mut buf[..h]);
        for (v, b) in col.iter_mut().zip(buf.iter()) {
            *v = *b;
        }
    }
}
