//! Flat-field helpers shared by the correlation axis estimate and the overlap search.

use ndarray::{Array2, ArrayView2, Zip};

/// Pixel-wise mean of a stack of frames, `None` for an empty stack.
pub fn mean_frame(frames: &[Array2<f32>]) -> Option<Array2<f32>> {
    let first = frames.first()?;
    let mut acc = first.mapv(|v| v as f64);
    for frame in &frames[1..] {
        Zip::from(&mut acc).and(frame).for_each(|a, &v| *a += v as f64);
    }
    let n = frames.len() as f64;
    Some(acc.mapv(|v| (v / n) as f32))
}

/// Flat field for projection `index` of `total`, linearly blended from the
/// flats taken before (`flat`) and after (`flat2`) the scan.
pub fn interpolated_flat(
    flat: ArrayView2<'_, f32>,
    flat2: ArrayView2<'_, f32>,
    index: usize,
    total: usize,
) -> Array2<f32> {
    let t = if total > 1 {
        index as f32 / (total - 1) as f32
    } else {
        0.0
    };
    Zip::from(flat).and(flat2).map_collect(|&a, &b| a * (1.0 - t) + b * t)
}

/// Absorption image `-ln((tomo - dark) / (flat - dark))` with non-finite values zeroed.
pub fn absorption(
    tomo: ArrayView2<'_, f32>,
    dark: ArrayView2<'_, f32>,
    flat: ArrayView2<'_, f32>,
) -> Array2<f32> {
    Zip::from(tomo).and(dark).and(flat).map_collect(|&t, &d, &f| {
        let v = -((t - d) / (f - d)).ln();
        if v.is_finite() {
            v
        } else {
            0.0
        }
    })
}

/// `ln(flat / radio)` where `radio` is non-zero; pixels with a non-positive
/// ratio (including zero radio) map to 0.
pub fn log_ratio(flat: ArrayView2<'_, f64>, radio: ArrayView2<'_, f64>) -> Array2<f64> {
    Zip::from(flat).and(radio).map_collect(|&f, &r| {
        let ratio = if r != 0.0 { f / r } else { 0.0 };
        if ratio <= 0.0 {
            0.0
        } else {
            ratio.ln()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mean_frame() {
        let frames = vec![array![[1.0f32, 2.0]], array![[3.0f32, 6.0]]];
        assert_eq!(mean_frame(&frames).unwrap(), array![[2.0f32, 4.0]]);
        assert!(mean_frame(&[]).is_none());
    }

    #[test]
    fn test_interpolated_flat_endpoints() {
        let a = array![[0.0f32, 10.0]];
        let b = array![[10.0f32, 20.0]];
        assert_eq!(interpolated_flat(a.view(), b.view(), 0, 5), a);
        assert_eq!(interpolated_flat(a.view(), b.view(), 4, 5), b);
        assert_eq!(interpolated_flat(a.view(), b.view(), 2, 5), array![[5.0f32, 15.0]]);
    }

    #[test]
    fn test_absorption_zeroes_invalid_pixels() {
        let tomo = array![[10.0f32, 5.0]];
        let dark = array![[0.0f32, 5.0]];
        let flat = array![[10.0f32, 5.0]];
        let out = absorption(tomo.view(), dark.view(), flat.view());
        assert_eq!(out[[0, 0]], 0.0);
        assert_eq!(out[[0, 1]], 0.0);
    }

    #[test]
    fn test_log_ratio() {
        let flat = array![[std::f64::consts::E, 1.0, -1.0]];
        let radio = array![[1.0, 0.0, 1.0]];
        let out = log_ratio(flat.view(), radio.view());
        assert!((out[[0, 0]] - 1.0).abs() < 1e-12);
        assert_eq!(out[[0, 1]], 0.0);
        assert_eq!(out[[0, 2]], 0.0);
    }
}
