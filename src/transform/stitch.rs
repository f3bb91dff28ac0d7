//! Horizontal stitching of half-acquisition projection pairs.

use crate::io::SampleFormat;
use ndarray::{s, Array2, ArrayView2, Axis};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StitchError {
    #[error("images differ in shape: {first:?} vs {second:?}")]
    ShapeMismatch {
        first: (usize, usize),
        second: (usize, usize),
    },

    #[error("axis {axis} gives an overlap of {overlap} px for width {width}")]
    InvalidAxis {
        axis: f64,
        overlap: usize,
        width: usize,
    },

    #[error("crop of {crop} px per side leaves nothing of width {width}")]
    CropTooLarge { crop: usize, width: usize },
}

/// Value range the rescaled second image is clipped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntensityRange {
    /// Floating-point data
    #[default]
    Unbounded,
    U8,
    U16,
    U32,
}

impl IntensityRange {
    fn clip(self, v: f32) -> f32 {
        match self {
            IntensityRange::Unbounded => v,
            IntensityRange::U8 => v.clamp(0.0, u8::MAX as f32),
            IntensityRange::U16 => v.clamp(0.0, u16::MAX as f32),
            IntensityRange::U32 => v.clamp(0.0, u32::MAX as f32),
        }
    }
}

impl From<SampleFormat> for IntensityRange {
    fn from(format: SampleFormat) -> Self {
        match format {
            SampleFormat::U8 => IntensityRange::U8,
            SampleFormat::U16 => IntensityRange::U16,
            SampleFormat::U32 => IntensityRange::U32,
            SampleFormat::F32 => IntensityRange::Unbounded,
        }
    }
}

/// Overlap in pixels between the two halves for a given axis.
pub fn overlap_width(axis: f64, width: usize) -> usize {
    let w = width as f64;
    let dx = if axis > w / 2.0 {
        2.0 * (w - axis) + 0.5
    } else {
        2.0 * axis + 0.5
    };
    dx.max(0.0) as usize
}

/// Stitch two images that overlap by `2 * (w - axis)` pixels (or `2 * axis`
/// when the axis lies in the left half, in which case the images swap sides).
///
/// The second image is scaled so the mean of its overlap band matches the
/// first, then the band is blended with a linear ramp. `crop` pixels are
/// removed from each side of the result.
pub fn stitch(
    first: ArrayView2<'_, f32>,
    second: ArrayView2<'_, f32>,
    axis: f64,
    crop: usize,
    range: IntensityRange,
) -> Result<Array2<f32>, StitchError> {
    if first.dim() != second.dim() {
        return Err(StitchError::ShapeMismatch {
            first: first.dim(),
            second: second.dim(),
        });
    }
    let (h, w) = first.dim();
    let dx = overlap_width(axis, w);
    if dx == 0 || dx > w {
        return Err(StitchError::InvalidAxis { axis, overlap: dx, width: w });
    }
    let (left, right) = if axis > w as f64 / 2.0 {
        (first.view(), second.view())
    } else {
        (second.view(), first.view())
    };

    let out_w = 2 * w - dx;
    if 2 * crop >= out_w {
        return Err(StitchError::CropTooLarge { crop, width: out_w });
    }

    let left_band = left.slice(s![.., w - dx..]);
    let right_band = right.slice(s![.., ..dx]);
    let k = match (left_band.mean(), right_band.mean()) {
        (Some(a), Some(b)) if b != 0.0 => a / b,
        _ => 1.0,
    };
    let right = right.mapv(|v| range.clip(v * k));

    let mut out = Array2::<f32>::zeros((h, out_w));
    out.slice_mut(s![.., ..w - dx]).assign(&left.slice(s![.., ..w - dx]));
    let denom = if dx > 1 { (dx - 1) as f32 } else { 1.0 };
    for c in 0..dx {
        let t = c as f32 / denom;
        let l = left.column(w - dx + c);
        let r = right.column(c);
        out.column_mut(w - dx + c)
            .zip_mut_with(&l, |o, &lv| *o = lv * (1.0 - t));
        out.column_mut(w - dx + c)
            .zip_mut_with(&r, |o, &rv| *o += rv * t);
    }
    out.slice_mut(s![.., w..]).assign(&right.slice(s![.., dx..]));

    Ok(out.slice(s![.., crop..out_w - crop]).to_owned())
}

/// Stitch frame `i` with the horizontally mirrored frame `i + N/2`.
pub fn stitch_pair(
    first: ArrayView2<'_, f32>,
    opposite: ArrayView2<'_, f32>,
    axis: f64,
    crop: usize,
    range: IntensityRange,
) -> Result<Array2<f32>, StitchError> {
    let mut mirrored = opposite.to_owned();
    mirrored.invert_axis(Axis(1));
    stitch(first, mirrored.view(), axis, crop, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_output_width_and_blend() {
        let first = Array2::from_elem((2, 10), 1.0f32);
        let second = Array2::from_elem((2, 10), 1.0f32);
        // axis 8 of width 10 -> overlap 4
        let out = stitch(first.view(), second.view(), 8.0, 0, IntensityRange::Unbounded).unwrap();
        assert_eq!(out.dim(), (2, 16));
        assert!(out.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_intensity_matching() {
        let first = Array2::from_elem((1, 6), 2.0f32);
        let second = Array2::from_elem((1, 6), 1.0f32);
        let out = stitch(first.view(), second.view(), 5.0, 0, IntensityRange::Unbounded).unwrap();
        // second scaled by 2 to match the band mean of first
        assert!(out.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_left_axis_swaps_inputs() {
        let first = array![[1.0f32, 1.0, 1.0, 1.0]];
        let second = array![[5.0f32, 5.0, 5.0, 5.0]];
        // axis 1 of width 4 -> overlap 2, second goes on the left
        let out = stitch(first.view(), second.view(), 1.0, 0, IntensityRange::Unbounded).unwrap();
        assert_eq!(out.dim(), (1, 6));
        assert_eq!(out[[0, 0]], 5.0);
        assert!((out[[0, 5]] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_and_clip() {
        let first = Array2::from_elem((1, 8), 60000.0f32);
        let second = Array2::from_elem((1, 8), 1.0f32);
        let out = stitch(first.view(), second.view(), 6.0, 2, IntensityRange::U16).unwrap();
        // 2*8 - 4 = 12 wide, minus 2 on each side
        assert_eq!(out.dim(), (1, 8));
        assert!(out.iter().all(|&v| v <= u16::MAX as f32));
    }

    #[test]
    fn test_float_input_keeps_negative_values() {
        let frame = Array2::from_elem((2, 8), -0.5f32);
        let out = stitch_pair(frame.view(), frame.view(), 6.0, 0, SampleFormat::F32.into()).unwrap();
        assert_eq!(out.dim(), (2, 12));
        assert!(out.iter().all(|&v| (v + 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_u8_input_is_clipped_at_255() {
        let first = Array2::from_elem((1, 8), 250.0f32);
        let second = Array2::from_elem((1, 8), 10.0f32);
        let mut second_band = second.clone();
        second_band.slice_mut(s![.., ..4]).fill(1.0);
        let out = stitch(first.view(), second_band.view(), 6.0, 0, SampleFormat::U8.into()).unwrap();
        // the right image is scaled by 250 and clipped
        assert_eq!(out[[0, 11]], 255.0);
        assert!(out.iter().all(|&v| (0.0..=255.0).contains(&v)));
    }

    #[test]
    fn test_invalid_axis() {
        let img = Array2::from_elem((1, 8), 1.0f32);
        let err = stitch(img.view(), img.view(), 8.0, 0, IntensityRange::Unbounded).unwrap_err();
        assert!(matches!(err, StitchError::InvalidAxis { overlap: 0, .. }));
    }

    #[test]
    fn test_crop_too_large() {
        let img = Array2::from_elem((1, 8), 1.0f32);
        let err = stitch(img.view(), img.view(), 6.0, 6, IntensityRange::Unbounded).unwrap_err();
        assert_eq!(err, StitchError::CropTooLarge { crop: 6, width: 12 });
    }

    #[test]
    fn test_stitch_pair_mirrors_opposite() {
        let first = array![[0.0f32, 1.0, 2.0, 3.0]];
        let opposite = array![[3.0f32, 2.0, 1.0, 0.0]];
        // mirrored opposite equals first; axis 2.5 of width 4 overlaps 3 px
        let out = stitch_pair(first.view(), opposite.view(), 2.5, 0, IntensityRange::Unbounded).unwrap();
        assert_eq!(out.dim(), (1, 5));
    }

    #[test]
    fn test_self_stitch_at_half_width() {
        let img = Array2::from_shape_fn((3, 8), |(y, x)| (y * 8 + x) as f32);
        let out = stitch(img.view(), img.view(), 4.0, 0, IntensityRange::Unbounded).unwrap();
        assert_eq!(overlap_width(4.0, 8), 8);
        assert_eq!(out.dim(), (3, 2 * 8 - 8));
        assert_eq!(out.slice(s![.., ..4]), img.slice(s![.., ..4]));
        let band_mean = out.mean().unwrap();
        assert!((band_mean - img.mean().unwrap()).abs() < 1e-4);
    }
}
