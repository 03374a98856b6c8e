//! # Edge-aware disparity refinement
//!
//! Weighted least squares refinement of a raw disparity map guided by the left colour image,
//! solved with the fast global smoother of Min et al. ("Fast Global Image Smoothing Based on
//! Weighted Least Squares", TIP 2014). Each pass solves one tridiagonal system per row and then
//! one per column.
//!
//! Left-right agreement gives every raw disparity a confidence in `[0, 1]`. The confidence
//! weighted disparity and the confidence itself are smoothed with the same operator and the
//! refined disparity is their ratio, so occluded or mismatched pixels are filled from their
//! confident, similarly coloured neighbours.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::RgbImage;
use log::debug;
use rayon::prelude::*;

use crate::config::WlsParams;
use crate::disparity::DisparityMap;
use crate::error::*;
use crate::frame::{check_dimensions, GrayFloatImage};
use crate::sgbm::{RawDisparity, DISP_SCALE, DISP_SHIFT, INVALID_DISPARITY};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Smoothed confidence below which a pixel is left invalid.
const MIN_CONFIDENCE: f32 = 1e-3;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct WlsFilter {
    params: WlsParams
}

/// Edge weights of a guide image for the row and column solves.
struct Smoother {
    width: usize,
    height: usize,

    /// `row_weights[y * width + x]` links `(x, y)` and `(x + 1, y)`.
    row_weights: Vec<f32>,

    /// `col_weights[x * height + y]` links `(x, y)` and `(x, y + 1)`.
    col_weights: Vec<f32>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl WlsFilter {
    pub fn new(params: WlsParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    /// Per-pixel confidence of the left map, `max(0, 1 - |dL - dR| / lrc_threshold)` where `dR`
    /// is the right view disparity at the pixel `dL` points to. Zero where either is invalid.
    pub fn confidence(&self, left: &RawDisparity, right: &RawDisparity) -> GrayFloatImage {
        let (w, h) = (left.width(), left.height());
        let threshold = self.params.lrc_threshold as f32;
        let mut conf = GrayFloatImage::new(w, h);

        for y in 0..h {
            for x in 0..w {
                let dl = left.get(x, y);
                if dl == INVALID_DISPARITY {
                    continue;
                }

                let offset = ((dl as i32 + DISP_SCALE / 2) >> DISP_SHIFT) as usize;
                if offset > x {
                    continue;
                }

                let dr = right.get(x - offset, y);
                if dr == INVALID_DISPARITY {
                    continue;
                }

                let c = 1.0 - (dl as f32 - dr as f32).abs() / threshold;
                conf.put(x, y, c.max(0.0));
            }
        }

        conf
    }

    /// Refine the left raw map into a disparity map in pixel units.
    ///
    /// The first `num_disparities` columns, where the matcher has no full search window, are
    /// invalid, as is any pixel whose refined disparity is not positive.
    pub fn filter(
        &self,
        left: &RawDisparity,
        right: &RawDisparity,
        guide: &RgbImage
    ) -> Result<DisparityMap> {
        let dims = (left.width() as u32, left.height() as u32);
        check_dimensions(dims, (right.width() as u32, right.height() as u32))?;
        check_dimensions(dims, guide.dimensions())?;

        let (w, h) = (left.width(), left.height());
        let conf = self.confidence(left, right);

        let weighted: Vec<f32> = left
            .as_slice()
            .iter()
            .zip(conf.as_slice().iter())
            .map(|(&d, &c)| if c > 0.0 { d as f32 * c } else { 0.0 })
            .collect();

        let smoother = Smoother::new(guide, self.params.sigma);
        let (num, den) = rayon::join(
            || smoother.smooth(weighted, &self.params),
            || smoother.smooth(conf.as_slice().to_vec(), &self.params)
        );

        let refined: Vec<f32> = num
            .iter()
            .zip(den.iter())
            .enumerate()
            .map(|(i, (&n, &c))| {
                if i % w.max(1) < left.num_disparities() || c < MIN_CONFIDENCE {
                    return DisparityMap::INVALID;
                }

                let d = n / c / DISP_SCALE as f32;
                if d > 0.0 { d } else { DisparityMap::INVALID }
            })
            .collect();

        let image = GrayFloatImage::from_vec(w, h, refined).ok_or_else(|| {
            Error::invalid("disparity", "refined buffer does not match the image size")
        })?;
        let map = DisparityMap::from_image(image);

        debug!(
            "Refined disparity valid in {} of {} pixels",
            map.valid_count(),
            w * h
        );

        Ok(map)
    }
}

impl Smoother {
    fn new(guide: &RgbImage, sigma: f32) -> Self {
        let (w, h) = (guide.width() as usize, guide.height() as usize);
        let weight = |a: (u32, u32), b: (u32, u32)| {
            let pa = guide.get_pixel(a.0, a.1);
            let pb = guide.get_pixel(b.0, b.1);
            let dist2: f32 = pa
                .0
                .iter()
                .zip(pb.0.iter())
                .map(|(&u, &v)| (u as f32 - v as f32).powi(2))
                .sum();

            (-dist2.sqrt() / sigma).exp()
        };

        let mut row_weights = vec![0f32; w * h];
        row_weights.par_chunks_mut(w.max(1)).enumerate().for_each(|(y, row)| {
            for x in 0..w.saturating_sub(1) {
                row[x] = weight((x as u32, y as u32), (x as u32 + 1, y as u32));
            }
        });

        let mut col_weights = vec![0f32; w * h];
        col_weights.par_chunks_mut(h.max(1)).enumerate().for_each(|(x, col)| {
            for y in 0..h.saturating_sub(1) {
                col[y] = weight((x as u32, y as u32), (x as u32, y as u32 + 1));
            }
        });

        Smoother {
            width: w,
            height: h,
            row_weights,
            col_weights
        }
    }

    /// Alternate row and column solves, with the regularisation decaying by `attenuation` each
    /// pass.
    fn smooth(&self, mut data: Vec<f32>, params: &WlsParams) -> Vec<f32> {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return data;
        }

        let growth = 1.0 / params.attenuation as f64;
        let passes = params.iterations as i32;
        let total = growth.powi(passes) - 1.0;

        for t in 0..passes {
            let lambda = (1.5 * params.lambda as f64 * growth.powi(passes - 1 - t) / total) as f32;

            data.par_chunks_mut(w)
                .zip(self.row_weights.par_chunks(w))
                .for_each(|(row, weights)| solve_tridiagonal(row, weights, lambda));

            let mut columns = transpose(&data, w, h);
            columns
                .par_chunks_mut(h)
                .zip(self.col_weights.par_chunks(h))
                .for_each(|(col, weights)| solve_tridiagonal(col, weights, lambda));

            data = transpose(&columns, h, w);
        }

        data
    }
}

/// Solve `(I + lambda * L) u = f` in place, where `L` is the weighted 1D Laplacian with
/// `weights[i]` linking samples `i` and `i + 1`.
fn solve_tridiagonal(f: &mut [f32], weights: &[f32], lambda: f32) {
    let n = f.len();
    if n == 0 {
        return;
    }

    let link = |i: usize| if i + 1 < n { lambda * weights[i] } else { 0.0 };
    let mut upper = vec![0f32; n];

    // Forward sweep
    let mut prev_link = 0.0;
    let mut prev_upper = 0.0;
    for i in 0..n {
        let next_link = link(i);
        let diag = 1.0 + prev_link + next_link;
        let m = diag + prev_link * prev_upper;

        upper[i] = -next_link / m;
        f[i] = if i == 0 { f[i] / m } else { (f[i] + prev_link * f[i - 1]) / m };

        prev_link = next_link;
        prev_upper = upper[i];
    }

    // Back substitution
    for i in (0..n - 1).rev() {
        f[i] -= upper[i] * f[i + 1];
    }
}

fn transpose(data: &[f32], w: usize, h: usize) -> Vec<f32> {
    let mut out = vec![0f32; w * h];
    out.par_chunks_mut(h).enumerate().for_each(|(x, col)| {
        for (y, v) in col.iter_mut().enumerate() {
            *v = data[y * w + x];
        }
    });

    out
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    fn constant_raw(w: usize, h: usize, nd: usize, value: i16) -> RawDisparity {
        RawDisparity::from_vec(w, h, nd, vec![value; w * h]).unwrap()
    }

    #[test]
    fn zero_weights_leave_signal_unchanged() {
        let mut f = [1.0, 5.0, -2.0, 7.0];
        solve_tridiagonal(&mut f, &[0.0; 4], 100.0);
        assert_eq!(f, [1.0, 5.0, -2.0, 7.0]);
    }

    #[test]
    fn smoothing_preserves_sum() {
        let mut f = [0.0, 10.0, 0.0, 0.0, 4.0, 0.0];
        solve_tridiagonal(&mut f, &[1.0; 6], 5.0);

        assert_relative_eq!(f.iter().sum::<f32>(), 14.0, epsilon = 1e-3);
        assert!(f.iter().all(|&v| v > 0.0 && v < 10.0));
    }

    #[test]
    fn transpose_round_trips() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let t = transpose(&data, 4, 3);
        assert_eq!(t[1], 4.0);
        assert_eq!(transpose(&t, 3, 4), data);
    }

    #[test]
    fn confidence_follows_left_right_agreement() {
        let filter = WlsFilter::new(WlsParams::default()).unwrap();
        let left = constant_raw(40, 4, 16, 96);
        let agreeing = constant_raw(40, 4, 16, 96);
        let off_by_half = constant_raw(40, 4, 16, 96 + 12);
        let invalid = constant_raw(40, 4, 16, INVALID_DISPARITY);

        assert_eq!(filter.confidence(&left, &agreeing).get(20, 1), 1.0);
        assert_relative_eq!(filter.confidence(&left, &off_by_half).get(20, 1), 0.5);
        assert_eq!(filter.confidence(&left, &invalid).get(20, 1), 0.0);

        // Pixels pointing outside the right view have no confidence
        assert_eq!(filter.confidence(&left, &agreeing).get(3, 1), 0.0);
    }

    #[test]
    fn constant_disparity_is_preserved() {
        let filter = WlsFilter::new(WlsParams::default()).unwrap();
        let raw = constant_raw(48, 12, 16, 96);
        let guide = RgbImage::from_pixel(48, 12, Rgb([80, 120, 160]));

        let map = filter.filter(&raw, &raw, &guide).unwrap();

        assert_eq!(map.get(10, 5), None);
        for x in 16..48 {
            assert_relative_eq!(map.get(x, 5).unwrap(), 6.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn colour_edges_stop_smoothing() {
        let (w, h) = (20, 6);
        let guide = RgbImage::from_fn(w, h, |x, _| {
            if x < 10 { Rgb([20, 20, 20]) } else { Rgb([220, 220, 220]) }
        });
        let signal: Vec<f32> = (0..(w * h) as usize)
            .map(|i| if i % (w as usize) < 10 { 4.0 } else { 10.0 })
            .collect();

        let smoother = Smoother::new(&guide, 1.5);
        let out = smoother.smooth(signal, &WlsParams::default());

        assert_relative_eq!(out[2 * w as usize + 9], 4.0, epsilon = 1e-3);
        assert_relative_eq!(out[2 * w as usize + 10], 10.0, epsilon = 1e-3);
    }
}
