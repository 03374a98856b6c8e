//! # Semi-global block matching
//!
//! Dense disparity between a rectified pair using the semi-global matching strategy of
//! Hirschmüller ("Stereo Processing by Semiglobal Matching and Mutual Information", PAMI 2008),
//! with block costs in the style of common SGBM implementations:
//!
//! - both images are pre-filtered with a clipped horizontal Sobel,
//! - the pixel cost is the Birchfield-Tomasi sampling insensitive difference of the pre-filtered
//!   images plus a quarter of the raw intensity difference,
//! - pixel costs are summed over a `block_size` square window,
//! - costs are aggregated along four scanline paths with penalties `P1` and `P2`,
//! - the winner is the lowest aggregated cost (lowest disparity on ties), refined to 1/16 pixel.
//!
//! The full cost and aggregation volumes are held in memory, `2 * width * height *
//! num_disparities` values of 16 bits each. [`SemiGlobal`] matches the two views one after the
//! other so only one pair of volumes is alive at a time.
//!
//! Raw disparities are signed 16 bit fixed point values with 4 fractional bits, invalid pixels
//! hold [`INVALID_DISPARITY`].

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{imageops, GrayImage};
use log::{debug, info};
use rayon::prelude::*;

use crate::config::{SgbmParams, WlsParams};
use crate::disparity::{DisparityAlgorithm, DisparityMap};
use crate::error::*;
use crate::frame::{check_dimensions, StereoFrame};
use crate::wls::WlsFilter;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of fractional bits in a raw disparity.
pub const DISP_SHIFT: i32 = 4;

/// Fixed point scale of a raw disparity.
pub const DISP_SCALE: i32 = 1 << DISP_SHIFT;

/// Marker for pixels without a confident match.
pub const INVALID_DISPARITY: i16 = -(DISP_SCALE as i16);

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Fixed point disparity map produced by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDisparity {
    width: usize,
    height: usize,
    num_disparities: usize,
    data: Vec<i16>
}

/// Semi-global matcher producing raw disparities for either view of a pair.
pub struct SemiGlobalMatcher {
    params: SgbmParams
}

/// Complete dense correspondence engine: semi-global matching in both directions followed by
/// edge-aware refinement.
pub struct SemiGlobal {
    matcher: SemiGlobalMatcher,
    filter: WlsFilter
}

/// Pre-computed per-pixel data of one image pair.
struct MatchInputs<'a> {
    width: usize,
    height: usize,
    num_disparities: usize,
    left_raw: &'a [u8],
    right_raw: &'a [u8],
    left: FilteredImage,
    right: FilteredImage
}

/// Pre-filtered image with the doubled Birchfield-Tomasi intensity bounds of every pixel.
struct FilteredImage {
    value: Vec<i32>,
    lower: Vec<i32>,
    upper: Vec<i32>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl RawDisparity {
    pub fn new(width: usize, height: usize, num_disparities: usize) -> Self {
        RawDisparity {
            width,
            height,
            num_disparities,
            data: vec![INVALID_DISPARITY; width * height]
        }
    }

    /// Wrap an existing row-major buffer. Returns `None` if the length does not match.
    pub fn from_vec(
        width: usize,
        height: usize,
        num_disparities: usize,
        data: Vec<i16>
    ) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }

        Some(RawDisparity { width, height, num_disparities, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Search range the map was computed with. In a left view map the first `num_disparities`
    /// columns are always invalid, in a right view map the last ones are.
    pub fn num_disparities(&self) -> usize {
        self.num_disparities
    }

    pub fn get(&self, x: usize, y: usize) -> i16 {
        self.data[self.width * y + x]
    }

    pub fn is_valid(&self, x: usize, y: usize) -> bool {
        self.get(x, y) != INVALID_DISPARITY
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&d| d != INVALID_DISPARITY).count()
    }

    pub fn as_slice(&self) -> &[i16] {
        &self.data
    }

    /// Mirror the map about its vertical centre line.
    pub fn flip_horizontal(&self) -> Self {
        let mut data = self.data.clone();
        data.par_chunks_mut(self.width.max(1)).for_each(|row| row.reverse());

        RawDisparity { data, ..*self }
    }

    /// Invalidate connected regions of at most `max_size` pixels, where neighbours belong to the
    /// same region if their disparities differ by at most `max_diff`.
    fn filter_speckles(&mut self, max_size: usize, max_diff: i32) {
        if max_size == 0 {
            return;
        }

        let (w, h) = (self.width, self.height);
        let mut labels = vec![0usize; w * h];
        let mut removed = vec![false];
        let mut stack = Vec::new();
        let mut num_removed = 0;

        for i in 0..w * h {
            if self.data[i] == INVALID_DISPARITY {
                continue;
            }

            if labels[i] != 0 {
                if removed[labels[i]] {
                    self.data[i] = INVALID_DISPARITY;
                }
                continue;
            }

            let label = removed.len();
            labels[i] = label;
            stack.push(i);
            let mut size = 0;

            while let Some(p) = stack.pop() {
                size += 1;
                let (x, y) = (p % w, p / w);
                let value = self.data[p] as i32;

                let neighbours = [
                    (x > 0, p.wrapping_sub(1)),
                    (x + 1 < w, p + 1),
                    (y > 0, p.wrapping_sub(w)),
                    (y + 1 < h, p + w)
                ];

                for &(inside, q) in neighbours.iter() {
                    if inside
                        && labels[q] == 0
                        && self.data[q] != INVALID_DISPARITY
                        && (self.data[q] as i32 - value).abs() <= max_diff
                    {
                        labels[q] = label;
                        stack.push(q);
                    }
                }
            }

            let speckle = size <= max_size;
            removed.push(speckle);

            if speckle {
                self.data[i] = INVALID_DISPARITY;
                num_removed += size;
            }
        }

        debug!("Speckle filter removed {} pixels", num_removed);
    }
}

impl SemiGlobalMatcher {
    pub fn new(params: SgbmParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &SgbmParams {
        &self.params
    }

    /// Disparities of the left view, a left pixel `x` matches the right pixel `x - d`.
    pub fn match_pair(&self, left: &GrayImage, right: &GrayImage) -> Result<RawDisparity> {
        check_dimensions(left.dimensions(), right.dimensions())?;

        let (w, h) = (left.width() as usize, left.height() as usize);
        let nd = self.params.num_disparities;

        self.params.check_width(w)?;

        let inputs = MatchInputs {
            width: w,
            height: h,
            num_disparities: nd,
            left_raw: left.as_raw(),
            right_raw: right.as_raw(),
            left: FilteredImage::new(left, self.params.pre_filter_cap),
            right: FilteredImage::new(right, self.params.pre_filter_cap)
        };

        let costs = inputs.cost_volume(self.params.block_size);
        let sums = self.aggregate(&inputs, &costs);
        drop(costs);

        let mut data = vec![INVALID_DISPARITY; w * h];
        data.par_chunks_mut(w)
            .zip(sums.par_chunks(w * nd))
            .for_each(|(row, s)| self.select_row(s, row));

        let mut raw = RawDisparity {
            width: w,
            height: h,
            num_disparities: nd,
            data: median_3x3(&data, w, h)
        };

        raw.filter_speckles(
            self.params.speckle_window_size,
            self.params.speckle_range * DISP_SCALE
        );

        Ok(raw)
    }

    /// Disparities of the right view, a right pixel `x` matches the left pixel `x + d`.
    ///
    /// Computed by matching the mirrored pair with the views swapped.
    pub fn match_right(&self, left: &GrayImage, right: &GrayImage) -> Result<RawDisparity> {
        let mirrored_left = imageops::flip_horizontal(right);
        let mirrored_right = imageops::flip_horizontal(left);

        Ok(self.match_pair(&mirrored_left, &mirrored_right)?.flip_horizontal())
    }

    /// Sum the path costs of the four scanline directions.
    fn aggregate(&self, inputs: &MatchInputs, costs: &[u16]) -> Vec<u16> {
        let (w, h, nd) = (inputs.width, inputs.height, inputs.num_disparities);
        let (p1, p2) = (self.params.p1(), self.params.p2());
        let mut sums = vec![0u16; w * h * nd];

        // Horizontal paths, rows are independent
        sums.par_chunks_mut(w * nd)
            .zip(costs.par_chunks(w * nd))
            .for_each(|(s_row, c_row)| {
                let mut prev = vec![0u32; nd];
                let mut cur = vec![0u32; nd];

                for pass in 0..2 {
                    for i in 0..w {
                        let x = if pass == 0 { i } else { w - 1 - i };
                        let range = x * nd..(x + 1) * nd;
                        let p = if i == 0 { None } else { Some(&prev[..]) };

                        path_step(&c_row[range.clone()], p, &mut cur, p1, p2);
                        accumulate(&mut s_row[range], &cur);
                        std::mem::swap(&mut prev, &mut cur);
                    }
                }
            });

        // Vertical paths, columns are independent within a row
        self.vertical_pass(inputs, costs, &mut sums, 0..h);
        self.vertical_pass(inputs, costs, &mut sums, (0..h).rev());

        sums
    }

    fn vertical_pass(
        &self,
        inputs: &MatchInputs,
        costs: &[u16],
        sums: &mut [u16],
        rows: impl Iterator<Item = usize>
    ) {
        let (w, nd) = (inputs.width, inputs.num_disparities);
        let (p1, p2) = (self.params.p1(), self.params.p2());
        let stride = w * nd;

        let mut prev = vec![0u32; stride];
        let mut cur = vec![0u32; stride];
        let mut first = true;

        for y in rows {
            let c_row = &costs[y * stride..(y + 1) * stride];
            let prev_row = &prev;

            cur.par_chunks_mut(nd)
                .zip(c_row.par_chunks(nd))
                .enumerate()
                .for_each(|(x, (l, c))| {
                    let p = if first { None } else { Some(&prev_row[x * nd..(x + 1) * nd]) };
                    path_step(c, p, l, p1, p2);
                });

            sums[y * stride..(y + 1) * stride]
                .par_chunks_mut(nd)
                .zip(cur.par_chunks(nd))
                .for_each(|(s, l)| accumulate(s, l));

            std::mem::swap(&mut prev, &mut cur);
            first = false;
        }
    }

    /// Winner-take-all over one row of aggregated costs, with the uniqueness test, sub-pixel
    /// refinement and the left-right check against the right view winners of the same volume.
    fn select_row(&self, sums: &[u16], out: &mut [i16]) {
        let w = out.len();
        let nd = self.params.num_disparities;
        let uniqueness = self.params.uniqueness_ratio as u64;

        let mut right_disp = vec![-1i32; w];
        let mut right_cost = vec![u32::MAX; w];

        for x in nd..w {
            let s = &sums[x * nd..(x + 1) * nd];

            let mut best = 0;
            let mut min_s = s[0];
            for (d, &v) in s.iter().enumerate().skip(1) {
                if v < min_s {
                    min_s = v;
                    best = d;
                }
            }

            for (d, &v) in s.iter().enumerate() {
                let xr = x - d;
                if (v as u32) < right_cost[xr] {
                    right_cost[xr] = v as u32;
                    right_disp[xr] = d as i32;
                }
            }

            let ambiguous = s.iter().enumerate().any(|(d, &v)| {
                (d as isize - best as isize).abs() > 1
                    && (v as u64) * (100 - uniqueness) < (min_s as u64) * 100
            });

            if ambiguous {
                continue;
            }

            let mut d16 = best as i32 * DISP_SCALE;
            if best > 0 && best < nd - 1 {
                let (below, above, centre) = (s[best - 1] as i32, s[best + 1] as i32, min_s as i32);
                let denom2 = (below + above - 2 * centre).max(1);
                d16 += ((below - above) * DISP_SCALE + denom2) / (denom2 * 2);
            }

            out[x] = d16 as i16;
        }

        let max_diff = self.params.disp12_max_diff;
        let disagrees = |xr: i32, d: i32| {
            xr >= 0
                && (xr as usize) < w
                && right_disp[xr as usize] >= 0
                && (right_disp[xr as usize] - d).abs() > max_diff
        };

        for x in nd..w {
            let d = out[x] as i32;
            if d == INVALID_DISPARITY as i32 {
                continue;
            }

            let floor = d >> DISP_SHIFT;
            let ceil = (d + DISP_SCALE - 1) >> DISP_SHIFT;

            if disagrees(x as i32 - floor, floor) && disagrees(x as i32 - ceil, ceil) {
                out[x] = INVALID_DISPARITY;
            }
        }
    }
}

impl SemiGlobal {
    pub fn new(sgbm: SgbmParams, wls: WlsParams) -> Result<Self> {
        Ok(Self {
            matcher: SemiGlobalMatcher::new(sgbm)?,
            filter: WlsFilter::new(wls)?
        })
    }

    pub fn matcher(&self) -> &SemiGlobalMatcher {
        &self.matcher
    }
}

impl DisparityAlgorithm for SemiGlobal {
    fn compute(&self, frame: &StereoFrame) -> Result<DisparityMap> {
        info!(
            "Matching {}x{} frame over {} disparities",
            frame.width(),
            frame.height(),
            self.matcher.params.num_disparities
        );

        // One view at a time, each match holds its own volumes
        let left = self.matcher.match_pair(&frame.left, &frame.right)?;
        let right = self.matcher.match_right(&frame.left, &frame.right)?;

        debug!(
            "Raw disparity valid in {} left and {} right pixels",
            left.valid_count(),
            right.valid_count()
        );

        self.filter.filter(&left, &right, &frame.guide)
    }
}

impl FilteredImage {
    fn new(img: &GrayImage, cap: i32) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let value = prefilter(img.as_raw(), w, h, cap);

        let mut lower = vec![0i32; w * h];
        let mut upper = vec![0i32; w * h];

        lower
            .par_chunks_mut(w)
            .zip(upper.par_chunks_mut(w))
            .zip(value.par_chunks(w))
            .for_each(|((lo, hi), row)| {
                for x in 0..w {
                    let centre = 2 * row[x];
                    let before = row[x.saturating_sub(1)] + row[x];
                    let after = row[x] + row[(x + 1).min(w - 1)];

                    lo[x] = centre.min(before).min(after);
                    hi[x] = centre.max(before).max(after);
                }
            });

        FilteredImage { value, lower, upper }
    }
}

impl<'a> MatchInputs<'a> {
    /// Pixel costs of row `y` for every disparity, laid out `[x * num_disparities + d]`.
    fn pixel_cost_row(&self, y: usize, out: &mut [u8]) {
        let (w, nd) = (self.width, self.num_disparities);

        for x in 0..w {
            let li = y * w + x;
            let vl = 2 * self.left.value[li];
            let raw_l = self.left_raw[li] as i32;

            for d in 0..nd {
                let ri = y * w + x.saturating_sub(d);
                let vr = 2 * self.right.value[ri];

                let to_right = (vl - self.right.upper[ri]).max(self.right.lower[ri] - vl).max(0);
                let to_left = (vr - self.left.upper[li]).max(self.left.lower[li] - vr).max(0);
                let raw = (raw_l - self.right_raw[ri] as i32).abs() >> 2;

                out[x * nd + d] = (to_right.min(to_left) / 2 + raw) as u8;
            }
        }
    }

    /// Block costs for all pixels and disparities, with borders replicated.
    fn cost_volume(&self, block_size: usize) -> Vec<u16> {
        let (w, h, nd) = (self.width, self.height, self.num_disparities);
        let radius = (block_size / 2) as isize;
        let mut costs = vec![0u16; w * h * nd];

        costs.par_chunks_mut(w * nd).enumerate().for_each(|(y, row)| {
            let mut pixel = vec![0u8; w * nd];
            let mut column = vec![0u32; w * nd];

            for k in -radius..=radius {
                self.pixel_cost_row(clamp_index(y as isize + k, h), &mut pixel);
                for (c, &p) in column.iter_mut().zip(pixel.iter()) {
                    *c += p as u32;
                }
            }

            let mut acc = vec![0u32; nd];
            for k in -radius..=radius {
                let xx = clamp_index(k, w);
                for (a, &c) in acc.iter_mut().zip(column[xx * nd..(xx + 1) * nd].iter()) {
                    *a += c;
                }
            }

            for x in 0..w {
                for d in 0..nd {
                    row[x * nd + d] = acc[d].min(u16::MAX as u32) as u16;
                }

                let enter = clamp_index(x as isize + radius + 1, w) * nd;
                let leave = clamp_index(x as isize - radius, w) * nd;
                for d in 0..nd {
                    acc[d] = acc[d] + column[enter + d] - column[leave + d];
                }
            }
        });

        info!("Computed {}x{}x{} cost volume", w, h, nd);

        costs
    }
}

/// Horizontal Sobel response clipped to `[-cap, cap]` and offset by `cap`.
fn prefilter(src: &[u8], w: usize, h: usize, cap: i32) -> Vec<i32> {
    let mut out = vec![0i32; w * h];

    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let up = y.saturating_sub(1);
        let down = (y + 1).min(h - 1);
        let at = |yy: usize, xx: usize| src[yy * w + xx] as i32;

        for x in 0..w {
            let l = x.saturating_sub(1);
            let r = (x + 1).min(w - 1);
            let sobel = at(up, r) - at(up, l) + 2 * (at(y, r) - at(y, l)) + at(down, r) - at(down, l);

            row[x] = sobel.max(-cap).min(cap) + cap;
        }
    });

    out
}

/// One step of the path recurrence
/// `L(p, d) = C(p, d) + min(L(q, d), L(q, d ± 1) + P1, min L(q) + P2) - min L(q)`.
fn path_step(cost: &[u16], prev: Option<&[u32]>, out: &mut [u32], p1: u32, p2: u32) {
    let prev = match prev {
        Some(p) => p,
        None => {
            for (o, &c) in out.iter_mut().zip(cost.iter()) {
                *o = c as u32;
            }
            return;
        }
    };

    let n = prev.len();
    let min_prev = prev.iter().copied().min().unwrap_or(0);

    for d in 0..n {
        let mut best = prev[d].min(min_prev + p2);
        if d > 0 {
            best = best.min(prev[d - 1] + p1);
        }
        if d + 1 < n {
            best = best.min(prev[d + 1] + p1);
        }

        out[d] = cost[d] as u32 + best - min_prev;
    }
}

fn accumulate(sums: &mut [u16], path: &[u32]) {
    for (s, &l) in sums.iter_mut().zip(path.iter()) {
        *s = s.saturating_add(l.min(u16::MAX as u32) as u16);
    }
}

fn median_3x3(data: &[i16], w: usize, h: usize) -> Vec<i16> {
    let mut out = vec![0i16; w * h];

    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let mut window = [0i16; 9];

        for x in 0..w {
            let mut i = 0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let yy = clamp_index(y as isize + dy, h);
                    let xx = clamp_index(x as isize + dx, w);
                    window[i] = data[yy * w + xx];
                    i += 1;
                }
            }

            window.sort_unstable();
            row[x] = window[4];
        }
    });

    out
}

fn clamp_index(i: isize, len: usize) -> usize {
    i.max(0).min(len as isize - 1) as usize
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
