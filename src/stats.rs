// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Robust noise statistics via the median absolute deviation.
//!
//! Raw radio images are heavy-tailed; a classic standard deviation is pulled
//! around by a handful of bright pixels or interference spikes. Every noise
//! estimate in this crate therefore goes through [`robust_std`] instead.

/// Scale factor between the MAD and the standard deviation of normally
/// distributed data.
pub const MAD_TO_STD: f64 = 1.4826;

/// The median of all non-NaN values. Returns NaN if no such value exists.
pub fn nan_median(xs: &[f64]) -> f64 {
    let mut finite: Vec<f64> = xs.iter().copied().filter(|x| !x.is_nan()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    // No NaNs left, so partial_cmp is a total order here.
    finite.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
    let n = finite.len();
    if n % 2 == 1 {
        finite[n / 2]
    } else {
        (finite[n / 2 - 1] + finite[n / 2]) / 2.0
    }
}

/// The median absolute deviation from the median, ignoring NaNs.
pub fn nan_mad(xs: &[f64]) -> f64 {
    let med = nan_median(xs);
    if med.is_nan() {
        return f64::NAN;
    }
    let devs: Vec<f64> = xs.iter().map(|x| (x - med).abs()).collect();
    nan_median(&devs)
}

/// Estimate the standard deviation of `xs` as `1.4826 × MAD`, ignoring NaNs.
///
/// All-NaN (or empty) input yields NaN, which callers must treat as "no
/// usable signal", never as zero noise.
pub fn robust_std(xs: &[f64]) -> f64 {
    MAD_TO_STD * nan_mad(xs)
}

/// [`robust_std`] over single-precision image pixels.
pub fn robust_std_f32<'a, I: IntoIterator<Item = &'a f32>>(xs: I) -> f64 {
    let xs: Vec<f64> = xs.into_iter().map(|&x| f64::from(x)).collect();
    robust_std(&xs)
}
