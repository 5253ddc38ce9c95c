// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Iterative outlier rejection over per-channel noise statistics.
//!
//! A least-squares polynomial is fitted to the Stokes V RMS as a function
//! of channel number, channels whose residuals exceed a threshold are
//! excluded, and the fit repeats until the excluded set stops changing.
//! The same input always produces the same flags.

use std::collections::BTreeSet;

use log::{debug, warn};
use thiserror::Error;

use crate::{
    cube::{CubeError, CubeFile},
    stats::{nan_median, robust_std},
};

#[derive(Error, Debug)]
pub enum RejectError {
    #[error(
        "Can't fit a {n_params}-parameter polynomial to {n_points} live channels; \
         too much of the band is already flagged"
    )]
    IllPosed { n_points: usize, n_params: usize },

    #[error("The polynomial fit is singular; are the fit powers distinct?")]
    Singular,

    #[error(
        "Outlier rejection hadn't reached a fixed point after {iterations} iterations; \
         the channel statistics look pathological"
    )]
    NonConvergence { iterations: usize },
}

/// Tuning knobs for [`reject_outliers`].
#[derive(Debug, Clone)]
pub struct RejectionConfig {
    /// Two-sided rejection threshold in units of the robust residual sigma.
    pub threshold_sigma: f64,
    /// If set, channels this many robust sigmas from the global median are
    /// excluded before the first fit, so a gross outlier can't drag it.
    pub pre_filter_sigma: Option<f64>,
    /// Polynomial powers to fit, e.g. `[0, 1, 2]` for a quadratic.
    pub fit_powers: Vec<u32>,
}

impl Default for RejectionConfig {
    fn default() -> RejectionConfig {
        RejectionConfig {
            threshold_sigma: 5.0,
            pre_filter_sigma: Some(10.0),
            fit_powers: vec![0, 1, 2],
        }
    }
}

/// The converged fit, kept so callers can report or plot it.
#[derive(Debug, Clone)]
pub struct OutlierModel {
    pub powers: Vec<u32>,
    pub coeffs: Vec<f64>,
    pub residual_sigma: f64,
}

impl OutlierModel {
    pub fn eval(&self, x: f64) -> f64 {
        self.powers
            .iter()
            .zip(&self.coeffs)
            .map(|(&p, &c)| c * x.powi(p as i32))
            .sum()
    }
}

/// Least-squares fit of `sum_j c_j x^p_j` to the points whose indices are
/// not in `excluded`, via the normal equations.
fn polyfit(
    xs: &[f64],
    ys: &[f64],
    excluded: &BTreeSet<usize>,
    powers: &[u32],
) -> Result<Vec<f64>, RejectError> {
    let n_params = powers.len();
    let live: Vec<usize> = (0..xs.len()).filter(|i| !excluded.contains(i)).collect();
    if live.len() < n_params {
        return Err(RejectError::IllPosed {
            n_points: live.len(),
            n_params,
        });
    }

    // Normal equations: (A^T A) c = A^T y with A[i][j] = x_i^p_j.
    let mut ata = vec![vec![0.0; n_params]; n_params];
    let mut aty = vec![0.0; n_params];
    for &i in &live {
        let row: Vec<f64> = powers.iter().map(|&p| xs[i].powi(p as i32)).collect();
        for j in 0..n_params {
            for k in 0..n_params {
                ata[j][k] += row[j] * row[k];
            }
            aty[j] += row[j] * ys[i];
        }
    }

    solve(ata, aty)
}

/// Gaussian elimination with partial pivoting. Row order is deterministic,
/// so repeated runs give bit-identical coefficients.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, RejectError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
            .ok_or(RejectError::Singular)?;
        if a[pivot][col].abs() < 1e-12 {
            return Err(RejectError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut c = vec![0.0; n];
    for col in (0..n).rev() {
        let mut v = b[col];
        for k in col + 1..n {
            v -= a[col][k] * c[k];
        }
        c[col] = v / a[col][col];
    }
    Ok(c)
}

const MAX_ITERATIONS: usize = 50;

/// Iteratively reject outliers from `(xs, ys)`. Returns the indices of the
/// rejected points and the converged model.
///
/// Non-finite and zero `ys` are excluded from the start and always count as
/// rejected. Each iteration refits on the surviving points, evaluates
/// residuals over *all* points, and recomputes the rejected set from
/// scratch, so a point rejected early can be readmitted by a later, better
/// fit.
pub fn reject_outliers(
    xs: &[f64],
    ys: &[f64],
    cfg: &RejectionConfig,
) -> Result<(BTreeSet<usize>, OutlierModel), RejectError> {
    reject_outliers_capped(xs, ys, cfg, MAX_ITERATIONS)
}

fn reject_outliers_capped(
    xs: &[f64],
    ys: &[f64],
    cfg: &RejectionConfig,
    max_iterations: usize,
) -> Result<(BTreeSet<usize>, OutlierModel), RejectError> {
    debug_assert_eq!(xs.len(), ys.len());

    let mut base: BTreeSet<usize> = ys
        .iter()
        .enumerate()
        .filter(|(_, &y)| !y.is_finite() || y == 0.0)
        .map(|(i, _)| i)
        .collect();

    if let Some(k) = cfg.pre_filter_sigma {
        let live: Vec<f64> = (0..ys.len())
            .filter(|i| !base.contains(i))
            .map(|i| ys[i])
            .collect();
        let med = nan_median(&live);
        let sigma = robust_std(&live);
        if sigma.is_finite() && sigma > 0.0 {
            for (i, &y) in ys.iter().enumerate() {
                if (y - med).abs() > k * sigma {
                    base.insert(i);
                }
            }
        }
    }

    let mut excluded = base.clone();
    for iteration in 1..=max_iterations {
        let coeffs = polyfit(xs, ys, &excluded, &cfg.fit_powers)?;
        let model = OutlierModel {
            powers: cfg.fit_powers.clone(),
            coeffs,
            residual_sigma: f64::NAN,
        };
        let residuals: Vec<f64> = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| y - model.eval(x))
            .collect();
        let sigma = robust_std(&residuals);
        debug!(
            "Iteration {iteration}: {} channels excluded, residual sigma {sigma:e}",
            excluded.len()
        );

        let mut next = base.clone();
        for (i, &r) in residuals.iter().enumerate() {
            if r.abs() > cfg.threshold_sigma * sigma {
                next.insert(i);
            }
        }

        if next == excluded {
            return Ok((
                excluded,
                OutlierModel {
                    residual_sigma: sigma,
                    ..model
                },
            ));
        }
        excluded = next;
    }

    Err(RejectError::NonConvergence {
        iterations: max_iterations,
    })
}

/// NaN-fill the named channels, then point CRPIX3 at the first channel that
/// still has data. Running this twice with the same channels leaves the
/// cube byte-for-byte unchanged.
pub fn apply_flags<I>(cube: &mut CubeFile, chan_nos: I) -> Result<(), CubeError>
where
    I: IntoIterator<Item = usize>,
{
    for chan_no in chan_nos {
        cube.nan_fill_channel(chan_no)?;
    }
    if let Some(chan_no) = cube.first_live_channel()? {
        cube.set_ref_channel(chan_no)?;
    } else {
        warn!("Every channel in the cube is flagged; leaving CRPIX3 alone");
    }
    Ok(())
}
