// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Frequency-dependent XY-phase and polarization-angle corrections.
//!
//! Corrections come from a whitespace-delimited calibration table keyed by a
//! 10-digit observation ID. Each row carries two sets of quadratic
//! coefficients, one for the XY phase, one for the polarization angle, as
//! functions of frequency in GHz, angles in radians. The XY phase must be
//! rotated before the polarization angle.

use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use ndarray::Array2;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorrectionsError {
    #[error("Couldn't read calibration table {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "Calibration table {path} line {line_num}: expected \
         'fieldname obsid a b c a b c', got '{line}'"
    )]
    Parse {
        path: PathBuf,
        line_num: usize,
        line: String,
    },

    #[error("Observation ID {obsid} isn't in the calibration table {path}")]
    UnknownObsid { obsid: String, path: PathBuf },

    #[error("No 10-digit observation ID in the filename of {path}")]
    NoObsid { path: PathBuf },
}

/// `a x² + b x + c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadratic {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Quadratic {
    pub fn eval(self, x: f64) -> f64 {
        (self.a * x + self.b) * x + self.c
    }
}

/// One observation's correction coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionCoefficients {
    pub xy_phase: Quadratic,
    pub pol_angle: Quadratic,
}

impl CorrectionCoefficients {
    /// The two correction angles (radians) at a channel frequency in Hz.
    pub fn angles_at(self, freq_hz: f64) -> (f64, f64) {
        let freq_ghz = freq_hz * 1e-9;
        (self.xy_phase.eval(freq_ghz), self.pol_angle.eval(freq_ghz))
    }
}

/// The parsed calibration table, keyed by observation ID.
#[derive(Debug, Clone, Default)]
pub struct CorrectionTable {
    rows: HashMap<String, CorrectionCoefficients>,
}

impl CorrectionTable {
    /// Parse a whitespace-delimited table. `#`-prefixed lines and blank
    /// lines are comments.
    pub fn read(path: &Path) -> Result<CorrectionTable, CorrectionsError> {
        let mut contents = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map_err(|source| CorrectionsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_str(&contents, path)
    }

    fn from_str(contents: &str, path: &Path) -> Result<CorrectionTable, CorrectionsError> {
        let mut rows = HashMap::new();
        for (line_num, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parse_err = || CorrectionsError::Parse {
                path: path.to_path_buf(),
                line_num: line_num + 1,
                line: line.to_string(),
            };

            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            // fieldname obsid, then 6 coefficients.
            if fields.len() != 8 {
                return Err(parse_err());
            }
            let mut coeffs = [0.0_f64; 6];
            for (c, field) in coeffs.iter_mut().zip(&fields[2..]) {
                *c = field.parse().map_err(|_| parse_err())?;
            }
            rows.insert(
                fields[1].to_string(),
                CorrectionCoefficients {
                    xy_phase: Quadratic {
                        a: coeffs[0],
                        b: coeffs[1],
                        c: coeffs[2],
                    },
                    pol_angle: Quadratic {
                        a: coeffs[3],
                        b: coeffs[4],
                        c: coeffs[5],
                    },
                },
            );
        }
        Ok(CorrectionTable { rows })
    }

    pub fn coefficients(&self, obsid: &str) -> Option<CorrectionCoefficients> {
        self.rows.get(obsid).copied()
    }
}

/// Extract the 10-digit observation ID from the filename component of a
/// path (e.g. `1538856059_sdp_l0.ms`).
pub fn obsid_from_path(path: &Path) -> Result<String, CorrectionsError> {
    lazy_static! {
        static ref OBSID_RE: Regex = Regex::new(r"[0-9]{10}").unwrap();
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| OBSID_RE.find(name))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| CorrectionsError::NoObsid {
            path: path.to_path_buf(),
        })
}

/// Rotate the polarization planes: first (U, V) by the XY-phase angle, then
/// (Q, U′) by the polarization angle. The order is fixed; the phase rotation
/// must precede the angle rotation.
pub fn rotate_planes(
    q: &Array2<f32>,
    u: &Array2<f32>,
    v: &Array2<f32>,
    xy_phase: f64,
    pol_angle: f64,
) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
    let (sin_xy, cos_xy) = xy_phase.sin_cos();
    let (sin_xy, cos_xy) = (sin_xy as f32, cos_xy as f32);
    let u_mid = u * cos_xy - v * sin_xy;
    let v_rot = u * sin_xy + v * cos_xy;

    let (sin_pol, cos_pol) = pol_angle.sin_cos();
    let (sin_pol, cos_pol) = (sin_pol as f32, cos_pol as f32);
    let q_rot = q * cos_pol - &u_mid * sin_pol;
    let u_rot = q * sin_pol + &u_mid * cos_pol;

    (q_rot, u_rot, v_rot)
}
