// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-channel statistics records and the tab-separated statistics table.
//!
//! The `build` phase writes the table; the `flag` phase reads it back,
//! updates the flags and writes a second table. Values are stored in SI
//! units in memory and in astronomer-friendly units (MHz, µJy/beam) on disk,
//! rounded to 4 decimals for readability.

use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::info;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Couldn't access statistics table {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Statistics table {path} line {line_num}: {reason}")]
    Parse {
        path: PathBuf,
        line_num: usize,
        reason: String,
    },
}

/// Derived facts about one cube channel. Append-only during ingestion;
/// `flagged` is the only field mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    /// 1-based, matching the FITS frequency axis.
    pub chan_no: usize,
    pub freq_hz: f64,
    /// Robust RMS estimates in Jy/beam.
    pub rms_i: f64,
    pub rms_v: f64,
    pub max_i: f64,
    pub flagged: bool,
    /// Correction angles in radians; NaN when no corrections were applied.
    pub xy_phase_corr: f64,
    pub pol_angle_corr: f64,
}

impl ChannelRecord {
    /// A record for a channel with no usable data: everything NaN, flagged.
    pub fn flagged_placeholder(chan_no: usize) -> ChannelRecord {
        ChannelRecord {
            chan_no,
            freq_hz: f64::NAN,
            rms_i: f64::NAN,
            rms_v: f64::NAN,
            max_i: f64::NAN,
            flagged: true,
            xy_phase_corr: f64::NAN,
            pol_angle_corr: f64::NAN,
        }
    }
}

const COLUMNS: [&str; 8] = [
    "chanNo",
    "frequency [MHz]",
    "rmsStokesI [uJy/beam]",
    "rmsStokesV [uJy/beam]",
    "maxStokesI [uJy/beam]",
    "flagged",
    "xyPhaseCorr [rad]",
    "polAngleCorr [rad]",
];

/// Write the statistics table.
pub fn write_statistics(path: &Path, records: &[ChannelRecord]) -> Result<(), TableError> {
    info!("Writing statistics table: {}", path.display());
    let io_err = |source| TableError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    writeln!(writer, "{}", COLUMNS.iter().join("\t")).map_err(io_err)?;
    for r in records {
        writeln!(
            writer,
            "{}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{}\t{:.4}\t{:.4}",
            r.chan_no,
            r.freq_hz * 1e-6,
            r.rms_i * 1e6,
            r.rms_v * 1e6,
            r.max_i * 1e6,
            r.flagged,
            r.xy_phase_corr,
            r.pol_angle_corr,
        )
        .map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

/// Read a statistics table back into records, converting to SI units.
pub fn read_statistics(path: &Path) -> Result<Vec<ChannelRecord>, TableError> {
    let io_err = |source| TableError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parse_err = |line_num: usize, reason: String| TableError::Parse {
        path: path.to_path_buf(),
        line_num,
        reason,
    };

    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(io_err)?;

    let mut records = vec![];
    // Line 1 is the column legend.
    for (line_num, line) in contents.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != COLUMNS.len() {
            return Err(parse_err(
                line_num + 1,
                format!("expected {} columns, found {}", COLUMNS.len(), fields.len()),
            ));
        }
        let float = |i: usize| {
            fields[i]
                .parse::<f64>()
                .map_err(|e| parse_err(line_num + 1, format!("column {}: {e}", COLUMNS[i])))
        };
        records.push(ChannelRecord {
            chan_no: fields[0]
                .parse()
                .map_err(|e| parse_err(line_num + 1, format!("column chanNo: {e}")))?,
            freq_hz: float(1)? * 1e6,
            rms_i: float(2)? * 1e-6,
            rms_v: float(3)? * 1e-6,
            max_i: float(4)? * 1e-6,
            flagged: match fields[5] {
                "true" => true,
                "false" => false,
                other => {
                    return Err(parse_err(
                        line_num + 1,
                        format!("column flagged: unrecognised value '{other}'"),
                    ))
                }
            },
            xy_phase_corr: float(6)?,
            pol_angle_corr: float(7)?,
        });
    }
    Ok(records)
}
