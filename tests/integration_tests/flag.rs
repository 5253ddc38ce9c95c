// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_abs_diff_eq;
use ndarray::Array2;
use tempfile::TempDir;

use polcube::{
    cube::{Card, CubeDims, CubeFile, Stokes},
    table::{self, ChannelRecord},
};

use crate::{freq_of, polcube};

const N_CHAN: usize = 60;

/// A small cube of constant-valued planes plus a statistics table whose
/// Stokes V RMS follows a smooth band, in Jy/beam.
fn synthetic_cube(dir: &Path, rms_v: impl Fn(usize) -> f64) -> (PathBuf, PathBuf) {
    let cube_path = dir.join("cube.fits");
    let stats_path = dir.join("cube.tab");

    let dims = CubeDims {
        nx: 4,
        ny: 4,
        n_chan: N_CHAN,
    };
    let cards = vec![
        Card::text("CTYPE3", "FREQ"),
        Card::real("CRPIX3", 1.0),
        Card::real("CRVAL3", freq_of(1)),
        Card::real("CDELT3", 2.5e6),
    ];
    let mut cube = CubeFile::create(&cube_path, dims, cards).unwrap();
    let plane = Array2::from_elem((4, 4), 1.0_f32);
    for chan_no in 1..=N_CHAN {
        for stokes in Stokes::ALL {
            cube.write_plane(stokes, chan_no, &plane).unwrap();
        }
    }

    let records: Vec<ChannelRecord> = (1..=N_CHAN)
        .map(|chan_no| ChannelRecord {
            chan_no,
            freq_hz: freq_of(chan_no),
            rms_i: 1e-5,
            rms_v: rms_v(chan_no),
            max_i: 1e-3,
            flagged: false,
            xy_phase_corr: f64::NAN,
            pol_angle_corr: f64::NAN,
        })
        .collect();
    table::write_statistics(&stats_path, &records).unwrap();

    (cube_path, stats_path)
}

fn smooth_band(chan_no: usize) -> f64 {
    let x = chan_no as f64;
    2e-5 + 1e-7 * x + 2e-9 * x * x + 5e-7 * (x * 0.7).sin()
}

#[test]
fn flag_rejects_spikes_and_nan_fills_them() {
    let tmp = TempDir::new().unwrap();
    let (cube_path, stats_path) = synthetic_cube(tmp.path(), |chan_no| {
        // Spikes on channels 10 and 50.
        smooth_band(chan_no) + if chan_no == 10 || chan_no == 50 { 1e-4 } else { 0.0 }
    });
    let output_path = tmp.path().join("flagged.tab");

    polcube()
        .args(["flag", "--stats"])
        .arg(&stats_path)
        .arg("--cube")
        .arg(&cube_path)
        .arg("--output-stats")
        .arg(&output_path)
        .assert()
        .success();

    let records = table::read_statistics(&output_path).unwrap();
    let flagged: Vec<usize> = records
        .iter()
        .filter(|r| r.flagged)
        .map(|r| r.chan_no)
        .collect();
    assert_eq!(flagged, [10, 50]);
    // The statistics of a rejected channel are kept for inspection.
    assert!(records[9].rms_v > smooth_band(10));

    let mut cube = CubeFile::open(&cube_path).unwrap();
    for stokes in Stokes::ALL {
        assert!(cube
            .read_plane(stokes, 10)
            .unwrap()
            .iter()
            .all(|v| v.is_nan()));
        assert!(cube
            .read_plane(stokes, 50)
            .unwrap()
            .iter()
            .all(|v| v.is_nan()));
    }
    // Unflagged channels are untouched.
    assert!(cube.read_plane(Stokes::I, 1).unwrap().iter().all(|&v| v == 1.0));

    // Channel 1 still has data, so the reference channel stays put.
    assert_abs_diff_eq!(cube.header().get_real("CRPIX3").unwrap(), 1.0);
}

#[test]
fn reference_channel_moves_past_flagged_leading_channels() {
    let tmp = TempDir::new().unwrap();
    let (cube_path, stats_path) = synthetic_cube(tmp.path(), |chan_no| {
        // The first three channels are wildly noisy.
        smooth_band(chan_no) + if chan_no <= 3 { 1e-3 } else { 0.0 }
    });

    polcube()
        .args(["flag", "--stats"])
        .arg(&stats_path)
        .arg("--cube")
        .arg(&cube_path)
        .arg("--output-stats")
        .arg(tmp.path().join("flagged.tab"))
        .assert()
        .success();

    let mut cube = CubeFile::open(&cube_path).unwrap();
    assert!(cube.read_plane(Stokes::I, 3).unwrap().iter().all(|v| v.is_nan()));
    assert_abs_diff_eq!(cube.header().get_real("CRPIX3").unwrap(), 4.0);
}

#[test]
fn flagging_twice_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let (cube_path, stats_path) = synthetic_cube(tmp.path(), |chan_no| {
        smooth_band(chan_no) + if chan_no == 25 { 1e-4 } else { 0.0 }
    });
    let first_table = tmp.path().join("flagged1.tab");
    let second_table = tmp.path().join("flagged2.tab");

    polcube()
        .args(["flag", "--stats"])
        .arg(&stats_path)
        .arg("--cube")
        .arg(&cube_path)
        .arg("--output-stats")
        .arg(&first_table)
        .assert()
        .success();
    let cube_after_first = fs::read(&cube_path).unwrap();

    polcube()
        .args(["flag", "--stats"])
        .arg(&first_table)
        .arg("--cube")
        .arg(&cube_path)
        .arg("--output-stats")
        .arg(&second_table)
        .assert()
        .success();
    let cube_after_second = fs::read(&cube_path).unwrap();

    assert_eq!(cube_after_first, cube_after_second);
    assert_eq!(
        fs::read_to_string(&first_table).unwrap(),
        fs::read_to_string(&second_table).unwrap()
    );
}

#[test]
fn dry_run_leaves_the_cube_alone() {
    let tmp = TempDir::new().unwrap();
    let (cube_path, stats_path) = synthetic_cube(tmp.path(), smooth_band);
    let before = fs::read(&cube_path).unwrap();
    let output_path = tmp.path().join("flagged.tab");

    polcube()
        .args(["flag", "--dry-run", "--stats"])
        .arg(&stats_path)
        .arg("--cube")
        .arg(&cube_path)
        .arg("--output-stats")
        .arg(&output_path)
        .assert()
        .success();

    assert!(!output_path.exists());
    assert_eq!(fs::read(&cube_path).unwrap(), before);
}
