// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_abs_diff_eq;
use tempfile::TempDir;

use polcube::{
    cube::{CubeFile, Stokes},
    stats::robust_std_f32,
    table,
};

use crate::{
    expected_plane, freq_of, plane_value, polcube, write_channel_image,
    write_channel_image_scaled, NX, NY,
};

fn image_path(dir: &Path, chan_no: usize) -> PathBuf {
    dir.join(format!("mos.chan{chan_no:04}.image.fits"))
}

#[test]
fn build_fills_present_channels_and_flags_the_rest() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("1538856059_images");
    fs::create_dir(&image_dir).unwrap();

    // Channels 1, 2 and 5 exist; 3 is a gap; 4 is on disk but unreadable.
    for chan_no in [1, 2, 5] {
        write_channel_image(&image_path(&image_dir, chan_no), chan_no);
    }
    fs::write(image_path(&image_dir, 4), b"not actually a fits file").unwrap();

    let cube_path = tmp.path().join("cube.fits");
    polcube()
        .args(["build", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(&cube_path)
        .assert()
        .success();

    let mut cube = CubeFile::open(&cube_path).unwrap();
    assert_eq!((cube.dims.nx, cube.dims.ny, cube.dims.n_chan), (NX, NY, 5));

    // Present channels hold their image data, untouched.
    let i1 = cube.read_plane(Stokes::I, 1).unwrap();
    assert_abs_diff_eq!(i1, expected_plane(1, 0), epsilon = f32::EPSILON);
    let q5 = cube.read_plane(Stokes::Q, 5).unwrap();
    assert_abs_diff_eq!(q5, expected_plane(5, 1), epsilon = f32::EPSILON);

    // Missing and unreadable channels are NaN in every polarisation.
    for chan_no in [3, 4] {
        for stokes in Stokes::ALL {
            let plane = cube.read_plane(stokes, chan_no).unwrap();
            assert!(plane.iter().all(|v| v.is_nan()));
        }
    }

    let records = table::read_statistics(&cube_path.with_extension("tab")).unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(
        records.iter().map(|r| r.flagged).collect::<Vec<_>>(),
        [false, false, true, true, false]
    );

    let r2 = &records[1];
    assert_eq!(r2.chan_no, 2);
    assert_abs_diff_eq!(r2.freq_hz, freq_of(2), epsilon = 1.0);
    let expected_rms = robust_std_f32(expected_plane(2, 0).iter());
    // The table rounds to 4 decimal places in uJy/beam.
    assert_abs_diff_eq!(r2.rms_i, expected_rms, epsilon = 1e-9);
    assert!(r2.max_i > 0.0);
    // No corrections were applied.
    assert!(r2.xy_phase_corr.is_nan());
    assert!(r2.pol_angle_corr.is_nan());

    let r3 = &records[2];
    assert!(r3.freq_hz.is_nan());
    assert!(r3.rms_v.is_nan());
}

#[test]
fn a_channel_below_the_rms_floor_is_flagged() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("images");
    fs::create_dir(&image_dir).unwrap();

    // Channel 1 has real signal; channel 2 is present and readable but its
    // Stokes V RMS sits far below the 1 uJy/beam floor.
    write_channel_image(&image_path(&image_dir, 1), 1);
    write_channel_image_scaled(&image_path(&image_dir, 2), 2, 1e-6);

    let cube_path = tmp.path().join("cube.fits");
    polcube()
        .args(["build", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(&cube_path)
        .assert()
        .success();

    let records = table::read_statistics(&cube_path.with_extension("tab")).unwrap();
    assert_eq!(
        records.iter().map(|r| r.flagged).collect::<Vec<_>>(),
        [false, true]
    );
    let r2 = &records[1];
    assert!(r2.freq_hz.is_nan());
    assert!(r2.rms_i.is_nan());
    assert!(r2.rms_v.is_nan());
    assert!(r2.max_i.is_nan());

    let mut cube = CubeFile::open(&cube_path).unwrap();
    for stokes in Stokes::ALL {
        let plane = cube.read_plane(stokes, 2).unwrap();
        assert!(plane.iter().all(|v| v.is_nan()));
    }
    // The live channel is untouched.
    let i1 = cube.read_plane(Stokes::I, 1).unwrap();
    assert_abs_diff_eq!(i1, expected_plane(1, 0), epsilon = f32::EPSILON);
}

#[test]
fn crop_cuts_a_centred_window() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("images");
    fs::create_dir(&image_dir).unwrap();
    write_channel_image(&image_path(&image_dir, 1), 1);

    let cube_path = tmp.path().join("cube.fits");
    polcube()
        .args(["build", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(&cube_path)
        .args(["--crop", "4"])
        .assert()
        .success();

    let mut cube = CubeFile::open(&cube_path).unwrap();
    assert_eq!((cube.dims.nx, cube.dims.ny), (4, 4));

    // Rows and columns 2..6 of the 8x8 source.
    let i1 = cube.read_plane(Stokes::I, 1).unwrap();
    for y in 0..4 {
        for x in 0..4 {
            assert_abs_diff_eq!(
                i1[(y, x)],
                plane_value(1, 0, y + 2, x + 2),
                epsilon = f32::EPSILON
            );
        }
    }
}

#[test]
fn oversized_crop_falls_back_to_the_image_extent() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("images");
    fs::create_dir(&image_dir).unwrap();
    write_channel_image(&image_path(&image_dir, 1), 1);

    let cube_path = tmp.path().join("cube.fits");
    polcube()
        .args(["build", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(&cube_path)
        .args(["--crop", "4096"])
        .assert()
        .success();

    let cube = CubeFile::open(&cube_path).unwrap();
    assert_eq!((cube.dims.nx, cube.dims.ny), (NX, NY));
}

#[test]
fn polarisation_corrections_rotate_the_planes() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("1538856059_images");
    fs::create_dir(&image_dir).unwrap();
    write_channel_image(&image_path(&image_dir, 1), 1);

    // Constant angles: XY phase 0.5 rad, pol angle 0.3 rad.
    let table_path = tmp.path().join("polcal.txt");
    fs::write(
        &table_path,
        "#fieldname obsid xy_a xy_b xy_c pol_a pol_b pol_c\n\
         FIELD 1538856059 0 0 0.5 0 0 0.3\n",
    )
    .unwrap();

    let cube_path = tmp.path().join("cube.fits");
    polcube()
        .args(["build", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(&cube_path)
        .arg("--corrections-table")
        .arg(&table_path)
        .assert()
        .success();

    let records = table::read_statistics(&cube_path.with_extension("tab")).unwrap();
    assert_abs_diff_eq!(records[0].xy_phase_corr, 0.5, epsilon = 1e-4);
    assert_abs_diff_eq!(records[0].pol_angle_corr, 0.3, epsilon = 1e-4);

    let mut cube = CubeFile::open(&cube_path).unwrap();
    let q_rot = cube.read_plane(Stokes::Q, 1).unwrap();
    let u_rot = cube.read_plane(Stokes::U, 1).unwrap();
    let v_rot = cube.read_plane(Stokes::V, 1).unwrap();

    let (sin_xy, cos_xy) = (0.5_f64.sin() as f32, 0.5_f64.cos() as f32);
    let (sin_pol, cos_pol) = (0.3_f64.sin() as f32, 0.3_f64.cos() as f32);
    for y in 0..NY {
        for x in 0..NX {
            let q = plane_value(1, 1, y, x);
            let u = plane_value(1, 2, y, x);
            let v = plane_value(1, 3, y, x);
            // XY phase rotates (U, V) first, then the pol angle (Q, U').
            let u_mid = u * cos_xy - v * sin_xy;
            assert_abs_diff_eq!(v_rot[(y, x)], u * sin_xy + v * cos_xy, epsilon = 1e-6);
            assert_abs_diff_eq!(q_rot[(y, x)], q * cos_pol - u_mid * sin_pol, epsilon = 1e-6);
            assert_abs_diff_eq!(u_rot[(y, x)], q * sin_pol + u_mid * cos_pol, epsilon = 1e-6);
        }
    }

    // Stokes I is untouched by the rotations.
    let i1 = cube.read_plane(Stokes::I, 1).unwrap();
    assert_abs_diff_eq!(i1, expected_plane(1, 0), epsilon = f32::EPSILON);
}

#[test]
fn unknown_obsid_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("9999999999_images");
    fs::create_dir(&image_dir).unwrap();
    write_channel_image(&image_path(&image_dir, 1), 1);

    let table_path = tmp.path().join("polcal.txt");
    fs::write(&table_path, "FIELD 1538856059 0 0 0.5 0 0 0.3\n").unwrap();

    let output = polcube()
        .args(["build", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(tmp.path().join("cube.fits"))
        .arg("--corrections-table")
        .arg(&table_path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("9999999999"));
}

#[test]
fn dry_run_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let image_dir = tmp.path().join("images");
    fs::create_dir(&image_dir).unwrap();
    write_channel_image(&image_path(&image_dir, 1), 1);

    let cube_path = tmp.path().join("cube.fits");
    polcube()
        .args(["build", "--dry-run", "--image-dir"])
        .arg(&image_dir)
        .arg("--cube")
        .arg(&cube_path)
        .assert()
        .success();
    assert!(!cube_path.exists());
}
