// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod build;
mod flag;

use std::path::Path;

use assert_cmd::Command;
use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use ndarray::Array2;

fn polcube() -> Command {
    Command::cargo_bin("polcube").unwrap()
}

const NX: usize = 8;
const NY: usize = 8;
/// A signal level comfortably above the default RMS floor of 1 uJy/beam.
const AMP: f32 = 1e-3;

fn freq_of(chan_no: usize) -> f64 {
    1.3e9 + (chan_no - 1) as f64 * 2.5e6
}

/// Deterministic pseudo-noise, so tests can recompute any pixel of any
/// plane without carrying the image data around.
fn plane_value(chan_no: usize, stokes: usize, y: usize, x: usize) -> f32 {
    AMP * (((chan_no * 131 + stokes * 31 + y * 17 + x * 7) as f32) * 0.7).sin()
}

fn expected_plane(chan_no: usize, stokes: usize) -> Array2<f32> {
    Array2::from_shape_fn((NY, NX), |(y, x)| plane_value(chan_no, stokes, y, x))
}

/// Write a synthetic 4-plane (Stokes IQUV) channel image.
fn write_channel_image(path: &Path, chan_no: usize) {
    write_channel_image_scaled(path, chan_no, 1.0);
}

/// As [`write_channel_image`], with the pixel values scaled. A scale of
/// 1e-6 puts the Stokes V RMS well below the default 1 uJy/beam floor.
fn write_channel_image_scaled(path: &Path, chan_no: usize, scale: f32) {
    let description = ImageDescription {
        data_type: ImageType::Float,
        dimensions: &[4, 1, NY, NX],
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()
        .unwrap();
    let hdu = fptr.primary_hdu().unwrap();

    hdu.write_key(&mut fptr, "CTYPE1", "RA---SIN").unwrap();
    hdu.write_key(&mut fptr, "CRPIX1", NX as f64 / 2.0).unwrap();
    hdu.write_key(&mut fptr, "CRVAL1", 35.0).unwrap();
    hdu.write_key(&mut fptr, "CDELT1", -4.0e-4).unwrap();
    hdu.write_key(&mut fptr, "CTYPE2", "DEC--SIN").unwrap();
    hdu.write_key(&mut fptr, "CRPIX2", NY as f64 / 2.0).unwrap();
    hdu.write_key(&mut fptr, "CRVAL2", -4.5).unwrap();
    hdu.write_key(&mut fptr, "CDELT2", 4.0e-4).unwrap();
    hdu.write_key(&mut fptr, "CTYPE3", "FREQ").unwrap();
    hdu.write_key(&mut fptr, "CRVAL3", freq_of(chan_no)).unwrap();
    hdu.write_key(&mut fptr, "CDELT3", 2.5e6).unwrap();
    hdu.write_key(&mut fptr, "BUNIT", "Jy/beam").unwrap();

    let data: Vec<f32> = (0..4)
        .flat_map(|stokes| {
            (0..NY * NX).map(move |i| scale * plane_value(chan_no, stokes, i / NX, i % NX))
        })
        .collect();
    hdu.write_image(&mut fptr, &data).unwrap();
}
