// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Arguments for the `build` subcommand.

use std::path::PathBuf;

use clap::Args;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::read_args_file;
use crate::{
    ingest::{self, CorrectionsConfig, IngestConfig},
    PolcubeError,
};

pub(super) const DEFAULT_IMAGE_GLOB: &str = "*image.fits";
pub(super) const DEFAULT_MARKER: &str = ".chan";
/// Stokes V RMS below this (Jy/beam) means a channel has no real signal.
pub(super) const DEFAULT_RMS_FLOOR: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum BuildArgsError {
    #[error("No directory of channel images was supplied")]
    NoImageDir,

    #[error("No output cube path was supplied")]
    NoCubePath,

    #[error("Crop specified as {values:?}, not <size> or <width> <height>")]
    BadCrop { values: Vec<usize> },
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub(super) struct BuildArgs {
    /// All of the arguments to build may be specified in a TOML file. Any
    /// CLI arguments override the file's.
    #[clap(name = "ARGUMENTS_FILE", parse(from_os_str))]
    #[serde(skip)]
    args_file: Option<PathBuf>,

    /// The directory containing the per-channel Stokes IQUV images.
    #[clap(short = 'd', long)]
    image_dir: Option<PathBuf>,

    /// The glob selecting channel images within the image directory.
    #[clap(long)]
    image_glob: Option<String>,

    /// The filename marker that precedes the zero-padded channel number.
    #[clap(long)]
    marker: Option<String>,

    /// The path of the cube to write.
    #[clap(short = 'o', long)]
    cube: Option<PathBuf>,

    /// The path of the per-channel statistics table to write. Defaults to the
    /// cube path with a .tab extension.
    #[clap(long)]
    stats: Option<PathBuf>,

    /// Centrally crop each image to this size in pixels; either one value for
    /// a square crop or width and height. A crop larger than the images falls
    /// back to the full image.
    #[clap(long, multiple_values(true), max_values(2))]
    crop: Option<Vec<usize>>,

    /// Flag a channel when its Stokes V RMS is below this many Jy/beam.
    #[clap(long)]
    rms_floor: Option<f64>,

    /// The OBJECT keyword to write into the cube header.
    #[clap(long)]
    object: Option<String>,

    /// A calibration table of per-observation XY-phase and polarisation-angle
    /// coefficients. When supplied, the corrections are applied to every
    /// channel as it is ingested.
    #[clap(long)]
    corrections_table: Option<PathBuf>,

    /// The path carrying the 10-digit observation ID used to look up the
    /// calibration table. Defaults to the image directory.
    #[clap(long)]
    observation: Option<PathBuf>,
}

impl BuildArgs {
    /// Both command-line and file arguments overlap in terms of what is
    /// available; this function consolidates everything that was specified
    /// into a single struct. Where applicable, it will prefer CLI parameters
    /// over those in the file.
    ///
    /// This function should only ever merge arguments, and not try to make
    /// sense of them.
    pub(super) fn merge(self) -> Result<BuildArgs, PolcubeError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;

        if let Some(args_file) = cli_args.args_file {
            // Read in the file arguments. Ensure all of the file args are
            // accounted for by pattern matching.
            let BuildArgs {
                args_file: _,
                image_dir,
                image_glob,
                marker,
                cube,
                stats,
                crop,
                rms_floor,
                object,
                corrections_table,
                observation,
            } = read_args_file(&args_file)?;

            // Merge all the arguments, preferring the CLI args when available.
            Ok(BuildArgs {
                args_file: None,
                image_dir: cli_args.image_dir.or(image_dir),
                image_glob: cli_args.image_glob.or(image_glob),
                marker: cli_args.marker.or(marker),
                cube: cli_args.cube.or(cube),
                stats: cli_args.stats.or(stats),
                crop: cli_args.crop.or(crop),
                rms_floor: cli_args.rms_floor.or(rms_floor),
                object: cli_args.object.or(object),
                corrections_table: cli_args.corrections_table.or(corrections_table),
                observation: cli_args.observation.or(observation),
            })
        } else {
            Ok(cli_args)
        }
    }

    fn into_config(self) -> Result<IngestConfig, BuildArgsError> {
        let BuildArgs {
            args_file: _,
            image_dir,
            image_glob,
            marker,
            cube,
            stats,
            crop,
            rms_floor,
            object,
            corrections_table,
            observation,
        } = self;

        let image_dir = image_dir.ok_or(BuildArgsError::NoImageDir)?;
        let cube_path = cube.ok_or(BuildArgsError::NoCubePath)?;
        let stats_path = stats.unwrap_or_else(|| cube_path.with_extension("tab"));

        let crop = match crop.as_deref() {
            None | Some([]) => None,
            Some(&[size]) => Some((size, size)),
            Some(&[width, height]) => Some((width, height)),
            Some(values) => {
                return Err(BuildArgsError::BadCrop {
                    values: values.to_vec(),
                })
            }
        };

        let corrections = corrections_table.map(|table| CorrectionsConfig {
            table,
            observation: observation.unwrap_or_else(|| image_dir.clone()),
        });

        Ok(IngestConfig {
            image_glob: image_glob.unwrap_or_else(|| DEFAULT_IMAGE_GLOB.to_string()),
            marker: marker.unwrap_or_else(|| DEFAULT_MARKER.to_string()),
            image_dir,
            cube_path,
            stats_path,
            crop,
            rms_floor: rms_floor.unwrap_or(DEFAULT_RMS_FLOOR),
            object,
            corrections,
        })
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), PolcubeError> {
        debug!("{:#?}", self);
        let cfg = self.into_config()?;

        info!("Channel images:   {}", cfg.image_dir.display());
        info!("Output cube:      {}", cfg.cube_path.display());
        info!("Statistics table: {}", cfg.stats_path.display());
        match cfg.crop {
            Some((w, h)) => info!("Cropping to {w}x{h} px"),
            None => info!("Not cropping"),
        }
        match &cfg.corrections {
            Some(c) => info!("Corrections from: {}", c.table.display()),
            None => info!("Not applying polarisation corrections"),
        }

        if dry_run {
            info!("Dry run; not writing anything.");
            return Ok(());
        }

        ingest::run_build(&cfg)?;
        Ok(())
    }
}
