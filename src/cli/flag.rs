// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Arguments for the `flag` subcommand.

use std::path::PathBuf;

use clap::Args;
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::read_args_file;
use crate::{
    cube::CubeFile,
    flagging::{apply_flags, reject_outliers, RejectionConfig},
    table, PolcubeError,
};

pub(super) const DEFAULT_THRESHOLD_SIGMA: f64 = 5.0;
pub(super) const DEFAULT_PRE_FILTER_SIGMA: f64 = 10.0;
pub(super) const DEFAULT_FIT_POWERS: &str = "0,1,2";
const FLAGGED_EXTENSION: &str = "ior-flagged.tab";

#[derive(Error, Debug)]
pub enum FlagArgsError {
    #[error("No statistics table was supplied")]
    NoStats,

    #[error("No cube was supplied")]
    NoCube,

    #[error("Couldn't parse '{0}' as comma-separated polynomial powers")]
    BadPowers(String),
}

#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
pub(super) struct FlagArgs {
    /// All of the arguments to flag may be specified in a TOML file. Any CLI
    /// arguments override the file's.
    #[clap(name = "ARGUMENTS_FILE", parse(from_os_str))]
    #[serde(skip)]
    args_file: Option<PathBuf>,

    /// The per-channel statistics table written by build.
    #[clap(short, long)]
    stats: Option<PathBuf>,

    /// The cube whose outlier channels should be flagged.
    #[clap(short, long)]
    cube: Option<PathBuf>,

    /// Where to write the updated statistics table. Defaults to the input
    /// table with an .ior-flagged.tab extension.
    #[clap(short, long)]
    output_stats: Option<PathBuf>,

    /// Reject a channel when its residual from the fit exceeds this many
    /// robust standard deviations.
    #[clap(short, long)]
    threshold_sigma: Option<f64>,

    /// Before the first fit, exclude channels this many robust standard
    /// deviations from the median Stokes V RMS.
    #[clap(long)]
    pre_filter_sigma: Option<f64>,

    /// Fit the first polynomial to every channel, however far out.
    #[clap(long, conflicts_with("pre-filter-sigma"))]
    #[serde(default)]
    no_pre_filter: bool,

    /// The comma-separated polynomial powers to fit to the Stokes V RMS,
    /// e.g. "0,1,2" for a quadratic.
    #[clap(long)]
    fit_powers: Option<String>,
}

impl FlagArgs {
    /// Both command-line and file arguments overlap in terms of what is
    /// available; this function consolidates everything that was specified
    /// into a single struct. Where applicable, it will prefer CLI parameters
    /// over those in the file.
    ///
    /// This function should only ever merge arguments, and not try to make
    /// sense of them.
    pub(super) fn merge(self) -> Result<FlagArgs, PolcubeError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;

        if let Some(args_file) = cli_args.args_file {
            // Read in the file arguments. Ensure all of the file args are
            // accounted for by pattern matching.
            let FlagArgs {
                args_file: _,
                stats,
                cube,
                output_stats,
                threshold_sigma,
                pre_filter_sigma,
                no_pre_filter,
                fit_powers,
            } = read_args_file(&args_file)?;

            // Merge all the arguments, preferring the CLI args when available.
            Ok(FlagArgs {
                args_file: None,
                stats: cli_args.stats.or(stats),
                cube: cli_args.cube.or(cube),
                output_stats: cli_args.output_stats.or(output_stats),
                threshold_sigma: cli_args.threshold_sigma.or(threshold_sigma),
                pre_filter_sigma: cli_args.pre_filter_sigma.or(pre_filter_sigma),
                no_pre_filter: cli_args.no_pre_filter || no_pre_filter,
                fit_powers: cli_args.fit_powers.or(fit_powers),
            })
        } else {
            Ok(cli_args)
        }
    }

    fn rejection_config(&self) -> Result<RejectionConfig, FlagArgsError> {
        let powers_str = self.fit_powers.as_deref().unwrap_or(DEFAULT_FIT_POWERS);
        let fit_powers: Vec<u32> = powers_str
            .split(',')
            .map(|p| p.trim().parse())
            .collect::<Result<_, _>>()
            .map_err(|_| FlagArgsError::BadPowers(powers_str.to_string()))?;
        if fit_powers.is_empty() {
            return Err(FlagArgsError::BadPowers(powers_str.to_string()));
        }

        Ok(RejectionConfig {
            threshold_sigma: self.threshold_sigma.unwrap_or(DEFAULT_THRESHOLD_SIGMA),
            pre_filter_sigma: if self.no_pre_filter {
                None
            } else {
                Some(self.pre_filter_sigma.unwrap_or(DEFAULT_PRE_FILTER_SIGMA))
            },
            fit_powers,
        })
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), PolcubeError> {
        debug!("{:#?}", self);

        let cfg = self.rejection_config()?;
        let stats_path = self.stats.ok_or(FlagArgsError::NoStats)?;
        let cube_path = self.cube.ok_or(FlagArgsError::NoCube)?;
        let output_stats = self
            .output_stats
            .unwrap_or_else(|| stats_path.with_extension(FLAGGED_EXTENSION));

        info!("Statistics table: {}", stats_path.display());
        info!("Cube:             {}", cube_path.display());
        info!("Flagged table:    {}", output_stats.display());
        info!(
            "Rejecting above {} sigma with powers [{}]",
            cfg.threshold_sigma,
            cfg.fit_powers.iter().join(", ")
        );

        if dry_run {
            info!("Dry run; not writing anything.");
            return Ok(());
        }

        let mut records = table::read_statistics(&stats_path)?;
        let xs: Vec<f64> = records.iter().map(|r| r.chan_no as f64).collect();
        // Already-flagged channels take no part in the fit and stay flagged.
        let ys: Vec<f64> = records
            .iter()
            .map(|r| if r.flagged { f64::NAN } else { r.rms_v })
            .collect();

        let (rejected, model) = reject_outliers(&xs, &ys, &cfg)?;
        info!(
            "Fit converged with residual sigma {:.2} uJy/beam",
            model.residual_sigma * 1e6
        );

        let mut newly_flagged = vec![];
        for (i, record) in records.iter_mut().enumerate() {
            if rejected.contains(&i) && !record.flagged {
                record.flagged = true;
                newly_flagged.push(record.chan_no);
            }
        }
        match newly_flagged.len() {
            0 => info!("No channels newly flagged"),
            n => info!(
                "{n} channels newly flagged: {}",
                newly_flagged.iter().join(", ")
            ),
        }

        let mut cube = CubeFile::open(&cube_path)?;
        apply_flags(
            &mut cube,
            records.iter().filter(|r| r.flagged).map(|r| r.chan_no),
        )?;

        table::write_statistics(&output_stats, &records)?;
        info!(
            "The flagged cube and {} are ready for science-format conversion",
            output_stats.display()
        );
        Ok(())
    }
}
