// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code. More specific options for `polcube`
//! subcommands are contained in modules.
//!
//! All booleans must have `#[serde(default)]` annotated, and anything that
//! isn't a boolean must be optional. This allows all arguments to be optional
//! *and* usable in an arguments file.

mod build;
mod flag;

pub use build::BuildArgsError;
pub use flag::FlagArgsError;

use std::path::{Path, PathBuf};

use clap::{AppSettings, Args, Parser, Subcommand};
use log::{debug, info};
use thiserror::Error;

use crate::PolcubeError;

#[derive(Error, Debug)]
pub enum ArgsFileError {
    #[error("Argument files must be TOML; can't handle {0}")]
    UnhandledExtension(PathBuf),

    #[error("Couldn't read argument file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't decode TOML structure from {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = "Assemble per-channel Stokes IQUV images into a spectro-polarimetric cube \
             and flag its noisy channels."
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Polcube {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,

    /// Only verify that arguments were correctly ingested and print out
    /// high-level information.
    #[clap(long)]
    #[clap(global = true)]
    dry_run: bool,

    /// Save the input arguments into a new TOML file that can be used to
    /// reproduce this run.
    #[clap(long)]
    #[clap(global = true)]
    save_toml: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Allocate a Stokes IQUV cube and fill it from per-channel images, \
                    writing a per-channel statistics table alongside.")]
    Build(build::BuildArgs),

    #[clap(about = "Flag outlier channels of a built cube by iteratively fitting a \
                    polynomial to the per-channel Stokes V noise.")]
    Flag(flag::FlagArgs),
}

impl Polcube {
    pub fn run(self) -> Result<(), PolcubeError> {
        let GlobalArgs {
            verbosity,
            dry_run,
            save_toml,
        } = self.global_opts;
        setup_logging(verbosity).expect("Failed to initialise logging.");

        let sub_command = match &self.command {
            Command::Build(_) => "build",
            Command::Flag(_) => "flag",
        };
        info!("polcube {} {}", sub_command, env!("CARGO_PKG_VERSION"));

        macro_rules! merge_save_run {
            ($args:expr) => {{
                let args = $args.merge()?;
                if let Some(toml) = save_toml {
                    use std::{
                        fs::File,
                        io::{BufWriter, Write},
                    };

                    let mut f = BufWriter::new(File::create(toml)?);
                    let toml_str = toml::to_string(&args).expect("toml serialisation error");
                    f.write_all(toml_str.as_bytes())?;
                }
                args.run(dry_run)?;
            }};
        }

        match self.command {
            Command::Build(args) => {
                merge_save_run!(args)
            }

            Command::Flag(args) => {
                merge_save_run!(args)
            }
        }

        info!("polcube {} complete.", sub_command);
        Ok(())
    }
}

/// Read and deserialise a TOML arguments file.
fn read_args_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ArgsFileError> {
    debug!("Attempting to parse argument file {}", path.display());
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("toml") => {
            let contents = std::fs::read_to_string(path).map_err(|source| ArgsFileError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ArgsFileError::Toml {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => Err(ArgsFileError::UnhandledExtension(path.to_path_buf())),
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty (e.g. a
/// terminal); piped output will be formatted sensibly. Source code lines are
/// displayed in log messages when verbosity >= 3.
fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();

    Ok(())
}
