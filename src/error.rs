// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all polcube-related errors. This should be the *only* error
//! enum that is publicly visible.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolcubeError {
    #[error(transparent)]
    ArgsFile(#[from] crate::cli::ArgsFileError),

    #[error(transparent)]
    BuildArgs(#[from] crate::cli::BuildArgsError),

    #[error(transparent)]
    FlagArgs(#[from] crate::cli::FlagArgsError),

    #[error(transparent)]
    Corrections(#[from] crate::ingest::corrections::CorrectionsError),

    #[error(transparent)]
    Channels(#[from] crate::channels::ChannelNameError),

    #[error(transparent)]
    Cube(#[from] crate::cube::CubeError),

    #[error(transparent)]
    Ingest(#[from] crate::ingest::IngestError),

    #[error(transparent)]
    Reject(#[from] crate::flagging::RejectError),

    #[error(transparent)]
    Table(#[from] crate::table::TableError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
