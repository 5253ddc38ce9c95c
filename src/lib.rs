// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Full-Stokes spectral-cube assembly and channel flagging for radio polarimetry
imaging.

`polcube` takes the per-frequency-channel FITS images produced by an external
imaging step and assembles them into a single 4D (stokes × channel × y × x)
FITS cube, which may be far larger than the available memory. Channels with
missing data or anomalous noise are detected with robust statistics and an
iterative outlier rejection over the Stokes V RMS, then flagged (NaN-filled)
in the cube.
 */

pub mod channels;
pub mod cli;
pub mod cube;
mod error;
pub mod flagging;
pub mod ingest;
pub mod stats;
pub mod table;

pub use error::PolcubeError;
