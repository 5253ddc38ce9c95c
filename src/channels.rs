// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Channel-numbered filename handling.
//!
//! Channel images carry a zero-padded channel number behind a marker (e.g.
//! `xmmlss12.chan042.image.fits` with marker `.chan`). Given one good
//! filename, the expected filename of any other channel can be predicted,
//! including channels whose images were never produced.

use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelNameError {
    #[error("No channel images matched {glob}")]
    NoMatches { glob: String },

    #[error("No channel marker '{marker}' followed by digits in filename {filename}")]
    NoMarker { marker: String, filename: String },

    #[error("Channel filename {filename} isn't valid UTF-8")]
    NotUtf8 { filename: String },

    #[error(
        "The highest numbered channel image is channel 0, which would make an \
         empty cube; channels are numbered from 1"
    )]
    ChannelZero,

    #[error(transparent)]
    GlobCrate(#[from] glob::GlobError),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// All channel images under `dir` matching `pattern` (e.g. `*image.fits`),
/// sorted by filename so the channel order falls out of the zero padding.
pub fn find_channel_images(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, ChannelNameError> {
    let g = dir.join(pattern).display().to_string();
    let mut entries = vec![];
    for entry in glob(&g)? {
        entries.push(entry?);
    }
    if entries.is_empty() {
        return Err(ChannelNameError::NoMatches { glob: g });
    }
    entries.sort_unstable();
    Ok(entries)
}

/// Parse the channel number following `marker`, returning it along with the
/// width of the zero-padded digit run.
pub fn channel_number(filename: &str, marker: &str) -> Option<(usize, usize)> {
    let start = filename.find(marker)? + marker.len();
    let digits: String = filename[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    let width = digits.len();
    digits.parse().ok().map(|n| (n, width))
}

/// Replace the channel number in `template` with `chan_no`, keeping the digit
/// width of the template.
pub fn with_channel_number(
    template: &Path,
    marker: &str,
    chan_no: usize,
) -> Result<PathBuf, ChannelNameError> {
    let filename = template
        .to_str()
        .ok_or_else(|| ChannelNameError::NotUtf8 {
            filename: template.display().to_string(),
        })?;
    let (old, width) = channel_number(filename, marker).ok_or_else(|| ChannelNameError::NoMarker {
        marker: marker.to_string(),
        filename: filename.to_string(),
    })?;
    let old_token = format!("{marker}{old:0width$}");
    let new_token = format!("{marker}{chan_no:0width$}");
    Ok(PathBuf::from(filename.replacen(&old_token, &new_token, 1)))
}

/// The highest channel number among `paths`. Gaps in the numbering are fine;
/// they become unfilled (flagged) cube channels.
pub fn highest_channel(paths: &[PathBuf], marker: &str) -> Result<usize, ChannelNameError> {
    let mut highest = None;
    for path in paths {
        let filename = path.to_str().ok_or_else(|| ChannelNameError::NotUtf8 {
            filename: path.display().to_string(),
        })?;
        let (chan_no, _) =
            channel_number(filename, marker).ok_or_else(|| ChannelNameError::NoMarker {
                marker: marker.to_string(),
                filename: filename.to_string(),
            })?;
        highest = Some(highest.map_or(chan_no, |h: usize| h.max(chan_no)));
    }
    match highest {
        None => Err(ChannelNameError::NoMatches {
            glob: String::new(),
        }),
        Some(0) => Err(ChannelNameError::ChannelZero),
        Some(h) => Ok(h),
    }
}
