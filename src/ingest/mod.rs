// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Channel-image ingestion: build the cube and fill it channel by channel.
//!
//! Every per-channel data-quality problem (missing file, unreadable file,
//! no signal) is absorbed into the flagging mechanism and never aborts the
//! run. Structural problems (allocation, cube writes, calibration lookup)
//! are fatal.

pub mod corrections;

use std::path::{Path, PathBuf};

use fitsio::{hdu::HduInfo, FitsFile};
use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use thiserror::Error;

use crate::{
    channels::{self, ChannelNameError},
    cube::{Card, CubeDims, CubeError, CubeFile, Stokes},
    stats::robust_std_f32,
    table::{self, ChannelRecord, TableError},
};
use corrections::{
    obsid_from_path, rotate_planes, CorrectionCoefficients, CorrectionTable, CorrectionsError,
};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Couldn't read template channel image {path}: {reason}")]
    Template { path: PathBuf, reason: String },

    #[error(transparent)]
    Channels(#[from] ChannelNameError),

    #[error(transparent)]
    Corrections(#[from] CorrectionsError),

    #[error(transparent)]
    Cube(#[from] CubeError),

    #[error(transparent)]
    Table(#[from] TableError),
}

/// Everything the `build` phase needs, validated up front.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Directory holding the per-channel images.
    pub image_dir: PathBuf,
    /// Glob pattern selecting channel images within `image_dir`.
    pub image_glob: String,
    /// Filename marker preceding the zero-padded channel number.
    pub marker: String,
    pub cube_path: PathBuf,
    pub stats_path: PathBuf,
    /// Centred crop target (width, height) in pixels.
    pub crop: Option<(usize, usize)>,
    /// Stokes V RMS below this (Jy/beam) means "no signal": flag the channel.
    pub rms_floor: f64,
    /// OBJECT header value for the cube.
    pub object: Option<String>,
    pub corrections: Option<CorrectionsConfig>,
}

#[derive(Debug, Clone)]
pub struct CorrectionsConfig {
    /// Path to the calibration coefficients table.
    pub table: PathBuf,
    /// Path whose filename carries the 10-digit observation ID.
    pub observation: PathBuf,
}

/// A fully read channel image: four polarisation planes and the channel's
/// own frequency metadata.
pub struct ChannelImage {
    pub freq_hz: f64,
    pub chan_width_hz: Option<f64>,
    planes: Array3<f32>,
}

/// The three first-class outcomes of looking for a channel's image.
pub enum ChannelSource {
    Found(Box<ChannelImage>),
    Missing,
    Corrupt(String),
}

#[derive(Error, Debug)]
enum ChannelReadError {
    #[error(transparent)]
    Fits(#[from] fitsio::errors::Error),

    #[error("primary HDU isn't an image")]
    NotAnImage,

    #[error("image has {0} axes; expected at least 2")]
    TooFewAxes(usize),

    #[error("expected 4 Stokes planes, found {0}")]
    NotFullStokes(usize),

    #[error("no {0} key in the header")]
    MissingKey(&'static str),

    #[error("couldn't parse the value of the {0} key")]
    UnparsableKey(&'static str),
}

impl ChannelImage {
    /// Look for a channel image on disk. Absent and unreadable files are
    /// first-class outcomes, not errors; both are recovered by flagging the
    /// channel.
    pub fn open(path: &Path) -> ChannelSource {
        if !path.exists() {
            return ChannelSource::Missing;
        }
        match Self::read(path) {
            Ok(image) => ChannelSource::Found(Box::new(image)),
            Err(e) => ChannelSource::Corrupt(e.to_string()),
        }
    }

    fn read(path: &Path) -> Result<ChannelImage, ChannelReadError> {
        let mut fptr = FitsFile::open(path)?;
        let hdu = fptr.primary_hdu()?;
        let shape = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            _ => return Err(ChannelReadError::NotAnImage),
        };
        if shape.len() < 2 {
            return Err(ChannelReadError::TooFewAxes(shape.len()));
        }
        let (ny, nx) = (shape[shape.len() - 2], shape[shape.len() - 1]);
        let n_planes: usize = shape[..shape.len() - 2].iter().product::<usize>().max(1);
        if n_planes < 4 {
            return Err(ChannelReadError::NotFullStokes(n_planes));
        }

        let freq_hz: f64 = read_optional_key(&mut fptr, &hdu, "CRVAL3")?
            .ok_or(ChannelReadError::MissingKey("CRVAL3"))?;
        let chan_width_hz = read_optional_key(&mut fptr, &hdu, "CDELT3")?;

        let data: Vec<f32> = hdu.read_image(&mut fptr)?;
        if data.len() < 4 * ny * nx {
            return Err(ChannelReadError::NotFullStokes(data.len() / (ny * nx)));
        }
        // The Stokes axis is the slowest; planes beyond IQUV (there are
        // none in practice) would be ignored.
        let planes = Array3::from_shape_vec((4, ny, nx), data[..4 * ny * nx].to_vec()).unwrap();
        Ok(ChannelImage {
            freq_hz,
            chan_width_hz,
            planes,
        })
    }

    pub fn plane(&self, stokes: Stokes) -> ArrayView2<f32> {
        self.planes.index_axis(Axis(0), stokes.index())
    }

    /// (ny, nx) of the polarisation planes.
    pub fn plane_dims(&self) -> (usize, usize) {
        let d = self.planes.dim();
        (d.1, d.2)
    }
}

/// Read a FITS keyword that may be absent. cfitsio statuses 202 and 204 are
/// "keyword doesn't exist".
fn read_optional_key<T: std::str::FromStr>(
    fptr: &mut FitsFile,
    hdu: &fitsio::hdu::FitsHdu,
    keyword: &'static str,
) -> Result<Option<T>, ChannelReadError> {
    let unparsed: String = match hdu.read_key(fptr, keyword) {
        Ok(v) => v,
        Err(fitsio::errors::Error::Fits(fitsio::errors::FitsError {
            status: 202 | 204, ..
        })) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match unparsed.trim().parse() {
        Ok(v) => Ok(Some(v)),
        Err(_) => Err(ChannelReadError::UnparsableKey(keyword)),
    }
}

/// Cut a centred (height × width) window out of `plane`. A target larger
/// than the source falls back to the source extent; this never errors and
/// never reads out of bounds.
pub fn centred_crop(plane: ArrayView2<f32>, width: usize, height: usize) -> Array2<f32> {
    let (ny, nx) = plane.dim();
    let w = width.min(nx);
    let h = height.min(ny);
    let left = nx / 2 - w / 2;
    let top = ny / 2 - h / 2;
    plane.slice(s![top..top + h, left..left + w]).to_owned()
}

/// Header keywords copied from the template channel image into the cube.
const TEMPLATE_REAL_KEYS: [&str; 17] = [
    "CRPIX1", "CRVAL1", "CDELT1", "CRPIX2", "CRVAL2", "CDELT2", "CRPIX3", "CRVAL3", "CDELT3",
    "CRPIX4", "CRVAL4", "CDELT4", "EQUINOX", "BMAJ", "BMIN", "BPA", "RESTFRQ",
];
const TEMPLATE_TEXT_KEYS: [&str; 13] = [
    "CTYPE1", "CUNIT1", "CTYPE2", "CUNIT2", "CTYPE3", "CUNIT3", "CTYPE4", "CUNIT4", "BUNIT",
    "OBJECT", "RADESYS", "SPECSYS", "TELESCOP",
];

fn template_cards(path: &Path) -> Result<(usize, usize, Vec<Card>), IngestError> {
    let template_err = |reason: String| IngestError::Template {
        path: path.to_path_buf(),
        reason,
    };

    let image = match ChannelImage::open(path) {
        ChannelSource::Found(image) => image,
        ChannelSource::Missing => return Err(template_err("file has gone missing".to_string())),
        ChannelSource::Corrupt(reason) => return Err(template_err(reason)),
    };
    let (ny, nx) = image.plane_dims();

    let mut fptr = FitsFile::open(path).map_err(|e| template_err(e.to_string()))?;
    let hdu = fptr.primary_hdu().map_err(|e| template_err(e.to_string()))?;
    let mut cards = vec![];
    for keyword in TEMPLATE_REAL_KEYS {
        if let Some(v) = read_optional_key::<f64>(&mut fptr, &hdu, keyword)
            .map_err(|e| template_err(e.to_string()))?
        {
            cards.push(Card::real(keyword, v));
        }
    }
    for keyword in TEMPLATE_TEXT_KEYS {
        if let Some(v) = read_optional_key::<String>(&mut fptr, &hdu, keyword)
            .map_err(|e| template_err(e.to_string()))?
        {
            cards.push(Card::text(keyword, v.trim()));
        }
    }
    Ok((ny, nx, cards))
}

/// Replace the first card with this keyword, or append it.
fn upsert(cards: &mut Vec<Card>, card: Card) {
    match cards.iter_mut().find(|c| c.keyword == card.keyword) {
        Some(existing) => *existing = card,
        None => cards.push(card),
    }
}

/// The whole `build` phase: allocate the cube, ingest every channel, write
/// the statistics table.
pub fn run_build(cfg: &IngestConfig) -> Result<(), IngestError> {
    let images = channels::find_channel_images(&cfg.image_dir, &cfg.image_glob)?;
    let n_chan = channels::highest_channel(&images, &cfg.marker)?;
    info!(
        "Found {} channel images; the highest channel number gives {n_chan} cube channels",
        images.len()
    );

    let template_path = &images[0];
    info!("Cube header template: {}", template_path.display());
    let (src_ny, src_nx, mut cards) = template_cards(template_path)?;

    let (nx, ny) = match cfg.crop {
        Some((w, h)) => {
            if w > src_nx || h > src_ny {
                info!(
                    "Crop target {w}x{h} px exceeds the source extent; \
                     falling back to {src_nx}x{src_ny} px"
                );
            }
            (w.min(src_nx), h.min(src_ny))
        }
        None => (src_nx, src_ny),
    };
    let dims = CubeDims { nx, ny, n_chan };

    // The crop re-centres the image, so the reference pixel moves too.
    if cfg.crop.is_some() {
        upsert(&mut cards, Card::real("CRPIX1", (nx / 2) as f64));
        upsert(&mut cards, Card::real("CRPIX2", (ny / 2) as f64));
    }
    upsert(&mut cards, Card::text("CTYPE3", "FREQ"));
    upsert(&mut cards, Card::real("CRPIX3", 1.0));
    if let Some(object) = &cfg.object {
        upsert(&mut cards, Card::text("OBJECT", object));
    }
    cards.push(Card::comment("Assembled by the polcube pipeline"));

    let mut cube = CubeFile::create(&cfg.cube_path, dims, cards)?;

    let coeffs = match &cfg.corrections {
        Some(c) => {
            let table = CorrectionTable::read(&c.table)?;
            let obsid = obsid_from_path(&c.observation)?;
            let coeffs =
                table
                    .coefficients(&obsid)
                    .ok_or_else(|| CorrectionsError::UnknownObsid {
                        obsid: obsid.clone(),
                        path: c.table.clone(),
                    })?;
            info!("Applying XY-phase and pol-angle corrections for observation {obsid}");
            Some(coeffs)
        }
        None => None,
    };

    let records = ingest_channels(&mut cube, template_path, coeffs, cfg)?;

    // Channels flagged during ingestion get their cube slices explicitly
    // NaN-filled; sparse allocation left them zero.
    for record in &records {
        if record.flagged {
            cube.nan_fill_channel(record.chan_no)?;
        }
    }

    table::write_statistics(&cfg.stats_path, &records)?;
    let n_flagged = records.iter().filter(|r| r.flagged).count();
    info!("Ingestion finished: {n_flagged} of {n_chan} channels flagged");
    Ok(())
}

fn ingest_channels(
    cube: &mut CubeFile,
    template_path: &Path,
    coeffs: Option<CorrectionCoefficients>,
    cfg: &IngestConfig,
) -> Result<Vec<ChannelRecord>, IngestError> {
    let (nx, ny) = (cube.dims.nx, cube.dims.ny);
    let n_chan = cube.dims.n_chan;
    let mut records = Vec::with_capacity(n_chan);

    for chan_no in 1..=n_chan {
        let path = channels::with_channel_number(template_path, &cfg.marker, chan_no)?;
        debug!("Channel {chan_no}: trying {}", path.display());

        let image = match ChannelImage::open(&path) {
            ChannelSource::Found(image) => image,
            ChannelSource::Missing => {
                info!(
                    "Flagging channel {chan_no}: no image at {}",
                    path.display()
                );
                records.push(ChannelRecord::flagged_placeholder(chan_no));
                continue;
            }
            ChannelSource::Corrupt(reason) => {
                warn!("Flagging channel {chan_no}: unreadable image: {reason}");
                records.push(ChannelRecord::flagged_placeholder(chan_no));
                continue;
            }
        };
        if let Some(width) = image.chan_width_hz {
            debug!(
                "Channel {chan_no}: {:.4} MHz, width {:.4} MHz",
                image.freq_hz * 1e-6,
                width * 1e-6
            );
        }

        let v = centred_crop(image.plane(Stokes::V), nx, ny);
        let rms_v = robust_std_f32(v.iter());
        if !rms_v.is_finite() || rms_v < cfg.rms_floor {
            info!(
                "Flagging channel {chan_no}: Stokes V RMS {:.2} uJy/beam is below the \
                 {:.2} uJy/beam floor",
                rms_v * 1e6,
                cfg.rms_floor * 1e6
            );
            records.push(ChannelRecord::flagged_placeholder(chan_no));
            continue;
        }

        let i = centred_crop(image.plane(Stokes::I), nx, ny);
        let rms_i = robust_std_f32(i.iter());
        let max_i = i.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        let q = centred_crop(image.plane(Stokes::Q), nx, ny);
        let u = centred_crop(image.plane(Stokes::U), nx, ny);

        let (q, u, v, xy_phase_corr, pol_angle_corr) = match coeffs {
            Some(c) => {
                let (xy, pol) = c.angles_at(image.freq_hz);
                debug!("Channel {chan_no}: XY phase {xy:.4} rad, pol angle {pol:.4} rad");
                let (q, u, v) = rotate_planes(&q, &u, &v, xy, pol);
                (q, u, v, xy, pol)
            }
            None => (q, u, v, f64::NAN, f64::NAN),
        };

        cube.write_plane(Stokes::I, chan_no, &i)?;
        cube.write_plane(Stokes::Q, chan_no, &q)?;
        cube.write_plane(Stokes::U, chan_no, &u)?;
        cube.write_plane(Stokes::V, chan_no, &v)?;

        records.push(ChannelRecord {
            chan_no,
            freq_hz: image.freq_hz,
            rms_i,
            rms_v,
            max_i,
            flagged: false,
            xy_phase_corr,
            pol_angle_corr,
        });
    }
    Ok(records)
}
