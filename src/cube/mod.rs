// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The on-disk 4D data cube.
//!
//! The cube is a FITS primary HDU with axes (x, y, channel, stokes) and
//! 32-bit floats. It can be far larger than memory: allocation writes the
//! header and then extends the file to its final size with a single
//! seek-and-write, which produces a sparse file on filesystems that support
//! it. All later access is by directly addressed plane reads/writes.
//!
//! Exactly one writer process may be active against a cube file; that is
//! enforced by the caller, not here.

mod header;

pub use header::{Card, CardValue, CubeHeader, BLOCK_SIZE};

use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use ndarray::Array2;
use thiserror::Error;

/// Number of polarisation planes; always full Stokes (I, Q, U, V).
pub const NUM_STOKES: usize = 4;

/// One of the four Stokes polarisation planes, in cube storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stokes {
    I,
    Q,
    U,
    V,
}

impl Stokes {
    pub const ALL: [Stokes; NUM_STOKES] = [Stokes::I, Stokes::Q, Stokes::U, Stokes::V];

    /// Index along the cube's Stokes axis.
    pub fn index(self) -> usize {
        match self {
            Stokes::I => 0,
            Stokes::Q => 1,
            Stokes::U => 2,
            Stokes::V => 3,
        }
    }
}

/// Bytes per data element (BITPIX = -32).
const ELEMENT_SIZE: u64 = 4;

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("Couldn't allocate {size} bytes for cube {path}: {source}")]
    Allocation {
        path: PathBuf,
        size: u64,
        source: std::io::Error,
    },

    #[error("Couldn't read FITS header of {path}: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error("Channel {chan_no} is out of range for a cube with {n_chan} channels")]
    BadChannel { chan_no: usize, n_chan: usize },

    #[error("{rows}x{cols} plane doesn't match the {ny}x{nx} cube dimensions")]
    BadPlaneShape {
        rows: usize,
        cols: usize,
        ny: usize,
        nx: usize,
    },

    #[error("No room in the header of {path} to add new cards")]
    HeaderFull { path: PathBuf },

    #[error("IO error on cube {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Pixel and channel dimensions of a cube. The Stokes dimension is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubeDims {
    pub nx: usize,
    pub ny: usize,
    pub n_chan: usize,
}

impl CubeDims {
    fn plane_len(self) -> usize {
        self.nx * self.ny
    }

    /// Size of the data block, padded up to a whole number of FITS blocks.
    pub fn padded_data_size(self) -> u64 {
        let raw = (self.plane_len() * self.n_chan * NUM_STOKES) as u64 * ELEMENT_SIZE;
        raw.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
    }
}

/// An open cube file with a parsed header.
pub struct CubeFile {
    file: File,
    path: PathBuf,
    pub dims: CubeDims,
    header: CubeHeader,
    data_start: u64,
}

impl CubeFile {
    /// Allocate a new cube: write a header describing the full 4D array,
    /// then extend the file to its exact final size without writing the data
    /// volume. After this returns, every plane offset within `dims` is a
    /// valid write target. Failure here is fatal to the run.
    ///
    /// `template_cards` are appended verbatim after the mandatory cards;
    /// they carry the WCS/beam/unit metadata copied from a channel image.
    /// Mandatory keywords appearing in the template are skipped.
    pub fn create(
        path: &Path,
        dims: CubeDims,
        template_cards: Vec<Card>,
    ) -> Result<CubeFile, CubeError> {
        const MANDATORY: [&str; 8] = [
            "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "NAXIS4", "EXTEND",
        ];

        let mut header = CubeHeader::default();
        header.push(Card::logical("SIMPLE", true));
        header.push(Card::integer("BITPIX", -32));
        header.push(Card::integer("NAXIS", 4));
        header.push(Card::integer("NAXIS1", dims.nx as i64));
        header.push(Card::integer("NAXIS2", dims.ny as i64));
        header.push(Card::integer("NAXIS3", dims.n_chan as i64));
        header.push(Card::integer("NAXIS4", NUM_STOKES as i64));
        for card in template_cards {
            if !MANDATORY.contains(&card.keyword.as_str()) {
                header.push(card);
            }
        }

        let header_bytes = header.to_bytes();
        let data_size = dims.padded_data_size();
        let total_size = header_bytes.len() as u64 + data_size;
        info!(
            "Allocating cube {} ({}x{} px, {} channels, {} Stokes): {} bytes",
            path.display(),
            dims.nx,
            dims.ny,
            dims.n_chan,
            NUM_STOKES,
            total_size
        );

        let allocation_err = |source| CubeError::Allocation {
            path: path.to_path_buf(),
            size: total_size,
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(allocation_err)?;
        file.write_all(&header_bytes).map_err(allocation_err)?;
        // Seek-and-write one byte: the filesystem backfills with zeroes
        // (sparsely, where supported) and the file reaches its exact final
        // size without the data volume ever living in memory.
        file.seek(SeekFrom::Start(total_size - 1))
            .map_err(allocation_err)?;
        file.write_all(&[0]).map_err(allocation_err)?;

        let data_start = header_bytes.len() as u64;
        Ok(CubeFile {
            file,
            path: path.to_path_buf(),
            dims,
            header,
            data_start,
        })
    }

    /// Open an existing cube for reading and in-place mutation.
    pub fn open(path: &Path) -> Result<CubeFile, CubeError> {
        let io_err = |source| CubeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let bad_header = |reason: &str| CubeError::BadHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let mut reader = BufReader::new(&file);
        let header = CubeHeader::from_reader(&mut reader)
            .map_err(io_err)?
            .ok_or_else(|| bad_header("no END card found"))?;

        let axis = |keyword: &str| {
            header
                .get_integer(keyword)
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| bad_header(&format!("missing or invalid {keyword}")))
        };
        if header.get_integer("BITPIX") != Some(-32) {
            return Err(bad_header("BITPIX isn't -32"));
        }
        if axis("NAXIS")? != 4 {
            return Err(bad_header("NAXIS isn't 4"));
        }
        if axis("NAXIS4")? != NUM_STOKES {
            return Err(bad_header("NAXIS4 isn't 4 Stokes planes"));
        }
        let dims = CubeDims {
            nx: axis("NAXIS1")?,
            ny: axis("NAXIS2")?,
            n_chan: axis("NAXIS3")?,
        };
        let data_start = header.byte_len() as u64;

        Ok(CubeFile {
            file,
            path: path.to_path_buf(),
            dims,
            header,
            data_start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &CubeHeader {
        &self.header
    }

    fn io_err(&self, source: std::io::Error) -> CubeError {
        CubeError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn plane_offset(&self, stokes: Stokes, chan_no: usize) -> Result<u64, CubeError> {
        if chan_no < 1 || chan_no > self.dims.n_chan {
            return Err(CubeError::BadChannel {
                chan_no,
                n_chan: self.dims.n_chan,
            });
        }
        let plane_index = stokes.index() * self.dims.n_chan + (chan_no - 1);
        Ok(self.data_start + (plane_index * self.dims.plane_len()) as u64 * ELEMENT_SIZE)
    }

    /// Write one Stokes plane of one channel. `chan_no` is 1-based, matching
    /// the FITS frequency axis.
    pub fn write_plane(
        &mut self,
        stokes: Stokes,
        chan_no: usize,
        plane: &Array2<f32>,
    ) -> Result<(), CubeError> {
        let (rows, cols) = plane.dim();
        if rows != self.dims.ny || cols != self.dims.nx {
            return Err(CubeError::BadPlaneShape {
                rows,
                cols,
                ny: self.dims.ny,
                nx: self.dims.nx,
            });
        }
        let offset = self.plane_offset(stokes, chan_no)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err(e))?;
        let mut writer = BufWriter::new(&self.file);
        for &v in plane.iter() {
            writer
                .write_f32::<BigEndian>(v)
                .map_err(|e| CubeError::Io {
                    path: self.path.clone(),
                    source: e,
                })?;
        }
        writer.flush().map_err(|e| CubeError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Read one Stokes plane of one channel.
    pub fn read_plane(&mut self, stokes: Stokes, chan_no: usize) -> Result<Array2<f32>, CubeError> {
        let offset = self.plane_offset(stokes, chan_no)?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err(e))?;
        let mut reader = BufReader::new(&self.file);
        let mut data = vec![0.0_f32; self.dims.plane_len()];
        reader
            .read_f32_into::<BigEndian>(&mut data)
            .map_err(|e| CubeError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(Array2::from_shape_vec((self.dims.ny, self.dims.nx), data).unwrap())
    }

    /// NaN-fill all four Stokes planes of a channel ("no valid data").
    /// Idempotent.
    pub fn nan_fill_channel(&mut self, chan_no: usize) -> Result<(), CubeError> {
        for stokes in Stokes::ALL {
            let offset = self.plane_offset(stokes, chan_no)?;
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| self.io_err(e))?;
            let mut writer = BufWriter::new(&self.file);
            for _ in 0..self.dims.plane_len() {
                writer
                    .write_f32::<BigEndian>(f32::NAN)
                    .map_err(|e| CubeError::Io {
                        path: self.path.clone(),
                        source: e,
                    })?;
            }
            writer.flush().map_err(|e| CubeError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// The lowest channel number whose Stokes I plane is neither entirely
    /// NaN nor entirely zero, i.e. the first channel holding real data.
    pub fn first_live_channel(&mut self) -> Result<Option<usize>, CubeError> {
        for chan_no in 1..=self.dims.n_chan {
            let plane = self.read_plane(Stokes::I, chan_no)?;
            let all_nan = plane.iter().all(|v| v.is_nan());
            let all_zero = plane.iter().all(|&v| v == 0.0);
            if !all_nan && !all_zero {
                return Ok(Some(chan_no));
            }
        }
        Ok(None)
    }

    /// Point the frequency-axis reference pixel (CRPIX3) at `chan_no`. The
    /// header is rewritten in place; its size cannot change because CRPIX3
    /// is written at allocation time.
    pub fn set_ref_channel(&mut self, chan_no: usize) -> Result<(), CubeError> {
        debug!("Updating CRPIX3 of {} to {chan_no}", self.path.display());
        if !self.header.set("CRPIX3", CardValue::Real(chan_no as f64)) {
            self.header.push(Card::real("CRPIX3", chan_no as f64));
        }
        let bytes = self.header.to_bytes();
        if bytes.len() as u64 != self.data_start {
            return Err(CubeError::HeaderFull {
                path: self.path.clone(),
            });
        }
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| self.io_err(e))?;
        self.file.write_all(&bytes).map_err(|e| self.io_err(e))
    }
}
