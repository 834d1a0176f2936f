//! Reads the attribute table and the imaging volumes

use crate::structs::{Attributes, DecodeError, Result};
use csv::ReaderBuilder;
use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// Locations of the three input files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub attributes: PathBuf,
    pub bold: PathBuf,
    pub mask: PathBuf,
}

impl DataPaths {
    /// Resolve file names relative to `dir`
    #[must_use]
    pub fn in_dir(dir: &Path, attributes: &Path, bold: &Path, mask: &Path) -> Self {
        Self {
            attributes: dir.join(attributes),
            bold: dir.join(bold),
            mask: dir.join(mask),
        }
    }

    /// # Errors
    /// Returns `Load` error naming the first missing file
    pub fn check_exist(&self) -> Result<()> {
        for path in [&self.attributes, &self.bold, &self.mask] {
            if !path.exists() {
                return Err(DecodeError::Load(format!(
                    "input file not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Raw inputs, shape-checked against each other
#[derive(Debug, Clone)]
pub struct RawInputs {
    pub attributes: Attributes,
    pub volume: Array4<f64>,
    pub mask: Array3<f64>,
}

/// Parse one integer attribute; finite floats are truncated toward zero
#[allow(clippy::cast_possible_truncation)]
fn parse_attribute(value: &str, line: u64) -> Result<i64> {
    if let Ok(v) = value.parse::<i64>() {
        return Ok(v);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v.trunc() as i64),
        Ok(_) => Err(DecodeError::Load(format!(
            "line {line}: '{value}' is not a finite number"
        ))),
        Err(_) => Err(DecodeError::Load(format!("line {line}: '{value}' is not a number"))),
    }
}

impl Attributes {
    /// Parse a whitespace-delimited `label session` table
    ///
    /// # Errors
    /// Returns error if the file cannot be read or a row is malformed
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_path(path)?;

        let mut labels = Vec::new();
        let mut sessions = Vec::new();

        for result in reader.records() {
            let record = result?;
            let line = record.position().map_or(0, csv::Position::line);
            let values: Vec<&str> = record
                .iter()
                .flat_map(|field| field.split_whitespace())
                .collect();

            if values.is_empty() {
                continue;
            }
            if values.len() != 2 {
                return Err(DecodeError::Load(format!(
                    "{} line {line}: expected 2 values (label session), found {}",
                    path.display(),
                    values.len()
                )));
            }

            labels.push(parse_attribute(values[0], line)?);
            sessions.push(parse_attribute(values[1], line)?);
        }

        if labels.is_empty() {
            return Err(DecodeError::Load(format!(
                "{} contains no attribute rows",
                path.display()
            )));
        }

        Ok(Self { labels, sessions })
    }
}

fn read_nifti(path: &Path) -> Result<ArrayD<f64>> {
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| DecodeError::Load(format!("{}: {e}", path.display())))?;
    object
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| DecodeError::Load(format!("{}: {e}", path.display())))
}

/// Read a 4-D (x, y, z, t) series; a 3-D image is a single volume
///
/// # Errors
/// Returns `Load` error if the file cannot be read or is not 3-D/4-D
pub fn load_volume(path: &Path) -> Result<Array4<f64>> {
    let array = read_nifti(path)?;
    let array = match array.ndim() {
        3 => array.insert_axis(Axis(3)),
        4 => array,
        n => {
            return Err(DecodeError::Load(format!(
                "{}: expected a 4-D series, found {n}-D",
                path.display()
            )))
        }
    };
    array
        .into_dimensionality::<Ix4>()
        .map_err(|e| DecodeError::Load(format!("{}: {e}", path.display())))
}

/// Read a 3-D mask; a 4-D mask must have a single frame
///
/// # Errors
/// Returns `Load` error if the file cannot be read or has the wrong shape
pub fn load_mask(path: &Path) -> Result<Array3<f64>> {
    let array = read_nifti(path)?;
    let shape = array.shape().to_vec();
    let array = match shape.as_slice() {
        [_, _, _] => array,
        [_, _, _, 1] => array.index_axis_move(Axis(3), 0),
        shape => {
            return Err(DecodeError::Load(format!(
                "{}: expected a 3-D mask, found shape {shape:?}",
                path.display()
            )))
        }
    };
    array
        .into_dimensionality::<Ix3>()
        .map_err(|e| DecodeError::Load(format!("{}: {e}", path.display())))
}

/// Load all three inputs and check that their shapes agree
///
/// # Errors
/// Returns `Load` error on a missing/malformed file or any shape mismatch
pub fn load_inputs(paths: &DataPaths) -> Result<RawInputs> {
    paths.check_exist()?;

    let attributes = Attributes::from_file(&paths.attributes)?;
    let volume = load_volume(&paths.bold)?;
    let mask = load_mask(&paths.mask)?;

    let (nx, ny, nz, nt) = volume.dim();
    info!(
        "Loaded {nt} volumes of {nx}x{ny}x{nz} voxels and {} attribute rows",
        attributes.len()
    );

    if mask.dim() != (nx, ny, nz) {
        return Err(DecodeError::Load(format!(
            "mask {} has shape {:?} but {} volumes are {:?}",
            paths.mask.display(),
            mask.dim(),
            paths.bold.display(),
            (nx, ny, nz)
        )));
    }
    if attributes.len() != nt {
        return Err(DecodeError::Load(format!(
            "{} has {} rows but {} holds {nt} volumes",
            paths.attributes.display(),
            attributes.len(),
            paths.bold.display()
        )));
    }

    Ok(RawInputs {
        attributes,
        volume,
        mask,
    })
}
