//! FITS reader/writer for the primary image HDU.
//!
//! Rows are kept in file order; no vertical flip is applied.

use std::path::Path;

use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::images::{ImageDescription, ImageType, ReadImage, WriteImage};
use ndarray::Array2;

use crate::prelude::{Image, StageError, StageResult};

fn container_error(path: &Path, err: impl std::fmt::Display) -> StageError {
    StageError::Container(format!("{}: {}", path.display(), err))
}

pub fn read_primary(path: &Path) -> StageResult<Image> {
    let fptr = FitsFile::open(path).map_err(|e| container_error(path, e))?;
    let hdu = fptr.hdu(0).map_err(|e| container_error(path, e))?;

    let naxis = hdu
        .read_key::<i64>(&fptr, "NAXIS")
        .map_err(|e| container_error(path, e))?;
    if naxis != 2 {
        return Err(StageError::InvalidInput(format!(
            "{}: primary HDU has {} axes, expected 2",
            path.display(),
            naxis
        )));
    }
    let width = hdu
        .read_key::<i64>(&fptr, "NAXIS1")
        .map_err(|e| container_error(path, e))? as usize;
    let height = hdu
        .read_key::<i64>(&fptr, "NAXIS2")
        .map_err(|e| container_error(path, e))? as usize;

    // decoded values are native-endian regardless of the on-disk byte order
    let data = f64::read_image(&fptr, &hdu).map_err(|e| container_error(path, e))?;
    Array2::from_shape_vec((height, width), data).map_err(|e| container_error(path, e))
}

pub fn write_primary(path: &Path, image: &Image) -> StageResult<()> {
    let (height, width) = image.dim();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: vec![width, height],
    };
    let mut fptr = FitsFile::create(path)
        .overwrite()
        .open()
        .map_err(|e| container_error(path, e))?;
    let hdu = fptr
        .create_image("PRIMARY", &description)
        .map_err(|e| container_error(path, e))?;
    let data: Vec<f64> = image.iter().copied().collect();
    f64::write_image(&mut fptr, &hdu, &data).map_err(|e| container_error(path, e))?;
    Ok(())
}

pub fn write_mask(path: &Path, mask: &Array2<u8>) -> StageResult<()> {
    let (height, width) = mask.dim();
    let description = ImageDescription {
        data_type: ImageType::UnsignedByte,
        dimensions: vec![width, height],
    };
    let mut fptr = FitsFile::create(path)
        .overwrite()
        .open()
        .map_err(|e| container_error(path, e))?;
    let hdu = fptr
        .create_image("PRIMARY", &description)
        .map_err(|e| container_error(path, e))?;
    let data: Vec<u8> = mask.iter().copied().collect();
    u8::write_image(&mut fptr, &hdu, &data).map_err(|e| container_error(path, e))?;
    Ok(())
}
