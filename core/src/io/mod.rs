//! Image containers at the pipeline boundary.
//!
//! `.json` files hold an `ndarray` document and are always available; `.fits`, `.fit` and
//! `.fts` need the `fits` feature. Writers overwrite existing files.

#[cfg(feature = "fits")]
pub mod fits;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::Array2;

use crate::prelude::{ensure_finite, Image, Mask, StageError, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Json,
    #[cfg(feature = "fits")]
    Fits,
}

impl Container {
    fn for_path(path: &Path) -> StageResult<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "json" => Ok(Container::Json),
            #[cfg(feature = "fits")]
            "fits" | "fit" | "fts" => Ok(Container::Fits),
            #[cfg(not(feature = "fits"))]
            "fits" | "fit" | "fts" => Err(StageError::InvalidInput(format!(
                "{} is a FITS file; rebuild with the `fits` feature to read it",
                path.display()
            ))),
            other => Err(StageError::InvalidInput(format!(
                "unsupported image container '{}' for {}",
                other,
                path.display()
            ))),
        }
    }
}

/// Where an input image comes from, resolved explicitly at the call boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    FilePath(PathBuf),
    InMemory(Image),
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::FilePath(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        ImageSource::FilePath(path.to_path_buf())
    }
}

impl From<Image> for ImageSource {
    fn from(image: Image) -> Self {
        ImageSource::InMemory(image)
    }
}

impl ImageSource {
    /// Owned copy of the pixels; every value must be finite.
    pub fn load(&self) -> StageResult<Image> {
        let image = match self {
            ImageSource::FilePath(path) => read_image(path)?,
            ImageSource::InMemory(image) => image.clone(),
        };
        ensure_finite("input image", &image)?;
        Ok(image)
    }
}

pub fn read_image(path: &Path) -> StageResult<Image> {
    let image = match Container::for_path(path)? {
        Container::Json => {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader::<_, Image>(reader)?
        }
        #[cfg(feature = "fits")]
        Container::Fits => fits::read_primary(path)?,
    };
    debug!("read {:?} image from {}", image.dim(), path.display());
    Ok(image)
}

pub fn write_image(path: &Path, image: &Image) -> StageResult<()> {
    match Container::for_path(path)? {
        Container::Json => write_json(path, image),
        #[cfg(feature = "fits")]
        Container::Fits => fits::write_primary(path, image),
    }
}

/// Persists a mask as 0/1 pixels, replacing any existing file.
pub fn write_mask(path: &Path, mask: &Mask) -> StageResult<()> {
    let pixels: Array2<u8> = mask.mapv(u8::from);
    match Container::for_path(path)? {
        Container::Json => write_json(path, &pixels)?,
        #[cfg(feature = "fits")]
        Container::Fits => fits::write_mask(path, &pixels)?,
    }
    debug!("wrote {:?} mask to {}", mask.dim(), path.display());
    Ok(())
}

/// Reads a mask written by [`write_mask`]; any non-zero pixel is excluded.
pub fn read_mask(path: &Path) -> StageResult<Mask> {
    Ok(read_image(path)?.mapv(|value| value != 0.0))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> StageResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}
