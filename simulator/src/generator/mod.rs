pub mod psf;
pub mod scene;
