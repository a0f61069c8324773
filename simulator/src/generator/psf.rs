use anyhow::bail;
use ndarray::Array2;
use sbfcore::Image;

/// Unit-sum circular Gaussian PSF on an odd `size × size` stamp centered on the middle pixel.
pub fn gaussian_psf(size: usize, sigma: f64) -> anyhow::Result<Image> {
    if size % 2 == 0 {
        bail!("PSF stamp size must be odd, got {}", size);
    }
    if !(sigma.is_finite() && sigma > 0.0) {
        bail!("PSF sigma must be positive, got {}", sigma);
    }
    let center = (size / 2) as f64;
    let inv_two_var = 0.5 / (sigma * sigma);
    let mut psf = Array2::from_shape_fn((size, size), |(row, col)| {
        let dy = row as f64 - center;
        let dx = col as f64 - center;
        (-(dx * dx + dy * dy) * inv_two_var).exp()
    });
    let total = psf.sum();
    psf.mapv_inplace(|value| value / total);
    Ok(psf)
}
