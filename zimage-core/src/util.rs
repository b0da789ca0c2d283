use std::io::Cursor;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Standard-normal latent noise for a `height`x`width` image, drawn from `seed`.
///
/// Sampled on the host so a seed gives the same noise on every backend.
pub fn seeded_noise(
    seed: u64,
    height: usize,
    width: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let h = height.div_ceil(16) * 2;
    let w = width.div_ceil(16) * 2;
    let len = 16 * h * w;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        // Box-Muller
        let u1: f32 = rng.random::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.random::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        values.push(r * theta.cos());
        values.push(r * theta.sin());
    }
    values.truncate(len);
    Ok(Tensor::from_vec(values, (1, 16, h, w), device)?.to_dtype(dtype)?)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// PNG preview whose longest side is at most `max_side` pixels.
pub fn thumbnail_png(img: &DynamicImage, max_side: u32) -> Result<Vec<u8>> {
    if img.width() <= max_side && img.height() <= max_side {
        return encode_png(img);
    }
    encode_png(&img.resize(max_side, max_side, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_is_seeded() {
        let a = seeded_noise(42, 96, 64, DType::F32, &Device::Cpu).unwrap();
        let b = seeded_noise(42, 96, 64, DType::F32, &Device::Cpu).unwrap();
        let c = seeded_noise(43, 96, 64, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(a.dims(), &[1, 16, 12, 8]);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_thumbnail_is_bounded() {
        let img = DynamicImage::new_rgb8(1280, 720);
        let png = thumbnail_png(&img, 256).unwrap();
        let thumb = image::load_from_memory(&png).unwrap();
        assert_eq!(thumb.width(), 256);
        assert!(thumb.height() <= 256);
    }

    #[test]
    fn test_tensor_to_image_rejects_gray() {
        let t = Tensor::zeros((1, 4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
    }
}
