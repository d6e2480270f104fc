//! Tensor to pixel conversion
//!
//! Decoder output is a `[1, C, H, W]` tensor in `[-1, 1]`. Each value maps to
//! a byte as `clamp(v * 0.5 + 0.5, 0, 1) * 255`, truncated.

use burn::prelude::*;
use image::{Rgb, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Expected a single image, got batch size {0}")]
    BatchSize(usize),

    #[error("Data holds {actual} values but shape {shape:?} needs {expected}")]
    Length {
        shape: [usize; 4],
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported channel count {0}, expected 1 or 3")]
    Channels(usize),

    #[error("Image dimensions {height}x{width} are too large")]
    Dimensions { height: usize, width: usize },

    #[error("Failed to read tensor data: {0}")]
    Data(String),
}

#[inline]
fn to_byte(v: f32) -> u8 {
    ((v * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0) as u8
}

/// Convert planar NCHW values in `[-1, 1]` to an RGB image
///
/// Three channels are read as R, G, B planes; a single channel is
/// replicated to grayscale.
pub fn pixels_from_nchw(data: &[f32], shape: [usize; 4]) -> Result<RgbImage, ImageError> {
    let [batch, channels, height, width] = shape;
    if batch != 1 {
        return Err(ImageError::BatchSize(batch));
    }
    let expected = channels * height * width;
    if data.len() != expected {
        return Err(ImageError::Length {
            shape,
            expected,
            actual: data.len(),
        });
    }
    if channels != 1 && channels != 3 {
        return Err(ImageError::Channels(channels));
    }
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(ImageError::Dimensions { height, width }),
    };

    let plane = height * width;
    Ok(RgbImage::from_fn(w, h, |x, y| {
        let idx = y as usize * width + x as usize;
        if channels == 3 {
            Rgb([
                to_byte(data[idx]),
                to_byte(data[plane + idx]),
                to_byte(data[2 * plane + idx]),
            ])
        } else {
            let v = to_byte(data[idx]);
            Rgb([v, v, v])
        }
    }))
}

/// Convert a decoded `[1, C, H, W]` tensor to an RGB image
pub fn tensor_to_pixels<B: Backend>(tensor: Tensor<B, 4>) -> Result<RgbImage, ImageError> {
    let shape = tensor.dims();
    let data = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ImageError::Data(format!("{e:?}")))?;
    pixels_from_nchw(&data, shape)
}

/// SD 1.x latent to RGB projection (4 channels x 3)
///
/// Coefficients from ComfyUI's latent_formats.py (GPL-3.0):
/// https://github.com/comfyanonymous/ComfyUI/blob/master/comfy/latent_formats.py
#[rustfmt::skip]
const SD15_RGB_COEFS: [f32; 12] = [
     0.3512,  0.2297,  0.3227,
     0.3250,  0.4974,  0.2350,
    -0.2829,  0.1762,  0.2721,
    -0.2120, -0.2616, -0.7177,
];

/// Convert a 4-channel latent to an RGB preview without running the decoder
///
/// Returns `[B, 3, H, W]` with values in `[0, 255]`.
pub fn latent_to_preview<B: Backend>(latent: Tensor<B, 4>) -> Result<Tensor<B, 4>, ImageError> {
    let [b, c, h, w] = latent.dims();
    if c != 4 {
        return Err(ImageError::Channels(c));
    }
    let device = latent.device();

    let coefs: Tensor<B, 2> =
        Tensor::from_data(TensorData::new(SD15_RGB_COEFS.to_vec(), [4, 3]), &device);

    // einsum "cxy,cr -> rxy"
    let flat_t = latent.reshape([b, c, h * w]).swap_dims(1, 2); // [B, H*W, C]
    let coefs_3d = coefs.unsqueeze::<3>().repeat_dim(0, b); // [B, C, 3]
    let rgb = flat_t.matmul(coefs_3d).swap_dims(1, 2).reshape([b, 3, h, w]);

    Ok(((rgb + 0.5) * 255.0).clamp(0.0, 255.0))
}

/// Convert a `[1, 3, H, W]` preview tensor in `[0, 255]` to an RGB image
pub fn preview_to_pixels<B: Backend>(preview: Tensor<B, 4>) -> Result<RgbImage, ImageError> {
    // Map [0, 255] back onto [-1, 1] so the shared conversion applies
    tensor_to_pixels(preview * (2.0 / 255.0) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_zeros_map_to_mid_gray() {
        let image = pixels_from_nchw(&[0.0; 3 * 2 * 2], [1, 3, 2, 2]).unwrap();
        assert_eq!(image.dimensions(), (2, 2));
        assert!(image.pixels().all(|p| p.0 == [127, 127, 127]));
    }

    #[test]
    fn test_value_mapping_and_clamp() {
        let data = [-1.0, 1.0, -5.0, 5.0];
        let image = pixels_from_nchw(&data, [1, 1, 2, 2]).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 1).0, [255, 255, 255]);
    }

    #[test]
    fn test_planar_layout() {
        // 1x2 image: R plane, G plane, B plane
        let data = [1.0, -1.0, -1.0, 1.0, 0.0, 0.0];
        let image = pixels_from_nchw(&data, [1, 3, 1, 2]).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 127]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 255, 127]);
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(matches!(
            pixels_from_nchw(&[0.0; 24], [2, 3, 2, 2]),
            Err(ImageError::BatchSize(2))
        ));
        assert!(matches!(
            pixels_from_nchw(&[0.0; 5], [1, 3, 2, 2]),
            Err(ImageError::Length { expected: 12, actual: 5, .. })
        ));
        assert!(matches!(
            pixels_from_nchw(&[0.0; 16], [1, 4, 2, 2]),
            Err(ImageError::Channels(4))
        ));
    }

    #[test]
    fn test_tensor_to_pixels() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 8], &device);
        let image = tensor_to_pixels(tensor).unwrap();
        assert_eq!(image.dimensions(), (8, 4));
        assert!(image.pixels().all(|p| p.0 == [127, 127, 127]));

        let batch = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 4], &device);
        assert!(matches!(
            tensor_to_pixels(batch),
            Err(ImageError::BatchSize(2))
        ));
    }

    #[test]
    fn test_latent_preview() {
        let device = Default::default();
        let latent = Tensor::<TestBackend, 4>::zeros([1, 4, 8, 8], &device);
        let preview = latent_to_preview(latent).unwrap();
        assert_eq!(preview.dims(), [1, 3, 8, 8]);

        let values = preview.clone().into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|&v| (v - 127.5).abs() < 1e-4));

        let image = preview_to_pixels(preview).unwrap();
        assert_eq!(image.dimensions(), (8, 8));

        let wrong = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        assert!(matches!(
            latent_to_preview(wrong),
            Err(ImageError::Channels(3))
        ));
    }
}
