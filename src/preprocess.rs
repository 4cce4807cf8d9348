use std::path::Path;

use image::{imageops::FilterType, DynamicImage, Rgba};
use ndarray::{s, Array3, Array4, Axis, ShapeError};
use thiserror::Error;

pub const TARGET_SIZE: u32 = 224;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("{0}")]
    Decode(#[from] image::ImageError),
    #[error("{0}")]
    Shape(#[from] ShapeError),
}

/// Decodes the stored upload and turns it into a `[1, 224, 224, 3]` batch.
pub fn load_batch(path: &Path) -> Result<Array4<f32>, PreprocessError> {
    let image = image::io::Reader::open(path)
        .map_err(image::ImageError::IoError)?
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?;
    to_batch(&image)
}

/// Squashes the image to 224x224 regardless of aspect ratio, drops alpha and
/// scales every channel into `[0, 1]`.
pub fn to_batch(image: &DynamicImage) -> Result<Array4<f32>, PreprocessError> {
    let size = TARGET_SIZE as usize;
    let mut rgba = image
        .resize_exact(TARGET_SIZE, TARGET_SIZE, FilterType::Triangle)
        .to_rgba8();
    rgba.pixels_mut().for_each(premultiply_round_trip);

    let pixels = Array3::from_shape_vec((size, size, 4), rgba.into_raw())?;
    let rgb = pixels.slice(s![.., .., ..3]).mapv(|v| f32::from(v) / 255.0);
    Ok(rgb.insert_axis(Axis(0)))
}

/// Reads a pixel back the way a premultiplied-alpha canvas does: colour is
/// stored scaled by alpha and divided out again on readback, so fully
/// transparent pixels come back black.
fn premultiply_round_trip(pixel: &mut Rgba<u8>) {
    let alpha = f32::from(pixel[3]);
    for c in pixel.0[..3].iter_mut() {
        *c = if alpha == 0.0 {
            0
        } else {
            let stored = (f32::from(*c) * alpha / 255.0).round();
            (stored * 255.0 / alpha).round().min(255.0) as u8
        };
    }
}
