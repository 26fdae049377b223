//! Image preprocessing.
//!
//! Normalizes any input image into the fixed encoding the engine expects:
//! 8-bit RGB, longest side capped (768 px by default), re-encoded as JPEG in
//! memory. Nothing is written back to disk.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageReader};

use crate::config::PreprocessSettings;
use crate::error::PreprocessError;

/// An image ready to hand to the inference engine.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub source: PathBuf,
    pub width: u32,
    pub height: u32,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    settings: PreprocessSettings,
}

impl ImagePreprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings }
    }

    pub fn prepare(&self, path: &Path) -> Result<EncodedImage, PreprocessError> {
        if !path.exists() {
            return Err(PreprocessError::NotFound(path.to_path_buf()));
        }

        let decoded = ImageReader::open(path)
            .map_err(|source| PreprocessError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .with_guessed_format()
            .map_err(|source| PreprocessError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .decode()
            .map_err(|source| PreprocessError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

        let resized = fit_within(decoded, self.settings.max_side);
        let rgb = match resized {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        };

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(Cursor::new(&mut bytes), self.settings.jpeg_quality)
            .encode_image(&rgb)
            .map_err(|source| PreprocessError::Encode {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(EncodedImage {
            source: path.to_path_buf(),
            width: rgb.width(),
            height: rgb.height(),
            mime: "image/jpeg",
            bytes,
        })
    }
}

/// Downsample so neither side exceeds `max_side`, keeping the aspect ratio.
/// Images already within bounds are returned untouched.
fn fit_within(image: DynamicImage, max_side: u32) -> DynamicImage {
    if image.width().max(image.height()) <= max_side {
        return image;
    }
    // 16-bit and float images are narrowed first so the filter runs on 8-bit data.
    let image = match image.color() {
        ColorType::Rgb8 | ColorType::Rgba8 | ColorType::L8 | ColorType::La8 => image,
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    };
    image.resize(max_side, max_side, FilterType::Lanczos3)
}
