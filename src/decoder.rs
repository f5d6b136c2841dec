use image::{Pixel, Rgb, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Empty image payload")]
    Empty,
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Error decoding image: {0}")]
    Corrupt(String),
}

/// Decoded upload, always normalized to 8-bit RGB.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn channels(&self) -> u8 {
        Rgb::<u8>::CHANNEL_COUNT
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }
}

pub fn decode(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let image_reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;

    if image_reader.format().is_none() {
        return Err(DecodeError::UnsupportedFormat(
            "unrecognized image container".to_string(),
        ));
    }

    let image = image_reader.decode().map_err(|e| match e {
        image::ImageError::Unsupported(u) => DecodeError::UnsupportedFormat(u.to_string()),
        other => DecodeError::Corrupt(other.to_string()),
    })?;

    Ok(DecodedImage::new(image.to_rgb8()))
}
