//! BGRA region encoding into pooled JPEG tiles.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageReader};
use thiserror::Error;

use glimpse_capture::buffer::SharedBuffer;
use glimpse_capture::frame::{GrabContent, BYTES_PER_PIXEL};
use glimpse_capture::pool::BufferPool;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("jpeg codec: {0}")]
    Codec(#[from] image::ImageError),
    #[error("region pixel length {actual} does not match {w}x{h}")]
    PixelLengthMismatch { actual: usize, w: u32, h: u32 },
}

/// One independently decodable JPEG tile of a frame.
#[derive(Debug, Clone)]
pub struct EncodedRegion {
    /// A keyframe region covers the entire frame and resets the
    /// viewer's canvas.
    pub is_keyframe: bool,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub jpeg: SharedBuffer,
}

/// Stateless JPEG encoder for grab results.
pub struct FrameEncoder {
    quality: u8,
    pool: Arc<BufferPool>,
}

impl FrameEncoder {
    #[must_use]
    pub fn new(quality: u8, pool: Arc<BufferPool>) -> Self {
        Self { quality, pool }
    }

    #[must_use]
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode a grab into JPEG regions.
    ///
    /// A full frame yields a single keyframe region at the origin; a
    /// region grab yields one delta region per dirty rectangle. Move
    /// regions carry no pixels and are not encoded.
    pub fn process_frame(
        &self,
        content: GrabContent,
        width: u32,
        height: u32,
    ) -> Result<Vec<EncodedRegion>, EncodeError> {
        match content {
            GrabContent::FullFrame(pixels) => {
                let jpeg = self.encode_tile(pixels.as_slice(), width, height)?;
                Ok(vec![EncodedRegion {
                    is_keyframe: true,
                    x: 0,
                    y: 0,
                    w: width,
                    h: height,
                    jpeg,
                }])
            }
            GrabContent::Regions { dirty, .. } => {
                let mut out = Vec::with_capacity(dirty.len());
                for region in dirty {
                    let jpeg = self.encode_tile(region.pixels.as_slice(), region.w, region.h)?;
                    out.push(EncodedRegion {
                        is_keyframe: false,
                        x: region.x,
                        y: region.y,
                        w: region.w,
                        h: region.h,
                        jpeg,
                    });
                }
                Ok(out)
            }
        }
    }

    fn encode_tile(&self, bgra: &[u8], w: u32, h: u32) -> Result<SharedBuffer, EncodeError> {
        let expected = (w * h) as usize * BYTES_PER_PIXEL;
        if bgra.len() != expected {
            return Err(EncodeError::PixelLengthMismatch {
                actual: bgra.len(),
                w,
                h,
            });
        }

        // JPEG carries no alpha; swizzle BGRA to RGB.
        let mut rgb = vec![0u8; (w * h) as usize * 3];
        for (src, dst) in bgra.chunks_exact(BYTES_PER_PIXEL).zip(rgb.chunks_exact_mut(3)) {
            dst[0] = src[2];
            dst[1] = src[1];
            dst[2] = src[0];
        }

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, self.quality).encode(
            &rgb,
            w,
            h,
            ExtendedColorType::Rgb8,
        )?;

        let mut tile = self.pool.rent(encoded.len());
        tile.as_mut_slice()
            .expect("freshly rented buffer is unique")
            .copy_from_slice(&encoded);
        Ok(tile)
    }
}

/// Decode a JPEG tile back into tightly packed BGRA.
///
/// Used by the viewer compositor; lives here so encode and decode stay
/// one concern.
pub fn decode_bgra(jpeg: &[u8]) -> Result<(Vec<u8>, u32, u32), EncodeError> {
    let img = ImageReader::new(Cursor::new(jpeg))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?;
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();

    let mut bgra = vec![0u8; (w * h) as usize * BYTES_PER_PIXEL];
    for (src, dst) in rgb
        .as_raw()
        .chunks_exact(3)
        .zip(bgra.chunks_exact_mut(BYTES_PER_PIXEL))
    {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
        dst[3] = 0xFF;
    }
    Ok((bgra, w, h))
}
