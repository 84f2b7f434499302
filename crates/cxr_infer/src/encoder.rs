//! Overlay encoding with an ordered codec fallback chain.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cxr_explain::OverlayImage;
use image::{DynamicImage, ImageOutputFormat, RgbImage};

use crate::error::EncodeError;

/// Default JPEG quality.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// An image codec.
pub trait Codec: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// MIME type of the output.
    fn mime(&self) -> &'static str;

    /// Encode an RGB raster.
    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError>;
}

fn write_image(
    image: &RgbImage,
    format: ImageOutputFormat,
    codec: &'static str,
) -> Result<Vec<u8>, EncodeError> {
    let dynamic = DynamicImage::ImageRgb8(image.clone());
    let mut cursor = Cursor::new(Vec::new());
    dynamic
        .write_to(&mut cursor, format)
        .map_err(|e| EncodeError {
            codec,
            reason: e.to_string(),
        })?;
    Ok(cursor.into_inner())
}

/// Lossy JPEG at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    /// Create with `quality` in `1..=100`.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// Configured quality.
    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl Codec for JpegCodec {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn mime(&self) -> &'static str {
        "image/jpeg"
    }

    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        write_image(image, ImageOutputFormat::Jpeg(self.quality), self.name())
    }
}

/// Lossless PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngCodec;

impl Codec for PngCodec {
    fn name(&self) -> &'static str {
        "png"
    }

    fn mime(&self) -> &'static str {
        "image/png"
    }

    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        write_image(image, ImageOutputFormat::Png, self.name())
    }
}

/// Result of encoding: complete bytes with their type, or nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedPayload {
    /// Encoded image.
    Encoded {
        /// Compressed bytes.
        bytes: Vec<u8>,
        /// MIME type of `bytes`.
        mime: &'static str,
    },
    /// Every codec failed.
    Failed,
}

impl EncodedPayload {
    /// Whether encoding succeeded.
    pub fn is_encoded(&self) -> bool {
        matches!(self, EncodedPayload::Encoded { .. })
    }

    /// Encoded bytes, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            EncodedPayload::Encoded { bytes, .. } => Some(bytes.as_slice()),
            EncodedPayload::Failed => None,
        }
    }

    /// MIME type, if any.
    pub fn mime(&self) -> Option<&'static str> {
        match self {
            EncodedPayload::Encoded { mime, .. } => Some(*mime),
            EncodedPayload::Failed => None,
        }
    }

    /// `data:<mime>;base64,<payload>`, or an empty string on failure.
    pub fn to_data_url(&self) -> String {
        match self {
            EncodedPayload::Encoded { bytes, mime } => {
                format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
            }
            EncodedPayload::Failed => String::new(),
        }
    }
}

/// Tries codecs in order until one succeeds.
pub struct Encoder {
    codecs: Vec<Box<dyn Codec>>,
}

impl Default for Encoder {
    /// JPEG at quality 90, then PNG.
    fn default() -> Self {
        Self::with_jpeg_quality(DEFAULT_JPEG_QUALITY)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| c.name()))
            .finish()
    }
}

impl Encoder {
    /// Create from an explicit chain.
    pub fn new(codecs: Vec<Box<dyn Codec>>) -> Self {
        Self { codecs }
    }

    /// JPEG at `quality`, then PNG.
    pub fn with_jpeg_quality(quality: u8) -> Self {
        Self::new(vec![Box::new(JpegCodec::new(quality)), Box::new(PngCodec)])
    }

    /// Codec names in order.
    pub fn codec_names(&self) -> Vec<&'static str> {
        self.codecs.iter().map(|c| c.name()).collect()
    }

    /// Encode an overlay. Never fails outward.
    pub fn encode(&self, overlay: &OverlayImage) -> EncodedPayload {
        for codec in &self.codecs {
            match codec.encode(overlay.image()) {
                Ok(bytes) if !bytes.is_empty() => {
                    return EncodedPayload::Encoded {
                        bytes,
                        mime: codec.mime(),
                    }
                }
                Ok(_) => tracing::warn!(codec = codec.name(), "codec produced no bytes"),
                Err(e) => tracing::warn!(codec = codec.name(), error = %e, "codec failed"),
            }
        }
        tracing::error!("all codecs failed, heatmap omitted");
        EncodedPayload::Failed
    }
}
