//! Heatmap overlay compositing.

use std::fmt;
use std::str::FromStr;

use cxr_transforms::ImageSample;
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::attribution::ActivationMap;

/// Default weight of the source image in the blend.
pub const DEFAULT_IMAGE_WEIGHT: f32 = 0.5;

/// Color ramp mapping `[0, 1]` importance to RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRamp {
    /// Blue to red through cyan and yellow (OpenCV `COLORMAP_JET`).
    #[default]
    Jet,
    /// Black to white through red and yellow.
    Hot,
    /// Black to white.
    Grayscale,
}

impl ColorRamp {
    /// Map an importance value to RGB components in `[0, 1]`.
    pub fn map(&self, value: f32) -> [f32; 3] {
        let v = value.clamp(0.0, 1.0);
        match self {
            ColorRamp::Jet => [
                (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0),
                (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0),
                (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0),
            ],
            ColorRamp::Hot => [
                (3.0 * v).clamp(0.0, 1.0),
                (3.0 * v - 1.0).clamp(0.0, 1.0),
                (3.0 * v - 2.0).clamp(0.0, 1.0),
            ],
            ColorRamp::Grayscale => [v, v, v],
        }
    }
}

impl fmt::Display for ColorRamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColorRamp::Jet => "jet",
            ColorRamp::Hot => "hot",
            ColorRamp::Grayscale => "grayscale",
        };
        f.write_str(name)
    }
}

impl FromStr for ColorRamp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jet" => Ok(ColorRamp::Jet),
            "hot" => Ok(ColorRamp::Hot),
            "grayscale" | "gray" | "grey" => Ok(ColorRamp::Grayscale),
            other => Err(format!("unknown color ramp '{}'", other)),
        }
    }
}

/// Overlay blending parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Weight of the source image; the heatmap gets `1 - image_weight`.
    pub image_weight: f32,
    /// Heatmap colors.
    pub ramp: ColorRamp,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            image_weight: DEFAULT_IMAGE_WEIGHT,
            ramp: ColorRamp::Jet,
        }
    }
}

impl OverlayConfig {
    /// Set the image weight, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_image_weight(mut self, image_weight: f32) -> Self {
        self.image_weight = image_weight.clamp(0.0, 1.0);
        self
    }

    /// Set the color ramp.
    #[must_use]
    pub fn with_ramp(mut self, ramp: ColorRamp) -> Self {
        self.ramp = ramp;
        self
    }
}

/// Composited RGB overlay at the activation map's resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayImage(RgbImage);

impl OverlayImage {
    /// Wrap a raster.
    pub fn new(image: RgbImage) -> Self {
        Self(image)
    }

    /// Borrow the raster.
    pub fn image(&self) -> &RgbImage {
        &self.0
    }

    /// Take the raster.
    pub fn into_image(self) -> RgbImage {
        self.0
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.0.height()
    }
}

/// Blends colorized activation maps onto source images.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compositor {
    config: OverlayConfig,
}

impl Compositor {
    /// Create a compositor.
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    /// Blend parameters.
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Resize `sample` to the map's size and blend the colorized map over it.
    ///
    /// `out = (1 - w) * heat + w * image`, then rescaled so the brightest
    /// channel value reaches full scale.
    pub fn composite(&self, sample: &ImageSample, map: &ActivationMap) -> OverlayImage {
        let (width, height) = (map.width(), map.height());
        let base = if width == height {
            sample.resized(width)
        } else {
            image::imageops::resize(
                sample.image(),
                width as u32,
                height as u32,
                image::imageops::FilterType::Triangle,
            )
        };

        let w = self.config.image_weight;
        let mut blended = Vec::with_capacity(width * height * 3);
        for (idx, pixel) in base.pixels().enumerate() {
            let heat = self.config.ramp.map(map.values()[idx]);
            for (c, h) in heat.iter().enumerate() {
                let source = pixel[c] as f32 / 255.0;
                blended.push((1.0 - w) * h + w * source);
            }
        }

        let peak = blended.iter().cloned().fold(0.0f32, f32::max);
        let scale = if peak > 0.0 { 255.0 / peak } else { 255.0 };

        let overlay = RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let base = (y as usize * width + x as usize) * 3;
            let channel = |c: usize| (blended[base + c] * scale).round().clamp(0.0, 255.0) as u8;
            Rgb([channel(0), channel(1), channel(2)])
        });
        OverlayImage(overlay)
    }
}
