//! Processing parameters, their lenient normalisation, and cache keys.
//!
//! Invalid overrides never fail a submission: they silently fall back to the
//! configured default (and an invalid default falls back to the built-in one).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};

use crate::config::UpscalerSettings;

/// Scale factors the upscaler accepts.
pub const ALLOWED_SCALES: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Inclusive denoise range; `-1` disables denoising.
pub const NOISE_RANGE: (i32, i32) = (-1, 3);

const FALLBACK_SCALE: u32 = 2;
const FALLBACK_NOISE: i32 = 1;

/// Output image encoding.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    #[default]
    Jpg,
    Png,
    Webp,
}

impl OutputFormat {
    /// File extension, also the value passed to the upscaler's `-f` flag.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpg => "image/jpeg",
        }
    }
}

/// Fully populated, validated parameter set for one task.
///
/// Stored as JSON in the `params` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscaleParams {
    pub scale: u32,
    pub noise: i32,
    pub tile: String,
    pub model: String,
    pub gpu: String,
    pub threads: String,
    pub format: OutputFormat,
    pub tta: bool,
}

/// Caller-supplied, loosely typed overrides.
///
/// Strings are accepted for `format` so that unknown values can fall back to
/// the default instead of failing deserialisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamOverrides {
    pub scale: Option<f64>,
    pub noise: Option<f64>,
    pub tile: Option<String>,
    pub model: Option<String>,
    pub gpu: Option<String>,
    pub threads: Option<String>,
    pub format: Option<String>,
    pub tta: Option<bool>,
}

impl UpscaleParams {
    /// Merge `overrides` over `defaults`, normalising every field.
    pub fn resolve(defaults: &UpscalerSettings, overrides: &ParamOverrides) -> Self {
        let default_scale = normalize_scale(f64::from(defaults.scale), FALLBACK_SCALE);
        let default_noise = normalize_noise(f64::from(defaults.noise), FALLBACK_NOISE);

        Self {
            scale: overrides
                .scale
                .map_or(default_scale, |s| normalize_scale(s, default_scale)),
            noise: overrides
                .noise
                .map_or(default_noise, |n| normalize_noise(n, default_noise)),
            tile: non_empty(overrides.tile.as_deref()).unwrap_or(&defaults.tile).to_owned(),
            model: non_empty(overrides.model.as_deref()).unwrap_or(&defaults.model).to_owned(),
            gpu: non_empty(overrides.gpu.as_deref()).unwrap_or(&defaults.gpu).to_owned(),
            threads: non_empty(overrides.threads.as_deref())
                .unwrap_or(&defaults.threads)
                .to_owned(),
            format: overrides
                .format
                .as_deref()
                .and_then(|f| f.trim().parse().ok())
                .unwrap_or(defaults.format),
            tta: overrides.tta.unwrap_or(defaults.tta),
        }
    }

    /// The output-affecting subset of the parameters, in a fixed order.
    ///
    /// Tile size, GPU selector and thread topology only change how the work
    /// is executed, not the resulting image, so they are left out.
    pub fn canonical(&self) -> String {
        [
            format!("s{}", self.scale),
            format!("n{}", self.noise),
            self.format.to_string(),
            self.model.clone(),
            if self.tta { "tta" } else { "no-tta" }.to_owned(),
        ]
        .join(":")
    }
}

/// Hex SHA-256 digest of the raw input bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Cache key: content hash joined with the canonical parameter string.
pub fn cache_key(image_hash: &str, params: &UpscaleParams) -> String {
    format!("{image_hash}:{}", params.canonical())
}

fn normalize_scale(value: f64, fallback: u32) -> u32 {
    if !value.is_finite() || value.fract() != 0.0 {
        return fallback;
    }
    ALLOWED_SCALES
        .iter()
        .copied()
        .find(|s| f64::from(*s) == value)
        .unwrap_or(fallback)
}

fn normalize_noise(value: f64, fallback: i32) -> i32 {
    if !value.is_finite() {
        return fallback;
    }
    let (lo, hi) = NOISE_RANGE;
    value.round().clamp(f64::from(lo), f64::from(hi)) as i32
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
