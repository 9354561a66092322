use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// Pixel storage of a texture or pass target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TextureFormat {
    /// 8-bit normalized RGBA. Host name `"RGBA"`.
    #[default]
    Rgba8,
    /// 32-bit float RGBA, opt-in for `FLOAT` passes. Host name `"RGBA32F"`.
    Rgba32F,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba32F => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextureFormat::Rgba8 => "RGBA",
            TextureFormat::Rgba32F => "RGBA32F",
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextureFormat {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RGBA" | "rgba" | "RGBA8" | "rgba8" => Ok(TextureFormat::Rgba8),
            "RGBA32F" | "rgba32f" => Ok(TextureFormat::Rgba32F),
            other => Err(ResourceError::UnsupportedFormat(other.to_string())),
        }
    }
}
