//! Pixel formats and multisample descriptions.

use serde::{Deserialize, Serialize};

/// Texel formats understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgb10a2Unorm,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,
}

impl Format {
    /// Whether the format carries a depth component.
    pub const fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D16Unorm | Self::D24UnormS8Uint | Self::D32Float | Self::D32FloatS8Uint
        )
    }

    /// Whether the format carries a stencil component.
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint | Self::D32FloatS8Uint)
    }

    /// Whether the format can back a colour render target.
    pub const fn is_color(self) -> bool {
        !self.is_depth()
    }

    /// Whether the format can be handed to the display pipeline.
    pub const fn is_presentable(self) -> bool {
        matches!(
            self,
            Self::Rgba8Unorm
                | Self::Rgba8UnormSrgb
                | Self::Bgra8Unorm
                | Self::Bgra8UnormSrgb
                | Self::Rgba16Float
                | Self::Rgb10a2Unorm
        )
    }
}

/// Sample count and quality pair for a multisampled resource.
///
/// `quality` is zero-indexed: a device reporting `n` quality levels accepts
/// values in `0..n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleDesc {
    pub count: u32,
    pub quality: u32,
}

impl SampleDesc {
    /// One sample, quality zero.
    pub const SINGLE: Self = Self {
        count: 1,
        quality: 0,
    };

    /// Create a sample description.
    pub const fn new(count: u32, quality: u32) -> Self {
        Self { count, quality }
    }

    /// Whether more than one sample is taken per pixel.
    pub const fn is_multisampled(self) -> bool {
        self.count > 1
    }
}

impl Default for SampleDesc {
    fn default() -> Self {
        Self::SINGLE
    }
}

/// Whether `count` is a sample count any backend may accept.
pub const fn is_valid_sample_count(count: u32) -> bool {
    matches!(count, 1 | 2 | 4 | 8 | 16)
}
