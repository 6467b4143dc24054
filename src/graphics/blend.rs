//! Composite modes and blend factors.
//!
//! Every composite mode names a fixed (source factor, destination factor)
//! pair over pre-multiplied colors:
//!
//! `out = src * src_factor + dst * dst_factor`
//!
//! The naming follows CSS compositing.

use std::fmt;

/// A factor applied to the source or destination color before summing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SourceAlpha,
    DestinationAlpha,
    OneMinusSourceAlpha,
    OneMinusDestinationAlpha,
    /// Per-channel factor: the destination color itself.
    DestinationColor,
}

impl BlendFactor {
    /// Evaluate the factor for one channel. `src` and `dst` are the
    /// pre-multiplied source and destination pixels in [0, 1];
    /// `dst_channel` is the destination value of the channel being blended.
    #[must_use]
    pub fn eval(self, src_alpha: f32, dst_alpha: f32, dst_channel: f32) -> f32 {
        match self {
            Self::Zero => 0.0,
            Self::One => 1.0,
            Self::SourceAlpha => src_alpha,
            Self::DestinationAlpha => dst_alpha,
            Self::OneMinusSourceAlpha => 1.0 - src_alpha,
            Self::OneMinusDestinationAlpha => 1.0 - dst_alpha,
            Self::DestinationColor => dst_channel,
        }
    }
}

/// Closed enumeration of the supported composite modes.
///
/// The default is `SourceOver` (regular alpha blending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompositeMode {
    #[default]
    SourceOver,
    Clear,
    Copy,
    Destination,
    DestinationOver,
    SourceIn,
    DestinationIn,
    SourceOut,
    DestinationOut,
    SourceAtop,
    DestinationAtop,
    Xor,
    Lighter,
    Multiply,
}

impl CompositeMode {
    pub const ALL: [CompositeMode; 14] = [
        Self::SourceOver,
        Self::Clear,
        Self::Copy,
        Self::Destination,
        Self::DestinationOver,
        Self::SourceIn,
        Self::DestinationIn,
        Self::SourceOut,
        Self::DestinationOut,
        Self::SourceAtop,
        Self::DestinationAtop,
        Self::Xor,
        Self::Lighter,
        Self::Multiply,
    ];

    /// The (source factor, destination factor) pair for this mode.
    #[must_use]
    pub const fn factors(self) -> (BlendFactor, BlendFactor) {
        use BlendFactor::*;
        match self {
            Self::SourceOver => (One, OneMinusSourceAlpha),
            Self::Clear => (Zero, Zero),
            Self::Copy => (One, Zero),
            Self::Destination => (Zero, One),
            Self::DestinationOver => (OneMinusDestinationAlpha, One),
            Self::SourceIn => (DestinationAlpha, Zero),
            Self::DestinationIn => (Zero, SourceAlpha),
            Self::SourceOut => (OneMinusDestinationAlpha, Zero),
            Self::DestinationOut => (Zero, OneMinusSourceAlpha),
            Self::SourceAtop => (DestinationAlpha, OneMinusSourceAlpha),
            Self::DestinationAtop => (OneMinusDestinationAlpha, SourceAlpha),
            Self::Xor => (OneMinusDestinationAlpha, OneMinusSourceAlpha),
            Self::Lighter => (One, One),
            Self::Multiply => (DestinationColor, Zero),
        }
    }
}

impl fmt::Display for CompositeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SourceOver => "source-over",
            Self::Clear => "clear",
            Self::Copy => "copy",
            Self::Destination => "destination",
            Self::DestinationOver => "destination-over",
            Self::SourceIn => "source-in",
            Self::DestinationIn => "destination-in",
            Self::SourceOut => "source-out",
            Self::DestinationOut => "destination-out",
            Self::SourceAtop => "source-atop",
            Self::DestinationAtop => "destination-atop",
            Self::Xor => "xor",
            Self::Lighter => "lighter",
            Self::Multiply => "multiply",
        };
        f.write_str(name)
    }
}

/// Blend one pre-multiplied RGBA pixel over another.
///
/// `src` and `dst` are pre-multiplied 8-bit channels. This is the reference
/// blender: the software backend uses it pixel by pixel, and the
/// composite-mode tests compare every backend result against it.
#[must_use]
pub fn blend_rgba8(mode: CompositeMode, src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    let (sf, df) = mode.factors();
    let s: [f32; 4] = [
        src[0] as f32 / 255.0,
        src[1] as f32 / 255.0,
        src[2] as f32 / 255.0,
        src[3] as f32 / 255.0,
    ];
    let d: [f32; 4] = [
        dst[0] as f32 / 255.0,
        dst[1] as f32 / 255.0,
        dst[2] as f32 / 255.0,
        dst[3] as f32 / 255.0,
    ];
    let mut out = [0u8; 4];
    for ch in 0..4 {
        let sfv = sf.eval(s[3], d[3], d[ch]);
        let dfv = df.eval(s[3], d[3], d[ch]);
        let v = (s[ch] * sfv + d[ch] * dfv).clamp(0.0, 1.0);
        out[ch] = (v * 255.0 + 0.5) as u8;
    }
    out
}
