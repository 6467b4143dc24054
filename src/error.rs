//! Crate-level error type.
//!
//! Subsystems carry their own error enums; this aggregates them at the
//! public API boundary.

use thiserror::Error;

use crate::config::ConfigError;
use crate::graphics::driver::DriverError;
use crate::threading::ThreadError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    /// An operation referenced a disposed image.
    #[error("image was already disposed")]
    ImageDisposed,

    /// Image creation with dimensions outside `1..=max_image_size`.
    #[error("invalid image size {width}x{height} (max {max})")]
    InvalidImageSize { width: i32, height: i32, max: i32 },

    /// A pixel rectangle reaches outside the target image.
    #[error("region {0} out of image bounds")]
    RegionOutOfBounds(String),

    /// `replace_pixels` byte length does not match the region area.
    #[error("pixel byte length {got} does not match region area {want}")]
    PixelLengthMismatch { got: usize, want: usize },

    /// A triangle index is out of range or the index count is not a
    /// multiple of three.
    #[error("malformed indices: {0}")]
    MalformedIndices(String),

    /// A shader draw supplied the wrong number of uniform words.
    #[error("uniform word count {got} does not match shader contract {want}")]
    UniformMismatch { got: usize, want: usize },

    /// A coordinate lies outside the image.
    #[error("coordinate ({x}, {y}) out of bounds")]
    OutOfBounds { x: i32, y: i32 },

    /// Debug image dump failed.
    #[error("image dump failed: {0}")]
    Dump(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_is_transparent() {
        let err: Error = DriverError::ContextLost.into();
        assert_eq!(err.to_string(), "GPU context lost");
    }

    #[test]
    fn messages() {
        let err = Error::InvalidImageSize {
            width: 0,
            height: 10,
            max: 4096,
        };
        assert_eq!(err.to_string(), "invalid image size 0x10 (max 4096)");
    }
}
