//! Debug PNG snapshots.

use std::path::Path;

use image::{ImageBuffer, Rgba};
use log::info;

use crate::error::{Error, Result};

/// Write pre-multiplied RGBA bytes as a PNG. The bytes are written as
/// stored, without un-multiplying.
pub fn write_png(path: &Path, width: i32, height: i32, pixels: &[u8]) -> Result<()> {
    let want = (width * height * 4) as usize;
    if pixels.len() != want {
        return Err(Error::Dump(format!(
            "pixel byte length {} does not match {}x{}",
            pixels.len(),
            width,
            height
        )));
    }
    let buffer: ImageBuffer<Rgba<u8>, _> =
        ImageBuffer::from_raw(width as u32, height as u32, pixels.to_vec())
            .ok_or_else(|| Error::Dump("buffer construction failed".into()))?;
    buffer
        .save(path)
        .map_err(|e| Error::Dump(e.to_string()))?;
    info!("dumped {}x{} image to {}", width, height, path.display());
    Ok(())
}
