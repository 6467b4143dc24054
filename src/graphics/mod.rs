//!
//! Rendering pipeline: drivers, command queue, restoration, atlas, and
//! the public image API.

pub mod atlas;
pub mod blend;
pub mod command;
pub mod driver;
pub mod dump;
pub mod image;
pub mod opengl;
pub mod packing;
pub mod restorable;
pub mod shader;
pub mod software;
pub mod vertex;

use std::ffi::c_void;

use driver::{DriverError, DriverResult};
use opengl::GlGraphics;

pub use atlas::ImageOptions;
pub use blend::CompositeMode;
pub use driver::{Address, BackendKind, FillRule, Filter, Graphics};
pub use image::{
    Context, DrawImageOptions, DrawTrianglesOptions, Geom, Image, Shader, SharedContext,
};
pub use shader::{ShaderSource, SoftwareFragment, SourceSampler, Uniforms};
pub use software::SoftwareGraphics;
pub use vertex::Vertex;

/// Build the driver a config asks for. The loader resolves GL entry
/// points and is ignored by the software backend. Metal is recognized
/// but not built here.
pub fn new_driver<F>(kind: BackendKind, loader: F) -> DriverResult<Box<dyn Graphics>>
where
    F: FnMut(&str) -> *const c_void,
{
    match kind {
        BackendKind::Software => Ok(Box::new(SoftwareGraphics::new())),
        BackendKind::OpenGl => Ok(Box::new(GlGraphics::new(loader)?)),
        BackendKind::Metal => Err(DriverError::UnsupportedBackend(BackendKind::Metal)),
    }
}
