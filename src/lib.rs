// Kaiga 2D rendering core

pub mod config;
pub mod error;
pub mod geom;
pub mod graphics;
pub mod threading;

pub use config::GraphicsConfig;
pub use error::{Error, Result};
pub use graphics::{
    CompositeMode, Context, DrawImageOptions, DrawTrianglesOptions, Geom, Image, ImageOptions,
    SoftwareGraphics,
};
pub use threading::{main_thread, MainThread, MainThreadHandle};
