//! Graphics driver abstraction.
//!
//! Every backend implements the [`Graphics`] trait: texture management,
//! vertex buffer upload, draw calls with fixed blend factor pairs, pixel
//! upload/readback, and context-loss reporting. Higher layers never see
//! the underlying GPU API.

use std::fmt;

use crate::geom::Rect;
use crate::graphics::blend::CompositeMode;
use crate::graphics::shader::ShaderSource;

/// Error types for driver operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Driver not initialized.
    NotInitialized,
    /// The requested backend is not available in this build.
    UnsupportedBackend(BackendKind),
    /// The GPU context was lost; the restorable layer must replay.
    ContextLost,
    /// A texture id does not name a live texture.
    InvalidTexture(TextureId),
    /// A shader id does not name a live shader.
    InvalidShader(ShaderId),
    /// Shader compilation or linking failed.
    ShaderCompileFailed(String),
    /// Pixel readback failed.
    ReadbackFailed(String),
    /// Invalid operation for current state.
    InvalidOperation(String),
    /// The GPU reported out-of-memory.
    OutOfMemory,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Graphics driver not initialized"),
            Self::UnsupportedBackend(kind) => {
                write!(f, "Backend {} is not available in this build", kind)
            }
            Self::ContextLost => write!(f, "GPU context lost"),
            Self::InvalidTexture(id) => write!(f, "Invalid texture id {}", id.0),
            Self::InvalidShader(id) => write!(f, "Invalid shader id {}", id.0),
            Self::ShaderCompileFailed(msg) => write!(f, "Shader compilation failed: {}", msg),
            Self::ReadbackFailed(msg) => write!(f, "Pixel readback failed: {}", msg),
            Self::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Self::OutOfMemory => write!(f, "GPU out of memory"),
        }
    }
}

impl std::error::Error for DriverError {}

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Type-safe physical texture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureId(pub u32);

impl TextureId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Type-safe compiled shader handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderId(pub u32);

impl ShaderId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Texture sampling filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

/// Texture addressing outside the source region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    /// Clamp to the source region edge.
    #[default]
    ClampToZero,
    /// Repeat the source region.
    Repeat,
    /// The caller guarantees coordinates stay inside the region.
    Unsafe,
}

/// Polygon fill rule.
///
/// Only `FillAll` draws are merged freely; the other rules restrict
/// batching to provably non-overlapping destination regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillRule {
    #[default]
    FillAll,
    NonZero,
    EvenOdd,
}

/// Framebuffer vertical orientation reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YDirection {
    /// Y grows upward (OpenGL framebuffers).
    Upward,
    /// Y grows downward (the other backends).
    Downward,
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    OpenGl,
    Metal,
    /// Software rasterizer; the secondary target and the test backend.
    #[default]
    Software,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenGl => f.write_str("opengl"),
            Self::Metal => f.write_str("metal"),
            Self::Software => f.write_str("software"),
        }
    }
}

/// One sub-rectangle upload for `replace_pixels`.
#[derive(Debug, Clone, Copy)]
pub struct PixelUpload<'a> {
    pub rect: Rect,
    /// Pre-multiplied RGBA bytes, `4 * rect.area()` of them.
    pub bytes: &'a [u8],
}

/// Parameters for one driver draw call.
///
/// `index_offset` and `index_len` select a range of the index buffer most
/// recently uploaded with `set_vertices`. Sources are bound in slot order;
/// unused slots are `None`. `src_regions` bound the addressable area of
/// each source in its texture's pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct DrawParams<'a> {
    pub srcs: [Option<TextureId>; 4],
    pub src_regions: [Rect; 4],
    pub index_offset: usize,
    pub index_len: usize,
    pub mode: CompositeMode,
    pub filter: Filter,
    pub address: Address,
    pub fill_rule: FillRule,
    pub shader: Option<ShaderId>,
    pub uniforms: &'a [u32],
}

/// Capability contract implemented by every graphics backend.
///
/// All methods must be called on the GPU thread. Draws with identical
/// source set, mode, shader, filter, address, and destination are
/// batchable: the driver may receive one `draw` covering a concatenated
/// index range.
pub trait Graphics: Send {
    /// Open a submission window. Paired with `end`.
    fn begin(&mut self) -> DriverResult<()>;

    /// Close the submission window opened by `begin`.
    fn end(&mut self) -> DriverResult<()>;

    /// Create an off-screen render target texture.
    fn new_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId>;

    /// Create the screen framebuffer image.
    fn new_screen_framebuffer_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId>;

    /// Schedule a texture for deletion. Safe to call with pending draws
    /// already flushed.
    fn dispose_image(&mut self, id: TextureId);

    /// Upload the pending vertex and index buffers for subsequent `draw`
    /// calls.
    fn set_vertices(&mut self, vertices: &[f32], indices: &[u32]) -> DriverResult<()>;

    /// Bind the render destination for subsequent `draw` calls.
    fn set_destination(&mut self, id: TextureId) -> DriverResult<()>;

    /// Issue one GPU draw call over the current vertex/index buffers.
    fn draw(&mut self, params: DrawParams<'_>) -> DriverResult<()>;

    /// Upload one or more sub-rectangles of pre-multiplied RGBA pixels.
    fn replace_pixels(&mut self, id: TextureId, regions: &[PixelUpload<'_>]) -> DriverResult<()>;

    /// Read the whole texture back as pre-multiplied RGBA bytes. May be
    /// expensive; allowed to fail.
    fn pixels(&mut self, id: TextureId) -> DriverResult<Vec<u8>>;

    /// Whether context loss has tainted this texture.
    fn is_invalidated(&self, id: TextureId) -> bool;

    /// Whether this backend requires the restorable layer to replay after
    /// context loss.
    fn needs_restoring(&self) -> bool;

    /// Re-initialize GPU state after context loss. Every previously
    /// created texture id becomes invalid.
    fn reset(&mut self) -> DriverResult<()>;

    /// Maximum texture dimension supported by the backend.
    fn max_image_size(&self) -> i32;

    /// Reported framebuffer orientation.
    fn y_direction(&self) -> YDirection;

    /// Whether `generate_mipmaps` is available.
    fn supports_mipmaps(&self) -> bool;

    /// Build the mipmap chain for a texture. No-op when unsupported.
    fn generate_mipmaps(&mut self, id: TextureId) -> DriverResult<()>;

    /// Compile a shader for this backend.
    fn new_shader(&mut self, source: &ShaderSource) -> DriverResult<ShaderId>;

    /// Schedule a shader for deletion.
    fn dispose_shader(&mut self, id: ShaderId);
}

// Lets a runtime-selected backend flow through generic call sites.
impl Graphics for Box<dyn Graphics> {
    fn begin(&mut self) -> DriverResult<()> {
        (**self).begin()
    }

    fn end(&mut self) -> DriverResult<()> {
        (**self).end()
    }

    fn new_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        (**self).new_image(width, height)
    }

    fn new_screen_framebuffer_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        (**self).new_screen_framebuffer_image(width, height)
    }

    fn dispose_image(&mut self, id: TextureId) {
        (**self).dispose_image(id);
    }

    fn set_vertices(&mut self, vertices: &[f32], indices: &[u32]) -> DriverResult<()> {
        (**self).set_vertices(vertices, indices)
    }

    fn set_destination(&mut self, id: TextureId) -> DriverResult<()> {
        (**self).set_destination(id)
    }

    fn draw(&mut self, params: DrawParams<'_>) -> DriverResult<()> {
        (**self).draw(params)
    }

    fn replace_pixels(&mut self, id: TextureId, regions: &[PixelUpload<'_>]) -> DriverResult<()> {
        (**self).replace_pixels(id, regions)
    }

    fn pixels(&mut self, id: TextureId) -> DriverResult<Vec<u8>> {
        (**self).pixels(id)
    }

    fn is_invalidated(&self, id: TextureId) -> bool {
        (**self).is_invalidated(id)
    }

    fn needs_restoring(&self) -> bool {
        (**self).needs_restoring()
    }

    fn reset(&mut self) -> DriverResult<()> {
        (**self).reset()
    }

    fn max_image_size(&self) -> i32 {
        (**self).max_image_size()
    }

    fn y_direction(&self) -> YDirection {
        (**self).y_direction()
    }

    fn supports_mipmaps(&self) -> bool {
        (**self).supports_mipmaps()
    }

    fn generate_mipmaps(&mut self, id: TextureId) -> DriverResult<()> {
        (**self).generate_mipmaps(id)
    }

    fn new_shader(&mut self, source: &ShaderSource) -> DriverResult<ShaderId> {
        (**self).new_shader(source)
    }

    fn dispose_shader(&mut self, id: ShaderId) {
        (**self).dispose_shader(id);
    }
}
