//! Public image API.
//!
//! [`Context`] is the explicit root object: it owns the driver, the
//! command queue, the restorable records, and the atlas. [`Image`] is a
//! small copyable handle; all operations go through the context. Drawing
//! is deferred and batched; pixel reads force a flush.
//!
//! Color model: pre-multiplied alpha everywhere. `at` returns the stored
//! pre-multiplied bytes.

use std::collections::HashSet;

use log::{info, warn};

use crate::config::GraphicsConfig;
use crate::error::{Error, Result};
use crate::geom::Rect;
use crate::graphics::atlas::{Atlas, AtlasImage, ImageOptions};
use crate::graphics::blend::CompositeMode;
use crate::graphics::command::{CommandQueue, ImageId, ShaderHandle};
use crate::graphics::driver::{Address, DriverError, FillRule, Filter, Graphics};
use crate::graphics::restorable::{DrawOp, Images};
use crate::graphics::shader::{ShaderSource, Uniforms};
use crate::graphics::vertex::{append_quad_vertices, Vertex, QUAD_INDICES};

/// 2×3 affine transform: `x' = a·x + b·y + tx`, `y' = c·x + d·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geom {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for Geom {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Geom {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    #[must_use]
    pub fn translate(self, tx: f32, ty: f32) -> Self {
        Self {
            tx: self.tx + tx,
            ty: self.ty + ty,
            ..self
        }
    }

    #[must_use]
    pub fn scale(self, sx: f32, sy: f32) -> Self {
        Self {
            a: self.a * sx,
            b: self.b * sx,
            tx: self.tx * sx,
            c: self.c * sy,
            d: self.d * sy,
            ty: self.ty * sy,
        }
    }

    #[must_use]
    pub fn rotate(self, theta: f32) -> Self {
        let (sin, cos) = theta.sin_cos();
        Self {
            a: cos * self.a - sin * self.c,
            b: cos * self.b - sin * self.d,
            tx: cos * self.tx - sin * self.ty,
            c: sin * self.a + cos * self.c,
            d: sin * self.b + cos * self.d,
            ty: sin * self.tx + cos * self.ty,
        }
    }

    /// Whether the transform shrinks along either axis.
    #[must_use]
    pub fn is_shrinking(self) -> bool {
        (self.a * self.a + self.c * self.c) < 1.0 || (self.b * self.b + self.d * self.d) < 1.0
    }
}

/// Copyable image handle. Carries the view rectangle, so a sub-image is
/// just a handle with a smaller rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Image {
    id: AtlasImage,
    rect: Rect,
}

impl Image {
    #[must_use]
    pub const fn width(&self) -> i32 {
        self.rect.width()
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.rect.height()
    }

    #[must_use]
    pub const fn bounds(&self) -> Rect {
        self.rect
    }
}

/// Compiled shader handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shader {
    handle: ShaderHandle,
    uniform_word_count: usize,
}

/// Options for [`Context::draw_image`].
#[derive(Debug, Clone, Copy)]
pub struct DrawImageOptions {
    pub geom: Geom,
    /// Pre-multiplied color scale applied per channel.
    pub color_scale: [f32; 4],
    pub mode: CompositeMode,
    pub filter: Filter,
}

impl Default for DrawImageOptions {
    fn default() -> Self {
        Self {
            geom: Geom::IDENTITY,
            color_scale: [1.0; 4],
            mode: CompositeMode::SourceOver,
            filter: Filter::Nearest,
        }
    }
}

/// Options for the triangle and shader draw entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawTrianglesOptions {
    pub mode: CompositeMode,
    pub filter: Filter,
    pub address: Address,
    pub fill_rule: FillRule,
}

/// The rendering context.
pub struct Context<G: Graphics> {
    driver: G,
    queue: CommandQueue,
    images: Images,
    atlas: Atlas,
    screen: Image,
    disposed: HashSet<u64>,
    frame: u64,
}

impl<G: Graphics> Context<G> {
    pub fn new(
        config: &GraphicsConfig,
        mut driver: G,
        screen_width: i32,
        screen_height: i32,
    ) -> Result<Self> {
        config.validate()?;
        let max_atlas = config.max_atlas_size.min(driver.max_image_size());
        let mut queue = CommandQueue::new(config.command_warn_threshold);
        let mut images = Images::new();
        let mut atlas = Atlas::new(config.initial_atlas_size.min(max_atlas), max_atlas);
        let screen_id = atlas.new_screen(&mut images, &mut queue, screen_width, screen_height);
        let screen = Image {
            id: screen_id,
            rect: Rect::new(0, 0, screen_width, screen_height),
        };
        queue.flush(&mut driver)?;
        info!(
            "graphics context up: screen {}x{}, atlas pages up to {}",
            screen_width, screen_height, max_atlas
        );
        Ok(Self {
            driver,
            queue,
            images,
            atlas,
            screen,
            disposed: HashSet::new(),
            frame: 0,
        })
    }

    /// Direct driver access, for backend-specific hooks.
    pub fn driver_mut(&mut self) -> &mut G {
        &mut self.driver
    }

    #[must_use]
    pub fn screen(&self) -> Image {
        self.screen
    }

    pub fn new_image(&mut self, width: i32, height: i32, options: ImageOptions) -> Result<Image> {
        let max = self.driver.max_image_size();
        if width <= 0 || height <= 0 || width > max || height > max {
            return Err(Error::InvalidImageSize {
                width,
                height,
                max,
            });
        }
        let id = self
            .atlas
            .new_image(&mut self.images, &mut self.queue, width, height, options)?;
        Ok(Image {
            id,
            rect: Rect::new(0, 0, width, height),
        })
    }

    /// A view onto `rect` of `image`, clipped to the image's own view.
    #[must_use]
    pub fn sub_image(&self, image: &Image, rect: Rect) -> Image {
        let rect = rect
            .offset(image.rect.x(), image.rect.y())
            .intersect(image.rect);
        Image {
            id: image.id,
            rect,
        }
    }

    fn check_live(&self, image: &Image) -> Result<()> {
        if self.disposed.contains(&image.id.id()) || self.atlas.is_disposed(image.id) {
            return Err(Error::ImageDisposed);
        }
        Ok(())
    }

    /// Queue the image for disposal at the next end-of-frame tick.
    pub fn dispose(&mut self, image: &Image) -> Result<()> {
        self.check_live(image)?;
        self.disposed.insert(image.id.id());
        self.atlas.dispose(image.id);
        Ok(())
    }

    pub fn replace_pixels(&mut self, image: &Image, rect: Rect, bytes: &[u8]) -> Result<()> {
        self.check_live(image)?;
        let local = Rect::new(0, 0, image.rect.width(), image.rect.height());
        if !local.contains_rect(rect) {
            return Err(Error::RegionOutOfBounds(format!("{:?}", rect)));
        }
        let want = (rect.area() * 4) as usize;
        if bytes.len() != want {
            return Err(Error::PixelLengthMismatch {
                got: bytes.len(),
                want,
            });
        }
        let (backing, base) = self.atlas.region(image.id)?;
        let target = rect.offset(base.x() + image.rect.x(), base.y() + image.rect.y());
        self.images
            .replace_pixels(&mut self.queue, backing, target, bytes.to_vec())?;
        Ok(())
    }

    /// Pre-multiplied RGBA at `(x, y)` of the view. Forces a flush and a
    /// GPU readback.
    pub fn at(&mut self, image: &Image, x: i32, y: i32) -> Result<[u8; 4]> {
        self.check_live(image)?;
        if x < 0 || y < 0 || x >= image.rect.width() || y >= image.rect.height() {
            return Err(Error::OutOfBounds { x, y });
        }
        let (backing, base) = self.atlas.region(image.id)?;
        let pixels = self.read_backing(backing)?;
        let (width, _) = self
            .queue
            .image_size(backing)
            .ok_or(Error::ImageDisposed)?;
        let px = base.x() + image.rect.x() + x;
        let py = base.y() + image.rect.y() + y;
        let off = ((py * width + px) * 4) as usize;
        Ok([
            pixels[off],
            pixels[off + 1],
            pixels[off + 2],
            pixels[off + 3],
        ])
    }

    pub fn draw_image(
        &mut self,
        dst: &Image,
        src: &Image,
        options: &DrawImageOptions,
    ) -> Result<()> {
        self.check_live(dst)?;
        self.check_live(src)?;
        self.atlas
            .ensure_isolated(&mut self.images, &mut self.queue, dst.id)?;
        let (dst_backing, dst_base) = self.atlas.region(dst.id)?;
        let (src_backing, src_base) = self.atlas.region(src.id)?;
        let src_rect = image_region(src, src_base);

        let (src_backing, src_rect) = if src_backing == dst_backing {
            self.snapshot_source(src_backing, src_rect)?
        } else {
            (src_backing, src_rect)
        };

        if options.filter == Filter::Linear && options.geom.is_shrinking() {
            self.atlas.mark_mipmap_candidate(src.id);
        }

        let geom = options
            .geom
            .translate((dst_base.x() + dst.rect.x()) as f32, (dst_base.y() + dst.rect.y()) as f32);
        let mut vertices = Vec::with_capacity(4 * 8);
        append_quad_vertices(
            &mut vertices,
            src_rect.x() as f32,
            src_rect.y() as f32,
            src_rect.right() as f32,
            src_rect.bottom() as f32,
            geom.a,
            geom.b,
            geom.c,
            geom.d,
            geom.tx,
            geom.ty,
            options.color_scale,
        );
        self.images.draw_triangles(
            &mut self.queue,
            dst_backing,
            DrawOp {
                srcs: [Some(src_backing), None, None, None],
                src_regions: [src_rect, Rect::default(), Rect::default(), Rect::default()],
                vertices,
                indices: QUAD_INDICES.to_vec(),
                mode: options.mode,
                filter: options.filter,
                address: Address::ClampToZero,
                fill_rule: FillRule::FillAll,
                shader: None,
                uniforms: Vec::new(),
            },
        )?;
        Ok(())
    }

    pub fn draw_triangles(
        &mut self,
        dst: &Image,
        vertices: &[Vertex],
        indices: &[u32],
        src: &Image,
        options: &DrawTrianglesOptions,
    ) -> Result<()> {
        self.check_live(dst)?;
        self.check_live(src)?;
        validate_indices(indices, vertices.len())?;
        self.atlas
            .ensure_isolated(&mut self.images, &mut self.queue, dst.id)?;
        let (dst_backing, dst_base) = self.atlas.region(dst.id)?;
        let (src_backing, src_base) = self.atlas.region(src.id)?;
        let src_rect = image_region(src, src_base);
        let (src_backing, src_rect) = if src_backing == dst_backing {
            self.snapshot_source(src_backing, src_rect)?
        } else {
            (src_backing, src_rect)
        };

        let raw = translate_vertices(
            vertices,
            (dst_base.x() + dst.rect.x()) as f32,
            (dst_base.y() + dst.rect.y()) as f32,
            src_rect.x() as f32,
            src_rect.y() as f32,
        );
        self.images.draw_triangles(
            &mut self.queue,
            dst_backing,
            DrawOp {
                srcs: [Some(src_backing), None, None, None],
                src_regions: [src_rect, Rect::default(), Rect::default(), Rect::default()],
                vertices: raw,
                indices: indices.to_vec(),
                mode: options.mode,
                filter: options.filter,
                address: options.address,
                fill_rule: options.fill_rule,
                shader: None,
                uniforms: Vec::new(),
            },
        )?;
        Ok(())
    }

    pub fn new_shader(&mut self, source: ShaderSource) -> Shader {
        let uniform_word_count = source.uniform_word_count;
        Shader {
            handle: self.queue.new_shader(source),
            uniform_word_count,
        }
    }

    pub fn dispose_shader(&mut self, shader: Shader) {
        self.queue.dispose_shader(shader.handle);
    }

    /// Draw an axis-aligned `width` × `height` rectangle with a shader.
    /// Up to four sources; slot 0 drives the texture coordinates.
    pub fn draw_rect_shader(
        &mut self,
        dst: &Image,
        width: i32,
        height: i32,
        shader: Shader,
        srcs: &[&Image],
        uniforms: &Uniforms,
        options: &DrawTrianglesOptions,
    ) -> Result<()> {
        let mut vertices = Vec::with_capacity(4 * 8);
        append_quad_vertices(
            &mut vertices,
            0.0,
            0.0,
            width as f32,
            height as f32,
            1.0,
            0.0,
            0.0,
            1.0,
            0.0,
            0.0,
            [1.0; 4],
        );
        let quad: Vec<Vertex> = vertices
            .chunks_exact(8)
            .map(|v| Vertex::new(v[0], v[1], v[2], v[3], [v[4], v[5], v[6], v[7]]))
            .collect();
        self.draw_triangles_shader(dst, &quad, &QUAD_INDICES, shader, srcs, uniforms, options)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_triangles_shader(
        &mut self,
        dst: &Image,
        vertices: &[Vertex],
        indices: &[u32],
        shader: Shader,
        srcs: &[&Image],
        uniforms: &Uniforms,
        options: &DrawTrianglesOptions,
    ) -> Result<()> {
        self.check_live(dst)?;
        for src in srcs {
            self.check_live(src)?;
        }
        validate_indices(indices, vertices.len())?;
        if uniforms.len() != shader.uniform_word_count {
            return Err(Error::UniformMismatch {
                got: uniforms.len(),
                want: shader.uniform_word_count,
            });
        }
        if srcs.len() > 4 {
            return Err(Error::MalformedIndices(format!(
                "{} sources, at most 4 supported",
                srcs.len()
            )));
        }
        self.atlas
            .ensure_isolated(&mut self.images, &mut self.queue, dst.id)?;
        let (dst_backing, dst_base) = self.atlas.region(dst.id)?;

        let mut bound = [None; 4];
        let mut regions = [Rect::default(); 4];
        for (slot, src) in srcs.iter().enumerate() {
            let (backing, base) = self.atlas.region(src.id)?;
            let rect = image_region(src, base);
            let (backing, rect) = if backing == dst_backing {
                self.snapshot_source(backing, rect)?
            } else {
                (backing, rect)
            };
            bound[slot] = Some(backing);
            regions[slot] = rect;
        }

        let raw = translate_vertices(
            vertices,
            (dst_base.x() + dst.rect.x()) as f32,
            (dst_base.y() + dst.rect.y()) as f32,
            regions[0].x() as f32,
            regions[0].y() as f32,
        );
        self.images.draw_triangles(
            &mut self.queue,
            dst_backing,
            DrawOp {
                srcs: bound,
                src_regions: regions,
                vertices: raw,
                indices: indices.to_vec(),
                mode: options.mode,
                filter: options.filter,
                address: options.address,
                fill_rule: options.fill_rule,
                shader: Some(shader.handle),
                uniforms: uniforms.words().to_vec(),
            },
        )?;
        Ok(())
    }

    /// Open a frame: volatile images are cleared.
    pub fn begin_frame(&mut self) -> Result<()> {
        self.frame += 1;
        self.images.clear_volatile(&mut self.queue);
        Ok(())
    }

    /// Close a frame: flush pending commands, resolve stale records, run
    /// deferred disposals. A lost context triggers restore and replay.
    pub fn end_frame(&mut self) -> Result<()> {
        self.atlas.flush_mipmaps(&mut self.queue);
        match self.queue.flush(&mut self.driver) {
            Err(DriverError::ContextLost) => self.recover()?,
            other => other?,
        }
        match self.images.resolve_stale(&mut self.queue, &mut self.driver) {
            Err(DriverError::ContextLost) => {
                self.recover()?;
                self.images.resolve_stale(&mut self.queue, &mut self.driver)?;
            }
            other => other?,
        }
        self.atlas
            .run_deferred_disposals(&mut self.images, &mut self.queue);
        self.queue.flush(&mut self.driver)?;
        Ok(())
    }

    /// Rebuild every texture from the restorable records after a context
    /// loss. Nothing recorded this frame is lost: the records already
    /// hold it.
    fn recover(&mut self) -> Result<()> {
        warn!("context lost in frame {}, restoring", self.frame);
        self.driver.reset()?;
        self.queue.reset();
        self.images.restore(&mut self.queue, &mut self.driver)?;
        Ok(())
    }

    fn read_backing(&mut self, backing: ImageId) -> Result<Vec<u8>> {
        match self.queue.read_pixels(&mut self.driver, backing) {
            Err(DriverError::ContextLost) => {
                self.recover()?;
                Ok(self.queue.read_pixels(&mut self.driver, backing)?)
            }
            other => Ok(other?),
        }
    }

    /// Snapshot the image's current content to a PNG file. Forces a
    /// flush and a readback; debugging only.
    pub fn dump_image(&mut self, image: &Image, path: &std::path::Path) -> Result<()> {
        self.check_live(image)?;
        let (backing, base) = self.atlas.region(image.id)?;
        let pixels = self.read_backing(backing)?;
        let (width, _) = self
            .queue
            .image_size(backing)
            .ok_or(Error::ImageDisposed)?;
        let view = image_region(image, base);
        let mut bytes = Vec::with_capacity((view.area() * 4) as usize);
        for row in 0..view.height() {
            let off = (((view.y() + row) * width + view.x()) * 4) as usize;
            bytes.extend_from_slice(&pixels[off..off + (view.width() * 4) as usize]);
        }
        crate::graphics::dump::write_png(path, view.width(), view.height(), &bytes)
    }

    /// Copy a region of `backing` into a fresh unmanaged image so a draw
    /// can read and write the same logical image deterministically.
    fn snapshot_source(&mut self, backing: ImageId, rect: Rect) -> Result<(ImageId, Rect)> {
        let pixels = self.read_backing(backing)?;
        let (width, _) = self
            .queue
            .image_size(backing)
            .ok_or(Error::ImageDisposed)?;
        let mut bytes = Vec::with_capacity((rect.area() * 4) as usize);
        for row in 0..rect.height() {
            let off = (((rect.y() + row) * width + rect.x()) * 4) as usize;
            bytes.extend_from_slice(&pixels[off..off + (rect.width() * 4) as usize]);
        }
        let snapshot = self.atlas.new_image(
            &mut self.images,
            &mut self.queue,
            rect.width(),
            rect.height(),
            ImageOptions {
                unmanaged: true,
                volatile: false,
                mipmaps: false,
            },
        )?;
        let (snap_backing, snap_rect) = self.atlas.region(snapshot)?;
        self.images
            .replace_pixels(&mut self.queue, snap_backing, snap_rect, bytes)?;
        // Freed at the next end-of-frame tick, after the draw flushed.
        self.atlas.dispose(snapshot);
        Ok((snap_backing, snap_rect))
    }
}

/// Shared handle for the two-thread model: the game thread records
/// commands and mutates image state under the lock while the GPU thread
/// takes it to flush. Cross-thread work posts through
/// [`crate::threading::MainThreadHandle::call`].
pub struct SharedContext<G: Graphics> {
    inner: std::sync::Arc<parking_lot::Mutex<Context<G>>>,
}

impl<G: Graphics> Clone for SharedContext<G> {
    fn clone(&self) -> Self {
        Self {
            inner: std::sync::Arc::clone(&self.inner),
        }
    }
}

impl<G: Graphics> SharedContext<G> {
    #[must_use]
    pub fn new(context: Context<G>) -> Self {
        Self {
            inner: std::sync::Arc::new(parking_lot::Mutex::new(context)),
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Context<G>> {
        self.inner.lock()
    }
}

/// View rectangle in backing-texture coordinates.
fn image_region(image: &Image, base: Rect) -> Rect {
    Rect::new(
        base.x() + image.rect.x(),
        base.y() + image.rect.y(),
        image.rect.width(),
        image.rect.height(),
    )
}

fn validate_indices(indices: &[u32], vertex_count: usize) -> Result<()> {
    if indices.len() % 3 != 0 {
        return Err(Error::MalformedIndices(format!(
            "index count {} is not a multiple of 3",
            indices.len()
        )));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(Error::MalformedIndices(format!(
            "index {} out of range for {} vertices",
            bad, vertex_count
        )));
    }
    Ok(())
}

/// Offset vertex destination and source coordinates into backing-texture
/// space.
fn translate_vertices(
    vertices: &[Vertex],
    dst_dx: f32,
    dst_dy: f32,
    src_dx: f32,
    src_dy: f32,
) -> Vec<f32> {
    let mut raw = Vec::with_capacity(vertices.len() * 8);
    for v in vertices {
        Vertex::new(
            v.dst_x + dst_dx,
            v.dst_y + dst_dy,
            v.src_x + src_dx,
            v.src_y + src_dy,
            [v.color_r, v.color_g, v.color_b, v.color_a],
        )
        .write_to(&mut raw);
    }
    raw
}
