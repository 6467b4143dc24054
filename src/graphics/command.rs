//! Deferred command queue with draw-call batching.
//!
//! Every pipeline operation becomes a command appended here; nothing
//! touches the driver until `flush`. Consecutive triangle draws merge
//! into one driver call when their destination, sources, composite mode,
//! filter, address mode, fill rule, shader, and uniforms all match; since
//! vertices and indices land in one pair of shared buffers, a merged run
//! is a single `draw` over a widened index range. Pixel uploads to the
//! same image coalesce the same way.
//!
//! Images and shaders get queue-level ids at creation time; their GPU
//! resources are created lazily when the creating command executes, so
//! callers may record draws against an image before the driver ever sees
//! it.

use std::collections::HashMap;

use log::{debug, warn};

use crate::geom::Rect;
use crate::graphics::blend::CompositeMode;
use crate::graphics::driver::{
    Address, DrawParams, DriverError, DriverResult, FillRule, Filter, Graphics, PixelUpload,
    ShaderId, TextureId,
};
use crate::graphics::shader::ShaderSource;
use crate::graphics::vertex::VERTEX_FLOAT_COUNT;

/// Queue-level image handle. Distinct from the driver's [`TextureId`],
/// which may not exist yet or may change across context loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(u32);

impl ImageId {
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from its raw id. Only meaningful for ids handed
    /// out by the same queue.
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }
}

/// Queue-level shader handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(u32);

struct ImageEntry {
    width: i32,
    height: i32,
    screen: bool,
    texture: Option<TextureId>,
}

struct ShaderEntry {
    source: ShaderSource,
    compiled: Option<ShaderId>,
}

/// Whether overlap can widen by one pixel due to rasterization rounding.
const OVERLAP_MARGIN: i32 = 1;

enum Command {
    NewImage {
        id: ImageId,
    },
    DisposeImage {
        id: ImageId,
    },
    NewShader {
        handle: ShaderHandle,
    },
    DisposeShader {
        handle: ShaderHandle,
    },
    WritePixels {
        dst: ImageId,
        uploads: Vec<(Rect, Vec<u8>)>,
    },
    DrawTriangles {
        dst: ImageId,
        srcs: [Option<ImageId>; 4],
        src_regions: [Rect; 4],
        index_offset: usize,
        index_len: usize,
        mode: CompositeMode,
        filter: Filter,
        address: Address,
        fill_rule: FillRule,
        shader: Option<ShaderHandle>,
        uniforms: Vec<u32>,
        /// Destination rectangles touched so far, for the non-FillAll
        /// merge check.
        dst_regions: Vec<Rect>,
    },
    GenerateMipmaps {
        id: ImageId,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::NewImage { .. } => "new-image",
            Self::DisposeImage { .. } => "dispose-image",
            Self::NewShader { .. } => "new-shader",
            Self::DisposeShader { .. } => "dispose-shader",
            Self::WritePixels { .. } => "write-pixels",
            Self::DrawTriangles { .. } => "draw-triangles",
            Self::GenerateMipmaps { .. } => "generate-mipmaps",
        }
    }
}

/// Caller-facing description of one triangle draw, before vertex bookkeeping.
pub struct DrawTrianglesRequest<'a> {
    pub dst: ImageId,
    pub srcs: [Option<ImageId>; 4],
    pub src_regions: [Rect; 4],
    pub vertices: &'a [f32],
    /// Indices relative to `vertices`. Appended after the shared buffer's
    /// current contents.
    pub indices: &'a [u32],
    pub mode: CompositeMode,
    pub filter: Filter,
    pub address: Address,
    pub fill_rule: FillRule,
    pub shader: Option<ShaderHandle>,
    pub uniforms: Vec<u32>,
}

/// The deferred command queue.
pub struct CommandQueue {
    commands: Vec<Command>,
    vertices: Vec<f32>,
    indices: Vec<u32>,
    images: HashMap<u32, ImageEntry>,
    next_image: u32,
    shaders: HashMap<u32, ShaderEntry>,
    next_shader: u32,
    warn_threshold: usize,
    flush_count: u64,
}

impl CommandQueue {
    #[must_use]
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            commands: Vec::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
            images: HashMap::new(),
            next_image: 1,
            shaders: HashMap::new(),
            next_shader: 1,
            warn_threshold,
            flush_count: 0,
        }
    }

    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    pub fn new_image(&mut self, width: i32, height: i32, screen: bool) -> ImageId {
        let id = ImageId(self.next_image);
        self.next_image += 1;
        self.images.insert(
            id.0,
            ImageEntry {
                width,
                height,
                screen,
                texture: None,
            },
        );
        self.push(Command::NewImage { id });
        id
    }

    pub fn dispose_image(&mut self, id: ImageId) {
        self.push(Command::DisposeImage { id });
    }

    pub fn new_shader(&mut self, source: ShaderSource) -> ShaderHandle {
        let handle = ShaderHandle(self.next_shader);
        self.next_shader += 1;
        self.shaders.insert(
            handle.0,
            ShaderEntry {
                source,
                compiled: None,
            },
        );
        self.push(Command::NewShader { handle });
        handle
    }

    pub fn dispose_shader(&mut self, handle: ShaderHandle) {
        self.push(Command::DisposeShader { handle });
    }

    pub fn generate_mipmaps(&mut self, id: ImageId) {
        self.push(Command::GenerateMipmaps { id });
    }

    #[must_use]
    pub fn image_size(&self, id: ImageId) -> Option<(i32, i32)> {
        self.images.get(&id.0).map(|e| (e.width, e.height))
    }

    /// Record a pixel upload. Coalesces with an immediately preceding
    /// upload to the same image.
    pub fn write_pixels(&mut self, dst: ImageId, rect: Rect, bytes: Vec<u8>) {
        if let Some(Command::WritePixels { dst: prev, uploads }) = self.commands.last_mut() {
            if *prev == dst {
                uploads.push((rect, bytes));
                return;
            }
        }
        self.push(Command::WritePixels {
            dst,
            uploads: vec![(rect, bytes)],
        });
    }

    /// Record a triangle draw, merging with the previous draw when the
    /// batching criteria hold.
    pub fn draw_triangles(&mut self, req: DrawTrianglesRequest<'_>) {
        debug_assert_eq!(req.vertices.len() % VERTEX_FLOAT_COUNT, 0);
        debug_assert_eq!(req.indices.len() % 3, 0);

        let base_vertex = (self.vertices.len() / VERTEX_FLOAT_COUNT) as u32;
        let index_offset = self.indices.len();
        self.vertices.extend_from_slice(req.vertices);
        self.indices
            .extend(req.indices.iter().map(|&i| i + base_vertex));

        let region = dst_bounds(req.vertices, self.images.get(&req.dst.0));

        if let Some(Command::DrawTriangles {
            dst,
            srcs,
            mode,
            filter,
            address,
            fill_rule,
            shader,
            uniforms,
            index_len,
            dst_regions,
            ..
        }) = self.commands.last_mut()
        {
            let compatible = *dst == req.dst
                && *srcs == req.srcs
                && *mode == req.mode
                && *filter == req.filter
                && *address == req.address
                && *fill_rule == req.fill_rule
                && *shader == req.shader
                && *uniforms == req.uniforms;
            let disjoint = req.fill_rule == FillRule::FillAll
                || !dst_regions.iter().any(|r| {
                    grow(*r, OVERLAP_MARGIN).overlaps(grow(region, OVERLAP_MARGIN))
                });
            if compatible && disjoint {
                *index_len += req.indices.len();
                dst_regions.push(region);
                return;
            }
        }

        self.push(Command::DrawTriangles {
            dst: req.dst,
            srcs: req.srcs,
            src_regions: req.src_regions,
            index_offset,
            index_len: req.indices.len(),
            mode: req.mode,
            filter: req.filter,
            address: req.address,
            fill_rule: req.fill_rule,
            shader: req.shader,
            uniforms: req.uniforms,
            dst_regions: vec![region],
        });
    }

    fn push(&mut self, command: Command) {
        if self.commands.len() + 1 == self.warn_threshold {
            warn!(
                "command queue reached {} pending commands without a flush",
                self.warn_threshold
            );
        }
        self.commands.push(command);
    }

    fn texture(&self, id: ImageId) -> DriverResult<TextureId> {
        self.images
            .get(&id.0)
            .and_then(|e| e.texture)
            .ok_or_else(|| {
                DriverError::InvalidOperation(format!("image {} has no texture", id.0))
            })
    }

    fn shader_id(&self, handle: ShaderHandle) -> DriverResult<ShaderId> {
        self.shaders
            .get(&handle.0)
            .and_then(|e| e.compiled)
            .ok_or_else(|| {
                DriverError::InvalidOperation(format!("shader {} is not compiled", handle.0))
            })
    }

    /// Execute every pending command against the driver, in order, inside
    /// one `begin`/`end` window. The shared vertex and index buffers are
    /// uploaded once.
    pub fn flush(&mut self, driver: &mut dyn Graphics) -> DriverResult<()> {
        if self.commands.is_empty() {
            return Ok(());
        }
        self.flush_count += 1;
        debug!(
            "flushing {} commands, {} vertices, {} indices",
            self.commands.len(),
            self.vertices.len() / VERTEX_FLOAT_COUNT,
            self.indices.len()
        );
        driver.begin()?;
        let result = self.execute_all(driver);
        let ended = driver.end();
        // On context loss the caller resets the queue wholesale; on any
        // other error dropping the commands keeps the queue usable.
        self.commands.clear();
        self.vertices.clear();
        self.indices.clear();
        result.and(ended)
    }

    fn execute_all(&mut self, driver: &mut dyn Graphics) -> DriverResult<()> {
        if !self.indices.is_empty() {
            driver.set_vertices(&self.vertices, &self.indices)?;
        }
        let commands = std::mem::take(&mut self.commands);
        for command in &commands {
            if let Err(err) = self.execute(driver, command) {
                warn!("command {} failed: {}", command.name(), err);
                self.commands = commands;
                return Err(err);
            }
        }
        self.commands = commands;
        Ok(())
    }

    fn execute(&mut self, driver: &mut dyn Graphics, command: &Command) -> DriverResult<()> {
        match command {
            Command::NewImage { id } => {
                let entry = self.images.get_mut(&id.0).ok_or_else(|| {
                    DriverError::InvalidOperation(format!("unknown image {}", id.0))
                })?;
                let texture = if entry.screen {
                    driver.new_screen_framebuffer_image(entry.width, entry.height)?
                } else {
                    driver.new_image(entry.width, entry.height)?
                };
                entry.texture = Some(texture);
                Ok(())
            }
            Command::DisposeImage { id } => {
                if let Some(entry) = self.images.remove(&id.0) {
                    if let Some(texture) = entry.texture {
                        driver.dispose_image(texture);
                    }
                }
                Ok(())
            }
            Command::NewShader { handle } => {
                let entry = self.shaders.get_mut(&handle.0).ok_or_else(|| {
                    DriverError::InvalidOperation(format!("unknown shader {}", handle.0))
                })?;
                entry.compiled = Some(driver.new_shader(&entry.source)?);
                Ok(())
            }
            Command::DisposeShader { handle } => {
                if let Some(entry) = self.shaders.remove(&handle.0) {
                    if let Some(compiled) = entry.compiled {
                        driver.dispose_shader(compiled);
                    }
                }
                Ok(())
            }
            Command::WritePixels { dst, uploads } => {
                let texture = self.texture(*dst)?;
                let regions: Vec<PixelUpload<'_>> = uploads
                    .iter()
                    .map(|(rect, bytes)| PixelUpload {
                        rect: *rect,
                        bytes,
                    })
                    .collect();
                driver.replace_pixels(texture, &regions)
            }
            Command::DrawTriangles {
                dst,
                srcs,
                src_regions,
                index_offset,
                index_len,
                mode,
                filter,
                address,
                fill_rule,
                shader,
                uniforms,
                ..
            } => {
                driver.set_destination(self.texture(*dst)?)?;
                let mut resolved = [None; 4];
                for (slot, src) in srcs.iter().enumerate() {
                    if let Some(src) = src {
                        resolved[slot] = Some(self.texture(*src)?);
                    }
                }
                let shader = match shader {
                    Some(handle) => Some(self.shader_id(*handle)?),
                    None => None,
                };
                driver.draw(DrawParams {
                    srcs: resolved,
                    src_regions: *src_regions,
                    index_offset: *index_offset,
                    index_len: *index_len,
                    mode: *mode,
                    filter: *filter,
                    address: *address,
                    fill_rule: *fill_rule,
                    shader,
                    uniforms,
                })
            }
            Command::GenerateMipmaps { id } => {
                if !driver.supports_mipmaps() {
                    return Ok(());
                }
                driver.generate_mipmaps(self.texture(*id)?)
            }
        }
    }

    /// Flush, then read an image back synchronously.
    pub fn read_pixels(
        &mut self,
        driver: &mut dyn Graphics,
        id: ImageId,
    ) -> DriverResult<Vec<u8>> {
        self.flush(driver)?;
        driver.pixels(self.texture(id)?)
    }

    /// Drop all pending work and forget every driver resource. Called
    /// after `Graphics::reset`, when every texture and shader id the queue
    /// holds has become invalid. Surviving images and shaders are
    /// re-created on the next flush.
    pub fn reset(&mut self) {
        debug!(
            "resetting command queue, {} images, {} shaders survive",
            self.images.len(),
            self.shaders.len()
        );
        self.commands.clear();
        self.vertices.clear();
        self.indices.clear();
        let mut ids: Vec<u32> = self.images.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(entry) = self.images.get_mut(&id) {
                entry.texture = None;
            }
            self.commands.push(Command::NewImage { id: ImageId(id) });
        }
        let mut handles: Vec<u32> = self.shaders.keys().copied().collect();
        handles.sort_unstable();
        for handle in handles {
            if let Some(entry) = self.shaders.get_mut(&handle) {
                entry.compiled = None;
            }
            self.commands.push(Command::NewShader {
                handle: ShaderHandle(handle),
            });
        }
    }
}

/// Bounding rectangle of the destination positions of a vertex run,
/// clamped to the image.
fn dst_bounds(vertices: &[f32], entry: Option<&ImageEntry>) -> Rect {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    for v in vertices.chunks_exact(VERTEX_FLOAT_COUNT) {
        min_x = min_x.min(v[0]);
        min_y = min_y.min(v[1]);
        max_x = max_x.max(v[0]);
        max_y = max_y.max(v[1]);
    }
    if min_x > max_x {
        return Rect::default();
    }
    let mut rect = Rect::new(
        min_x.floor() as i32,
        min_y.floor() as i32,
        (max_x.ceil() - min_x.floor()) as i32,
        (max_y.ceil() - min_y.floor()) as i32,
    );
    if let Some(entry) = entry {
        rect = rect.intersect(Rect::new(0, 0, entry.width, entry.height));
    }
    rect
}

fn grow(r: Rect, margin: i32) -> Rect {
    Rect::new(
        r.x() - margin,
        r.y() - margin,
        r.width() + 2 * margin,
        r.height() + 2 * margin,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::software::SoftwareGraphics;
    use crate::graphics::vertex::{append_quad_vertices, QUAD_INDICES};

    fn quad_request<'a>(
        dst: ImageId,
        src: ImageId,
        vertices: &'a [f32],
        mode: CompositeMode,
        fill_rule: FillRule,
    ) -> DrawTrianglesRequest<'a> {
        DrawTrianglesRequest {
            dst,
            srcs: [Some(src), None, None, None],
            src_regions: [
                Rect::new(0, 0, 16, 16),
                Rect::default(),
                Rect::default(),
                Rect::default(),
            ],
            vertices,
            indices: &QUAD_INDICES,
            mode,
            filter: Filter::Nearest,
            address: Address::ClampToZero,
            fill_rule,
            shader: None,
            uniforms: Vec::new(),
        }
    }

    fn quad_at(x: f32, y: f32, size: f32) -> Vec<f32> {
        let mut v = Vec::new();
        append_quad_vertices(
            &mut v,
            0.0,
            0.0,
            size,
            size,
            1.0,
            0.0,
            0.0,
            1.0,
            x,
            y,
            [1.0; 4],
        );
        v
    }

    #[test]
    fn fifty_compatible_quads_merge_into_one_draw() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let src = queue.new_image(16, 16, false);
        let dst = queue.new_image(256, 256, false);
        for i in 0..50 {
            let v = quad_at((i % 16) as f32 * 16.0, (i / 16) as f32 * 16.0, 16.0);
            queue.draw_triangles(quad_request(
                dst,
                src,
                &v,
                CompositeMode::SourceOver,
                FillRule::FillAll,
            ));
        }
        // 2 image creations + 1 merged draw.
        assert_eq!(queue.pending_commands(), 3);
        queue.flush(&mut driver).unwrap();
        let stats = driver.stats();
        assert_eq!(stats.set_vertices_calls, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.last_index_len, 300);
    }

    #[test]
    fn mode_change_breaks_the_batch() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let src = queue.new_image(16, 16, false);
        let dst = queue.new_image(64, 64, false);
        let v = quad_at(0.0, 0.0, 16.0);
        queue.draw_triangles(quad_request(
            dst,
            src,
            &v,
            CompositeMode::SourceOver,
            FillRule::FillAll,
        ));
        queue.draw_triangles(quad_request(
            dst,
            src,
            &v,
            CompositeMode::Lighter,
            FillRule::FillAll,
        ));
        queue.draw_triangles(quad_request(
            dst,
            src,
            &v,
            CompositeMode::Lighter,
            FillRule::FillAll,
        ));
        queue.flush(&mut driver).unwrap();
        assert_eq!(driver.stats().draw_calls, 2);
    }

    #[test]
    fn non_fill_all_merges_only_disjoint_regions() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let src = queue.new_image(16, 16, false);
        let dst = queue.new_image(256, 256, false);
        // Far apart: merge.
        queue.draw_triangles(quad_request(
            dst,
            src,
            &quad_at(0.0, 0.0, 16.0),
            CompositeMode::SourceOver,
            FillRule::NonZero,
        ));
        queue.draw_triangles(quad_request(
            dst,
            src,
            &quad_at(100.0, 100.0, 16.0),
            CompositeMode::SourceOver,
            FillRule::NonZero,
        ));
        assert_eq!(queue.pending_commands(), 3);
        // Within the one-pixel margin of the first: no merge.
        queue.draw_triangles(quad_request(
            dst,
            src,
            &quad_at(16.0, 0.0, 16.0),
            CompositeMode::SourceOver,
            FillRule::NonZero,
        ));
        assert_eq!(queue.pending_commands(), 4);
    }

    #[test]
    fn write_pixels_coalesces_per_image() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let img = queue.new_image(8, 8, false);
        queue.write_pixels(img, Rect::new(0, 0, 1, 1), vec![255, 0, 0, 255]);
        queue.write_pixels(img, Rect::new(1, 0, 1, 1), vec![0, 255, 0, 255]);
        // 1 creation + 1 coalesced upload.
        assert_eq!(queue.pending_commands(), 2);
        let px = queue.read_pixels(&mut driver, img).unwrap();
        assert_eq!(&px[0..4], &[255, 0, 0, 255]);
        assert_eq!(&px[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn draw_after_write_does_not_merge_across_it() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let src = queue.new_image(16, 16, false);
        let dst = queue.new_image(64, 64, false);
        let v = quad_at(0.0, 0.0, 16.0);
        queue.draw_triangles(quad_request(
            dst,
            src,
            &v,
            CompositeMode::SourceOver,
            FillRule::FillAll,
        ));
        queue.write_pixels(src, Rect::new(0, 0, 1, 1), vec![1, 2, 3, 255]);
        queue.draw_triangles(quad_request(
            dst,
            src,
            &v,
            CompositeMode::SourceOver,
            FillRule::FillAll,
        ));
        queue.flush(&mut driver).unwrap();
        assert_eq!(driver.stats().draw_calls, 2);
    }

    #[test]
    fn reset_recreates_surviving_images() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let img = queue.new_image(4, 4, false);
        queue.write_pixels(
            img,
            Rect::new(0, 0, 4, 4),
            vec![7; 64],
        );
        queue.flush(&mut driver).unwrap();

        driver.invalidate_context();
        driver.reset().unwrap();
        queue.reset();

        // The image comes back (blank) under a fresh texture.
        queue.write_pixels(img, Rect::new(0, 0, 4, 4), vec![9; 64]);
        let px = queue.read_pixels(&mut driver, img).unwrap();
        assert!(px.iter().all(|&b| b == 9));
    }

    #[test]
    fn batch_and_unbatched_render_identically() {
        let run = |batched: bool| {
            let mut driver = SoftwareGraphics::new();
            let mut queue = CommandQueue::new(16384);
            let src = queue.new_image(16, 16, false);
            let dst = queue.new_image(64, 64, false);
            queue.write_pixels(
                src,
                Rect::new(0, 0, 16, 16),
                vec![40; 16 * 16 * 4],
            );
            for i in 0..4 {
                let v = quad_at(i as f32 * 10.0, i as f32 * 10.0, 16.0);
                queue.draw_triangles(quad_request(
                    dst,
                    src,
                    &v,
                    CompositeMode::Lighter,
                    FillRule::FillAll,
                ));
                if !batched {
                    queue.flush(&mut driver).unwrap();
                }
            }
            queue.read_pixels(&mut driver, dst).unwrap()
        };
        assert_eq!(run(true), run(false));
    }
}
