//! Software rasterizer backend.
//!
//! This is the secondary render target and the backend every pipeline
//! test runs against: a deterministic CPU implementation of the driver
//! contract. Triangles are rasterized at pixel centers with the top-left
//! fill rule, so adjacent triangles sharing an edge never double-cover a
//! pixel and batching cannot change coverage. Blending reproduces the
//! composite factor table bit-exactly in 8-bit channels.
//!
//! The backend also carries the test instrumentation the rest of the
//! crate relies on: call counters for `set_vertices`/`draw` and a
//! context-loss injection hook.

use std::collections::HashMap;

use fast_image_resize::{
    images::{Image as FirImage, ImageRef as FirImageRef},
    FilterType, PixelType, ResizeOptions, Resizer,
};
use log::{debug, warn};

use crate::geom::Rect;
use crate::graphics::blend::blend_rgba8;
use crate::graphics::driver::{
    Address, DrawParams, DriverError, DriverResult, Filter, Graphics, PixelUpload, ShaderId,
    TextureId, YDirection,
};
use crate::graphics::shader::{ShaderSource, SoftwareFragment, SourceSampler};
use crate::graphics::vertex::VERTEX_FLOAT_COUNT;

const MAX_IMAGE_SIZE: i32 = 4096;

struct Texture {
    width: i32,
    height: i32,
    /// Pre-multiplied RGBA, row-major.
    pixels: Vec<u8>,
    /// Downscaled levels built by `generate_mipmaps`; level 0 is implicit.
    /// The rasterizer always samples level 0; the chain exists so tests
    /// can observe the generation contract (when it runs, invalidation on
    /// base writes) without a GPU.
    mips: Vec<(i32, i32, Vec<u8>)>,
    invalidated: bool,
}

struct CompiledShader {
    fragment: Option<std::sync::Arc<dyn SoftwareFragment>>,
    uniform_word_count: usize,
    name: String,
}

/// Counters observed by pipeline tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub set_vertices_calls: usize,
    pub draw_calls: usize,
    pub last_index_len: usize,
}

/// The software graphics driver.
pub struct SoftwareGraphics {
    textures: HashMap<u32, Texture>,
    next_texture: u32,
    shaders: HashMap<u32, CompiledShader>,
    next_shader: u32,
    vertices: Vec<f32>,
    indices: Vec<u32>,
    destination: Option<TextureId>,
    context_lost: bool,
    in_frame: bool,
    stats: DriverStats,
}

impl Default for SoftwareGraphics {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareGraphics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
            next_texture: 1,
            shaders: HashMap::new(),
            next_shader: 1,
            vertices: Vec::new(),
            indices: Vec::new(),
            destination: None,
            context_lost: false,
            in_frame: false,
            stats: DriverStats::default(),
        }
    }

    /// Test hook: simulate a GPU context loss. Every texture is tainted
    /// until `reset`.
    pub fn invalidate_context(&mut self) {
        debug!("software driver: context loss injected");
        self.context_lost = true;
        for tex in self.textures.values_mut() {
            tex.invalidated = true;
        }
    }

    #[must_use]
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DriverStats::default();
    }

    /// Number of mip levels held for a texture, counting the base level.
    #[must_use]
    pub fn mip_level_count(&self, id: TextureId) -> usize {
        self.textures.get(&id.0).map_or(0, |t| 1 + t.mips.len())
    }

    fn texture(&self, id: TextureId) -> DriverResult<&Texture> {
        self.textures.get(&id.0).ok_or(DriverError::InvalidTexture(id))
    }

    fn texture_mut(&mut self, id: TextureId) -> DriverResult<&mut Texture> {
        self.textures.get_mut(&id.0).ok_or(DriverError::InvalidTexture(id))
    }

    fn create_texture(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        if width <= 0 || height <= 0 || width > MAX_IMAGE_SIZE || height > MAX_IMAGE_SIZE {
            return Err(DriverError::InvalidOperation(format!(
                "texture size {}x{} out of range",
                width, height
            )));
        }
        let id = self.next_texture;
        self.next_texture += 1;
        self.textures.insert(
            id,
            Texture {
                width,
                height,
                pixels: vec![0; (width * height * 4) as usize],
                mips: Vec::new(),
                invalidated: false,
            },
        );
        Ok(TextureId(id))
    }
}

impl Graphics for SoftwareGraphics {
    fn begin(&mut self) -> DriverResult<()> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        self.in_frame = true;
        Ok(())
    }

    fn end(&mut self) -> DriverResult<()> {
        self.in_frame = false;
        Ok(())
    }

    fn new_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        self.create_texture(width, height)
    }

    fn new_screen_framebuffer_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        // The rasterizer writes every target the same way.
        self.create_texture(width, height)
    }

    fn dispose_image(&mut self, id: TextureId) {
        if self.textures.remove(&id.0).is_none() {
            warn!("software driver: disposing unknown texture {}", id.0);
        }
    }

    fn set_vertices(&mut self, vertices: &[f32], indices: &[u32]) -> DriverResult<()> {
        self.stats.set_vertices_calls += 1;
        self.vertices.clear();
        self.vertices.extend_from_slice(vertices);
        self.indices.clear();
        self.indices.extend_from_slice(indices);
        Ok(())
    }

    fn set_destination(&mut self, id: TextureId) -> DriverResult<()> {
        self.texture(id)?;
        self.destination = Some(id);
        Ok(())
    }

    fn draw(&mut self, params: DrawParams<'_>) -> DriverResult<()> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        self.stats.draw_calls += 1;
        self.stats.last_index_len = params.index_len;

        let dst_id = self
            .destination
            .ok_or_else(|| DriverError::InvalidOperation("no destination bound".into()))?;
        for src in params.srcs.into_iter().flatten() {
            if src == dst_id {
                return Err(DriverError::InvalidOperation(
                    "destination bound as source".into(),
                ));
            }
        }
        let shader = match params.shader {
            Some(id) => {
                let s = self
                    .shaders
                    .get(&id.0)
                    .ok_or(DriverError::InvalidShader(id))?;
                if s.uniform_word_count != params.uniforms.len() {
                    return Err(DriverError::InvalidOperation(format!(
                        "shader {} expects {} uniform words, got {}",
                        s.name,
                        s.uniform_word_count,
                        params.uniforms.len()
                    )));
                }
                s.fragment.clone()
            }
            None => None,
        };

        // Take the destination out of the map so sources can be borrowed
        // from it immutably.
        let mut dst = self
            .textures
            .remove(&dst_id.0)
            .ok_or(DriverError::InvalidTexture(dst_id))?;
        let result = rasterize(
            &mut dst,
            &self.textures,
            &self.vertices,
            &self.indices,
            &params,
            shader.as_deref(),
        );
        self.textures.insert(dst_id.0, dst);
        result
    }

    fn replace_pixels(&mut self, id: TextureId, regions: &[PixelUpload<'_>]) -> DriverResult<()> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        let tex = self.texture_mut(id)?;
        let bounds = Rect::new(0, 0, tex.width, tex.height);
        for upload in regions {
            if !bounds.contains_rect(upload.rect) {
                return Err(DriverError::InvalidOperation(format!(
                    "upload region {:?} outside {}x{}",
                    upload.rect, tex.width, tex.height
                )));
            }
            let want = (upload.rect.area() * 4) as usize;
            if upload.bytes.len() != want {
                return Err(DriverError::InvalidOperation(format!(
                    "upload byte length {} != {}",
                    upload.bytes.len(),
                    want
                )));
            }
            let row_bytes = (upload.rect.width() * 4) as usize;
            for row in 0..upload.rect.height() {
                let dst_off =
                    (((upload.rect.y() + row) * tex.width + upload.rect.x()) * 4) as usize;
                let src_off = (row * upload.rect.width() * 4) as usize;
                tex.pixels[dst_off..dst_off + row_bytes]
                    .copy_from_slice(&upload.bytes[src_off..src_off + row_bytes]);
            }
        }
        // Base level changed; the chain is stale.
        tex.mips.clear();
        Ok(())
    }

    fn pixels(&mut self, id: TextureId) -> DriverResult<Vec<u8>> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        let tex = self.texture(id)?;
        if tex.invalidated {
            return Err(DriverError::ReadbackFailed("texture invalidated".into()));
        }
        Ok(tex.pixels.clone())
    }

    fn is_invalidated(&self, id: TextureId) -> bool {
        self.textures.get(&id.0).map_or(true, |t| t.invalidated)
    }

    fn needs_restoring(&self) -> bool {
        true
    }

    fn reset(&mut self) -> DriverResult<()> {
        debug!("software driver: reset after context loss");
        self.textures.clear();
        self.vertices.clear();
        self.indices.clear();
        self.destination = None;
        self.context_lost = false;
        Ok(())
    }

    fn max_image_size(&self) -> i32 {
        MAX_IMAGE_SIZE
    }

    fn y_direction(&self) -> YDirection {
        YDirection::Downward
    }

    fn supports_mipmaps(&self) -> bool {
        true
    }

    fn generate_mipmaps(&mut self, id: TextureId) -> DriverResult<()> {
        let tex = self.texture_mut(id)?;
        if !tex.mips.is_empty() {
            return Ok(());
        }
        let mut resizer = Resizer::new();
        let options = ResizeOptions::new()
            .resize_alg(fast_image_resize::ResizeAlg::Convolution(FilterType::Box));
        let (mut w, mut h) = (tex.width, tex.height);
        let mut level = tex.pixels.clone();
        let mut mips = Vec::new();
        while w > 1 || h > 1 {
            let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
            let src = FirImageRef::new(w as u32, h as u32, &level, PixelType::U8x4)
                .map_err(|e| DriverError::InvalidOperation(e.to_string()))?;
            let mut dst = FirImage::new(nw as u32, nh as u32, PixelType::U8x4);
            resizer
                .resize(&src, &mut dst, &options)
                .map_err(|e| DriverError::InvalidOperation(e.to_string()))?;
            level = dst.into_vec();
            mips.push((nw, nh, level.clone()));
            w = nw;
            h = nh;
        }
        tex.mips = mips;
        Ok(())
    }

    fn new_shader(&mut self, source: &ShaderSource) -> DriverResult<ShaderId> {
        if source.software.is_none() {
            return Err(DriverError::ShaderCompileFailed(format!(
                "shader {} has no software entry point",
                source.name
            )));
        }
        let id = self.next_shader;
        self.next_shader += 1;
        self.shaders.insert(
            id,
            CompiledShader {
                fragment: source.software.clone(),
                uniform_word_count: source.uniform_word_count,
                name: source.name.clone(),
            },
        );
        Ok(ShaderId(id))
    }

    fn dispose_shader(&mut self, id: ShaderId) {
        self.shaders.remove(&id.0);
    }
}

/// Sampler over the bound sources of one draw call.
struct Samplers<'a> {
    textures: &'a HashMap<u32, Texture>,
    srcs: [Option<TextureId>; 4],
    regions: [Rect; 4],
    filter: Filter,
    address: Address,
}

impl Samplers<'_> {
    fn texel(&self, slot: usize, x: i32, y: i32) -> [f32; 4] {
        let Some(id) = self.srcs[slot] else {
            return [0.0; 4];
        };
        let Some(tex) = self.textures.get(&id.0) else {
            return [0.0; 4];
        };
        let region = self.regions[slot];
        if region.is_empty() {
            return [0.0; 4];
        }
        let (x, y) = match self.address {
            Address::Repeat => (
                region.x() + (x - region.x()).rem_euclid(region.width()),
                region.y() + (y - region.y()).rem_euclid(region.height()),
            ),
            Address::ClampToZero | Address::Unsafe => (
                x.clamp(region.x(), region.right() - 1),
                y.clamp(region.y(), region.bottom() - 1),
            ),
        };
        let off = ((y * tex.width + x) * 4) as usize;
        [
            tex.pixels[off] as f32 / 255.0,
            tex.pixels[off + 1] as f32 / 255.0,
            tex.pixels[off + 2] as f32 / 255.0,
            tex.pixels[off + 3] as f32 / 255.0,
        ]
    }

    fn sample(&self, slot: usize, u: f32, v: f32) -> [f32; 4] {
        match self.filter {
            Filter::Nearest => self.texel(slot, u.floor() as i32, v.floor() as i32),
            Filter::Linear => {
                let fu = u - 0.5;
                let fv = v - 0.5;
                let x0 = fu.floor();
                let y0 = fv.floor();
                let tx = fu - x0;
                let ty = fv - y0;
                let (x0, y0) = (x0 as i32, y0 as i32);
                let mut out = [0.0f32; 4];
                let c00 = self.texel(slot, x0, y0);
                let c10 = self.texel(slot, x0 + 1, y0);
                let c01 = self.texel(slot, x0, y0 + 1);
                let c11 = self.texel(slot, x0 + 1, y0 + 1);
                for ch in 0..4 {
                    let top = c00[ch] * (1.0 - tx) + c10[ch] * tx;
                    let bottom = c01[ch] * (1.0 - tx) + c11[ch] * tx;
                    out[ch] = top * (1.0 - ty) + bottom * ty;
                }
                out
            }
        }
    }
}

impl SourceSampler for Samplers<'_> {
    fn src_at(&self, slot: usize, x: f32, y: f32) -> [f32; 4] {
        let region = self.regions[slot];
        self.sample(slot, x + region.x() as f32, y + region.y() as f32)
    }

    fn src_size(&self, slot: usize) -> (f32, f32) {
        let r = self.regions[slot];
        (r.width() as f32, r.height() as f32)
    }
}

fn edge(ax: f64, ay: f64, bx: f64, by: f64, px: f64, py: f64) -> f64 {
    (bx - ax) * (py - ay) - (by - ay) * (px - ax)
}

/// Top-left rule: a zero edge value covers the pixel only when the edge
/// goes up, or goes exactly right (y-down coordinates, positive-interior
/// vertex order).
fn edge_accepts_zero(ax: f64, ay: f64, bx: f64, by: f64) -> bool {
    let dy = by - ay;
    let dx = bx - ax;
    dy < 0.0 || (dy == 0.0 && dx > 0.0)
}

fn rasterize(
    dst: &mut Texture,
    textures: &HashMap<u32, Texture>,
    vertices: &[f32],
    indices: &[u32],
    params: &DrawParams<'_>,
    fragment: Option<&dyn SoftwareFragment>,
) -> DriverResult<()> {
    let end = params.index_offset + params.index_len;
    if end > indices.len() || params.index_len % 3 != 0 {
        return Err(DriverError::InvalidOperation(format!(
            "index range {}..{} out of buffer of {}",
            params.index_offset,
            end,
            indices.len()
        )));
    }
    let samplers = Samplers {
        textures,
        srcs: params.srcs,
        regions: params.src_regions,
        filter: params.filter,
        address: params.address,
    };
    for tri in indices[params.index_offset..end].chunks_exact(3) {
        let mut v = [[0.0f32; VERTEX_FLOAT_COUNT]; 3];
        for (slot, &index) in tri.iter().enumerate() {
            let base = index as usize * VERTEX_FLOAT_COUNT;
            if base + VERTEX_FLOAT_COUNT > vertices.len() {
                return Err(DriverError::InvalidOperation(format!(
                    "vertex index {} out of buffer",
                    index
                )));
            }
            v[slot].copy_from_slice(&vertices[base..base + VERTEX_FLOAT_COUNT]);
        }
        rasterize_triangle(dst, &samplers, &v, params, fragment);
    }
    Ok(())
}

fn rasterize_triangle(
    dst: &mut Texture,
    samplers: &Samplers<'_>,
    v: &[[f32; VERTEX_FLOAT_COUNT]; 3],
    params: &DrawParams<'_>,
    fragment: Option<&dyn SoftwareFragment>,
) {
    let v0 = v[0];
    let mut v1 = v[1];
    let mut v2 = v[2];
    let area = edge(
        v0[0] as f64, v0[1] as f64, v1[0] as f64, v1[1] as f64, v2[0] as f64, v2[1] as f64,
    );
    if area == 0.0 {
        return;
    }
    if area < 0.0 {
        std::mem::swap(&mut v1, &mut v2);
    }
    let area = area.abs();

    let min_x = v0[0].min(v1[0]).min(v2[0]).floor().max(0.0) as i32;
    let min_y = v0[1].min(v1[1]).min(v2[1]).floor().max(0.0) as i32;
    let max_x = (v0[0].max(v1[0]).max(v2[0]).ceil() as i32).min(dst.width);
    let max_y = (v0[1].max(v1[1]).max(v2[1]).ceil() as i32).min(dst.height);

    // Edges opposite each vertex; barycentric weight i comes from edge i.
    let edges = [(v1, v2), (v2, v0), (v0, v1)];
    for py in min_y..max_y {
        for px in min_x..max_x {
            let cx = px as f64 + 0.5;
            let cy = py as f64 + 0.5;
            let mut w = [0.0f64; 3];
            let mut inside = true;
            for (i, (a, b)) in edges.iter().enumerate() {
                let e = edge(a[0] as f64, a[1] as f64, b[0] as f64, b[1] as f64, cx, cy);
                if e < 0.0
                    || (e == 0.0 && !edge_accepts_zero(a[0] as f64, a[1] as f64, b[0] as f64, b[1] as f64))
                {
                    inside = false;
                    break;
                }
                w[i] = e / area;
            }
            if !inside {
                continue;
            }
            let mut interp = [0.0f32; VERTEX_FLOAT_COUNT];
            for ch in 0..VERTEX_FLOAT_COUNT {
                interp[ch] = (w[0] * v0[ch] as f64 + w[1] * v1[ch] as f64 + w[2] * v2[ch] as f64)
                    as f32;
            }
            let (u, s, color) = (
                [interp[2], interp[3]],
                [cx as f32, cy as f32],
                [interp[4], interp[5], interp[6], interp[7]],
            );
            let out = match fragment {
                Some(frag) => {
                    let region0 = samplers.regions[0];
                    let local = [u[0] - region0.x() as f32, u[1] - region0.y() as f32];
                    frag.fragment(s, local, color, samplers, params.uniforms)
                }
                None => {
                    let texel = samplers.sample(0, u[0], u[1]);
                    [
                        texel[0] * color[0],
                        texel[1] * color[1],
                        texel[2] * color[2],
                        texel[3] * color[3],
                    ]
                }
            };
            let src8 = [
                (out[0].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
                (out[1].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
                (out[2].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
                (out[3].clamp(0.0, 1.0) * 255.0 + 0.5) as u8,
            ];
            let off = ((py * dst.width + px) * 4) as usize;
            let dst8 = [
                dst.pixels[off],
                dst.pixels[off + 1],
                dst.pixels[off + 2],
                dst.pixels[off + 3],
            ];
            let blended = blend_rgba8(params.mode, src8, dst8);
            dst.pixels[off..off + 4].copy_from_slice(&blended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::blend::CompositeMode;
    use crate::graphics::vertex::{append_quad_vertices, QUAD_INDICES};

    fn quad_draw_params<'a>(
        src: Option<TextureId>,
        region: Rect,
        mode: CompositeMode,
        uniforms: &'a [u32],
    ) -> DrawParams<'a> {
        DrawParams {
            srcs: [src, None, None, None],
            src_regions: [region, Rect::default(), Rect::default(), Rect::default()],
            index_offset: 0,
            index_len: 6,
            mode,
            filter: Filter::Nearest,
            address: Address::ClampToZero,
            fill_rule: crate::graphics::driver::FillRule::FillAll,
            shader: None,
            uniforms,
        }
    }

    fn upload_solid(g: &mut SoftwareGraphics, id: TextureId, w: i32, h: i32, px: [u8; 4]) {
        let bytes: Vec<u8> = px.iter().copied().cycle().take((w * h * 4) as usize).collect();
        g.replace_pixels(
            id,
            &[PixelUpload {
                rect: Rect::new(0, 0, w, h),
                bytes: &bytes,
            }],
        )
        .unwrap();
    }

    fn draw_unit_quad(
        g: &mut SoftwareGraphics,
        dst: TextureId,
        src: TextureId,
        w: i32,
        h: i32,
        mode: CompositeMode,
    ) {
        let mut vertices = Vec::new();
        append_quad_vertices(
            &mut vertices,
            0.0,
            0.0,
            w as f32,
            h as f32,
            1.0,
            0.0,
            0.0,
            1.0,
            0.0,
            0.0,
            [1.0; 4],
        );
        g.set_vertices(&vertices, &QUAD_INDICES).unwrap();
        g.set_destination(dst).unwrap();
        g.draw(quad_draw_params(Some(src), Rect::new(0, 0, w, h), mode, &[]))
            .unwrap();
    }

    #[test]
    fn quad_copies_source_exactly() {
        let mut g = SoftwareGraphics::new();
        let src = g.new_image(4, 4).unwrap();
        let dst = g.new_image(4, 4).unwrap();
        upload_solid(&mut g, src, 4, 4, [10, 20, 30, 255]);
        draw_unit_quad(&mut g, dst, src, 4, 4, CompositeMode::Copy);
        let px = g.pixels(dst).unwrap();
        for p in px.chunks_exact(4) {
            assert_eq!(p, &[10, 20, 30, 255]);
        }
    }

    #[test]
    fn shared_diagonal_covers_each_pixel_once() {
        // With Lighter, double coverage along the quad diagonal would
        // show as doubled channel values.
        let mut g = SoftwareGraphics::new();
        let src = g.new_image(8, 8).unwrap();
        let dst = g.new_image(8, 8).unwrap();
        upload_solid(&mut g, src, 8, 8, [60, 0, 0, 60]);
        draw_unit_quad(&mut g, dst, src, 8, 8, CompositeMode::Lighter);
        let px = g.pixels(dst).unwrap();
        for p in px.chunks_exact(4) {
            assert_eq!(p, &[60, 0, 0, 60]);
        }
    }

    #[test]
    fn lighter_accumulates() {
        let mut g = SoftwareGraphics::new();
        let src = g.new_image(2, 2).unwrap();
        let dst = g.new_image(2, 2).unwrap();
        upload_solid(&mut g, src, 2, 2, [100, 0, 0, 100]);
        upload_solid(&mut g, dst, 2, 2, [0, 100, 0, 100]);
        draw_unit_quad(&mut g, dst, src, 2, 2, CompositeMode::Lighter);
        let px = g.pixels(dst).unwrap();
        assert_eq!(&px[0..4], &[100, 100, 0, 200]);
    }

    #[test]
    fn repeat_addressing_tiles_the_region() {
        let mut g = SoftwareGraphics::new();
        let src = g.new_image(2, 1).unwrap();
        let dst = g.new_image(4, 1).unwrap();
        g.replace_pixels(
            src,
            &[PixelUpload {
                rect: Rect::new(0, 0, 2, 1),
                bytes: &[255, 0, 0, 255, 0, 255, 0, 255],
            }],
        )
        .unwrap();
        let mut vertices = Vec::new();
        append_quad_vertices(
            &mut vertices, 0.0, 0.0, 4.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, [1.0; 4],
        );
        g.set_vertices(&vertices, &QUAD_INDICES).unwrap();
        g.set_destination(dst).unwrap();
        let mut params = quad_draw_params(
            Some(src),
            Rect::new(0, 0, 2, 1),
            CompositeMode::Copy,
            &[],
        );
        params.address = Address::Repeat;
        g.draw(params).unwrap();
        let px = g.pixels(dst).unwrap();
        assert_eq!(&px[0..4], &[255, 0, 0, 255]);
        assert_eq!(&px[4..8], &[0, 255, 0, 255]);
        assert_eq!(&px[8..12], &[255, 0, 0, 255]);
        assert_eq!(&px[12..16], &[0, 255, 0, 255]);
    }

    #[test]
    fn context_loss_taints_and_reset_clears() {
        let mut g = SoftwareGraphics::new();
        let id = g.new_image(2, 2).unwrap();
        assert!(!g.is_invalidated(id));
        g.invalidate_context();
        assert!(g.is_invalidated(id));
        assert_eq!(g.begin(), Err(DriverError::ContextLost));
        // Readback reports the loss itself, not a plain failure, so
        // callers know to restore.
        assert_eq!(g.pixels(id), Err(DriverError::ContextLost));
        g.reset().unwrap();
        // Old ids are gone after reset.
        assert!(g.pixels(id).is_err());
        assert!(g.begin().is_ok());
    }

    #[test]
    fn mipmap_chain_reaches_one_pixel() {
        let mut g = SoftwareGraphics::new();
        let id = g.new_image(8, 4).unwrap();
        g.generate_mipmaps(id).unwrap();
        // 8x4 -> 4x2 -> 2x1 -> 1x1, plus the base level.
        assert_eq!(g.mip_level_count(id), 4);
    }

    #[test]
    fn replace_pixels_validates_region_and_length() {
        let mut g = SoftwareGraphics::new();
        let id = g.new_image(4, 4).unwrap();
        let err = g.replace_pixels(
            id,
            &[PixelUpload {
                rect: Rect::new(2, 2, 4, 4),
                bytes: &[0; 64],
            }],
        );
        assert!(err.is_err());
        let err = g.replace_pixels(
            id,
            &[PixelUpload {
                rect: Rect::new(0, 0, 2, 2),
                bytes: &[0; 4],
            }],
        );
        assert!(err.is_err());
    }

    #[test]
    fn stats_count_driver_calls() {
        let mut g = SoftwareGraphics::new();
        let src = g.new_image(2, 2).unwrap();
        let dst = g.new_image(2, 2).unwrap();
        draw_unit_quad(&mut g, dst, src, 2, 2, CompositeMode::SourceOver);
        let stats = g.stats();
        assert_eq!(stats.set_vertices_calls, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.last_index_len, 6);
    }
}
