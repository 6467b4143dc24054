//! Context-loss recovery.
//!
//! Every image above the command queue carries a restorable record: a
//! cache of uploaded base pixels plus an ordered log of the triangle
//! draws applied since. After the driver reports a lost context, the
//! records are replayed onto fresh textures in dependency order.
//!
//! Cycles never reach the restore path. Whenever an image becomes a draw
//! target, every record whose log reads from it is marked stale; stale
//! records are resolved by reading their current pixels back from the GPU
//! at end-of-frame, which truncates their logs. The dependency graph at
//! restore time is therefore acyclic.

use std::collections::HashMap;

use log::{debug, info};

use crate::geom::Rect;
use crate::graphics::blend::CompositeMode;
use crate::graphics::command::{CommandQueue, DrawTrianglesRequest, ImageId, ShaderHandle};
use crate::graphics::driver::{Address, DriverError, DriverResult, FillRule, Filter, Graphics};

/// A log longer than this is cheaper to resolve by readback than to
/// replay.
const MAX_DRAW_HISTORY: usize = 1024;

/// Restoration flavor of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Restored from base pixels and the draw log.
    Normal,
    /// Contents are valid for one frame only; restores to transparent.
    Volatile,
    /// The screen framebuffer; recreated, never replayed.
    Screen,
}

/// One logged triangle draw.
#[derive(Clone)]
pub struct DrawOp {
    pub srcs: [Option<ImageId>; 4],
    pub src_regions: [Rect; 4],
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub mode: CompositeMode,
    pub filter: Filter,
    pub address: Address,
    pub fill_rule: FillRule,
    pub shader: Option<ShaderHandle>,
    pub uniforms: Vec<u32>,
}

struct Record {
    width: i32,
    height: i32,
    kind: ImageKind,
    /// Uploaded pixel regions. A full-cover upload supersedes the rest.
    base_pixels: Vec<(Rect, Vec<u8>)>,
    ops: Vec<DrawOp>,
    stale: bool,
}

impl Record {
    fn depends_on(&self, target: ImageId) -> bool {
        self.ops
            .iter()
            .any(|op| op.srcs.iter().flatten().any(|&s| s == target))
    }
}

/// The set of restorable images.
#[derive(Default)]
pub struct Images {
    records: HashMap<u32, Record>,
}

impl Images {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an image and its record. The texture itself is created
    /// lazily by the queue.
    pub fn create(
        &mut self,
        queue: &mut CommandQueue,
        width: i32,
        height: i32,
        kind: ImageKind,
    ) -> ImageId {
        let id = queue.new_image(width, height, kind == ImageKind::Screen);
        self.records.insert(
            id.id(),
            Record {
                width,
                height,
                kind,
                base_pixels: Vec::new(),
                ops: Vec::new(),
                stale: false,
            },
        );
        id
    }

    #[must_use]
    pub fn contains(&self, id: ImageId) -> bool {
        self.records.contains_key(&id.id())
    }

    #[must_use]
    pub fn kind(&self, id: ImageId) -> Option<ImageKind> {
        self.records.get(&id.id()).map(|r| r.kind)
    }

    #[must_use]
    pub fn is_stale(&self, id: ImageId) -> bool {
        self.records.get(&id.id()).is_some_and(|r| r.stale)
    }

    #[must_use]
    pub fn logged_ops(&self, id: ImageId) -> usize {
        self.records.get(&id.id()).map_or(0, |r| r.ops.len())
    }

    /// Record and forward a pixel upload. A full-cover upload prunes the
    /// record: everything before it is unreachable.
    pub fn replace_pixels(
        &mut self,
        queue: &mut CommandQueue,
        id: ImageId,
        rect: Rect,
        bytes: Vec<u8>,
    ) -> DriverResult<()> {
        if !self.records.contains_key(&id.id()) {
            return Err(DriverError::InvalidOperation(format!(
                "unknown image {}",
                id.id()
            )));
        }
        // The written content replaces what dependents' logs read from.
        self.make_stale_if_depending_on(id);

        let record = self
            .records
            .get_mut(&id.id())
            .ok_or_else(|| DriverError::InvalidOperation(format!("unknown image {}", id.id())))?;
        let full = rect == Rect::new(0, 0, record.width, record.height);
        if full {
            record.base_pixels.clear();
            record.ops.clear();
            record.stale = false;
        }
        if record.kind == ImageKind::Normal && !record.stale {
            if record.ops.is_empty() {
                record.base_pixels.push((rect, bytes.clone()));
            } else {
                // A partial write after logged draws cannot be replayed in
                // order (base pixels upload first on restore); fall back to
                // an end-of-frame readback of the final content.
                record.stale = true;
            }
        }
        queue.write_pixels(id, rect, bytes);
        Ok(())
    }

    /// Record and forward a triangle draw onto `dst`.
    pub fn draw_triangles(
        &mut self,
        queue: &mut CommandQueue,
        dst: ImageId,
        op: DrawOp,
    ) -> DriverResult<()> {
        if !self.records.contains_key(&dst.id()) {
            return Err(DriverError::InvalidOperation(format!(
                "unknown image {}",
                dst.id()
            )));
        }
        // dst is now a target; anything replaying from it would see the
        // new content instead of the logged one.
        self.make_stale_if_depending_on(dst);

        let record = self.records.get_mut(&dst.id()).ok_or_else(|| {
            DriverError::InvalidOperation(format!("unknown image {}", dst.id()))
        })?;
        let self_draw = op.srcs.iter().flatten().any(|&s| s == dst);
        if self_draw {
            record.stale = true;
        }
        queue.draw_triangles(DrawTrianglesRequest {
            dst,
            srcs: op.srcs,
            src_regions: op.src_regions,
            vertices: &op.vertices,
            indices: &op.indices,
            mode: op.mode,
            filter: op.filter,
            address: op.address,
            fill_rule: op.fill_rule,
            shader: op.shader,
            uniforms: op.uniforms.clone(),
        });

        let record = self.records.get_mut(&dst.id()).ok_or_else(|| {
            DriverError::InvalidOperation(format!("unknown image {}", dst.id()))
        })?;
        if record.kind == ImageKind::Normal && !record.stale {
            record.ops.push(op);
            if record.ops.len() > MAX_DRAW_HISTORY {
                debug!("image {} exceeded draw history, marking stale", dst.id());
                record.stale = true;
            }
        }
        Ok(())
    }

    /// Mark stale every record whose log depends on `target`.
    pub fn make_stale_if_depending_on(&mut self, target: ImageId) {
        for (id, record) in &mut self.records {
            if *id != target.id() && record.kind == ImageKind::Normal && record.depends_on(target)
            {
                record.stale = true;
            }
        }
    }

    /// Read every stale record's pixels back and truncate its log. Runs
    /// at end-of-frame, while the context is known good.
    pub fn resolve_stale(
        &mut self,
        queue: &mut CommandQueue,
        driver: &mut dyn Graphics,
    ) -> DriverResult<()> {
        let stale: Vec<u32> = self
            .records
            .iter()
            .filter(|(_, r)| r.stale)
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            let pixels = queue.read_pixels(driver, ImageId::from_raw(id))?;
            let record = self.records.get_mut(&id).ok_or_else(|| {
                DriverError::InvalidOperation(format!("unknown image {}", id))
            })?;
            record.base_pixels = vec![(Rect::new(0, 0, record.width, record.height), pixels)];
            record.ops.clear();
            record.stale = false;
        }
        Ok(())
    }

    /// Drop a record. Records replaying from it can no longer do so and
    /// are resolved by readback first.
    pub fn dispose(&mut self, queue: &mut CommandQueue, id: ImageId) {
        self.make_stale_if_depending_on(id);
        self.records.remove(&id.id());
        queue.dispose_image(id);
    }

    /// Replay every record onto fresh textures after `Graphics::reset`
    /// and `CommandQueue::reset`. Restores sources before the records
    /// that draw from them.
    pub fn restore(
        &mut self,
        queue: &mut CommandQueue,
        driver: &mut dyn Graphics,
    ) -> DriverResult<()> {
        info!("restoring {} images after context loss", self.records.len());
        for id in self.restore_order()? {
            let record = self.records.get(&id).ok_or_else(|| {
                DriverError::InvalidOperation(format!("unknown image {}", id))
            })?;
            if record.kind != ImageKind::Normal {
                // Fresh textures are already transparent.
                continue;
            }
            let image = ImageId::from_raw(id);
            for (rect, bytes) in record.base_pixels.clone() {
                queue.write_pixels(image, rect, bytes);
            }
            for op in record.ops.clone() {
                queue.draw_triangles(DrawTrianglesRequest {
                    dst: image,
                    srcs: op.srcs,
                    src_regions: op.src_regions,
                    vertices: &op.vertices,
                    indices: &op.indices,
                    mode: op.mode,
                    filter: op.filter,
                    address: op.address,
                    fill_rule: op.fill_rule,
                    shader: op.shader,
                    uniforms: op.uniforms,
                });
            }
        }
        queue.flush(driver)
    }

    /// Topological order over draw dependencies. The stale policy keeps
    /// the graph acyclic; a cycle here is a bug.
    fn restore_order(&self) -> DriverResult<Vec<u32>> {
        let mut order = Vec::with_capacity(self.records.len());
        let mut done: HashMap<u32, bool> = HashMap::new();
        let mut ids: Vec<u32> = self.records.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            self.visit(*id, &mut done, &mut order, 0)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: u32,
        done: &mut HashMap<u32, bool>,
        order: &mut Vec<u32>,
        depth: usize,
    ) -> DriverResult<()> {
        match done.get(&id) {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(DriverError::InvalidOperation(format!(
                    "dependency cycle through image {}",
                    id
                )))
            }
            None => {}
        }
        if depth > self.records.len() {
            return Err(DriverError::InvalidOperation(
                "restore recursion too deep".into(),
            ));
        }
        done.insert(id, false);
        if let Some(record) = self.records.get(&id) {
            for op in &record.ops {
                for src in op.srcs.iter().flatten() {
                    if self.records.contains_key(&src.id()) {
                        self.visit(src.id(), done, order, depth + 1)?;
                    }
                }
            }
        }
        done.insert(id, true);
        order.push(id);
        Ok(())
    }

    /// Clear every volatile image at the top of a frame.
    pub fn clear_volatile(&mut self, queue: &mut CommandQueue) {
        for (&id, record) in &mut self.records {
            if record.kind == ImageKind::Volatile {
                let rect = Rect::new(0, 0, record.width, record.height);
                queue.write_pixels(
                    ImageId::from_raw(id),
                    rect,
                    vec![0; (rect.area() * 4) as usize],
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::software::SoftwareGraphics;
    use crate::graphics::vertex::{append_quad_vertices, QUAD_INDICES};

    fn copy_op(src: ImageId, size: f32) -> DrawOp {
        let mut vertices = Vec::new();
        append_quad_vertices(
            &mut vertices,
            0.0,
            0.0,
            size,
            size,
            1.0,
            0.0,
            0.0,
            1.0,
            0.0,
            0.0,
            [1.0; 4],
        );
        DrawOp {
            srcs: [Some(src), None, None, None],
            src_regions: [
                Rect::new(0, 0, size as i32, size as i32),
                Rect::default(),
                Rect::default(),
                Rect::default(),
            ],
            vertices,
            indices: QUAD_INDICES.to_vec(),
            mode: CompositeMode::SourceOver,
            filter: Filter::Nearest,
            address: Address::ClampToZero,
            fill_rule: FillRule::FillAll,
            shader: None,
            uniforms: Vec::new(),
        }
    }

    fn red(n: usize) -> Vec<u8> {
        solid(n, [255, 0, 0, 255])
    }

    fn solid(n: usize, px: [u8; 4]) -> Vec<u8> {
        px.iter().copied().cycle().take(n * 4).collect()
    }

    #[test]
    fn restore_replays_upload_and_draw() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let i = images.create(&mut queue, 4, 4, ImageKind::Normal);
        let j = images.create(&mut queue, 4, 4, ImageKind::Normal);
        images
            .replace_pixels(&mut queue, i, Rect::new(0, 0, 4, 4), red(16))
            .unwrap();
        images.draw_triangles(&mut queue, j, copy_op(i, 4.0)).unwrap();
        queue.flush(&mut driver).unwrap();

        driver.invalidate_context();
        driver.reset().unwrap();
        queue.reset();
        images.restore(&mut queue, &mut driver).unwrap();

        let px = queue.read_pixels(&mut driver, j).unwrap();
        for p in px.chunks_exact(4) {
            assert_eq!(p, &[255, 0, 0, 255]);
        }
    }

    #[test]
    fn drawing_into_a_source_marks_dependents_stale() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let i = images.create(&mut queue, 4, 4, ImageKind::Normal);
        let j = images.create(&mut queue, 4, 4, ImageKind::Normal);
        let k = images.create(&mut queue, 4, 4, ImageKind::Normal);
        images.draw_triangles(&mut queue, k, copy_op(j, 4.0)).unwrap();
        assert!(!images.is_stale(k));
        // j becomes a target; k's log would now replay the wrong j.
        images.draw_triangles(&mut queue, j, copy_op(i, 4.0)).unwrap();
        assert!(images.is_stale(k));

        images.resolve_stale(&mut queue, &mut driver).unwrap();
        assert!(!images.is_stale(k));
        assert_eq!(images.logged_ops(k), 0);
    }

    #[test]
    fn overwriting_a_source_marks_dependents_stale() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let i = images.create(&mut queue, 4, 4, ImageKind::Normal);
        let j = images.create(&mut queue, 4, 4, ImageKind::Normal);
        images
            .replace_pixels(&mut queue, i, Rect::new(0, 0, 4, 4), red(16))
            .unwrap();
        images.draw_triangles(&mut queue, j, copy_op(i, 4.0)).unwrap();
        // i's content changes; j's log must not replay against it.
        images
            .replace_pixels(&mut queue, i, Rect::new(0, 0, 4, 4), solid(16, [0, 255, 0, 255]))
            .unwrap();
        assert!(images.is_stale(j));

        images.resolve_stale(&mut queue, &mut driver).unwrap();
        driver.invalidate_context();
        driver.reset().unwrap();
        queue.reset();
        images.restore(&mut queue, &mut driver).unwrap();

        let px = queue.read_pixels(&mut driver, j).unwrap();
        assert_eq!(&px[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn partial_upload_after_draws_goes_stale() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let i = images.create(&mut queue, 4, 4, ImageKind::Normal);
        let j = images.create(&mut queue, 4, 4, ImageKind::Normal);
        images
            .replace_pixels(&mut queue, i, Rect::new(0, 0, 4, 4), red(16))
            .unwrap();
        images.draw_triangles(&mut queue, j, copy_op(i, 4.0)).unwrap();
        // Base pixels replay before the log on restore, so a partial
        // write after a draw cannot keep its position in the order.
        images
            .replace_pixels(&mut queue, j, Rect::new(0, 0, 1, 1), solid(1, [255, 255, 255, 255]))
            .unwrap();
        assert!(images.is_stale(j));

        images.resolve_stale(&mut queue, &mut driver).unwrap();
        driver.invalidate_context();
        driver.reset().unwrap();
        queue.reset();
        images.restore(&mut queue, &mut driver).unwrap();

        let px = queue.read_pixels(&mut driver, j).unwrap();
        assert_eq!(&px[..4], &[255, 255, 255, 255]);
        assert_eq!(&px[4..8], &[255, 0, 0, 255]);
    }

    #[test]
    fn full_cover_upload_prunes_the_log() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let i = images.create(&mut queue, 4, 4, ImageKind::Normal);
        let j = images.create(&mut queue, 4, 4, ImageKind::Normal);
        images.draw_triangles(&mut queue, j, copy_op(i, 4.0)).unwrap();
        assert_eq!(images.logged_ops(j), 1);
        images
            .replace_pixels(&mut queue, j, Rect::new(0, 0, 4, 4), red(16))
            .unwrap();
        assert_eq!(images.logged_ops(j), 0);
        queue.flush(&mut driver).unwrap();
    }

    #[test]
    fn self_draw_goes_stale_immediately() {
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let i = images.create(&mut queue, 4, 4, ImageKind::Normal);
        images.draw_triangles(&mut queue, i, copy_op(i, 4.0)).unwrap();
        assert!(images.is_stale(i));
    }

    #[test]
    fn volatile_restores_to_transparent() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        let v = images.create(&mut queue, 2, 2, ImageKind::Volatile);
        images
            .replace_pixels(&mut queue, v, Rect::new(0, 0, 2, 2), red(4))
            .unwrap();
        queue.flush(&mut driver).unwrap();

        driver.invalidate_context();
        driver.reset().unwrap();
        queue.reset();
        images.restore(&mut queue, &mut driver).unwrap();

        let px = queue.read_pixels(&mut driver, v).unwrap();
        assert!(px.iter().all(|&b| b == 0));
    }

    #[test]
    fn restore_orders_sources_first() {
        let mut driver = SoftwareGraphics::new();
        let mut queue = CommandQueue::new(16384);
        let mut images = Images::new();
        // Chain a -> b -> c by draws; create in reverse to stress the
        // ordering.
        let c = images.create(&mut queue, 2, 2, ImageKind::Normal);
        let b = images.create(&mut queue, 2, 2, ImageKind::Normal);
        let a = images.create(&mut queue, 2, 2, ImageKind::Normal);
        images
            .replace_pixels(&mut queue, a, Rect::new(0, 0, 2, 2), red(4))
            .unwrap();
        images.draw_triangles(&mut queue, b, copy_op(a, 2.0)).unwrap();
        images.draw_triangles(&mut queue, c, copy_op(b, 2.0)).unwrap();
        queue.flush(&mut driver).unwrap();

        driver.invalidate_context();
        driver.reset().unwrap();
        queue.reset();
        images.restore(&mut queue, &mut driver).unwrap();

        let px = queue.read_pixels(&mut driver, c).unwrap();
        assert_eq!(&px[0..4], &[255, 0, 0, 255]);
    }
}
