//! Texture atlas management.
//!
//! Small static images share big page textures, packed by the BSP
//! allocator in [`crate::graphics::packing`]; draws from many of them can
//! then merge into one batch because they share a source texture. Images
//! that cannot safely share (screens, volatile images, caller-flagged
//! unmanaged images, anything with a side over half the page cap) get
//! their own texture.
//!
//! A managed image used as a draw *destination* is first evicted to its
//! own texture, copying its current content with a draw. Rendering into a
//! shared page would invalidate every neighbor's batching assumptions.

use std::collections::HashMap;

use log::debug;

use crate::geom::Rect;
use crate::graphics::blend::CompositeMode;
use crate::graphics::command::{CommandQueue, ImageId};
use crate::graphics::driver::{Address, DriverError, DriverResult, FillRule, Filter};
use crate::graphics::packing::{NodeId, Page as BspPage};
use crate::graphics::restorable::{DrawOp, ImageKind, Images};
use crate::graphics::vertex::{append_quad_vertices, QUAD_INDICES};

/// One pixel of separation between packed neighbors so bilinear sampling
/// cannot bleed across regions.
const PADDING: i32 = 1;

/// Atlas-level image handle, the unit the public API wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtlasImage(u64);

impl AtlasImage {
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Creation options, surfaced through the public API.
#[derive(Debug, Clone, Copy)]
pub struct ImageOptions {
    /// Never place on a shared page.
    pub unmanaged: bool,
    /// Contents last one frame; restores to transparent.
    pub volatile: bool,
    /// Allow deferred mipmap generation for shrinking linear draws.
    /// On unless explicitly disabled.
    pub mipmaps: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            unmanaged: false,
            volatile: false,
            mipmaps: true,
        }
    }
}

struct AtlasPage {
    bsp: BspPage,
    backing: ImageId,
    size: i32,
}

enum Backing {
    Managed { page: usize, node: NodeId },
    Isolated { image: ImageId },
}

struct Entry {
    width: i32,
    height: i32,
    backing: Backing,
    mipmaps: bool,
    mipmap_dirty: bool,
}

/// The atlas: pages, per-image placements, and deferred disposals.
pub struct Atlas {
    pages: Vec<AtlasPage>,
    entries: HashMap<u64, Entry>,
    next: u64,
    next_page_size: i32,
    max_size: i32,
    deferred: Vec<AtlasImage>,
}

impl Atlas {
    #[must_use]
    pub fn new(initial_size: i32, max_size: i32) -> Self {
        Self {
            pages: Vec::new(),
            entries: HashMap::new(),
            next: 1,
            next_page_size: initial_size,
            max_size,
            deferred: Vec::new(),
        }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_managed(&self, id: AtlasImage) -> bool {
        matches!(
            self.entries.get(&id.0).map(|e| &e.backing),
            Some(Backing::Managed { .. })
        )
    }

    #[must_use]
    pub fn size(&self, id: AtlasImage) -> Option<(i32, i32)> {
        self.entries.get(&id.0).map(|e| (e.width, e.height))
    }

    /// Backing image and the region this image occupies in it.
    pub fn region(&self, id: AtlasImage) -> DriverResult<(ImageId, Rect)> {
        let entry = self
            .entries
            .get(&id.0)
            .ok_or_else(|| DriverError::InvalidOperation(format!("unknown image {}", id.0)))?;
        match &entry.backing {
            Backing::Managed { page, node } => {
                let page = &self.pages[*page];
                let region = page.bsp.region(*node);
                Ok((
                    page.backing,
                    Rect::new(region.x(), region.y(), entry.width, entry.height),
                ))
            }
            Backing::Isolated { image } => {
                Ok((*image, Rect::new(0, 0, entry.width, entry.height)))
            }
        }
    }

    /// Place a new image. Managed placement tries existing pages first,
    /// then opens a page, doubling sizes up to the cap.
    pub fn new_image(
        &mut self,
        images: &mut Images,
        queue: &mut CommandQueue,
        width: i32,
        height: i32,
        options: ImageOptions,
    ) -> DriverResult<AtlasImage> {
        let kind = if options.volatile {
            ImageKind::Volatile
        } else {
            ImageKind::Normal
        };
        let too_big = width > self.max_size / 2 || height > self.max_size / 2;
        let backing = if options.unmanaged || options.volatile || too_big {
            Backing::Isolated {
                image: images.create(queue, width, height, kind),
            }
        } else {
            self.place_managed(images, queue, width, height)?
        };
        let id = AtlasImage(self.next);
        self.next += 1;
        self.entries.insert(
            id.0,
            Entry {
                width,
                height,
                backing,
                mipmaps: options.mipmaps,
                mipmap_dirty: false,
            },
        );
        Ok(id)
    }

    /// Wrap the screen framebuffer. Always isolated.
    pub fn new_screen(
        &mut self,
        images: &mut Images,
        queue: &mut CommandQueue,
        width: i32,
        height: i32,
    ) -> AtlasImage {
        let image = images.create(queue, width, height, ImageKind::Screen);
        let id = AtlasImage(self.next);
        self.next += 1;
        self.entries.insert(
            id.0,
            Entry {
                width,
                height,
                backing: Backing::Isolated { image },
                mipmaps: false,
                mipmap_dirty: false,
            },
        );
        id
    }

    fn place_managed(
        &mut self,
        images: &mut Images,
        queue: &mut CommandQueue,
        width: i32,
        height: i32,
    ) -> DriverResult<Backing> {
        let padded_w = width + PADDING;
        let padded_h = height + PADDING;
        for (index, page) in self.pages.iter_mut().enumerate() {
            if let Some(node) = page.bsp.alloc(padded_w, padded_h) {
                return Ok(Backing::Managed { page: index, node });
            }
        }
        let mut size = self.next_page_size;
        while size < self.max_size && (padded_w > size || padded_h > size) {
            size *= 2;
        }
        if padded_w > size || padded_h > size {
            return Err(DriverError::InvalidOperation(format!(
                "image {}x{} does not fit a {} page",
                width, height, size
            )));
        }
        debug!("opening atlas page {} ({}x{})", self.pages.len(), size, size);
        let backing = images.create(queue, size, size, ImageKind::Normal);
        let mut bsp = BspPage::new(size);
        let node = bsp.alloc(padded_w, padded_h).ok_or_else(|| {
            DriverError::InvalidOperation("fresh page refused allocation".into())
        })?;
        let index = self.pages.len();
        self.pages.push(AtlasPage {
            bsp,
            backing,
            size,
        });
        self.next_page_size = (self.next_page_size * 2).min(self.max_size);
        Ok(Backing::Managed { page: index, node })
    }

    /// Give a managed image its own texture, copying its content. Called
    /// before the image is used as a draw destination, and when it is
    /// both source and destination of one draw.
    pub fn ensure_isolated(
        &mut self,
        images: &mut Images,
        queue: &mut CommandQueue,
        id: AtlasImage,
    ) -> DriverResult<()> {
        let (page_index, node, width, height) = {
            let entry = self
                .entries
                .get(&id.0)
                .ok_or_else(|| DriverError::InvalidOperation(format!("unknown image {}", id.0)))?;
            match entry.backing {
                Backing::Isolated { .. } => return Ok(()),
                Backing::Managed { page, node } => (page, node, entry.width, entry.height),
            }
        };
        let (src_image, src_region) = self.region(id)?;
        debug!(
            "evicting image {} ({}x{}) from page {}",
            id.0, width, height, page_index
        );
        let image = images.create(queue, width, height, ImageKind::Normal);
        let mut vertices = Vec::new();
        append_quad_vertices(
            &mut vertices,
            src_region.x() as f32,
            src_region.y() as f32,
            src_region.right() as f32,
            src_region.bottom() as f32,
            1.0,
            0.0,
            0.0,
            1.0,
            0.0,
            0.0,
            [1.0; 4],
        );
        images.draw_triangles(
            queue,
            image,
            DrawOp {
                srcs: [Some(src_image), None, None, None],
                src_regions: [src_region, Rect::default(), Rect::default(), Rect::default()],
                vertices,
                indices: QUAD_INDICES.to_vec(),
                mode: CompositeMode::Copy,
                filter: Filter::Nearest,
                address: Address::ClampToZero,
                fill_rule: FillRule::FillAll,
                shader: None,
                uniforms: Vec::new(),
            },
        )?;
        self.pages[page_index].bsp.free(node);
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.backing = Backing::Isolated { image };
        }
        self.maybe_free_page(images, queue, page_index);
        Ok(())
    }

    /// A shrinking linear-filtered draw read from this image; remember to
    /// rebuild its mipmaps at flush.
    pub fn mark_mipmap_candidate(&mut self, id: AtlasImage) {
        if let Some(entry) = self.entries.get_mut(&id.0) {
            if entry.mipmaps {
                entry.mipmap_dirty = true;
            }
        }
    }

    /// Enqueue mipmap generation for every dirty backing.
    pub fn flush_mipmaps(&mut self, queue: &mut CommandQueue) {
        let mut dirty: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.mipmap_dirty)
            .map(|(&id, _)| id)
            .collect();
        dirty.sort_unstable();
        for id in dirty {
            if let Ok((image, _)) = self.region(AtlasImage(id)) {
                queue.generate_mipmaps(image);
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.mipmap_dirty = false;
            }
        }
    }

    /// Queue a handle for disposal at the next end-of-frame tick.
    pub fn dispose(&mut self, id: AtlasImage) {
        self.deferred.push(id);
    }

    #[must_use]
    pub fn is_disposed(&self, id: AtlasImage) -> bool {
        !self.entries.contains_key(&id.0)
    }

    /// Free everything queued by [`Atlas::dispose`].
    pub fn run_deferred_disposals(&mut self, images: &mut Images, queue: &mut CommandQueue) {
        let deferred = std::mem::take(&mut self.deferred);
        for id in deferred {
            let Some(entry) = self.entries.remove(&id.0) else {
                continue;
            };
            match entry.backing {
                Backing::Managed { page, node } => {
                    self.pages[page].bsp.free(node);
                    self.maybe_free_page(images, queue, page);
                }
                Backing::Isolated { image } => {
                    images.dispose(queue, image);
                }
            }
        }
    }

    /// An empty page is freed only while another page remains, so steady
    /// alloc/free churn does not thrash page creation.
    fn maybe_free_page(&mut self, images: &mut Images, queue: &mut CommandQueue, page: usize) {
        if self.pages.len() <= 1 || !self.pages[page].bsp.is_empty() {
            return;
        }
        let removed = self.pages.remove(page);
        debug!("freeing empty atlas page ({}x{})", removed.size, removed.size);
        images.dispose(queue, removed.backing);
        // Placements index pages by position; fix up the tail.
        for entry in self.entries.values_mut() {
            if let Backing::Managed { page: p, .. } = &mut entry.backing {
                if *p > page {
                    *p -= 1;
                }
            }
        }
    }
}
