//! Vertex layout shared by every backend.
//!
//! One vertex is 8 × f32, in order: destination x/y in pixels, source u/v
//! in source-image pixels (not normalized), and a pre-multiplied color
//! scale r/g/b/a. The byte layout is little-endian and bit-exact across
//! backends; `to_bytes`/`from_bytes` are the canonical (de)serialization.

/// Number of f32 values per vertex.
pub const VERTEX_FLOAT_COUNT: usize = 8;

/// Indices for one quad made of two triangles.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 1, 2, 3];

/// One vertex of the fixed pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Vertex {
    pub dst_x: f32,
    pub dst_y: f32,
    pub src_x: f32,
    pub src_y: f32,
    pub color_r: f32,
    pub color_g: f32,
    pub color_b: f32,
    pub color_a: f32,
}

impl Vertex {
    #[must_use]
    pub const fn new(dst_x: f32, dst_y: f32, src_x: f32, src_y: f32, color: [f32; 4]) -> Self {
        Self {
            dst_x,
            dst_y,
            src_x,
            src_y,
            color_r: color[0],
            color_g: color[1],
            color_b: color[2],
            color_a: color[3],
        }
    }

    pub fn write_to(self, dst: &mut Vec<f32>) {
        dst.extend_from_slice(&[
            self.dst_x,
            self.dst_y,
            self.src_x,
            self.src_y,
            self.color_r,
            self.color_g,
            self.color_b,
            self.color_a,
        ]);
    }
}

/// Nudge a destination coordinate off the problematic pixel center by
/// aligning it with 1/3-pixel steps. Integer coordinates map to themselves.
#[must_use]
pub fn adjust_destination_pixel(x: f32) -> f32 {
    ((x + 1.0 / 6.0) * 3.0).floor() / 3.0
}

/// Append the 4 vertices of a quad transformed by the affine
/// `[a b tx; c d ty]` to `dst`. The source rectangle is
/// `(sx0, sy0)-(sx1, sy1)` in source pixels; `color` is the pre-multiplied
/// color scale applied to every vertex.
#[allow(clippy::too_many_arguments)]
pub fn append_quad_vertices(
    dst: &mut Vec<f32>,
    sx0: f32,
    sy0: f32,
    sx1: f32,
    sy1: f32,
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    tx: f32,
    ty: f32,
    color: [f32; 4],
) {
    let x = sx1 - sx0;
    let y = sy1 - sy0;
    let (ax, by, cx, dy) = (a * x, b * y, c * x, d * y);
    let corners = [
        (tx, ty, sx0, sy0),
        (ax + tx, cx + ty, sx1, sy0),
        (by + tx, dy + ty, sx0, sy1),
        (ax + by + tx, cx + dy + ty, sx1, sy1),
    ];
    for (px, py, u, v) in corners {
        Vertex::new(
            adjust_destination_pixel(px),
            adjust_destination_pixel(py),
            u,
            v,
            color,
        )
        .write_to(dst);
    }
}

/// Serialize a vertex buffer to little-endian bytes.
#[must_use]
pub fn to_bytes(vertices: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vertices.len() * 4);
    for v in vertices {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Deserialize a little-endian byte buffer back into vertex floats.
///
/// Returns `None` when the length is not a multiple of 4.
#[must_use]
pub fn from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
