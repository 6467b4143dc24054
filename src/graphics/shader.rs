//! Shader sources and uniform packing.
//!
//! A shader is a fragment entry point `Fragment(position, texcoord,
//! color) -> color` sampling up to four source images. Each backend
//! consumes the representation it understands: the OpenGL driver compiles
//! the GLSL text, the software rasterizer invokes a [`SoftwareFragment`]
//! trait object. Uniform values travel as packed little-endian `u32`
//! words, the same buffer for every backend.

use std::fmt;
use std::sync::Arc;

/// Sampling access to the bound source images, in source-region pixel
/// coordinates. The software counterpart of `imageSrcNAt`.
pub trait SourceSampler {
    /// Sample source slot `slot` at `(x, y)` in that source's region
    /// pixels. Returns pre-multiplied RGBA in [0, 1]. Unbound slots
    /// sample transparent black.
    fn src_at(&self, slot: usize, x: f32, y: f32) -> [f32; 4];

    /// The region extent of source slot `slot` in pixels.
    fn src_size(&self, slot: usize) -> (f32, f32);
}

/// Fragment entry point executed by the software rasterizer.
pub trait SoftwareFragment: Send + Sync {
    /// `position` is the destination pixel center; `texcoord` is the
    /// interpolated source coordinate for slot 0; `color` is the
    /// interpolated pre-multiplied color scale. Returns the
    /// pre-multiplied output color in [0, 1].
    fn fragment(
        &self,
        position: [f32; 2],
        texcoord: [f32; 2],
        color: [f32; 4],
        srcs: &dyn SourceSampler,
        uniforms: &[u32],
    ) -> [f32; 4];
}

/// Backend-agnostic shader program description.
#[derive(Clone)]
pub struct ShaderSource {
    /// Name used in logs and errors.
    pub name: String,
    /// GLSL fragment source for GL-family backends.
    pub glsl_fragment: Option<String>,
    /// Software rasterizer entry point.
    pub software: Option<Arc<dyn SoftwareFragment>>,
    /// Number of `u32` uniform words the entry point expects. Draw calls
    /// supplying a different count are contract violations.
    pub uniform_word_count: usize,
}

impl ShaderSource {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            glsl_fragment: None,
            software: None,
            uniform_word_count: 0,
        }
    }

    #[must_use]
    pub fn with_glsl(mut self, fragment: &str) -> Self {
        self.glsl_fragment = Some(fragment.to_string());
        self
    }

    #[must_use]
    pub fn with_software(mut self, fragment: Arc<dyn SoftwareFragment>) -> Self {
        self.software = Some(fragment);
        self
    }

    #[must_use]
    pub fn with_uniform_words(mut self, count: usize) -> Self {
        self.uniform_word_count = count;
        self
    }
}

impl fmt::Debug for ShaderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderSource")
            .field("name", &self.name)
            .field("glsl", &self.glsl_fragment.is_some())
            .field("software", &self.software.is_some())
            .field("uniform_word_count", &self.uniform_word_count)
            .finish()
    }
}

/// Builder packing typed uniform values into `u32` words.
#[derive(Debug, Clone, Default)]
pub struct Uniforms {
    words: Vec<u32>,
}

impl Uniforms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        self.words.push(v.to_bits());
        self
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.words.push(v);
        self
    }

    pub fn push_vec2(&mut self, v: [f32; 2]) -> &mut Self {
        self.push_f32(v[0]).push_f32(v[1])
    }

    pub fn push_vec4(&mut self, v: [f32; 4]) -> &mut Self {
        for c in v {
            self.push_f32(c);
        }
        self
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[must_use]
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
}

/// Read one packed f32 uniform word.
#[must_use]
pub fn uniform_f32(words: &[u32], index: usize) -> f32 {
    f32::from_bits(words[index])
}
