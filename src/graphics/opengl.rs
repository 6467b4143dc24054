//! OpenGL graphics driver implementation.
//!
//! The primary render target. Every logical image is a texture with a
//! framebuffer object attached; draws go through one fixed vertex shader
//! that maps destination pixel coordinates to clip space, with blending
//! configured from the composite factor table. Custom fragment shaders
//! are compiled per backend from their GLSL source.
//!
//! Requires a current GL context on the calling thread; the loader
//! closure resolves GL entry points from it.

use std::collections::HashMap;
use std::ffi::{c_void, CString};

use log::{debug, warn};

use crate::graphics::blend::BlendFactor;
use crate::graphics::driver::{
    DrawParams, DriverError, DriverResult, Filter, Graphics, PixelUpload, ShaderId, TextureId,
    YDirection,
};
use crate::graphics::shader::ShaderSource;
use crate::graphics::vertex::VERTEX_FLOAT_COUNT;

const VERT_SHADER_SRC: &str = "\
    #version 100\n\
    attribute vec2 a_dst;\n\
    attribute vec2 a_src;\n\
    attribute vec4 a_color;\n\
    uniform vec2 u_dst_size;\n\
    uniform vec2 u_src_size;\n\
    varying vec2 v_tex;\n\
    varying vec4 v_color;\n\
    void main() {\n\
        v_tex = a_src / u_src_size;\n\
        v_color = a_color;\n\
        vec2 pos = a_dst / u_dst_size * 2.0 - 1.0;\n\
        gl_Position = vec4(pos.x, -pos.y, 0.0, 1.0);\n\
    }\n\
";

const FRAG_SHADER_SRC: &str = "\
    #version 100\n\
    precision mediump float;\n\
    varying vec2 v_tex;\n\
    varying vec4 v_color;\n\
    uniform sampler2D u_tex0;\n\
    void main() {\n\
        gl_FragColor = texture2D(u_tex0, v_tex) * v_color;\n\
    }\n\
";

/// Uniform word capacity of custom shaders, mirrored in their GLSL.
const MAX_UNIFORM_WORDS: usize = 64;

struct GlTexture {
    texture: u32,
    framebuffer: u32,
    width: i32,
    height: i32,
}

struct GlProgram {
    program: u32,
    dst_size: i32,
    src_size: i32,
    uniforms: i32,
}

/// The OpenGL graphics driver.
pub struct GlGraphics {
    textures: HashMap<u32, GlTexture>,
    next_texture: u32,
    programs: HashMap<u32, GlProgram>,
    next_program: u32,
    default_program: Option<GlProgram>,
    vertex_buffer: u32,
    index_buffer: u32,
    index_count: usize,
    destination: Option<TextureId>,
    context_lost: bool,
    max_texture_size: i32,
}

impl GlGraphics {
    /// Resolve entry points from a current GL context and build the
    /// fixed pipeline.
    pub fn new<F>(mut loader: F) -> DriverResult<Self>
    where
        F: FnMut(&str) -> *const c_void,
    {
        gl::load_with(|s| loader(s));

        let mut max_texture_size = 0;
        unsafe {
            gl::GetIntegerv(gl::MAX_TEXTURE_SIZE, &mut max_texture_size);
            gl::Disable(gl::DEPTH_TEST);
            gl::Disable(gl::DITHER);
            gl::PixelStorei(gl::UNPACK_ALIGNMENT, 1);
        }
        if max_texture_size <= 0 {
            return Err(DriverError::NotInitialized);
        }

        let mut driver = Self {
            textures: HashMap::new(),
            next_texture: 1,
            programs: HashMap::new(),
            next_program: 1,
            default_program: None,
            vertex_buffer: 0,
            index_buffer: 0,
            index_count: 0,
            destination: None,
            context_lost: false,
            max_texture_size,
        };
        driver.init_pipeline()?;
        debug!("gl driver up, max texture size {}", max_texture_size);
        Ok(driver)
    }

    /// Called by the window layer when the context is reported lost.
    pub fn notify_context_lost(&mut self) {
        warn!("gl driver: context loss reported");
        self.context_lost = true;
    }

    fn init_pipeline(&mut self) -> DriverResult<()> {
        self.default_program = Some(link_program(VERT_SHADER_SRC, FRAG_SHADER_SRC)?);
        unsafe {
            gl::GenBuffers(1, &mut self.vertex_buffer);
            gl::GenBuffers(1, &mut self.index_buffer);
        }
        Ok(())
    }

    fn texture(&self, id: TextureId) -> DriverResult<&GlTexture> {
        self.textures.get(&id.0).ok_or(DriverError::InvalidTexture(id))
    }

    fn create_texture(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        if width <= 0 || height <= 0 || width > self.max_texture_size || height > self.max_texture_size
        {
            return Err(DriverError::InvalidOperation(format!(
                "texture size {}x{} out of range",
                width, height
            )));
        }
        let mut texture = 0;
        let mut framebuffer = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::NEAREST as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::NEAREST as i32);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA as i32,
                width,
                height,
                0,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                std::ptr::null(),
            );
            gl::GenFramebuffers(1, &mut framebuffer);
            gl::BindFramebuffer(gl::FRAMEBUFFER, framebuffer);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                texture,
                0,
            );
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            gl::BindTexture(gl::TEXTURE_2D, 0);
            if status != gl::FRAMEBUFFER_COMPLETE {
                gl::DeleteFramebuffers(1, &framebuffer);
                gl::DeleteTextures(1, &texture);
                return Err(DriverError::OutOfMemory);
            }
        }
        let id = self.next_texture;
        self.next_texture += 1;
        self.textures.insert(
            id,
            GlTexture {
                texture,
                framebuffer,
                width,
                height,
            },
        );
        Ok(TextureId(id))
    }

    fn cleanup(&mut self) {
        for tex in self.textures.values() {
            unsafe {
                gl::DeleteFramebuffers(1, &tex.framebuffer);
                gl::DeleteTextures(1, &tex.texture);
            }
        }
        self.textures.clear();
        for prog in self.programs.values() {
            unsafe {
                gl::DeleteProgram(prog.program);
            }
        }
        self.programs.clear();
        if let Some(prog) = self.default_program.take() {
            unsafe {
                gl::DeleteProgram(prog.program);
            }
        }
        if self.vertex_buffer != 0 {
            unsafe {
                gl::DeleteBuffers(1, &self.vertex_buffer);
            }
            self.vertex_buffer = 0;
        }
        if self.index_buffer != 0 {
            unsafe {
                gl::DeleteBuffers(1, &self.index_buffer);
            }
            self.index_buffer = 0;
        }
        self.destination = None;
    }
}

impl Drop for GlGraphics {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// SAFETY: the coordinator pins all driver calls to the GPU thread that
// owns the GL context.
unsafe impl Send for GlGraphics {}

impl Graphics for GlGraphics {
    fn begin(&mut self) -> DriverResult<()> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        Ok(())
    }

    fn end(&mut self) -> DriverResult<()> {
        unsafe {
            gl::Flush();
        }
        Ok(())
    }

    fn new_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        self.create_texture(width, height)
    }

    fn new_screen_framebuffer_image(&mut self, width: i32, height: i32) -> DriverResult<TextureId> {
        // Rendered into an FBO like any other target; the compositor
        // presents it.
        self.create_texture(width, height)
    }

    fn dispose_image(&mut self, id: TextureId) {
        if let Some(tex) = self.textures.remove(&id.0) {
            unsafe {
                gl::DeleteFramebuffers(1, &tex.framebuffer);
                gl::DeleteTextures(1, &tex.texture);
            }
        }
    }

    fn set_vertices(&mut self, vertices: &[f32], indices: &[u32]) -> DriverResult<()> {
        self.index_count = indices.len();
        unsafe {
            gl::BindBuffer(gl::ARRAY_BUFFER, self.vertex_buffer);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                std::mem::size_of_val(vertices) as isize,
                vertices.as_ptr().cast(),
                gl::DYNAMIC_DRAW,
            );
            gl::BindBuffer(gl::ELEMENT_ARRAY_BUFFER, self.index_buffer);
            gl::BufferData(
                gl::ELEMENT_ARRAY_BUFFER,
                std::mem::size_of_val(indices) as isize,
                indices.as_ptr().cast(),
                gl::DYNAMIC_DRAW,
            );
        }
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
        let dst_id = self
            .destination
            .ok_or_else(|| DriverError::InvalidOperation("no destination bound".into()))?;
        let dst = self.texture(dst_id)?;
        if params.index_offset + params.index_len > self.index_count {
            return Err(DriverError::InvalidOperation(format!(
                "index range {}..{} out of buffer of {}",
                params.index_offset,
                params.index_offset + params.index_len,
                self.index_count
            )));
        }

        let program = match params.shader {
            Some(id) => self
                .programs
                .get(&id.0)
                .ok_or(DriverError::InvalidShader(id))?,
            None => self
                .default_program
                .as_ref()
                .ok_or(DriverError::NotInitialized)?,
        };

        let (src_factor, dst_factor) = params.mode.factors();
        let filter = match params.filter {
            Filter::Nearest => gl::NEAREST,
            Filter::Linear => gl::LINEAR,
        };
        let src_size = params.srcs[0]
            .and_then(|id| self.textures.get(&id.0))
            .map_or((1.0, 1.0), |t| (t.width as f32, t.height as f32));

        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, dst.framebuffer);
            gl::Viewport(0, 0, dst.width, dst.height);
            gl::UseProgram(program.program);
            gl::Uniform2f(program.dst_size, dst.width as f32, dst.height as f32);
            gl::Uniform2f(program.src_size, src_size.0, src_size.1);
            if program.uniforms >= 0 && !params.uniforms.is_empty() {
                let words: Vec<f32> = params
                    .uniforms
                    .iter()
                    .take(MAX_UNIFORM_WORDS)
                    .map(|&w| f32::from_bits(w))
                    .collect();
                gl::Uniform1fv(program.uniforms, words.len() as i32, words.as_ptr());
            }

            for (slot, src) in params.srcs.iter().enumerate() {
                let Some(src) = src else { continue };
                let tex = self.textures.get(&src.0).ok_or_else(|| {
                    DriverError::InvalidTexture(*src)
                })?;
                gl::ActiveTexture(gl::TEXTURE0 + slot as u32);
                gl::BindTexture(gl::TEXTURE_2D, tex.texture);
                gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, filter as i32);
                gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, filter as i32);
            }

            gl::Enable(gl::BLEND);
            gl::BlendFunc(blend_factor_gl(src_factor), blend_factor_gl(dst_factor));

            gl::BindBuffer(gl::ARRAY_BUFFER, self.vertex_buffer);
            gl::BindBuffer(gl::ELEMENT_ARRAY_BUFFER, self.index_buffer);
            let stride = (VERTEX_FLOAT_COUNT * std::mem::size_of::<f32>()) as i32;
            gl::EnableVertexAttribArray(0);
            gl::VertexAttribPointer(0, 2, gl::FLOAT, gl::FALSE, stride, std::ptr::null());
            gl::EnableVertexAttribArray(1);
            gl::VertexAttribPointer(
                1,
                2,
                gl::FLOAT,
                gl::FALSE,
                stride,
                (2 * std::mem::size_of::<f32>()) as *const _,
            );
            gl::EnableVertexAttribArray(2);
            gl::VertexAttribPointer(
                2,
                4,
                gl::FLOAT,
                gl::FALSE,
                stride,
                (4 * std::mem::size_of::<f32>()) as *const _,
            );
            gl::DrawElements(
                gl::TRIANGLES,
                params.index_len as i32,
                gl::UNSIGNED_INT,
                (params.index_offset * std::mem::size_of::<u32>()) as *const _,
            );
            gl::DisableVertexAttribArray(0);
            gl::DisableVertexAttribArray(1);
            gl::DisableVertexAttribArray(2);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
        }
        Ok(())
    }

    fn replace_pixels(&mut self, id: TextureId, regions: &[PixelUpload<'_>]) -> DriverResult<()> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        let tex = self.texture(id)?;
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, tex.texture);
            for upload in regions {
                let want = (upload.rect.area() * 4) as usize;
                if upload.bytes.len() != want {
                    return Err(DriverError::InvalidOperation(format!(
                        "upload byte length {} != {}",
                        upload.bytes.len(),
                        want
                    )));
                }
                gl::TexSubImage2D(
                    gl::TEXTURE_2D,
                    0,
                    upload.rect.x(),
                    upload.rect.y(),
                    upload.rect.width(),
                    upload.rect.height(),
                    gl::RGBA,
                    gl::UNSIGNED_BYTE,
                    upload.bytes.as_ptr().cast(),
                );
            }
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        Ok(())
    }

    fn pixels(&mut self, id: TextureId) -> DriverResult<Vec<u8>> {
        if self.context_lost {
            return Err(DriverError::ContextLost);
        }
        let tex = self.texture(id)?;
        let mut pixels = vec![0u8; (tex.width * tex.height * 4) as usize];
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, tex.framebuffer);
            gl::ReadPixels(
                0,
                0,
                tex.width,
                tex.height,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                pixels.as_mut_ptr().cast(),
            );
            let err = gl::GetError();
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            if err != gl::NO_ERROR {
                return Err(DriverError::ReadbackFailed(format!("gl error 0x{:x}", err)));
            }
        }
        Ok(pixels)
    }

    fn is_invalidated(&self, id: TextureId) -> bool {
        self.context_lost || !self.textures.contains_key(&id.0)
    }

    fn needs_restoring(&self) -> bool {
        true
    }

    fn reset(&mut self) -> DriverResult<()> {
        debug!("gl driver: reset after context loss");
        self.cleanup();
        self.context_lost = false;
        self.init_pipeline()
    }

    fn max_image_size(&self) -> i32 {
        self.max_texture_size
    }

    fn y_direction(&self) -> YDirection {
        YDirection::Upward
    }

    fn supports_mipmaps(&self) -> bool {
        true
    }

    fn generate_mipmaps(&mut self, id: TextureId) -> DriverResult<()> {
        let tex = self.texture(id)?;
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, tex.texture);
            gl::GenerateMipmap(gl::TEXTURE_2D);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        Ok(())
    }

    fn new_shader(&mut self, source: &ShaderSource) -> DriverResult<ShaderId> {
        let fragment = source.glsl_fragment.as_deref().ok_or_else(|| {
            DriverError::ShaderCompileFailed(format!("shader {} has no GLSL source", source.name))
        })?;
        let program = link_program(VERT_SHADER_SRC, fragment)?;
        let id = self.next_program;
        self.next_program += 1;
        self.programs.insert(id, program);
        Ok(ShaderId(id))
    }

    fn dispose_shader(&mut self, id: ShaderId) {
        if let Some(prog) = self.programs.remove(&id.0) {
            unsafe {
                gl::DeleteProgram(prog.program);
            }
        }
    }
}

fn blend_factor_gl(factor: BlendFactor) -> u32 {
    match factor {
        BlendFactor::Zero => gl::ZERO,
        BlendFactor::One => gl::ONE,
        BlendFactor::SourceAlpha => gl::SRC_ALPHA,
        BlendFactor::DestinationAlpha => gl::DST_ALPHA,
        BlendFactor::OneMinusSourceAlpha => gl::ONE_MINUS_SRC_ALPHA,
        BlendFactor::OneMinusDestinationAlpha => gl::ONE_MINUS_DST_ALPHA,
        BlendFactor::DestinationColor => gl::DST_COLOR,
    }
}

fn link_program(vertex_src: &str, fragment_src: &str) -> DriverResult<GlProgram> {
    let vertex_shader = compile_shader(gl::VERTEX_SHADER, vertex_src)?;
    let fragment_shader = compile_shader(gl::FRAGMENT_SHADER, fragment_src)?;
    let program = unsafe { gl::CreateProgram() };

    unsafe {
        gl::AttachShader(program, vertex_shader);
        gl::AttachShader(program, fragment_shader);
        gl::BindAttribLocation(program, 0, b"a_dst\0".as_ptr().cast());
        gl::BindAttribLocation(program, 1, b"a_src\0".as_ptr().cast());
        gl::BindAttribLocation(program, 2, b"a_color\0".as_ptr().cast());
        gl::LinkProgram(program);
    }

    let mut link_status = 0;
    unsafe {
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut link_status);
    }
    if link_status == 0 {
        let log = program_info_log(program);
        unsafe {
            gl::DeleteProgram(program);
            gl::DeleteShader(vertex_shader);
            gl::DeleteShader(fragment_shader);
        }
        return Err(DriverError::ShaderCompileFailed(format!(
            "link failed: {}",
            log
        )));
    }

    let (dst_size, src_size, uniforms, samplers);
    unsafe {
        gl::DetachShader(program, vertex_shader);
        gl::DetachShader(program, fragment_shader);
        gl::DeleteShader(vertex_shader);
        gl::DeleteShader(fragment_shader);
        gl::UseProgram(program);
        dst_size = gl::GetUniformLocation(program, b"u_dst_size\0".as_ptr().cast());
        src_size = gl::GetUniformLocation(program, b"u_src_size\0".as_ptr().cast());
        uniforms = gl::GetUniformLocation(program, b"u_uniforms\0".as_ptr().cast());
        samplers = [
            gl::GetUniformLocation(program, b"u_tex0\0".as_ptr().cast()),
            gl::GetUniformLocation(program, b"u_tex1\0".as_ptr().cast()),
            gl::GetUniformLocation(program, b"u_tex2\0".as_ptr().cast()),
            gl::GetUniformLocation(program, b"u_tex3\0".as_ptr().cast()),
        ];
        for (slot, location) in samplers.iter().enumerate() {
            if *location >= 0 {
                gl::Uniform1i(*location, slot as i32);
            }
        }
    }

    Ok(GlProgram {
        program,
        dst_size,
        src_size,
        uniforms,
    })
}

fn compile_shader(shader_type: u32, source: &str) -> DriverResult<u32> {
    let shader = unsafe { gl::CreateShader(shader_type) };
    let c_str = CString::new(source).map_err(|e| {
        DriverError::ShaderCompileFailed(format!("source contains null: {}", e))
    })?;

    unsafe {
        gl::ShaderSource(shader, 1, &c_str.as_ptr(), std::ptr::null());
        gl::CompileShader(shader);
    }

    let mut status = 0;
    unsafe {
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
    }
    if status == 0 {
        let log = shader_info_log(shader);
        unsafe {
            gl::DeleteShader(shader);
        }
        return Err(DriverError::ShaderCompileFailed(log));
    }

    Ok(shader)
}

fn shader_info_log(shader: u32) -> String {
    let mut len = 0;
    unsafe {
        gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
    }
    if len <= 1 {
        return String::new();
    }

    let mut buffer = vec![0u8; len as usize];
    unsafe {
        gl::GetShaderInfoLog(shader, len, std::ptr::null_mut(), buffer.as_mut_ptr().cast());
    }
    String::from_utf8_lossy(&buffer)
        .trim_end_matches('\0')
        .to_string()
}

fn program_info_log(program: u32) -> String {
    let mut len = 0;
    unsafe {
        gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
    }
    if len <= 1 {
        return String::new();
    }

    let mut buffer = vec![0u8; len as usize];
    unsafe {
        gl::GetProgramInfoLog(program, len, std::ptr::null_mut(), buffer.as_mut_ptr().cast());
    }
    String::from_utf8_lossy(&buffer)
        .trim_end_matches('\0')
        .to_string()
}
