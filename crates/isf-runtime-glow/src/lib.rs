//! OpenGL backend for the ISF runtime, over `glow`.
//
// This crate only realizes `GpuBackend` calls:
// - compile/link programs
// - textures and framebuffers (render targets, host uploads)
// - fullscreen draws, blits and readback
//
// The host creates the context and keeps it current; nothing here creates windows or contexts.
#![allow(clippy::missing_safety_doc)]
#![deny(missing_debug_implementations)]

use glow::HasContext;

use isf_core::{EngineError, ShaderStage, TextureFormat};
use isf_runtime::glsl::POSITION_ATTRIB;
use isf_runtime::{DrawCall, GpuBackend, TextureDesc, UniformValue};

/// `(internal format, pixel format, component type)` for a texture format.
pub fn gl_formats(format: TextureFormat) -> (i32, u32, u32) {
    match format {
        TextureFormat::Rgba8 => (glow::RGBA8 as i32, glow::RGBA, glow::UNSIGNED_BYTE),
        TextureFormat::Rgba32F => (glow::RGBA32F as i32, glow::RGBA, glow::FLOAT),
    }
}

/// Compile and link a program. Failures carry the stage and the driver log verbatim.
pub unsafe fn compile_program(
    gl: &glow::Context,
    vert_src: &str,
    frag_src: &str,
) -> Result<glow::NativeProgram, (ShaderStage, String)> {
    let vs = gl
        .create_shader(glow::VERTEX_SHADER)
        .map_err(|e| (ShaderStage::Vertex, format!("create_shader(VS) failed: {e:?}")))?;
    gl.shader_source(vs, vert_src);
    gl.compile_shader(vs);
    if !gl.get_shader_compile_status(vs) {
        let log = gl.get_shader_info_log(vs);
        gl.delete_shader(vs);
        return Err((ShaderStage::Vertex, log));
    }

    let fs = match gl.create_shader(glow::FRAGMENT_SHADER) {
        Ok(fs) => fs,
        Err(e) => {
            gl.delete_shader(vs);
            return Err((ShaderStage::Fragment, format!("create_shader(FS) failed: {e:?}")));
        }
    };
    gl.shader_source(fs, frag_src);
    gl.compile_shader(fs);
    if !gl.get_shader_compile_status(fs) {
        let log = gl.get_shader_info_log(fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);
        return Err((ShaderStage::Fragment, log));
    }

    let program = match gl.create_program() {
        Ok(p) => p,
        Err(e) => {
            gl.delete_shader(vs);
            gl.delete_shader(fs);
            return Err((ShaderStage::Link, format!("create_program failed: {e:?}")));
        }
    };
    gl.attach_shader(program, vs);
    gl.attach_shader(program, fs);
    gl.link_program(program);

    gl.detach_shader(program, vs);
    gl.detach_shader(program, fs);
    gl.delete_shader(vs);
    gl.delete_shader(fs);

    if !gl.get_program_link_status(program) {
        let log = gl.get_program_info_log(program);
        gl.delete_program(program);
        return Err((ShaderStage::Link, log));
    }

    Ok(program)
}

/// Fullscreen triangle; positions only, on [`POSITION_ATTRIB`].
#[derive(Debug)]
pub struct FullscreenTriangle {
    vao: glow::NativeVertexArray,
    vbo: glow::NativeBuffer,
}

impl FullscreenTriangle {
    pub unsafe fn new(gl: &glow::Context) -> Result<Self, EngineError> {
        let verts: [f32; 6] = [-1.0, -1.0, 3.0, -1.0, -1.0, 3.0];

        let vao = gl
            .create_vertex_array()
            .map_err(|e| EngineError::GlCreate(format!("create_vertex_array: {e}")))?;
        let vbo = match gl.create_buffer() {
            Ok(vbo) => vbo,
            Err(e) => {
                gl.delete_vertex_array(vao);
                return Err(EngineError::GlCreate(format!("create_buffer: {e}")));
            }
        };

        gl.bind_vertex_array(Some(vao));
        gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
        gl.buffer_data_u8_slice(
            glow::ARRAY_BUFFER,
            bytemuck::cast_slice(&verts),
            glow::STATIC_DRAW,
        );
        gl.enable_vertex_attrib_array(POSITION_ATTRIB);
        gl.vertex_attrib_pointer_f32(POSITION_ATTRIB, 2, glow::FLOAT, false, 2 * 4, 0);
        gl.bind_buffer(glow::ARRAY_BUFFER, None);
        gl.bind_vertex_array(None);

        Ok(Self { vao, vbo })
    }

    pub unsafe fn draw(&self, gl: &glow::Context) {
        gl.bind_vertex_array(Some(self.vao));
        gl.draw_arrays(glow::TRIANGLES, 0, 3);
        gl.bind_vertex_array(None);
    }

    pub unsafe fn destroy(&mut self, gl: &glow::Context) {
        gl.delete_vertex_array(self.vao);
        gl.delete_buffer(self.vbo);
    }
}

unsafe fn set_uniform(gl: &glow::Context, program: glow::NativeProgram, name: &str, value: UniformValue) {
    // Uniforms the compiler optimized away have no location.
    let Some(loc) = gl.get_uniform_location(program, name) else {
        return;
    };
    let loc = Some(&loc);
    match value {
        UniformValue::Float(v) => gl.uniform_1_f32(loc, v),
        UniformValue::Int(v) => gl.uniform_1_i32(loc, v),
        UniformValue::Bool(b) => gl.uniform_1_i32(loc, i32::from(b)),
        UniformValue::Vec2([x, y]) => gl.uniform_2_f32(loc, x, y),
        UniformValue::Vec4([x, y, z, w]) => gl.uniform_4_f32(loc, x, y, z, w),
    }
}

/// `GpuBackend` over a `glow::Context` the host keeps current.
pub struct GlowBackend {
    gl: glow::Context,
    triangle: FullscreenTriangle,
    lost: bool,
}

impl std::fmt::Debug for GlowBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlowBackend")
            .field("triangle", &self.triangle)
            .field("lost", &self.lost)
            .finish()
    }
}

impl GlowBackend {
    /// `gl` must be current on the calling thread whenever the backend is used, and stay
    /// alive until the backend is dropped.
    pub unsafe fn new(gl: glow::Context) -> Result<Self, EngineError> {
        let triangle = FullscreenTriangle::new(&gl)?;
        tracing::debug!(version = ?gl.version(), "glow backend ready");
        Ok(Self {
            gl,
            triangle,
            lost: false,
        })
    }

    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }
}

impl Drop for GlowBackend {
    fn drop(&mut self) {
        if !self.lost {
            unsafe { self.triangle.destroy(&self.gl) };
        }
    }
}

impl GpuBackend for GlowBackend {
    type Texture = glow::NativeTexture;
    type Framebuffer = glow::NativeFramebuffer;
    type Program = glow::NativeProgram;

    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
    ) -> Result<Self::Program, (ShaderStage, String)> {
        unsafe { compile_program(&self.gl, vertex, fragment) }
    }

    fn delete_program(&mut self, program: Self::Program) {
        unsafe { self.gl.delete_program(program) }
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<Self::Texture, String> {
        if let Some(p) = pixels {
            if p.len() != desc.byte_len() {
                return Err(format!(
                    "pixel data is {} bytes, expected {}",
                    p.len(),
                    desc.byte_len()
                ));
            }
        }
        let gl = &self.gl;
        unsafe {
            let tex = gl
                .create_texture()
                .map_err(|e| format!("create_texture failed: {e:?}"))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);

            let (internal, format, ty) = gl_formats(desc.format);
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                desc.width as i32,
                desc.height as i32,
                0,
                format,
                ty,
                pixels,
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
            Ok(tex)
        }
    }

    fn delete_texture(&mut self, texture: Self::Texture) {
        unsafe { self.gl.delete_texture(texture) }
    }

    fn create_framebuffer(&mut self, texture: Self::Texture) -> Result<Self::Framebuffer, String> {
        let gl = &self.gl;
        unsafe {
            let fbo = gl
                .create_framebuffer()
                .map_err(|e| format!("create_framebuffer failed: {e:?}"))?;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                gl.delete_framebuffer(fbo);
                return Err(format!("framebuffer incomplete: 0x{status:x}"));
            }
            Ok(fbo)
        }
    }

    fn delete_framebuffer(&mut self, framebuffer: Self::Framebuffer) {
        unsafe { self.gl.delete_framebuffer(framebuffer) }
    }

    fn clear(&mut self, framebuffer: Self::Framebuffer, color: [f32; 4]) {
        let gl = &self.gl;
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.clear_color(color[0], color[1], color[2], color[3]);
            gl.clear(glow::COLOR_BUFFER_BIT);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
    }

    fn blit(&mut self, src: Self::Framebuffer, dst: Self::Framebuffer, width: u32, height: u32) {
        let gl = &self.gl;
        let (w, h) = (width as i32, height as i32);
        unsafe {
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(src));
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(dst));
            gl.blit_framebuffer(0, 0, w, h, 0, 0, w, h, glow::COLOR_BUFFER_BIT, glow::NEAREST);
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, None);
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, None);
        }
    }

    fn draw(
        &mut self,
        program: Self::Program,
        target: Self::Framebuffer,
        width: u32,
        height: u32,
        call: &DrawCall<Self::Texture>,
    ) -> Result<(), String> {
        let gl = &self.gl;
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(target));
            gl.viewport(0, 0, width as i32, height as i32);
            gl.disable(glow::BLEND);
            gl.use_program(Some(program));

            for (name, value) in &call.uniforms {
                set_uniform(gl, program, name, *value);
            }
            for (name, unit, tex) in &call.samplers {
                gl.active_texture(glow::TEXTURE0 + unit);
                gl.bind_texture(glow::TEXTURE_2D, Some(*tex));
                set_uniform(gl, program, name, UniformValue::Int(*unit as i32));
            }

            self.triangle.draw(gl);

            for (_, unit, _) in &call.samplers {
                gl.active_texture(glow::TEXTURE0 + unit);
                gl.bind_texture(glow::TEXTURE_2D, None);
            }
            gl.active_texture(glow::TEXTURE0);
            gl.use_program(None);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);

            match gl.get_error() {
                glow::NO_ERROR => Ok(()),
                glow::CONTEXT_LOST => {
                    self.lost = true;
                    Err("GL_CONTEXT_LOST during draw".to_string())
                }
                code => Err(format!("{} (0x{code:x}) during draw", gl_error_name(code))),
            }
        }
    }

    fn read_pixels(
        &mut self,
        framebuffer: Self::Framebuffer,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, String> {
        let gl = &self.gl;
        let mut buf = vec![0u8; width as usize * height as usize * 4];
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(&mut buf),
            );
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            match gl.get_error() {
                glow::NO_ERROR => Ok(buf),
                glow::CONTEXT_LOST => {
                    self.lost = true;
                    Err("GL_CONTEXT_LOST during readback".to_string())
                }
                code => Err(format!("{} (0x{code:x}) during readback", gl_error_name(code))),
            }
        }
    }

    fn context_lost(&mut self) -> bool {
        if self.lost {
            return true;
        }
        let gl = &self.gl;
        let pending = std::iter::from_fn(|| {
            let code = unsafe { gl.get_error() };
            (code != glow::NO_ERROR).then_some(code)
        })
        .take(MAX_PENDING_ERRORS);
        let (lost, others) = split_lost(pending);
        for code in others {
            tracing::warn!(code, error = gl_error_name(code), "discarding pending GL error");
        }
        if lost {
            tracing::error!("GL_CONTEXT_LOST reported by the driver");
            self.lost = true;
        }
        self.lost
    }
}

/// Drivers may queue one flag per error class; more than this means `glGetError` is stuck.
const MAX_PENDING_ERRORS: usize = 8;

/// Separate `GL_CONTEXT_LOST` from the other pending error codes.
fn split_lost(codes: impl IntoIterator<Item = u32>) -> (bool, Vec<u32>) {
    let mut lost = false;
    let mut others = Vec::new();
    for code in codes {
        if code == glow::CONTEXT_LOST {
            lost = true;
        } else {
            others.push(code);
        }
    }
    (lost, others)
}

fn gl_error_name(code: u32) -> &'static str {
    match code {
        glow::INVALID_ENUM => "GL_INVALID_ENUM",
        glow::INVALID_VALUE => "GL_INVALID_VALUE",
        glow::INVALID_OPERATION => "GL_INVALID_OPERATION",
        glow::INVALID_FRAMEBUFFER_OPERATION => "GL_INVALID_FRAMEBUFFER_OPERATION",
        glow::OUT_OF_MEMORY => "GL_OUT_OF_MEMORY",
        glow::STACK_OVERFLOW => "GL_STACK_OVERFLOW",
        glow::STACK_UNDERFLOW => "GL_STACK_UNDERFLOW",
        glow::CONTEXT_LOST => "GL_CONTEXT_LOST",
        _ => "unknown GL error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_targets_use_float_storage() {
        assert_eq!(gl_formats(TextureFormat::Rgba32F).2, glow::FLOAT);
        assert_eq!(gl_formats(TextureFormat::Rgba8).0, glow::RGBA8 as i32);
    }

    #[test]
    fn pending_errors_are_kept_apart_from_context_loss() {
        let (lost, others) = split_lost([glow::INVALID_OPERATION, glow::CONTEXT_LOST, glow::OUT_OF_MEMORY]);
        assert!(lost);
        assert_eq!(others, vec![glow::INVALID_OPERATION, glow::OUT_OF_MEMORY]);
        assert_eq!(gl_error_name(others[0]), "GL_INVALID_OPERATION");

        let (lost, others) = split_lost([glow::INVALID_ENUM]);
        assert!(!lost);
        assert_eq!(others.len(), 1);
    }
}
