//! The contract between the engine and a GPU API.
//!
//! The host owns the GPU context lifecycle: a backend wraps an already-current context and
//! the engine only issues object-level calls through this trait.

use isf_core::{ShaderStage, TextureFormat};

/// Size and storage of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// A uniform value as the GPU sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec4([f32; 4]),
}

/// Everything one fullscreen draw needs besides the program and target.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall<T> {
    pub uniforms: Vec<(String, UniformValue)>,
    /// `(sampler name, texture unit, texture)`.
    pub samplers: Vec<(String, u32, T)>,
}

impl<T> Default for DrawCall<T> {
    fn default() -> Self {
        Self {
            uniforms: Vec::new(),
            samplers: Vec::new(),
        }
    }
}

impl<T> DrawCall<T> {
    pub fn uniform(&mut self, name: impl Into<String>, value: UniformValue) {
        self.uniforms.push((name.into(), value));
    }

    pub fn uniform_value(&self, name: &str) -> Option<UniformValue> {
        self.uniforms
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// GPU operations the engine needs. All calls assume the backend's context is current.
///
/// Errors are backend-specific text; the engine wraps them into its own taxonomy.
pub trait GpuBackend: std::fmt::Debug {
    type Texture: Copy + Eq + std::hash::Hash + std::fmt::Debug;
    type Framebuffer: Copy + Eq + std::fmt::Debug;
    type Program: Copy + Eq + std::fmt::Debug;

    /// Compile and link a program. On failure returns the failing stage and the driver log
    /// exactly as reported.
    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
    ) -> Result<Self::Program, (ShaderStage, String)>;

    fn delete_program(&mut self, program: Self::Program);

    /// Allocate a texture, optionally filled with tightly packed rows in GL order.
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<Self::Texture, String>;

    fn delete_texture(&mut self, texture: Self::Texture);

    /// Framebuffer with `texture` as its single color attachment.
    fn create_framebuffer(&mut self, texture: Self::Texture) -> Result<Self::Framebuffer, String>;

    fn delete_framebuffer(&mut self, framebuffer: Self::Framebuffer);

    fn clear(&mut self, framebuffer: Self::Framebuffer, color: [f32; 4]);

    /// Copy a `width`x`height` region from `src` to `dst`.
    fn blit(
        &mut self,
        src: Self::Framebuffer,
        dst: Self::Framebuffer,
        width: u32,
        height: u32,
    );

    /// Draw a fullscreen triangle with `program` into `target`.
    fn draw(
        &mut self,
        program: Self::Program,
        target: Self::Framebuffer,
        width: u32,
        height: u32,
        call: &DrawCall<Self::Texture>,
    ) -> Result<(), String>;

    /// Read RGBA8 pixels, row 0 at the bottom.
    fn read_pixels(
        &mut self,
        framebuffer: Self::Framebuffer,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, String>;

    /// True once the underlying context is gone for good.
    fn context_lost(&mut self) -> bool;
}

/// Offscreen render target (texture + framebuffer).
#[derive(Debug)]
pub struct RenderTarget<B: GpuBackend> {
    pub tex: B::Texture,
    pub fbo: B::Framebuffer,
    pub desc: TextureDesc,
}

impl<B: GpuBackend> RenderTarget<B> {
    /// Allocate a target and clear it to `clear`.
    pub fn create(gpu: &mut B, desc: TextureDesc, clear: [f32; 4]) -> Result<Self, String> {
        let tex = gpu.create_texture(&desc, None)?;
        let fbo = match gpu.create_framebuffer(tex) {
            Ok(fbo) => fbo,
            Err(e) => {
                gpu.delete_texture(tex);
                return Err(e);
            }
        };
        gpu.clear(fbo, clear);
        tracing::debug!(
            width = desc.width,
            height = desc.height,
            format = %desc.format,
            "allocated render target"
        );
        Ok(Self { tex, fbo, desc })
    }

    pub fn destroy(self, gpu: &mut B) {
        gpu.delete_framebuffer(self.fbo);
        gpu.delete_texture(self.tex);
    }
}
