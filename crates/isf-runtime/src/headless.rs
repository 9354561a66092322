//! CPU implementation of [`GpuBackend`], for tests and GPU-less hosts.
//!
//! GLSL is not interpreted. A compiled program resolves to a registered Rust kernel whose
//! marker text appears in the assembled fragment source, or to a constant color when the
//! fragment's only output is `vec4(<literal>, <literal>, <literal>, <literal>)`. `#error`
//! directives fail compilation with a driver-style log that honors `#line`.
//!
//! Textures are float RGBA arrays; RGBA8 storage is quantized on every write. Sampling is
//! nearest-neighbour with clamp-to-edge.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use isf_core::{ShaderStage, TextureFormat};

use crate::backend::{DrawCall, GpuBackend, TextureDesc, UniformValue};

/// Fragment kernel: computes one output texel.
pub type Kernel = fn(&Fragment<'_>) -> [f32; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessTexture(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessFramebuffer(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessProgram(u32);

#[derive(Clone, Copy)]
enum Shader {
    Kernel(Kernel),
    Constant([f32; 4]),
}

#[derive(Debug, Clone)]
struct TexData {
    desc: TextureDesc,
    texels: Vec<[f32; 4]>,
}

impl TexData {
    fn store(&mut self, i: usize, v: [f32; 4]) {
        if let Some(t) = self.texels.get_mut(i) {
            *t = quantize(self.desc.format, v);
        }
    }
}

fn quantize(format: TextureFormat, v: [f32; 4]) -> [f32; 4] {
    match format {
        TextureFormat::Rgba32F => v,
        TextureFormat::Rgba8 => v.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0),
    }
}

/// One fragment invocation's view of the draw.
#[derive(Debug)]
pub struct Fragment<'a> {
    /// `isf_FragNormCoord`: texel center in `[0, 1]`.
    pub coord: [f32; 2],
    pub pixel: [u32; 2],
    pub size: [u32; 2],
    call: &'a DrawCall<HeadlessTexture>,
    textures: &'a HashMap<u32, TexData>,
}

impl Fragment<'_> {
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.call.uniform_value(name)
    }

    pub fn float(&self, name: &str) -> f32 {
        match self.uniform(name) {
            Some(UniformValue::Float(v)) => v,
            Some(UniformValue::Int(v)) => v as f32,
            Some(UniformValue::Bool(b)) => f32::from(u8::from(b)),
            _ => 0.0,
        }
    }

    pub fn int(&self, name: &str) -> i32 {
        match self.uniform(name) {
            Some(UniformValue::Int(v)) => v,
            Some(UniformValue::Float(v)) => v as i32,
            Some(UniformValue::Bool(b)) => i32::from(b),
            _ => 0,
        }
    }

    pub fn bool(&self, name: &str) -> bool {
        matches!(self.uniform(name), Some(UniformValue::Bool(true)))
    }

    pub fn vec2(&self, name: &str) -> [f32; 2] {
        match self.uniform(name) {
            Some(UniformValue::Vec2(v)) => v,
            _ => [0.0; 2],
        }
    }

    pub fn vec4(&self, name: &str) -> [f32; 4] {
        match self.uniform(name) {
            Some(UniformValue::Vec4(v)) => v,
            _ => [0.0; 4],
        }
    }

    pub fn pass_index(&self) -> i32 {
        self.int("PASSINDEX")
    }

    /// `texture(sampler, uv)`. Unbound samplers read transparent black.
    pub fn sample(&self, sampler: &str, uv: [f32; 2]) -> [f32; 4] {
        let Some(tex) = self
            .call
            .samplers
            .iter()
            .find(|(n, _, _)| n == sampler)
            .and_then(|(_, _, t)| self.textures.get(&t.0))
        else {
            return [0.0; 4];
        };
        let (w, h) = (tex.desc.width, tex.desc.height);
        let x = ((uv[0] * w as f32).floor() as i64).clamp(0, i64::from(w) - 1) as u32;
        let y = ((uv[1] * h as f32).floor() as i64).clamp(0, i64::from(h) - 1) as u32;
        tex.texels
            .get((y * w + x) as usize)
            .copied()
            .unwrap_or([0.0; 4])
    }

    /// `IMG_THIS_PIXEL(sampler)`.
    pub fn this_pixel(&self, sampler: &str) -> [f32; 4] {
        self.sample(sampler, self.coord)
    }
}

fn constant_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let n = r"\s*(-?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*";
        Regex::new(&format!(r"isf_FragColor\s*=\s*vec4\({n},{n},{n},{n}\)\s*;"))
            .expect("static regex")
    })
}

fn constant_color(fragment: &str) -> Option<[f32; 4]> {
    let mut found = None;
    for caps in constant_re().captures_iter(fragment) {
        if found.is_some() {
            return None;
        }
        let mut c = [0.0f32; 4];
        for (i, slot) in c.iter_mut().enumerate() {
            *slot = caps.get(i + 1)?.as_str().parse().ok()?;
        }
        found = Some(c);
    }
    found
}

/// First `#error` directive as a driver-style log, with line numbers following `#line`.
fn error_directive(src: &str) -> Option<String> {
    let mut line = 1usize;
    for text in src.lines() {
        let t = text.trim_start();
        if let Some(n) = t
            .strip_prefix("#line")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<usize>().ok())
        {
            line = n;
            continue;
        }
        if let Some(msg) = t.strip_prefix("#error") {
            return Some(format!("0:{line}(1): error: #error {}\n", msg.trim()));
        }
        line += 1;
    }
    None
}

pub struct HeadlessBackend {
    next_id: u32,
    kernels: Vec<(String, Kernel)>,
    textures: HashMap<u32, TexData>,
    framebuffers: HashMap<u32, u32>,
    programs: HashMap<u32, Shader>,
    compiles: u64,
    lost: bool,
    fail_readback: bool,
}

impl fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("kernels", &self.kernels.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>())
            .field("textures", &self.textures.len())
            .field("framebuffers", &self.framebuffers.len())
            .field("programs", &self.programs.len())
            .field("compiles", &self.compiles)
            .field("lost", &self.lost)
            .finish()
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            kernels: Vec::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            compiles: 0,
            lost: false,
            fail_readback: false,
        }
    }

    /// Register `kernel` for fragments containing `marker`. Earlier registrations win.
    pub fn with_kernel(mut self, marker: impl Into<String>, kernel: Kernel) -> Self {
        self.kernels.push((marker.into(), kernel));
        self
    }

    /// Successful program compilations so far.
    pub fn compile_count(&self) -> u64 {
        self.compiles
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Simulate losing the context: every later call fails.
    pub fn set_context_lost(&mut self, lost: bool) {
        self.lost = lost;
    }

    /// Make the next `read_pixels` fail once.
    pub fn fail_next_readback(&mut self) {
        self.fail_readback = true;
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn fb_texture(&self, fb: HeadlessFramebuffer) -> Option<u32> {
        self.framebuffers.get(&fb.0).copied()
    }
}

impl GpuBackend for HeadlessBackend {
    type Texture = HeadlessTexture;
    type Framebuffer = HeadlessFramebuffer;
    type Program = HeadlessProgram;

    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
    ) -> Result<Self::Program, (ShaderStage, String)> {
        if self.lost {
            return Err((ShaderStage::Link, "error: context lost\n".to_string()));
        }
        if let Some(log) = error_directive(vertex) {
            return Err((ShaderStage::Vertex, log));
        }
        if let Some(log) = error_directive(fragment) {
            return Err((ShaderStage::Fragment, log));
        }
        if !vertex.contains("void main") {
            return Err((
                ShaderStage::Link,
                "error: vertex shader lacks `main'\n".to_string(),
            ));
        }

        let shader = match self.kernels.iter().find(|(m, _)| fragment.contains(m.as_str())) {
            Some((_, k)) => Shader::Kernel(*k),
            None => match constant_color(fragment) {
                Some(c) => Shader::Constant(c),
                None => {
                    return Err((
                        ShaderStage::Fragment,
                        "0:1(1): error: no headless kernel matches this fragment source\n"
                            .to_string(),
                    ))
                }
            },
        };
        let id = self.id();
        self.programs.insert(id, shader);
        self.compiles += 1;
        Ok(HeadlessProgram(id))
    }

    fn delete_program(&mut self, program: Self::Program) {
        self.programs.remove(&program.0);
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<Self::Texture, String> {
        if self.lost {
            return Err("context lost".to_string());
        }
        let count = desc.width as usize * desc.height as usize;
        let texels = match pixels {
            None => vec![[0.0; 4]; count],
            Some(bytes) if bytes.len() != desc.byte_len() => {
                return Err(format!(
                    "pixel data is {} bytes, expected {}",
                    bytes.len(),
                    desc.byte_len()
                ));
            }
            Some(bytes) => match desc.format {
                TextureFormat::Rgba8 => bytes
                    .chunks_exact(4)
                    .map(|p| [p[0], p[1], p[2], p[3]].map(|b| f32::from(b) / 255.0))
                    .collect(),
                TextureFormat::Rgba32F => bytes
                    .chunks_exact(16)
                    .map(|p| {
                        let mut t = [0.0f32; 4];
                        for (c, b) in t.iter_mut().zip(p.chunks_exact(4)) {
                            *c = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                        }
                        t
                    })
                    .collect(),
            },
        };
        let id = self.id();
        self.textures.insert(id, TexData { desc: *desc, texels });
        Ok(HeadlessTexture(id))
    }

    fn delete_texture(&mut self, texture: Self::Texture) {
        self.textures.remove(&texture.0);
    }

    fn create_framebuffer(&mut self, texture: Self::Texture) -> Result<Self::Framebuffer, String> {
        if !self.textures.contains_key(&texture.0) {
            return Err(format!("framebuffer incomplete: no texture {}", texture.0));
        }
        let id = self.id();
        self.framebuffers.insert(id, texture.0);
        Ok(HeadlessFramebuffer(id))
    }

    fn delete_framebuffer(&mut self, framebuffer: Self::Framebuffer) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn clear(&mut self, framebuffer: Self::Framebuffer, color: [f32; 4]) {
        let Some(tex) = self.fb_texture(framebuffer) else {
            return;
        };
        if let Some(t) = self.textures.get_mut(&tex) {
            let c = quantize(t.desc.format, color);
            t.texels.iter_mut().for_each(|p| *p = c);
        }
    }

    fn blit(
        &mut self,
        src: Self::Framebuffer,
        dst: Self::Framebuffer,
        width: u32,
        height: u32,
    ) {
        let (Some(s), Some(d)) = (self.fb_texture(src), self.fb_texture(dst)) else {
            return;
        };
        let Some(source) = self.textures.get(&s).cloned() else {
            return;
        };
        let Some(target) = self.textures.get_mut(&d) else {
            return;
        };
        let w = width.min(source.desc.width).min(target.desc.width);
        let h = height.min(source.desc.height).min(target.desc.height);
        for y in 0..h {
            for x in 0..w {
                let v = source.texels[(y * source.desc.width + x) as usize];
                target.store((y * target.desc.width + x) as usize, v);
            }
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
        if self.lost {
            return Err("context lost".to_string());
        }
        let shader = *self
            .programs
            .get(&program.0)
            .ok_or_else(|| format!("invalid program {}", program.0))?;
        let tex = self
            .fb_texture(target)
            .ok_or_else(|| format!("invalid framebuffer {}", target.0))?;

        let mut out = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let frag = Fragment {
                    coord: [
                        (x as f32 + 0.5) / width as f32,
                        (y as f32 + 0.5) / height as f32,
                    ],
                    pixel: [x, y],
                    size: [width, height],
                    call,
                    textures: &self.textures,
                };
                out.push(match shader {
                    Shader::Kernel(k) => k(&frag),
                    Shader::Constant(c) => c,
                });
            }
        }

        let t = self
            .textures
            .get_mut(&tex)
            .ok_or_else(|| format!("framebuffer {} has no texture", target.0))?;
        let tw = t.desc.width;
        for (i, v) in out.into_iter().enumerate() {
            let (x, y) = (i as u32 % width, i as u32 / width);
            if x < tw && y < t.desc.height {
                t.store((y * tw + x) as usize, v);
            }
        }
        Ok(())
    }

    fn read_pixels(
        &mut self,
        framebuffer: Self::Framebuffer,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, String> {
        if std::mem::take(&mut self.fail_readback) {
            return Err("read_pixels failed".to_string());
        }
        if self.lost {
            return Err("context lost".to_string());
        }
        let tex = self
            .fb_texture(framebuffer)
            .and_then(|t| self.textures.get(&t))
            .ok_or_else(|| format!("invalid framebuffer {}", framebuffer.0))?;
        if width > tex.desc.width || height > tex.desc.height {
            return Err(format!(
                "read of {width}x{height} exceeds {}x{} target",
                tex.desc.width, tex.desc.height
            ));
        }
        let mut buf = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let p = tex.texels[(y * tex.desc.width + x) as usize];
                buf.extend(p.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8));
            }
        }
        Ok(buf)
    }

    fn context_lost(&mut self) -> bool {
        self.lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_output_is_detected() {
        assert_eq!(
            constant_color("void main() { isf_FragColor = vec4(1.0, 0.0, .5, 1); }"),
            Some([1.0, 0.0, 0.5, 1.0])
        );
        assert_eq!(
            constant_color("isf_FragColor = vec4(1.0, 0.0, 0.0, 1.0); isf_FragColor = vec4(0.0, 0.0, 0.0, 1.0);"),
            None
        );
    }

    #[test]
    fn error_directive_follows_line_markers() {
        let src = "#version 330 core\nuniform float TIME;\n#line 10\nvoid main() {\n#error nope\n}\n";
        assert_eq!(
            error_directive(src).as_deref(),
            Some("0:11(1): error: #error nope\n")
        );
        assert_eq!(error_directive("void main() {}"), None);
    }

    #[test]
    fn unknown_fragment_fails_like_a_driver() {
        let mut gpu = HeadlessBackend::new();
        let (stage, log) = gpu
            .compile_program("void main() {}", "void main() { isf_FragColor = foo(); }")
            .unwrap_err();
        assert_eq!(stage, ShaderStage::Fragment);
        assert!(log.starts_with("0:1(1): error:"));
        assert_eq!(gpu.compile_count(), 0);
    }

    #[test]
    fn float_textures_keep_precision() {
        let mut gpu = HeadlessBackend::new();
        let desc = TextureDesc::new(1, 1, TextureFormat::Rgba32F);
        let bytes: Vec<u8> = [2.5f32, -1.0, 0.25, 1.0]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        let tex = gpu.create_texture(&desc, Some(&bytes)).unwrap();
        assert_eq!(gpu.textures[&tex.0].texels[0], [2.5, -1.0, 0.25, 1.0]);

        let fb = gpu.create_framebuffer(tex).unwrap();
        assert_eq!(gpu.read_pixels(fb, 1, 1).unwrap(), vec![255, 0, 64, 255]);
    }

    #[test]
    fn draw_samples_bound_textures() {
        let mut gpu = HeadlessBackend::new().with_kernel("flip", |f| {
            f.sample("src", [1.0 - f.coord[0], f.coord[1]])
        });
        let rgba8 = TextureDesc::new(2, 1, TextureFormat::Rgba8);
        let src = gpu
            .create_texture(&rgba8, Some(&[10, 20, 30, 40, 50, 60, 70, 80]))
            .unwrap();
        let dst = gpu.create_texture(&rgba8, None).unwrap();
        let fb = gpu.create_framebuffer(dst).unwrap();
        let prog = gpu.compile_program("void main() {}", "flip").unwrap();

        let call = DrawCall {
            uniforms: Vec::new(),
            samplers: vec![("src".to_string(), 0, src)],
        };
        gpu.draw(prog, fb, 2, 1, &call).unwrap();
        assert_eq!(
            gpu.read_pixels(fb, 2, 1).unwrap(),
            vec![50, 60, 70, 80, 10, 20, 30, 40]
        );
    }
}
