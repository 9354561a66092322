//! Renderer: executes a document's render graph for one frame.
//!
//! A [`Session`] carries everything that outlives a frame: parameter values, frame counters,
//! persistent buffers (a ping-pong pair per persistent pass) and transient targets reused
//! across frames. A frame draws into the spare half of each pair and only swaps once the
//! readback succeeded, so a failed frame leaves the session exactly as it was.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use isf_core::{EngineError, ParamError, RenderError};
use isf_doc::{Document, InputKind};
use isf_graph::{BindingSource, RenderGraph, SizeContext};

use crate::backend::{DrawCall, GpuBackend, RenderTarget, TextureDesc, UniformValue};
use crate::glsl::{self, ShaderPair};
use crate::params::ParamValue;
use crate::pipeline::PipelineCache;
use crate::textures::TextureManager;

/// Per-frame values supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    /// Seconds since the session started.
    pub time: f64,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    /// `DATE` uniform: year, month, day, seconds since midnight.
    pub date: [f32; 4],
}

impl FrameContext {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            time: 0.0,
            frame_index: 0,
            width,
            height,
            date: [0.0; 4],
        }
    }

    pub fn at(mut self, time: f64, frame_index: u64) -> Self {
        self.time = time;
        self.frame_index = frame_index;
        self
    }

    pub fn with_date(mut self, date: [f32; 4]) -> Self {
        self.date = date;
        self
    }

    /// Fill `date` from the system clock (UTC).
    pub fn with_system_date(self) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.with_date(civil_date(secs))
    }
}

/// Unix seconds to `[year, month, day, seconds since midnight]` in the proleptic Gregorian
/// calendar.
pub fn civil_date(unix_secs: f64) -> [f32; 4] {
    let days = (unix_secs / 86_400.0).floor() as i64;
    let since_midnight = unix_secs - days as f64 * 86_400.0;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    [year as f32, month as f32, day as f32, since_midnight as f32]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8,
}

/// Host-consumable frame: tightly packed RGBA8 rows, row 0 at the bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
    pub format: PixelFormat,
}

impl ImageBuffer {
    pub fn format_name(&self) -> &'static str {
        match self.format {
            PixelFormat::Rgba8 => "RGBA",
        }
    }

    /// Pixel at `(x, y)`, y counted from the bottom row.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 4) as usize;
        let p = self.bytes.get(i..i + 4)?;
        Some([p[0], p[1], p[2], p[3]])
    }
}

/// Engine-level settings a frame needs.
#[derive(Debug, Clone, Copy)]
pub struct FrameOptions<T> {
    pub clear_color: [f32; 4],
    pub max_texture_size: u32,
    /// 1x1 transparent texture bound for unsupplied images and unwritten targets.
    pub placeholder: T,
    /// Fail instead of binding the placeholder for a declared image nobody supplied.
    pub missing_images_fail: bool,
}

#[derive(Debug)]
struct PingPong<B: GpuBackend> {
    /// Last committed frame; what feedback reads sample.
    retained: RenderTarget<B>,
    /// Drawn into this frame.
    spare: RenderTarget<B>,
}

impl<B: GpuBackend> PingPong<B> {
    fn swap(&mut self) {
        std::mem::swap(&mut self.retained, &mut self.spare);
    }

    fn destroy(self, gpu: &mut B) {
        self.retained.destroy(gpu);
        self.spare.destroy(gpu);
    }
}

/// Final target of a drawn (not yet committed) frame.
#[derive(Debug)]
pub struct FrameOutput<B: GpuBackend> {
    pub tex: B::Texture,
    pub fbo: B::Framebuffer,
    pub width: u32,
    pub height: u32,
}

/// Per-document render state.
#[derive(Debug)]
pub struct Session<B: GpuBackend> {
    document: Document,
    graph: RenderGraph,
    sources: ShaderPair,
    values: HashMap<String, ParamValue>,
    frame_count: u64,
    last_time: Option<f64>,
    persistent: HashMap<usize, PingPong<B>>,
    transient: HashMap<usize, RenderTarget<B>>,
}

impl<B: GpuBackend> Session<B> {
    /// Validate, build and assemble `document`. Nothing touches the GPU yet.
    pub fn prepare(document: Document, glsl_version: &str) -> Result<Self, EngineError> {
        let report = isf_doc::validate(&document);
        if !report.is_valid {
            return Err(EngineError::Invalid(report.errors));
        }
        let graph = isf_graph::build(&document)?;
        for w in report.warnings.iter().chain(&graph.warnings) {
            tracing::debug!(document = %document.identity, warning = %w, "document warning");
        }
        let sources = glsl::assemble(&document, glsl_version);
        Ok(Self {
            document,
            graph,
            sources,
            values: HashMap::new(),
            frame_count: 0,
            last_time: None,
            persistent: HashMap::new(),
            transient: HashMap::new(),
        })
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn sources(&self) -> &ShaderPair {
        &self.sources
    }

    /// Frames committed so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn value(&self, name: &str) -> Option<ParamValue> {
        self.values.get(name).copied()
    }

    /// Store a session value. Image values take a texture reference for as long as they stay
    /// bound.
    pub fn set_value(
        &mut self,
        gpu: &mut B,
        textures: &mut TextureManager<B>,
        name: &str,
        value: ParamValue,
    ) -> Result<(), EngineError> {
        check_value(&self.document, name, &value)?;
        if let Some(id) = value.image() {
            textures.retain(id)?;
        }
        if let Some(old) = self.values.insert(name.to_string(), value).and_then(|v| v.image()) {
            textures.release(gpu, old);
        }
        Ok(())
    }

    /// Draw every pass. Persistent passes render into their spare buffers; nothing is
    /// committed until [`Session::commit`].
    pub fn draw_passes(
        &mut self,
        gpu: &mut B,
        cache: &mut PipelineCache<B>,
        textures: &mut TextureManager<B>,
        ctx: &FrameContext,
        overrides: &HashMap<String, ParamValue>,
        opts: &FrameOptions<B::Texture>,
    ) -> Result<FrameOutput<B>, EngineError> {
        if ctx.width == 0
            || ctx.height == 0
            || ctx.width > opts.max_texture_size
            || ctx.height > opts.max_texture_size
        {
            return Err(RenderError::InvalidSize {
                width: ctx.width,
                height: ctx.height,
            }
            .into());
        }
        for (name, value) in overrides {
            check_value(&self.document, name, value)?;
        }
        let pipeline = cache.compile(gpu, &self.graph, &self.sources)?;

        let (uniforms, descs) = {
            // Effective value per declared input: call override, then session value, then default.
            let mut values: HashMap<&str, ParamValue> = HashMap::new();
            for input in &self.document.inputs {
                let v = overrides
                    .get(&input.name)
                    .or_else(|| self.values.get(&input.name))
                    .copied()
                    .or_else(|| input.effective_default().map(ParamValue::from_input_value));
                if let Some(v) = v {
                    values.insert(input.name.as_str(), v);
                }
            }

            let mut uniforms: Vec<(String, UniformValue)> = Vec::new();
            for (name, _) in self.graph.parameter_uniforms() {
                let (Some(decl), Some(v)) = (self.document.input(name), values.get(name)) else {
                    continue;
                };
                let (v, moved) = v.clamped(decl);
                if moved {
                    tracing::warn!(parameter = name, value = ?v, "parameter clamped to [MIN, MAX]");
                }
                if let Some(u) = v.to_uniform() {
                    uniforms.push((name.to_string(), u));
                }
            }

            let lookup = |name: &str| values.get(name).and_then(ParamValue::as_f64);
            let size_ctx = SizeContext {
                width: ctx.width,
                height: ctx.height,
                max_size: opts.max_texture_size,
                params: &lookup,
            };
            let mut descs = Vec::with_capacity(self.graph.passes.len());
            for node in &self.graph.passes {
                let (w, h) = self.graph.resolve_size(node.index, &size_ctx)?;
                descs.push(TextureDesc::new(w, h, node.format));
            }
            (uniforms, descs)
        };

        // Allocate every target up front so feedback reads of later passes find their buffer.
        let layout: Vec<(usize, bool)> = self
            .graph
            .passes
            .iter()
            .map(|n| (n.index, n.persistent))
            .collect();
        for ((pass, persistent), desc) in layout.into_iter().zip(&descs) {
            if persistent {
                self.ensure_persistent(gpu, pass, *desc)?;
            } else {
                self.ensure_transient(gpu, pass, *desc)?;
            }
        }

        let time_delta = self.last_time.map_or(0.0, |t| (ctx.time - t).max(0.0));
        let mut outputs: Vec<Option<(B::Texture, B::Framebuffer)>> = vec![None; descs.len()];

        for (node, desc) in self.graph.passes.iter().zip(&descs) {
            let pass = node.index;
            let (tex, fbo) = self.target(pass).ok_or_else(|| RenderError::Binding {
                pass,
                name: node.target.clone().unwrap_or_default(),
                reason: "render target missing".to_string(),
            })?;

            let mut call = DrawCall::default();
            call.uniform("PASSINDEX", UniformValue::Int(pass as i32));
            call.uniform(
                "RENDERSIZE",
                UniformValue::Vec2([desc.width as f32, desc.height as f32]),
            );
            call.uniform("TIME", UniformValue::Float(ctx.time as f32));
            call.uniform("TIMEDELTA", UniformValue::Float(time_delta as f32));
            call.uniform("FRAMEINDEX", UniformValue::Int(ctx.frame_index as i32));
            call.uniform("DATE", UniformValue::Vec4(ctx.date));
            call.uniforms.extend(uniforms.iter().cloned());

            for b in &node.bindings {
                let bind_err = |reason: String| RenderError::Binding {
                    pass,
                    name: b.name.clone(),
                    reason,
                };
                let (btex, bdesc) = match &b.source {
                    BindingSource::Input(name) | BindingSource::Imported(name) => {
                        let id = overrides
                            .get(name)
                            .or_else(|| self.values.get(name))
                            .and_then(ParamValue::image);
                        match id {
                            Some(id) => {
                                let bdesc = textures
                                    .desc(id)
                                    .ok_or_else(|| bind_err(format!("texture {id} not found")))?;
                                let (_, t) = textures
                                    .bind_for_read(id, b.slot)
                                    .map_err(|e| bind_err(e.to_string()))?;
                                (t, bdesc)
                            }
                            None if opts.missing_images_fail => {
                                return Err(RenderError::MissingImage(name.clone()).into());
                            }
                            None => {
                                tracing::warn!(pass, image = %name, "image not supplied; binding placeholder");
                                (opts.placeholder, TextureDesc::new(1, 1, Default::default()))
                            }
                        }
                    }
                    BindingSource::PassOutput(j) => {
                        let (t, _) = outputs
                            .get(*j)
                            .copied()
                            .flatten()
                            .ok_or_else(|| bind_err(format!("pass {j} has not rendered")))?;
                        (t, descs[*j])
                    }
                    BindingSource::Feedback(j) => {
                        let pp = self
                            .persistent
                            .get(j)
                            .ok_or_else(|| bind_err(format!("no persistent buffer for pass {j}")))?;
                        (pp.retained.tex, pp.retained.desc)
                    }
                    BindingSource::Unwritten(_) => {
                        (opts.placeholder, TextureDesc::new(1, 1, Default::default()))
                    }
                };
                call.samplers.push((b.name.clone(), b.slot, btex));
                call.uniform(
                    glsl::image_size_uniform(&b.name),
                    UniformValue::Vec2([bdesc.width as f32, bdesc.height as f32]),
                );
            }

            let program = pipeline.program(pass).ok_or_else(|| RenderError::Binding {
                pass,
                name: "program".to_string(),
                reason: "no compiled program".to_string(),
            })?;
            gpu.clear(fbo, opts.clear_color);
            gpu.draw(program, fbo, desc.width, desc.height, &call)
                .map_err(RenderError::Backend)?;
            outputs[pass] = Some((tex, fbo));
        }

        let last = self.graph.final_index();
        let (tex, fbo) = outputs[last].ok_or_else(|| RenderError::Backend("final pass did not render".into()))?;
        Ok(FrameOutput {
            tex,
            fbo,
            width: descs[last].width,
            height: descs[last].height,
        })
    }

    fn target(&self, pass: usize) -> Option<(B::Texture, B::Framebuffer)> {
        if let Some(pp) = self.persistent.get(&pass) {
            return Some((pp.spare.tex, pp.spare.fbo));
        }
        self.transient.get(&pass).map(|t| (t.tex, t.fbo))
    }

    fn ensure_persistent(&mut self, gpu: &mut B, pass: usize, desc: TextureDesc) -> Result<(), EngineError> {
        if self.persistent.get(&pass).is_some_and(|pp| pp.retained.desc == desc) {
            return Ok(());
        }
        if let Some(old) = self.persistent.remove(&pass) {
            tracing::warn!(
                pass,
                width = desc.width,
                height = desc.height,
                format = %desc.format,
                "persistent buffer reset after size/format change"
            );
            old.destroy(gpu);
        }
        let clear = [0.0; 4];
        let retained = RenderTarget::create(gpu, desc, clear).map_err(EngineError::GlCreate)?;
        let spare = match RenderTarget::create(gpu, desc, clear) {
            Ok(t) => t,
            Err(e) => {
                retained.destroy(gpu);
                return Err(EngineError::GlCreate(e));
            }
        };
        self.persistent.insert(pass, PingPong { retained, spare });
        Ok(())
    }

    fn ensure_transient(&mut self, gpu: &mut B, pass: usize, desc: TextureDesc) -> Result<(), EngineError> {
        if self.transient.get(&pass).is_some_and(|t| t.desc == desc) {
            return Ok(());
        }
        if let Some(old) = self.transient.remove(&pass) {
            old.destroy(gpu);
        }
        let target = RenderTarget::create(gpu, desc, [0.0; 4]).map_err(EngineError::GlCreate)?;
        self.transient.insert(pass, target);
        Ok(())
    }

    /// Publish a drawn frame: persistent buffers swap, events fire once, counters advance.
    pub fn commit(&mut self, ctx: &FrameContext) {
        for pp in self.persistent.values_mut() {
            pp.swap();
        }
        for input in self.document.inputs.iter().filter(|i| i.kind == InputKind::Event) {
            if let Some(v) = self.values.get_mut(&input.name) {
                *v = ParamValue::Bool(false);
            }
        }
        self.frame_count += 1;
        self.last_time = Some(ctx.time);
    }

    /// Release every GPU resource and texture reference held by the session.
    pub fn dispose(self, gpu: &mut B, textures: &mut TextureManager<B>) {
        for (_, pp) in self.persistent {
            pp.destroy(gpu);
        }
        for (_, t) in self.transient {
            t.destroy(gpu);
        }
        for id in self.values.values().filter_map(ParamValue::image) {
            textures.release(gpu, id);
        }
    }
}

/// A value may target a declared input, or an imported image by name.
fn check_value(doc: &Document, name: &str, value: &ParamValue) -> Result<(), ParamError> {
    if let Some(decl) = doc.input(name) {
        return value.check(decl);
    }
    if doc.is_imported(name) {
        return match value {
            ParamValue::Image(_) => Ok(()),
            other => Err(ParamError::TypeMismatch {
                name: name.to_string(),
                expected: "image".to_string(),
                found: other.type_name().to_string(),
            }),
        };
    }
    Err(ParamError::Unknown(name.to_string()))
}

/// Read the final target back into host memory.
pub fn read_back<B: GpuBackend>(gpu: &mut B, out: &FrameOutput<B>) -> Result<ImageBuffer, EngineError> {
    let bytes = gpu
        .read_pixels(out.fbo, out.width, out.height)
        .map_err(RenderError::Backend)?;
    Ok(ImageBuffer {
        width: out.width,
        height: out.height,
        bytes,
        format: PixelFormat::Rgba8,
    })
}

/// Render one frame of `session` and read it back. All-or-nothing: on error the session keeps
/// its previous persistent buffers and counters.
pub fn render_frame<B: GpuBackend>(
    gpu: &mut B,
    cache: &mut PipelineCache<B>,
    textures: &mut TextureManager<B>,
    session: &mut Session<B>,
    ctx: &FrameContext,
    overrides: &HashMap<String, ParamValue>,
    opts: &FrameOptions<B::Texture>,
) -> Result<ImageBuffer, EngineError> {
    let result = session
        .draw_passes(gpu, cache, textures, ctx, overrides, opts)
        .and_then(|out| read_back(gpu, &out));
    textures.end_frame(gpu);
    let image = result?;
    session.commit(ctx);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{Fragment, HeadlessBackend};
    use isf_core::TextureFormat;
    use isf_doc::parse;

    struct Rig {
        gpu: HeadlessBackend,
        cache: PipelineCache<HeadlessBackend>,
        textures: TextureManager<HeadlessBackend>,
        opts: FrameOptions<<HeadlessBackend as GpuBackend>::Texture>,
        placeholder: RenderTarget<HeadlessBackend>,
    }

    impl Rig {
        fn new(mut gpu: HeadlessBackend) -> Self {
            let placeholder =
                RenderTarget::create(&mut gpu, TextureDesc::new(1, 1, TextureFormat::Rgba8), [0.0; 4])
                    .unwrap();
            let opts = FrameOptions {
                clear_color: [0.0; 4],
                max_texture_size: 256,
                placeholder: placeholder.tex,
                missing_images_fail: false,
            };
            Self {
                gpu,
                cache: PipelineCache::new(),
                textures: TextureManager::new(256),
                opts,
                placeholder,
            }
        }

        fn session(&self, text: &str) -> Session<HeadlessBackend> {
            Session::prepare(parse(text).unwrap(), "330 core").unwrap()
        }

        fn frame(
            &mut self,
            s: &mut Session<HeadlessBackend>,
            ctx: FrameContext,
            params: &HashMap<String, ParamValue>,
        ) -> Result<ImageBuffer, EngineError> {
            render_frame(
                &mut self.gpu,
                &mut self.cache,
                &mut self.textures,
                s,
                &ctx,
                params,
                &self.opts,
            )
        }
    }

    const ACCUMULATE: &str = r#"/*{
        "INPUTS": [ { "NAME": "step", "TYPE": "float", "DEFAULT": 0.25, "MIN": 0, "MAX": 0.5 } ],
        "PASSES": [ { "TARGET": "acc", "PERSISTENT": true } ]
    }*/
    void main() { gl_FragColor = IMG_THIS_PIXEL(acc) + vec4(step); }
    "#;

    fn accumulate(f: &Fragment<'_>) -> [f32; 4] {
        let prev = f.this_pixel("acc");
        let s = f.float("step");
        [prev[0] + s, prev[1] + s, prev[2] + s, prev[3] + s]
    }

    #[test]
    fn persistent_buffer_feeds_back_and_commits() {
        let mut rig = Rig::new(HeadlessBackend::new().with_kernel("IMG_THIS_PIXEL(acc) + vec4(step)", accumulate));
        let mut s = rig.session(ACCUMULATE);
        let none = HashMap::new();

        let f0 = rig.frame(&mut s, FrameContext::new(2, 2), &none).unwrap();
        assert_eq!(f0.pixel(0, 0), Some([64, 64, 64, 64]));
        let f1 = rig.frame(&mut s, FrameContext::new(2, 2).at(0.1, 1), &none).unwrap();
        assert_eq!(f1.pixel(1, 1), Some([128, 128, 128, 128]));
        assert_eq!(s.frame_count(), 2);
    }

    #[test]
    fn persistent_and_transient_targets_share_a_frame() {
        let text = r#"/*{
            "PASSES": [ { "TARGET": "acc", "PERSISTENT": true }, {} ]
        }*/
        void main() {
            vec4 prev = IMG_THIS_PIXEL(acc);
            gl_FragColor = PASSINDEX == 0 ? prev + vec4(0.25) : prev;
        }"#;
        let gpu = HeadlessBackend::new().with_kernel("PASSINDEX == 0 ? prev", |f| {
            let prev = f.this_pixel("acc");
            if f.pass_index() == 0 {
                prev.map(|c| c + 0.25)
            } else {
                prev
            }
        });
        let mut rig = Rig::new(gpu);
        let mut s = rig.session(text);
        let none = HashMap::new();

        let f0 = rig.frame(&mut s, FrameContext::new(2, 2), &none).unwrap();
        assert_eq!(f0.pixel(1, 0), Some([64, 64, 64, 64]));
        let f1 = rig.frame(&mut s, FrameContext::new(2, 2).at(0.1, 1), &none).unwrap();
        assert_eq!(f1.pixel(0, 1), Some([128, 128, 128, 128]));
        // placeholder + ping/pong pair + one transient target
        assert_eq!(rig.gpu.live_textures(), 4);
    }

    #[test]
    fn overrides_are_clamped() {
        let mut rig = Rig::new(HeadlessBackend::new().with_kernel("IMG_THIS_PIXEL(acc) + vec4(step)", accumulate));
        let mut s = rig.session(ACCUMULATE);
        let params = HashMap::from([("step".to_string(), ParamValue::Float(9.0))]);
        let f0 = rig.frame(&mut s, FrameContext::new(1, 1), &params).unwrap();
        assert_eq!(f0.pixel(0, 0), Some([128, 128, 128, 128]));
    }

    #[test]
    fn failed_frame_commits_nothing() {
        let mut rig = Rig::new(HeadlessBackend::new().with_kernel("IMG_THIS_PIXEL(acc) + vec4(step)", accumulate));
        let mut s = rig.session(ACCUMULATE);
        let none = HashMap::new();
        rig.frame(&mut s, FrameContext::new(1, 1), &none).unwrap();

        let bad = HashMap::from([("step".to_string(), ParamValue::Bool(true))]);
        let err = rig.frame(&mut s, FrameContext::new(1, 1), &bad).unwrap_err();
        assert!(matches!(err, EngineError::Param(ParamError::TypeMismatch { .. })));
        assert_eq!(s.frame_count(), 1);

        rig.gpu.fail_next_readback();
        assert!(rig.frame(&mut s, FrameContext::new(1, 1), &none).is_err());
        assert_eq!(s.frame_count(), 1);

        let f = rig.frame(&mut s, FrameContext::new(1, 1), &none).unwrap();
        assert_eq!(f.pixel(0, 0), Some([128, 128, 128, 128]));
    }

    #[test]
    fn size_change_resets_persistent_buffers() {
        let mut rig = Rig::new(HeadlessBackend::new().with_kernel("IMG_THIS_PIXEL(acc) + vec4(step)", accumulate));
        let mut s = rig.session(ACCUMULATE);
        let none = HashMap::new();
        rig.frame(&mut s, FrameContext::new(2, 2), &none).unwrap();
        rig.frame(&mut s, FrameContext::new(2, 2), &none).unwrap();
        let f = rig.frame(&mut s, FrameContext::new(3, 1), &none).unwrap();
        assert_eq!((f.width, f.height), (3, 1));
        assert_eq!(f.pixel(2, 0), Some([64, 64, 64, 64]));
    }

    #[test]
    fn missing_image_binds_placeholder_or_fails() {
        let text = r#"/*{ "INPUTS": [ { "NAME": "inputImage", "TYPE": "image" } ] }*/
            void main() { gl_FragColor = IMG_THIS_PIXEL(inputImage); }"#;
        let gpu = HeadlessBackend::new().with_kernel("IMG_THIS_PIXEL(inputImage)", |f| {
            f.this_pixel("inputImage")
        });
        let mut rig = Rig::new(gpu);
        let mut s = rig.session(text);
        let none = HashMap::new();

        let f = rig.frame(&mut s, FrameContext::new(2, 1), &none).unwrap();
        assert_eq!(f.bytes, vec![0; 8]);

        rig.opts.missing_images_fail = true;
        let err = rig.frame(&mut s, FrameContext::new(2, 1), &none).unwrap_err();
        assert!(matches!(err, EngineError::Render(RenderError::MissingImage(ref n)) if n == "inputImage"));
    }

    #[test]
    fn event_fires_for_one_frame() {
        let text = r#"/*{ "INPUTS": [ { "NAME": "flash", "TYPE": "event" } ] }*/
            void main() { gl_FragColor = flash ? vec4(1.0) : vec4(0.0); }"#;
        let gpu = HeadlessBackend::new().with_kernel("flash ?", |f| {
            if f.bool("flash") {
                [1.0; 4]
            } else {
                [0.0; 4]
            }
        });
        let mut rig = Rig::new(gpu);
        let mut s = rig.session(text);
        let none = HashMap::new();
        s.set_value(&mut rig.gpu, &mut rig.textures, "flash", ParamValue::Bool(true))
            .unwrap();

        let on = rig.frame(&mut s, FrameContext::new(1, 1), &none).unwrap();
        assert_eq!(on.bytes, vec![255; 4]);
        let off = rig.frame(&mut s, FrameContext::new(1, 1), &none).unwrap();
        assert_eq!(off.bytes, vec![0; 4]);
    }

    #[test]
    fn unknown_session_value_is_rejected() {
        let mut rig = Rig::new(HeadlessBackend::new());
        let mut s = rig.session("/*{}*/ void main(){ gl_FragColor = vec4(1.0, 0.0, 0.0, 1.0); }");
        let err = s
            .set_value(&mut rig.gpu, &mut rig.textures, "nope", ParamValue::Float(1.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Param(ParamError::Unknown(_))));
        s.dispose(&mut rig.gpu, &mut rig.textures);
        rig.placeholder.destroy(&mut rig.gpu);
        assert_eq!(rig.gpu.live_textures(), 0);
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_date(0.0), [1970.0, 1.0, 1.0, 0.0]);
        assert_eq!(civil_date(951_782_400.0 + 3_600.0), [2000.0, 2.0, 29.0, 3_600.0]);
        assert_eq!(civil_date(-86_400.0), [1969.0, 12.0, 31.0, 0.0]);
    }
}
