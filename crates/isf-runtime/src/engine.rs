//! `EngineInstance`: the host-facing facade.
//!
//! One instance owns one backend (and therefore one GPU context), the pipeline cache, the
//! texture table and every per-document session. Methods take `&mut self`; sharing an instance
//! across threads means wrapping it in a `Mutex`. Independent instances are independent.
//!
//! Every failed call records its error text in the last-error slot. Losing the GPU context
//! is the one fatal condition: the instance reports `ContextLost` once and `NotInitialized`
//! from then on.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use serde_json::Value;

use isf_core::{
    EngineConfig, EngineError, ParamError, PersistencePolicy, ResourceError, TextureFormat,
};
use isf_doc::{DocumentId, ValidationResult};

use crate::backend::{GpuBackend, RenderTarget, TextureDesc};
use crate::glsl;
use crate::params::{self, ParamValue, ParameterInfo};
use crate::pipeline::{CacheStats, PipelineCache};
use crate::renderer::{self, FrameContext, FrameOptions, ImageBuffer, PixelFormat, Session};
use crate::textures::{TextureId, TextureManager};

/// Host handle for an open document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

/// Session kept across `render_shader` calls under [`PersistencePolicy::Session`].
#[derive(Debug)]
struct SharedSession<B: GpuBackend> {
    session: Session<B>,
    started: Instant,
}

#[derive(Debug)]
pub struct EngineInstance<B: GpuBackend> {
    gpu: B,
    config: EngineConfig,
    pipelines: PipelineCache<B>,
    textures: TextureManager<B>,
    sessions: BTreeMap<DocumentHandle, Session<B>>,
    shared: HashMap<DocumentId, SharedSession<B>>,
    /// Documents `render_shader` keeps warm, least recently rendered first.
    recent: VecDeque<DocumentId>,
    placeholder: Option<RenderTarget<B>>,
    next_handle: u64,
    initialized: bool,
    last_error: String,
}

impl<B: GpuBackend> EngineInstance<B> {
    /// Take ownership of `gpu`, whose context must be current.
    pub fn new(mut gpu: B, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        if gpu.context_lost() {
            return Err(EngineError::ContextLost);
        }
        let placeholder = RenderTarget::create(
            &mut gpu,
            TextureDesc::new(1, 1, TextureFormat::Rgba8),
            [0.0; 4],
        )
        .map_err(EngineError::GlCreate)?;

        tracing::info!(
            glsl_version = %config.glsl_version,
            persistence = ?config.persistence,
            max_texture_size = config.max_texture_size,
            "engine instance created"
        );
        Ok(Self {
            gpu,
            textures: TextureManager::new(config.max_texture_size),
            config,
            pipelines: PipelineCache::new(),
            sessions: BTreeMap::new(),
            shared: HashMap::new(),
            recent: VecDeque::new(),
            placeholder: Some(placeholder),
            next_handle: 1,
            initialized: true,
            last_error: String::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.gpu
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.gpu
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Text of the most recent failure, empty if none since the last reset.
    pub fn last_error(&self) -> String {
        self.last_error.clone()
    }

    pub fn reset_errors(&mut self) {
        self.last_error.clear();
    }

    pub fn pipeline_stats(&self) -> CacheStats {
        self.pipelines.stats()
    }

    /// Live texture table entries.
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn open_document_count(&self) -> usize {
        self.sessions.len()
    }

    fn ready(&mut self) -> Result<(), EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        if self.gpu.context_lost() {
            return Err(EngineError::ContextLost);
        }
        Ok(())
    }

    /// Record failures. A backend failure on a dead context becomes `ContextLost`.
    fn track<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        let result = result.map_err(|e| {
            if !e.is_fatal() && self.initialized && self.gpu.context_lost() {
                EngineError::ContextLost
            } else {
                e
            }
        });
        if let Err(e) = &result {
            self.last_error = e.to_string();
            if matches!(e, EngineError::ContextLost) && self.initialized {
                self.initialized = false;
                tracing::error!("GPU context lost; the engine instance must be recreated");
            }
        }
        result
    }

    fn frame_options(&self) -> Result<FrameOptions<B::Texture>, EngineError> {
        let placeholder = self
            .placeholder
            .as_ref()
            .ok_or(EngineError::NotInitialized)?;
        Ok(FrameOptions {
            clear_color: self.config.clear_color,
            max_texture_size: self.config.max_texture_size,
            placeholder: placeholder.tex,
            missing_images_fail: !self.config.placeholder_missing_images,
        })
    }

    // ---------------------------------------------------------------------------------------
    // Documents
    // ---------------------------------------------------------------------------------------

    /// Structural validation; with `strict_validation` configured, also builds and compiles.
    pub fn validate_document(&mut self, text: &str) -> ValidationResult {
        if self.config.strict_validation {
            return self.validate_strict(text);
        }
        isf_doc::validate_source(text)
    }

    /// Validation plus graph build and GPU compile of every pass. Build and compile
    /// diagnostics are appended as errors; compile logs are kept verbatim.
    pub fn validate_strict(&mut self, text: &str) -> ValidationResult {
        let doc = match isf_doc::parse(text) {
            Ok(doc) => doc,
            Err(e) => return ValidationResult::from_parts(vec![e.to_string()], Vec::new()),
        };
        let mut report = isf_doc::validate(&doc);
        if !report.is_valid {
            return report;
        }
        if let Err(e) = self.ready() {
            let e = self.track::<()>(Err(e)).err().map(|e| e.to_string());
            return report.with_errors(e);
        }
        let graph = match isf_graph::build(&doc) {
            Ok(graph) => graph,
            Err(e) => return report.with_errors([e.to_string()]),
        };
        report.warnings.extend(graph.warnings.iter().cloned());
        let sources = glsl::assemble(&doc, &self.config.glsl_version);
        self.touch(doc.identity);
        match self.pipelines.compile(&mut self.gpu, &graph, &sources) {
            Ok(_) => report,
            Err(e) => report.with_errors([e.to_string()]),
        }
    }

    /// Declared inputs of `text`, in declaration order.
    pub fn get_parameters(&mut self, text: &str) -> Result<Vec<ParameterInfo>, EngineError> {
        let result = isf_doc::parse(text)
            .map(|doc| params::describe(&doc))
            .map_err(EngineError::from);
        self.track(result)
    }

    pub fn open_document(&mut self, text: &str) -> Result<DocumentHandle, EngineError> {
        self.open_document_with_vertex(text, None)
    }

    /// Parse, validate, build and compile a document into a new session.
    pub fn open_document_with_vertex(
        &mut self,
        text: &str,
        vertex: Option<&str>,
    ) -> Result<DocumentHandle, EngineError> {
        let result = self.ready().and_then(|()| self.open(text, vertex));
        self.track(result)
    }

    fn open(&mut self, text: &str, vertex: Option<&str>) -> Result<DocumentHandle, EngineError> {
        let doc = isf_doc::parse_with_vertex(text, vertex)?;
        let session = Session::prepare(doc, &self.config.glsl_version)?;
        self.pipelines
            .compile(&mut self.gpu, session.graph(), session.sources())?;

        let handle = DocumentHandle(self.next_handle);
        self.next_handle += 1;
        tracing::info!(
            %handle,
            document = %session.document().identity,
            passes = session.graph().passes.len(),
            "opened document"
        );
        self.sessions.insert(handle, session);
        Ok(handle)
    }

    /// Release a session's buffers and texture references.
    pub fn close_document(&mut self, handle: DocumentHandle) -> Result<(), EngineError> {
        let result = match self.sessions.remove(&handle) {
            Some(session) => {
                let document = session.document().identity;
                session.dispose(&mut self.gpu, &mut self.textures);
                self.release_programs(document);
                tracing::info!(%handle, "closed document");
                Ok(())
            }
            None => Err(EngineError::UnknownDocument(handle.0)),
        };
        self.track(result)
    }

    /// Drop cached programs and the shared `render_shader` session of a document.
    pub fn invalidate_document(&mut self, document: DocumentId) -> usize {
        self.recent.retain(|id| *id != document);
        if let Some(shared) = self.shared.remove(&document) {
            shared.session.dispose(&mut self.gpu, &mut self.textures);
        }
        self.pipelines.invalidate(&mut self.gpu, document)
    }

    /// Mark `document` as most recently rendered and release whatever falls off the end.
    fn touch(&mut self, document: DocumentId) {
        self.recent.retain(|id| *id != document);
        self.recent.push_back(document);
        while self.recent.len() > self.config.max_cached_documents {
            let Some(oldest) = self.recent.pop_front() else {
                break;
            };
            if let Some(shared) = self.shared.remove(&oldest) {
                shared.session.dispose(&mut self.gpu, &mut self.textures);
            }
            let released = self.release_programs(oldest);
            tracing::debug!(document = %oldest, programs = released, "evicted cached document");
        }
    }

    /// Drop the programs of `document` unless a warm or open session still draws with them.
    fn release_programs(&mut self, document: DocumentId) -> usize {
        let in_use = self.recent.contains(&document)
            || self.sessions.values().any(|s| s.document().identity == document);
        if in_use {
            0
        } else {
            self.pipelines.invalidate(&mut self.gpu, document)
        }
    }

    pub fn set_parameter(
        &mut self,
        handle: DocumentHandle,
        name: &str,
        value: ParamValue,
    ) -> Result<(), EngineError> {
        let result = self.ready().and_then(|()| {
            let session = self
                .sessions
                .get_mut(&handle)
                .ok_or(EngineError::UnknownDocument(handle.0))?;
            session.set_value(&mut self.gpu, &mut self.textures, name, value)
        });
        self.track(result)
    }

    /// [`EngineInstance::set_parameter`] with a host JSON value coerced against the
    /// declaration. Imported images take a `"tex-<n>"` string.
    pub fn set_parameter_json(
        &mut self,
        handle: DocumentHandle,
        name: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        let coerced = match self.sessions.get(&handle) {
            None => Err(EngineError::UnknownDocument(handle.0)),
            Some(session) => {
                let doc = session.document();
                match doc.input(name) {
                    Some(decl) => ParamValue::from_json(decl, value).map_err(EngineError::from),
                    None if doc.is_imported(name) => value
                        .as_str()
                        .and_then(|s| s.parse::<TextureId>().ok())
                        .map(ParamValue::Image)
                        .ok_or_else(|| {
                            ParamError::TypeMismatch {
                                name: name.to_string(),
                                expected: "image".to_string(),
                                found: value.to_string(),
                            }
                            .into()
                        }),
                    None => Err(ParamError::Unknown(name.to_string()).into()),
                }
            }
        };
        match coerced {
            Ok(v) => self.set_parameter(handle, name, v),
            Err(e) => self.track(Err(e)),
        }
    }

    // ---------------------------------------------------------------------------------------
    // Rendering
    // ---------------------------------------------------------------------------------------

    /// Render one frame of an open document. `params` override session values for this
    /// frame only.
    pub fn render_frame(
        &mut self,
        handle: DocumentHandle,
        ctx: FrameContext,
        params: &HashMap<String, ParamValue>,
    ) -> Result<ImageBuffer, EngineError> {
        let result = self.ready().and_then(|()| {
            let opts = self.frame_options()?;
            let session = self
                .sessions
                .get_mut(&handle)
                .ok_or(EngineError::UnknownDocument(handle.0))?;
            renderer::render_frame(
                &mut self.gpu,
                &mut self.pipelines,
                &mut self.textures,
                session,
                &ctx,
                params,
                &opts,
            )
        });
        self.track(result)
    }

    /// Render one frame of an open document into a host texture of the same size.
    pub fn render_to_texture(
        &mut self,
        handle: DocumentHandle,
        ctx: FrameContext,
        params: &HashMap<String, ParamValue>,
        texture: &str,
    ) -> Result<(), EngineError> {
        let result = self
            .ready()
            .and_then(|()| self.render_into(handle, &ctx, params, texture));
        self.track(result)
    }

    fn render_into(
        &mut self,
        handle: DocumentHandle,
        ctx: &FrameContext,
        params: &HashMap<String, ParamValue>,
        texture: &str,
    ) -> Result<(), EngineError> {
        let id: TextureId = texture.parse()?;
        let desc = self
            .textures
            .desc(id)
            .filter(|_| self.textures.is_host_owned(id))
            .ok_or_else(|| ResourceError::NotFound(texture.to_string()))?;
        let opts = self.frame_options()?;
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(EngineError::UnknownDocument(handle.0))?;

        let drawn = session.draw_passes(
            &mut self.gpu,
            &mut self.pipelines,
            &mut self.textures,
            ctx,
            params,
            &opts,
        );
        let result = match drawn {
            Ok(out) if (out.width, out.height) != (desc.width, desc.height) => {
                Err(ResourceError::InvalidSize {
                    width: desc.width,
                    height: desc.height,
                    len: desc.byte_len(),
                    reason: format!("frame is {}x{}", out.width, out.height),
                }
                .into())
            }
            Ok(out) => self
                .textures
                .bind_for_write(&mut self.gpu, id)
                .map(|dst| self.gpu.blit(out.fbo, dst, out.width, out.height))
                .map_err(EngineError::from),
            Err(e) => Err(e),
        };
        self.textures.end_frame(&mut self.gpu);
        result?;
        session.commit(ctx);
        Ok(())
    }

    /// One-shot render of `text` at `width`x`height`.
    ///
    /// Under [`PersistencePolicy::ResetPerCall`] every call starts from cleared persistent
    /// buffers at frame 0. Under [`PersistencePolicy::Session`] calls with the same text share
    /// buffers and frame counter, and `TIME` runs from the first call.
    pub fn render_shader(
        &mut self,
        text: &str,
        width: u32,
        height: u32,
        params: &HashMap<String, ParamValue>,
    ) -> Result<ImageBuffer, EngineError> {
        let result = self
            .ready()
            .and_then(|()| self.render_once(text, width, height, params));
        self.track(result)
    }

    fn render_once(
        &mut self,
        text: &str,
        width: u32,
        height: u32,
        params: &HashMap<String, ParamValue>,
    ) -> Result<ImageBuffer, EngineError> {
        let doc = isf_doc::parse(text)?;
        let opts = self.frame_options()?;
        self.touch(doc.identity);

        match self.config.persistence {
            PersistencePolicy::ResetPerCall => {
                let mut session = Session::prepare(doc, &self.config.glsl_version)?;
                let ctx = FrameContext::new(width, height).with_system_date();
                let result = renderer::render_frame(
                    &mut self.gpu,
                    &mut self.pipelines,
                    &mut self.textures,
                    &mut session,
                    &ctx,
                    params,
                    &opts,
                );
                session.dispose(&mut self.gpu, &mut self.textures);
                result
            }
            PersistencePolicy::Session => {
                let shared = match self.shared.entry(doc.identity) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => e.insert(SharedSession {
                        session: Session::prepare(doc, &self.config.glsl_version)?,
                        started: Instant::now(),
                    }),
                };
                let ctx = FrameContext::new(width, height)
                    .at(
                        shared.started.elapsed().as_secs_f64(),
                        shared.session.frame_count(),
                    )
                    .with_system_date();
                renderer::render_frame(
                    &mut self.gpu,
                    &mut self.pipelines,
                    &mut self.textures,
                    &mut shared.session,
                    &ctx,
                    params,
                    &opts,
                )
            }
        }
    }

    // ---------------------------------------------------------------------------------------
    // Textures
    // ---------------------------------------------------------------------------------------

    /// Upload tightly packed rows (row 0 at the bottom). `format` is `"RGBA"` or `"RGBA32F"`.
    pub fn create_texture(
        &mut self,
        bytes: &[u8],
        width: u32,
        height: u32,
        format: &str,
    ) -> Result<String, EngineError> {
        let result = self.ready().and_then(|()| {
            let format: TextureFormat = format.parse()?;
            let id = self
                .textures
                .create(&mut self.gpu, bytes, width, height, format)?;
            Ok(id.to_string())
        });
        self.track(result)
    }

    pub fn destroy_texture(&mut self, texture: &str) -> Result<(), EngineError> {
        let result = self.ready().and_then(|()| {
            let id: TextureId = texture.parse()?;
            self.textures.destroy(&mut self.gpu, id)?;
            Ok(())
        });
        self.track(result)
    }

    /// Copy a texture into a new host-owned one.
    pub fn duplicate_texture(&mut self, texture: &str) -> Result<String, EngineError> {
        let result = self.ready().and_then(|()| {
            let id: TextureId = texture.parse()?;
            Ok(self.textures.duplicate(&mut self.gpu, id)?.to_string())
        });
        self.track(result)
    }

    pub fn read_texture(&mut self, texture: &str) -> Result<ImageBuffer, EngineError> {
        let result = self.ready().and_then(|()| {
            let id: TextureId = texture.parse()?;
            let desc = self
                .textures
                .desc(id)
                .ok_or_else(|| ResourceError::NotFound(texture.to_string()))?;
            let bytes = self.textures.read(&mut self.gpu, id)?;
            Ok(ImageBuffer {
                width: desc.width,
                height: desc.height,
                bytes,
                format: PixelFormat::Rgba8,
            })
        });
        self.track(result)
    }

    // ---------------------------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------------------------

    /// Release every session, texture and program. The instance is unusable afterwards.
    /// On a lost context the handles are dropped without GPU calls.
    pub fn shutdown(&mut self) {
        let lost = self.gpu.context_lost();
        let sessions = std::mem::take(&mut self.sessions);
        let shared = std::mem::take(&mut self.shared);
        self.recent.clear();
        let placeholder = self.placeholder.take();

        if lost {
            self.textures = TextureManager::new(self.config.max_texture_size);
            self.pipelines = PipelineCache::new();
        } else {
            for (_, session) in sessions {
                session.dispose(&mut self.gpu, &mut self.textures);
            }
            for (_, s) in shared {
                s.session.dispose(&mut self.gpu, &mut self.textures);
            }
            if let Some(p) = placeholder {
                p.destroy(&mut self.gpu);
            }
            self.textures.destroy_all(&mut self.gpu);
            self.pipelines.clear(&mut self.gpu);
        }
        if self.initialized {
            tracing::info!(context_lost = lost, "engine instance shut down");
        }
        self.initialized = false;
    }
}

impl<B: GpuBackend> Drop for EngineInstance<B> {
    fn drop(&mut self) {
        if self.placeholder.is_some() {
            self.shutdown();
        }
    }
}
