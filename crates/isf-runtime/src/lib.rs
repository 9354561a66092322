#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

//! Backend-agnostic ISF runtime.
//!
//! Everything GPU-facing goes through [`GpuBackend`]; this crate never touches a graphics API
//! directly. Backends live in their own crates (`isf-runtime-glow`). The `headless` feature
//! adds a CPU backend for tests and GPU-less hosts.
//!
//! Flow: [`Session::prepare`] (parse result → validated graph → assembled GLSL), then
//! per frame [`PipelineCache::compile`] (cache hit after the first frame) and the renderer.
//! [`EngineInstance`] ties these together behind the host-facing API.

pub mod backend;
pub mod engine;
pub mod glsl;
pub mod params;
pub mod pipeline;
pub mod renderer;
pub mod textures;

#[cfg(any(test, feature = "headless"))]
pub mod headless;

pub use backend::{DrawCall, GpuBackend, RenderTarget, TextureDesc, UniformValue};
pub use engine::{DocumentHandle, EngineInstance};
pub use glsl::{assemble, ShaderPair};
pub use params::{describe, ParamValue, ParameterInfo};
pub use pipeline::{CacheStats, CompiledPipeline, PipelineCache, PipelineKey};
pub use renderer::{civil_date, FrameContext, ImageBuffer, PixelFormat, Session};
pub use textures::{TextureId, TextureManager};

pub use isf_core::{EngineConfig, EngineError, PersistencePolicy, TextureFormat};
