#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

//! Shared vocabulary for the ISF engine crates: the error taxonomy and engine configuration.
//!
//! Contract rule: nothing in here knows about GPU handles.

pub mod config;
pub mod error;
pub mod format;

pub use config::{load_typed_json, EngineConfig, PersistencePolicy};
pub use error::{
    BuildError, CompileError, EngineError, ParamError, ParseError, RenderError, ResourceError,
    ShaderStage,
};
pub use format::TextureFormat;
