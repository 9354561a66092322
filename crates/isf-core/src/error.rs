use std::fmt;
use std::path::PathBuf;

/// A malformed ISF source text. Recoverable: the engine stays usable.
///
/// Every variant carries the byte offset (into the full source text) where the problem was
/// detected. Field-level problems report the offset of the JSON header itself.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing ISF header: expected a leading /* {{ ... }} */ comment (byte {offset})")]
    MissingHeader { offset: usize },

    #[error("unterminated ISF header comment starting at byte {offset}")]
    UnterminatedHeader { offset: usize },

    #[error("malformed JSON header at byte {offset}: {reason}")]
    Json { offset: usize, reason: String },

    #[error("missing required field '{field}' in {context} (byte {offset})")]
    MissingField {
        offset: usize,
        field: &'static str,
        context: String,
    },

    #[error("unknown input type '{ty}' for input '{input}' (byte {offset})")]
    UnknownInputType {
        offset: usize,
        input: String,
        ty: String,
    },

    #[error("invalid field '{field}' in {context}: {reason} (byte {offset})")]
    InvalidField {
        offset: usize,
        field: &'static str,
        context: String,
        reason: String,
    },
}

impl ParseError {
    pub fn offset(&self) -> usize {
        match self {
            ParseError::MissingHeader { offset }
            | ParseError::UnterminatedHeader { offset }
            | ParseError::Json { offset, .. }
            | ParseError::MissingField { offset, .. }
            | ParseError::UnknownInputType { offset, .. }
            | ParseError::InvalidField { offset, .. } => *offset,
        }
    }
}

/// Structural failure while turning a document into a render graph. Fatal for that document.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("unresolved binding '{0}'")]
    UnresolvedBinding(String),

    #[error("cycle detected: pass {pass} reads its own non-persistent target '{target}'")]
    CycleDetected { pass: usize, target: String },

    #[error("pass {pass} reads target '{target}' before it is rendered (mark it PERSISTENT to read last frame)")]
    ForwardRead { pass: usize, target: String },

    #[error("pass {pass}: bad size expression: {reason}")]
    SizeExpression { pass: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Link,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
            ShaderStage::Link => f.write_str("link"),
        }
    }
}

/// GPU compiler diagnostic for one pass. `log` is the driver output, unaltered.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("pass {pass_index} {stage} error: {log}")]
pub struct CompileError {
    pub pass_index: usize,
    pub stage: ShaderStage,
    pub log: String,
}

/// Texture table failures. Fatal for the call only.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("texture '{0}' not found")]
    NotFound(String),

    #[error("texture '{0}' is bound by an in-flight render")]
    InUse(String),

    #[error("invalid texture size {width}x{height} with {len} bytes ({reason})")]
    InvalidSize {
        width: u32,
        height: u32,
        len: usize,
        reason: String,
    },

    #[error("unsupported texture format '{0}'")]
    UnsupportedFormat(String),

    #[error("backend texture operation failed: {0}")]
    Backend(String),
}

/// A host-supplied parameter that does not fit its declaration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),

    #[error("parameter '{name}' expects {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("parameter '{name}' value {value} is not one of the declared VALUES")]
    NotInValues { name: String, value: i64 },
}

/// Failure while executing one frame. Prior frames' outputs are unaffected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("pass {pass}: failed to bind '{name}': {reason}")]
    Binding {
        pass: usize,
        name: String,
        reason: String,
    },

    #[error("image input '{0}' was not supplied")]
    MissingImage(String),

    #[error("invalid output size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("backend render failed: {0}")]
    Backend(String),
}

/// Engine-level errors used across the ISF engine crates.
///
/// Contract rule: this type lives in `isf-core` and is re-exported by runtimes.
#[derive(Debug)]
pub enum EngineError {
    // ---- Config ----
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    JsonValue {
        path: PathBuf,
        source: serde_json::Error,
    },

    InvalidConfig {
        path: PathBuf,
        msg: String,
    },

    // ---- Document pipeline ----
    Parse(ParseError),
    /// The document parsed but failed validation; carries the collected errors.
    Invalid(Vec<String>),
    Build(BuildError),
    Compile(CompileError),

    // ---- Runtime-facing ----
    Resource(ResourceError),
    Param(ParamError),
    Render(RenderError),
    UnknownDocument(u64),
    GlCreate(String),
    /// The GPU context is gone; the instance must be recreated.
    ContextLost,
    NotInitialized,
}

impl EngineError {
    /// True when the whole instance is unusable (as opposed to a per-call/per-document failure).
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::ContextLost | EngineError::NotInitialized)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io { path, source } => {
                write!(f, "io error at {}: {}", path.display(), source)
            }
            EngineError::Json { path, source } => {
                write!(f, "json parse error at {}: {}", path.display(), source)
            }
            EngineError::JsonValue { path, source } => {
                write!(f, "json value error at {}: {}", path.display(), source)
            }
            EngineError::InvalidConfig { path, msg } => {
                write!(f, "invalid config at {}: {}", path.display(), msg)
            }

            EngineError::Parse(e) => write!(f, "parse error: {e}"),
            EngineError::Invalid(errors) => {
                write!(f, "invalid document: {}", errors.join("; "))
            }
            EngineError::Build(e) => write!(f, "build error: {e}"),
            EngineError::Compile(e) => write!(f, "compile error: {e}"),

            EngineError::Resource(e) => write!(f, "resource error: {e}"),
            EngineError::Param(e) => write!(f, "parameter error: {e}"),
            EngineError::Render(e) => write!(f, "render error: {e}"),
            EngineError::UnknownDocument(id) => write!(f, "unknown document handle {id:016x}"),
            EngineError::GlCreate(msg) => write!(f, "backend object creation failed: {msg}"),
            EngineError::ContextLost => write!(f, "GPU context lost; reinitialize the engine"),
            EngineError::NotInitialized => write!(f, "engine not initialized"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io { source, .. } => Some(source),
            EngineError::Json { source, .. } => Some(source),
            EngineError::JsonValue { source, .. } => Some(source),
            EngineError::Parse(e) => Some(e),
            EngineError::Build(e) => Some(e),
            EngineError::Compile(e) => Some(e),
            EngineError::Resource(e) => Some(e),
            EngineError::Param(e) => Some(e),
            EngineError::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Parse(e)
    }
}

impl From<BuildError> for EngineError {
    fn from(e: BuildError) -> Self {
        EngineError::Build(e)
    }
}

impl From<CompileError> for EngineError {
    fn from(e: CompileError) -> Self {
        EngineError::Compile(e)
    }
}

impl From<ResourceError> for EngineError {
    fn from(e: ResourceError) -> Self {
        EngineError::Resource(e)
    }
}

impl From<ParamError> for EngineError {
    fn from(e: ParamError) -> Self {
        EngineError::Param(e)
    }
}

impl From<RenderError> for EngineError {
    fn from(e: RenderError) -> Self {
        EngineError::Render(e)
    }
}
