use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Content identity of a parsed document (hash of the source text and vertex stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl DocumentId {
    pub fn of(fragment_text: &str, vertex: Option<&str>) -> Self {
        let mut h = DefaultHasher::new();
        fragment_text.hash(&mut h);
        vertex.hash(&mut h);
        DocumentId(h.finish())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Declared input type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputKind {
    Event,
    Bool,
    Long,
    Float,
    Point2D,
    Color,
    Image,
    Audio,
    AudioFft,
}

impl InputKind {
    /// Accepts the ISF spelling (`"point2D"`, `"audioFFT"`, ...) and `"int"` as an alias of `long`.
    pub fn from_isf(s: &str) -> Option<Self> {
        Some(match s {
            "event" => InputKind::Event,
            "bool" => InputKind::Bool,
            "long" | "int" => InputKind::Long,
            "float" => InputKind::Float,
            "point2D" => InputKind::Point2D,
            "color" => InputKind::Color,
            "image" => InputKind::Image,
            "audio" => InputKind::Audio,
            "audioFFT" => InputKind::AudioFft,
            _ => return None,
        })
    }

    pub fn as_isf(self) -> &'static str {
        match self {
            InputKind::Event => "event",
            InputKind::Bool => "bool",
            InputKind::Long => "long",
            InputKind::Float => "float",
            InputKind::Point2D => "point2D",
            InputKind::Color => "color",
            InputKind::Image => "image",
            InputKind::Audio => "audio",
            InputKind::AudioFft => "audioFFT",
        }
    }

    /// Inputs bound as samplers rather than plain uniforms.
    pub fn is_sampler(self) -> bool {
        matches!(self, InputKind::Image | InputKind::Audio | InputKind::AudioFft)
    }

    /// Inputs usable as `$name` in size expressions.
    pub fn is_scalar_numeric(self) -> bool {
        matches!(self, InputKind::Float | InputKind::Long)
    }
}

/// A typed constant from the header (`DEFAULT`, `MIN`, `MAX`, `IDENTITY`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Long(i32),
    Float(f32),
    Point2D([f32; 2]),
    Color([f32; 4]),
}

impl InputValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InputValue::Long(v) => Some(f64::from(*v)),
            InputValue::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDeclaration {
    pub name: String,
    pub kind: InputKind,
    pub label: Option<String>,
    pub default: Option<InputValue>,
    pub min: Option<InputValue>,
    pub max: Option<InputValue>,
    pub identity: Option<InputValue>,
    /// `long` only: selectable values and their labels.
    pub values: Vec<i32>,
    pub labels: Vec<String>,
    /// Audio inputs: requested sample count (`MAX` on audio inputs).
    pub max_samples: Option<u32>,
}

impl InputDeclaration {
    pub fn new(name: impl Into<String>, kind: InputKind) -> Self {
        Self {
            name: name.into(),
            kind,
            label: None,
            default: None,
            min: None,
            max: None,
            identity: None,
            values: Vec::new(),
            labels: Vec::new(),
            max_samples: None,
        }
    }

    /// Declared default, or the ISF fallback for the type. `None` for sampler inputs.
    pub fn effective_default(&self) -> Option<InputValue> {
        if let Some(v) = self.default {
            return Some(v);
        }
        match self.kind {
            InputKind::Event | InputKind::Bool => Some(InputValue::Bool(false)),
            InputKind::Long => Some(InputValue::Long(self.values.first().copied().unwrap_or(0))),
            InputKind::Float => Some(InputValue::Float(0.0)),
            InputKind::Point2D => Some(InputValue::Point2D([0.0, 0.0])),
            InputKind::Color => Some(InputValue::Color([0.0, 0.0, 0.0, 1.0])),
            InputKind::Image | InputKind::Audio | InputKind::AudioFft => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PassDeclaration {
    pub target: Option<String>,
    pub persistent: bool,
    pub float_buffer: bool,
    /// Raw `WIDTH`/`HEIGHT` expressions; `None` means the render size.
    pub width: Option<String>,
    pub height: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedImage {
    pub name: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    /// Fragment body: everything after the header comment.
    pub fragment: String,
    pub vertex: Option<String>,
}

/// One parsed ISF asset. Immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub name: Option<String>,
    pub description: Option<String>,
    pub credit: Option<String>,
    pub isf_version: String,
    pub vsn: Option<String>,
    /// Ordered, without duplicates.
    pub categories: Vec<String>,
    pub inputs: Vec<InputDeclaration>,
    /// Never empty: a header without `PASSES` yields one implicit pass.
    pub passes: Vec<PassDeclaration>,
    pub imported: Vec<ImportedImage>,
    pub shader: ShaderSource,
    pub identity: DocumentId,
    /// Byte offset of the JSON header inside the source text.
    pub header_offset: usize,
    /// Byte offset of the fragment body inside the source text.
    pub body_offset: usize,
    /// 1-based line of the body's first character inside the source text.
    pub body_line: usize,
}

impl Document {
    pub fn input(&self, name: &str) -> Option<&InputDeclaration> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Index of the pass rendering into `target`.
    pub fn target_pass(&self, target: &str) -> Option<usize> {
        self.passes
            .iter()
            .position(|p| p.target.as_deref() == Some(target))
    }

    pub fn is_imported(&self, name: &str) -> bool {
        self.imported.iter().any(|i| i.name == name)
    }

    pub fn is_multipass(&self) -> bool {
        self.passes.len() > 1
    }

    pub fn persistent_pass_count(&self) -> usize {
        self.passes.iter().filter(|p| p.persistent).count()
    }
}
