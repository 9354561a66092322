use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How `render_shader` treats persistent buffers across repeated calls with the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistencePolicy {
    /// Every call starts from cleared persistent buffers and frame index 0.
    #[default]
    ResetPerCall,
    /// Calls with the same document text share one session (buffers, frame index, parameters).
    Session,
}

/// Engine configuration. Every field has a default, so `{}` is a valid config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Value emitted after `#version` in assembled shaders.
    pub glsl_version: String,

    pub persistence: PersistencePolicy,

    /// Upper bound for texture and pass dimensions.
    pub max_texture_size: u32,

    /// When true, `validate_document` also builds and compiles the document.
    pub strict_validation: bool,

    /// Color used to clear transient pass targets before drawing.
    pub clear_color: [f32; 4],

    /// When true, declared-but-unsupplied image inputs sample a transparent 1x1 placeholder.
    /// When false they fail the frame.
    pub placeholder_missing_images: bool,

    /// Documents `render_shader` keeps warm (shared sessions and compiled programs). The least
    /// recently rendered one is released past this count.
    pub max_cached_documents: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            glsl_version: "330 core".to_string(),
            persistence: PersistencePolicy::ResetPerCall,
            max_texture_size: 8192,
            strict_validation: false,
            clear_color: [0.0, 0.0, 0.0, 0.0],
            placeholder_missing_images: true,
            max_cached_documents: 16,
        }
    }
}

impl EngineConfig {
    /// Load and check a config file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let cfg: EngineConfig = load_typed_json(path)?;
        cfg.check(path)?;
        Ok(cfg)
    }

    /// Parse an in-memory config. Errors report the path as `<inline>`.
    pub fn from_json_str(s: &str) -> Result<Self, EngineError> {
        let path = PathBuf::from("<inline>");
        let value: serde_json::Value = serde_json::from_str(s).map_err(|source| EngineError::Json {
            path: path.clone(),
            source,
        })?;
        let cfg: EngineConfig =
            serde_json::from_value(value).map_err(|source| EngineError::JsonValue {
                path: path.clone(),
                source,
            })?;
        cfg.check(&path)?;
        Ok(cfg)
    }

    /// Check a config built in code. Errors report the path as `<engine>`.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.check(Path::new("<engine>"))
    }

    fn check(&self, path: &Path) -> Result<(), EngineError> {
        let invalid = |msg: String| EngineError::InvalidConfig {
            path: path.to_path_buf(),
            msg,
        };

        if self.max_texture_size == 0 {
            return Err(invalid("max_texture_size must be > 0".to_string()));
        }
        if self.max_cached_documents == 0 {
            return Err(invalid("max_cached_documents must be > 0".to_string()));
        }
        if self.glsl_version.trim().is_empty() {
            return Err(invalid("glsl_version must not be empty".to_string()));
        }
        if self.clear_color.iter().any(|c| !c.is_finite()) {
            return Err(invalid(format!(
                "clear_color must be finite, got {:?}",
                self.clear_color
            )));
        }
        Ok(())
    }
}

/// Read a JSON file and deserialize it into `T`.
///
/// Syntax errors map to `EngineError::Json`, shape errors to `EngineError::JsonValue`.
pub fn load_typed_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, EngineError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|source| EngineError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_value(value).map_err(|source| EngineError::JsonValue {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        let cfg = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn session_policy_parses() {
        let cfg =
            EngineConfig::from_json_str(r#"{ "persistence": "session", "max_texture_size": 512 }"#)
                .unwrap();
        assert_eq!(cfg.persistence, PersistencePolicy::Session);
        assert_eq!(cfg.max_texture_size, 512);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "glsl": "450" }"#).unwrap_err();
        assert!(matches!(err, EngineError::JsonValue { .. }), "got {err:?}");
    }

    #[test]
    fn zero_texture_size_is_invalid() {
        let err = EngineConfig::from_json_str(r#"{ "max_texture_size": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("max_texture_size"));
    }

    #[test]
    fn zero_document_cache_is_invalid() {
        let err = EngineConfig::from_json_str(r#"{ "max_cached_documents": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("max_cached_documents"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::load_from("/definitely/not/here/isf.json").unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
