#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

//! ISF documents: parsing, structural validation and the small languages embedded in them.
//!
//! This crate is **contract-only**: no GPU handles, no shared state. Every function is pure and
//! may run concurrently across documents.

pub mod document;
pub mod expr;
pub mod parser;
pub mod refs;
pub mod validate;

pub use document::{
    Document, DocumentId, ImportedImage, InputDeclaration, InputKind, InputValue,
    PassDeclaration, ShaderSource,
};
pub use expr::{ExprError, SizeExpr};
pub use parser::{parse, parse_with_vertex};
pub use validate::{validate, validate_source, ValidationResult};
