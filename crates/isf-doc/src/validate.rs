//! Structural checks over a parsed [`Document`].
//!
//! Validation never fails: every problem lands in [`ValidationResult::errors`] or
//! [`ValidationResult::warnings`]. GLSL compilation is not performed here.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::document::{Document, InputKind, InputValue};
use crate::expr::SizeExpr;
use crate::parser;
use crate::refs::{self, BraceMismatch};

/// Names hosts commonly bind themselves; an input with one of these names is likely to clash.
const RESERVED_HOST_NAMES: &[&str] = &[
    "time",
    "resolution",
    "mouse",
    "mouseNorm",
    "mouseDown",
    "mouseDownNorm",
];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ValidationResult {
    /// Build a result from collected diagnostics; `is_valid` follows `errors`.
    pub fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            metadata: BTreeMap::new(),
        }
    }

    /// Append further errors (e.g. from a strict compile step).
    pub fn with_errors(mut self, more: impl IntoIterator<Item = String>) -> Self {
        self.errors.extend(more);
        self.is_valid = self.errors.is_empty();
        self
    }
}

/// Parse and validate in one step. Parse failures become a single error entry.
pub fn validate_source(text: &str) -> ValidationResult {
    match parser::parse(text) {
        Ok(doc) => validate(&doc),
        Err(e) => ValidationResult::from_parts(vec![e.to_string()], Vec::new()),
    }
}

pub fn validate(doc: &Document) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_inputs(doc, &mut errors, &mut warnings);
    check_passes(doc, &mut errors, &mut warnings);
    check_references(doc, &mut errors, &mut warnings);
    check_body(doc, &mut errors, &mut warnings);
    check_metadata(doc, &mut warnings);

    let mut result = ValidationResult::from_parts(errors, warnings);
    result
        .metadata
        .insert("isf_version".into(), doc.isf_version.clone());
    result
        .metadata
        .insert("input_count".into(), doc.inputs.len().to_string());
    result
        .metadata
        .insert("pass_count".into(), doc.passes.len().to_string());
    result.metadata.insert(
        "persistent_passes".into(),
        doc.persistent_pass_count().to_string(),
    );
    tracing::debug!(
        document = %doc.identity,
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        "validated ISF document"
    );
    result
}

fn check_inputs(doc: &Document, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for input in &doc.inputs {
        if input.name.is_empty() {
            errors.push("input with an empty NAME".to_string());
            continue;
        }
        if !seen.insert(input.name.as_str()) {
            errors.push(format!("duplicate input name '{}'", input.name));
        }
        if refs::is_implicit(&input.name) {
            errors.push(format!(
                "input '{}' shadows a reserved implicit input",
                input.name
            ));
        }
        if RESERVED_HOST_NAMES.contains(&input.name.as_str()) {
            warnings.push(format!(
                "input '{}' uses a name hosts commonly reserve",
                input.name
            ));
        }

        if input.kind == InputKind::Long
            && !input.labels.is_empty()
            && input.values.len() != input.labels.len()
        {
            errors.push(format!(
                "input '{}' has {} VALUES but {} LABELS",
                input.name,
                input.values.len(),
                input.labels.len()
            ));
        }
        if input.kind == InputKind::Long && !input.values.is_empty() {
            if let Some(InputValue::Long(d)) = input.default {
                if !input.values.contains(&d) {
                    warnings.push(format!(
                        "input '{}' DEFAULT {d} is not one of its VALUES",
                        input.name
                    ));
                }
            }
        }

        check_range(input.name.as_str(), input.min, input.max, input.default, errors, warnings);
    }
}

fn check_body(doc: &Document, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let body = &doc.shader.fragment;
    if body.trim().is_empty() {
        errors.push("fragment shader body is empty".to_string());
        return;
    }
    if !refs::defines_main(body) {
        warnings.push("fragment shader has no void main()".to_string());
    }
    if !refs::writes_frag_color(body) {
        warnings.push("fragment shader never writes gl_FragColor".to_string());
    }
    match refs::brace_mismatch(body) {
        Some(BraceMismatch::UnmatchedClose(offset)) => {
            let line = doc.body_line + body[..offset].matches('\n').count();
            errors.push(format!("unmatched closing brace on line {line}"));
        }
        Some(BraceMismatch::Unclosed(n)) => {
            errors.push(format!("{n} unclosed brace(s) at end of fragment shader"));
        }
        None => {}
    }
}

fn check_metadata(doc: &Document, warnings: &mut Vec<String>) {
    let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
    if blank(&doc.description) {
        warnings.push("missing DESCRIPTION".to_string());
    }
    if blank(&doc.credit) {
        warnings.push("missing CREDIT".to_string());
    }
    if doc.categories.is_empty() {
        warnings.push("missing CATEGORIES".to_string());
    }
}

fn components(v: InputValue) -> Vec<f32> {
    match v {
        InputValue::Bool(b) => vec![if b { 1.0 } else { 0.0 }],
        InputValue::Long(l) => vec![l as f32],
        InputValue::Float(f) => vec![f],
        InputValue::Point2D(p) => p.to_vec(),
        InputValue::Color(c) => c.to_vec(),
    }
}

fn check_range(
    name: &str,
    min: Option<InputValue>,
    max: Option<InputValue>,
    default: Option<InputValue>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let (Some(min), Some(max)) = (min, max) else {
        return;
    };
    let (lo, hi) = (components(min), components(max));
    if lo.iter().zip(&hi).any(|(l, h)| l > h) {
        errors.push(format!("input '{name}' has MIN greater than MAX"));
        return;
    }
    if let Some(default) = default {
        let d = components(default);
        let outside = d
            .iter()
            .zip(lo.iter().zip(&hi))
            .any(|(v, (l, h))| v < l || v > h);
        if outside {
            warnings.push(format!(
                "input '{name}' DEFAULT lies outside [MIN, MAX] and will be clamped"
            ));
        }
    }
}

fn check_passes(doc: &Document, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let mut targets = HashSet::new();
    for (i, pass) in doc.passes.iter().enumerate() {
        match &pass.target {
            Some(t) => {
                if !targets.insert(t.as_str()) {
                    errors.push(format!("duplicate pass target '{t}' (pass {i})"));
                }
                if doc.input(t).is_some() {
                    errors.push(format!(
                        "pass {i} target '{t}' collides with an input of the same name"
                    ));
                }
                if refs::is_implicit(t) {
                    errors.push(format!("pass {i} target '{t}' uses a reserved name"));
                }
            }
            None => {
                if pass.persistent {
                    warnings.push(format!(
                        "pass {i} is PERSISTENT but has no TARGET; its buffer cannot be read back"
                    ));
                }
                if pass.float_buffer {
                    warnings.push(format!("pass {i} is FLOAT but has no TARGET"));
                }
            }
        }

        for (field, raw) in [("WIDTH", &pass.width), ("HEIGHT", &pass.height)] {
            let Some(raw) = raw else { continue };
            match SizeExpr::parse(raw) {
                Err(e) => errors.push(format!("pass {i} {field} '{raw}': {e}")),
                Ok(expr) => {
                    for var in expr.variables() {
                        let known = matches!(var, "WIDTH" | "HEIGHT")
                            || doc
                                .input(var)
                                .map(|d| d.kind.is_scalar_numeric())
                                .unwrap_or(false);
                        if !known {
                            errors.push(format!(
                                "pass {i} {field} '{raw}' references unknown variable '${var}'"
                            ));
                        }
                    }
                }
            }
        }
    }
}

fn check_references(doc: &Document, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let mut reported = HashSet::new();
    for r in refs::sampler_references(&doc.shader.fragment) {
        let name = r.name.as_str();
        if refs::is_implicit(name) {
            continue;
        }
        if let Some(input) = doc.input(name) {
            if !input.kind.is_sampler() && reported.insert(name.to_string()) {
                errors.push(format!(
                    "'{name}' is sampled as an image but declared as {}",
                    input.kind.as_isf()
                ));
            }
            continue;
        }
        if doc.is_imported(name) {
            continue;
        }
        let Some(writer) = doc.target_pass(name) else {
            if reported.insert(name.to_string()) {
                errors.push(format!("unresolved image reference '{name}'"));
            }
            continue;
        };
        if doc.passes[writer].persistent {
            continue;
        }
        match r.pass {
            Some(reader) if reader == writer => errors.push(format!(
                "pass {reader} reads its own non-persistent target '{name}'"
            )),
            Some(reader) if reader < writer => errors.push(format!(
                "pass {reader} reads target '{name}' before pass {writer} renders it"
            )),
            None if reported.insert(format!("{name}@unguarded")) => {
                warnings.push(format!(
                    "target '{name}' is read outside a PASSINDEX block; passes up to {writer} see an empty buffer"
                ));
            }
            _ => {}
        }
    }
}
