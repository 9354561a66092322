#![forbid(unsafe_code)]

//! ISF render graph: declared passes resolved into an executable, ordered plan.
//!
//! This crate is **contract-only**: no GPU handles. `build()` walks passes in declaration order
//! and resolves every sampler the fragment body reads against image inputs, imported images,
//! pass targets and implicit inputs. Sizes stay symbolic until a frame supplies a
//! [`SizeContext`].
//!
//! Reads only flow from earlier passes to later ones within a frame, so the plan is acyclic by
//! construction. Reads of a persistent target at or after its own pass resolve to last frame's
//! buffer ([`BindingSource::Feedback`]).
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]

use isf_core::{BuildError, TextureFormat};
use isf_doc::refs;
use isf_doc::{Document, DocumentId, InputKind, SizeExpr};

/// Where a sampler gets its texture from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingSource {
    /// A declared `image`/`audio`/`audioFFT` input, supplied by the host.
    Input(String),
    /// An `IMPORTED` image, supplied by the host under the same name.
    Imported(String),
    /// Output of an earlier pass in the same frame.
    PassOutput(usize),
    /// Last frame's content of a persistent pass (possibly this one).
    Feedback(usize),
    /// A non-persistent target read (outside any `PASSINDEX` block) before it is rendered;
    /// samples as empty.
    Unwritten(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerBinding {
    /// GLSL sampler name.
    pub name: String,
    /// Texture unit, stable per pass.
    pub slot: u32,
    pub source: BindingSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassNode {
    pub index: usize,
    pub target: Option<String>,
    pub width: SizeExpr,
    pub height: SizeExpr,
    pub format: TextureFormat,
    pub persistent: bool,
    pub bindings: Vec<SamplerBinding>,
}

/// Values a frame supplies for resolving pass sizes.
#[derive(Clone, Copy)]
pub struct SizeContext<'a> {
    pub width: u32,
    pub height: u32,
    pub max_size: u32,
    /// Current value of a numeric input, by name.
    pub params: &'a dyn Fn(&str) -> Option<f64>,
}

impl std::fmt::Debug for SizeContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeContext")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

/// Ordered pass plan for one document. Rebuild when the document's shape changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderGraph {
    pub document: DocumentId,
    pub passes: Vec<PassNode>,
    /// Non-sampler inputs, bound as plain uniforms on every pass, in declaration order.
    pub parameters: Vec<(String, InputKind)>,
    /// Non-fatal observations made while building.
    pub warnings: Vec<String>,
}

impl RenderGraph {
    /// The pass whose target is read back as the frame's image (always the last pass).
    pub fn final_pass(&self) -> &PassNode {
        // `build` guarantees at least one pass.
        &self.passes[self.passes.len() - 1]
    }

    pub fn final_index(&self) -> usize {
        self.passes.len() - 1
    }

    pub fn parameter_uniforms(&self) -> impl Iterator<Item = (&str, InputKind)> + '_ {
        self.parameters.iter().map(|(n, k)| (n.as_str(), *k))
    }

    /// Host-supplied sampler names (image inputs and imported images) read by any pass.
    pub fn host_images(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for p in &self.passes {
            for b in &p.bindings {
                if let BindingSource::Input(n) | BindingSource::Imported(n) = &b.source {
                    if !out.contains(&n.as_str()) {
                        out.push(n);
                    }
                }
            }
        }
        out
    }

    /// Resolve a pass's pixel size. Results are rounded and clamped to `[1, max_size]`.
    pub fn resolve_size(&self, pass: usize, ctx: &SizeContext<'_>) -> Result<(u32, u32), BuildError> {
        let node = self.passes.get(pass).ok_or_else(|| BuildError::SizeExpression {
            pass,
            reason: "no such pass".to_string(),
        })?;
        let lookup = |name: &str| -> Option<f64> {
            match name {
                "WIDTH" => Some(f64::from(ctx.width)),
                "HEIGHT" => Some(f64::from(ctx.height)),
                other => (ctx.params)(other),
            }
        };
        let eval = |e: &SizeExpr| -> Result<u32, BuildError> {
            let v = e.eval(&lookup).map_err(|err| BuildError::SizeExpression {
                pass,
                reason: err.to_string(),
            })?;
            Ok(v.round().clamp(1.0, f64::from(ctx.max_size.max(1))) as u32)
        };
        Ok((eval(&node.width)?, eval(&node.height)?))
    }
}

/// Resolve a document's passes into a [`RenderGraph`].
///
/// The document should have passed validation; `build` re-checks only what it needs.
pub fn build(doc: &Document) -> Result<RenderGraph, BuildError> {
    let refs = refs::sampler_references(&doc.shader.fragment);
    let mut warnings = Vec::new();
    let mut passes = Vec::with_capacity(doc.passes.len());

    for (index, decl) in doc.passes.iter().enumerate() {
        let size = |raw: &Option<String>, full: fn() -> SizeExpr| -> Result<SizeExpr, BuildError> {
            match raw {
                None => Ok(full()),
                Some(s) => {
                    let e = SizeExpr::parse(s).map_err(|e| BuildError::SizeExpression {
                        pass: index,
                        reason: format!("'{s}': {e}"),
                    })?;
                    for var in e.variables() {
                        let ok = matches!(var, "WIDTH" | "HEIGHT")
                            || doc.input(var).is_some_and(|d| d.kind.is_scalar_numeric());
                        if !ok {
                            return Err(BuildError::SizeExpression {
                                pass: index,
                                reason: format!("'{s}': unknown variable '${var}'"),
                            });
                        }
                    }
                    Ok(e)
                }
            }
        };
        let width = size(&decl.width, SizeExpr::width)?;
        let height = size(&decl.height, SizeExpr::height)?;

        let mut bindings: Vec<SamplerBinding> = Vec::new();
        for r in refs.iter().filter(|r| r.pass.is_none() || r.pass == Some(index)) {
            if bindings.iter().any(|b| b.name == r.name) {
                continue;
            }
            let Some(source) = resolve(doc, index, &r.name, r.pass.is_some(), &mut warnings)? else {
                continue;
            };
            bindings.push(SamplerBinding {
                name: r.name.clone(),
                slot: bindings.len() as u32,
                source,
            });
        }

        passes.push(PassNode {
            index,
            target: decl.target.clone(),
            width,
            height,
            format: if decl.float_buffer {
                TextureFormat::Rgba32F
            } else {
                TextureFormat::Rgba8
            },
            persistent: decl.persistent,
            bindings,
        });
    }

    // Guarded references to passes that do not exist never bind; still resolve their names so
    // typos surface.
    for r in refs.iter().filter(|r| r.pass.is_some_and(|p| p >= doc.passes.len())) {
        if !refs::is_implicit(&r.name)
            && doc.input(&r.name).is_none()
            && !doc.is_imported(&r.name)
            && doc.target_pass(&r.name).is_none()
        {
            return Err(BuildError::UnresolvedBinding(r.name.clone()));
        }
    }

    tracing::debug!(
        document = %doc.identity,
        passes = passes.len(),
        warnings = warnings.len(),
        "built render graph"
    );
    Ok(RenderGraph {
        document: doc.identity,
        passes,
        parameters: doc
            .inputs
            .iter()
            .filter(|i| !i.kind.is_sampler())
            .map(|i| (i.name.clone(), i.kind))
            .collect(),
        warnings,
    })
}

/// `Ok(None)` for names that need no texture binding (implicit inputs).
fn resolve(
    doc: &Document,
    reader: usize,
    name: &str,
    guarded: bool,
    warnings: &mut Vec<String>,
) -> Result<Option<BindingSource>, BuildError> {
    if refs::is_implicit(name) {
        return Ok(None);
    }
    if let Some(input) = doc.input(name) {
        return match input.kind {
            InputKind::Image | InputKind::Audio | InputKind::AudioFft => {
                Ok(Some(BindingSource::Input(name.to_string())))
            }
            _ => Err(BuildError::UnresolvedBinding(name.to_string())),
        };
    }
    if doc.is_imported(name) {
        return Ok(Some(BindingSource::Imported(name.to_string())));
    }
    let writer = doc
        .target_pass(name)
        .ok_or_else(|| BuildError::UnresolvedBinding(name.to_string()))?;

    if writer < reader {
        return Ok(Some(BindingSource::PassOutput(writer)));
    }
    if doc.passes[writer].persistent {
        return Ok(Some(BindingSource::Feedback(writer)));
    }
    if guarded {
        return Err(if writer == reader {
            BuildError::CycleDetected {
                pass: reader,
                target: name.to_string(),
            }
        } else {
            BuildError::ForwardRead {
                pass: reader,
                target: name.to_string(),
            }
        });
    }
    warnings.push(format!(
        "pass {reader} samples '{name}' before pass {writer} renders it; it reads as empty"
    ));
    Ok(Some(BindingSource::Unwritten(writer)))
}
