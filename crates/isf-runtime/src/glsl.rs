//! GLSL assembly: turns an ISF body into complete vertex/fragment sources.
//!
//! ISF bodies are written against an implicit environment (implicit uniforms, one uniform per
//! input, `IMG_*` macros, legacy `gl_FragColor`/`texture2D`). The assembled fragment declares
//! that environment and rewrites the legacy names; `#line` keeps driver logs pointing at lines
//! of the original document.

use std::sync::OnceLock;

use regex::Regex;

use isf_doc::{Document, InputKind};

/// Vertex attribute location of the fullscreen triangle's position.
pub const POSITION_ATTRIB: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderPair {
    pub vertex: String,
    pub fragment: String,
}

const IMPLICIT_UNIFORMS: &str = "\
uniform int PASSINDEX;
uniform vec2 RENDERSIZE;
uniform float TIME;
uniform float TIMEDELTA;
uniform int FRAMEINDEX;
uniform vec4 DATE;
";

const MACROS: &str = "\
#define IMG_NORM_PIXEL(img, coord) texture(img, coord)
#define IMG_PIXEL(img, coord) texture(img, (coord) / vec2(textureSize(img, 0)))
#define IMG_THIS_NORM_PIXEL(img) texture(img, isf_FragNormCoord)
#define IMG_THIS_PIXEL(img) texture(img, isf_FragNormCoord)
#define IMG_SIZE(img) vec2(textureSize(img, 0))
";

const VERTEX_INIT: &str = "\
void isf_vertShaderInit() {
    isf_FragNormCoord = isf_position * 0.5 + 0.5;
    gl_Position = vec4(isf_position, 0.0, 1.0);
}
";

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*#[ \t]*version[^\n]*$").expect("static regex"))
}

fn legacy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(gl_FragColor|texture2DRect|texture2D|varying)\b").expect("static regex")
    })
}

fn uniform_type(kind: InputKind) -> &'static str {
    match kind {
        InputKind::Event | InputKind::Bool => "bool",
        InputKind::Long => "int",
        InputKind::Float => "float",
        InputKind::Point2D => "vec2",
        InputKind::Color => "vec4",
        InputKind::Image | InputKind::Audio | InputKind::AudioFft => "sampler2D",
    }
}

/// Name of the size uniform the engine sets for every bound sampler.
pub fn image_size_uniform(sampler: &str) -> String {
    format!("_{sampler}_imgSize")
}

fn sampler_decl(out: &mut String, name: &str) {
    out.push_str(&format!(
        "uniform sampler2D {name};\nuniform vec2 {};\n",
        image_size_uniform(name)
    ));
}

fn declarations(doc: &Document) -> String {
    let mut out = String::from(IMPLICIT_UNIFORMS);
    for input in &doc.inputs {
        if input.kind.is_sampler() {
            sampler_decl(&mut out, &input.name);
        } else {
            out.push_str(&format!("uniform {} {};\n", uniform_type(input.kind), input.name));
        }
    }
    for pass in &doc.passes {
        if let Some(target) = &pass.target {
            sampler_decl(&mut out, target);
        }
    }
    for img in &doc.imported {
        sampler_decl(&mut out, &img.name);
    }
    out
}

fn rewrite_body(body: &str, stage_is_fragment: bool) -> String {
    let stripped = version_re().replace_all(body, "");
    legacy_re()
        .replace_all(&stripped, |caps: &regex::Captures<'_>| match &caps[1] {
            "gl_FragColor" => "isf_FragColor",
            "varying" if stage_is_fragment => "in",
            "varying" => "out",
            _ => "texture",
        })
        .into_owned()
}

/// Assemble both stages for `doc`. Every pass uses the same program; passes branch on
/// `PASSINDEX`.
pub fn assemble(doc: &Document, glsl_version: &str) -> ShaderPair {
    let decls = declarations(doc);

    let mut fragment = format!("#version {glsl_version}\n");
    fragment.push_str(&decls);
    fragment.push_str("in vec2 isf_FragNormCoord;\nout vec4 isf_FragColor;\n");
    fragment.push_str(MACROS);
    fragment.push_str(&format!("#line {}\n", doc.body_line));
    fragment.push_str(&rewrite_body(&doc.shader.fragment, true));
    if !fragment.ends_with('\n') {
        fragment.push('\n');
    }

    let mut vertex = format!("#version {glsl_version}\n");
    vertex.push_str(&decls);
    vertex.push_str(&format!(
        "layout(location = {POSITION_ATTRIB}) in vec2 isf_position;\nout vec2 isf_FragNormCoord;\n"
    ));
    vertex.push_str(VERTEX_INIT);
    match &doc.shader.vertex {
        Some(custom) => {
            vertex.push_str("#line 1\n");
            vertex.push_str(&rewrite_body(custom, false));
        }
        None => vertex.push_str("void main() {\n    isf_vertShaderInit();\n}\n"),
    }

    ShaderPair { vertex, fragment }
}
