//! ISF source text → [`Document`].
//!
//! The header is the first `/* ... */` comment of the text (only whitespace may precede it) and
//! must hold a JSON object. Everything after the comment is the fragment body. Parsing does not
//! check cross-references; see [`crate::validate`].

use serde::Deserialize;
use serde_json::{Map, Value};

use isf_core::ParseError;

use crate::document::{
    Document, DocumentId, ImportedImage, InputDeclaration, InputKind, InputValue,
    PassDeclaration, ShaderSource,
};

#[derive(Deserialize)]
struct RawHeader {
    #[serde(rename = "NAME")]
    name: Option<String>,
    #[serde(rename = "DESCRIPTION")]
    description: Option<String>,
    #[serde(rename = "CREDIT")]
    credit: Option<String>,
    #[serde(rename = "ISFVSN")]
    isf_version: Option<Value>,
    #[serde(rename = "VSN")]
    vsn: Option<Value>,
    #[serde(rename = "CATEGORIES", default)]
    categories: Vec<String>,
    #[serde(rename = "INPUTS", default)]
    inputs: Vec<Value>,
    #[serde(rename = "PASSES", default)]
    passes: Vec<Value>,
    /// ISF v1 spelling of persistent targets.
    #[serde(rename = "PERSISTENT_BUFFERS")]
    persistent_buffers: Option<Value>,
    #[serde(rename = "IMPORTED")]
    imported: Option<Value>,
}

/// Parse an ISF source text with the fixed vertex stage.
pub fn parse(text: &str) -> Result<Document, ParseError> {
    parse_with_vertex(text, None)
}

/// Parse an ISF source text, attaching an optional custom vertex stage.
pub fn parse_with_vertex(text: &str, vertex: Option<&str>) -> Result<Document, ParseError> {
    let (json_start, json_end) = locate_header(text)?;
    let json = &text[json_start..json_end];
    let body_offset = json_end + 2;

    let value: Value = serde_json::from_str(json).map_err(|e| ParseError::Json {
        offset: json_start + offset_of(json, e.line(), e.column()),
        reason: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(ParseError::InvalidField {
            offset: json_start,
            field: "header",
            context: "ISF header".to_string(),
            reason: "must be a JSON object".to_string(),
        });
    }
    let raw: RawHeader = serde_json::from_value(value).map_err(|e| ParseError::InvalidField {
        offset: json_start,
        field: "header",
        context: "ISF header".to_string(),
        reason: e.to_string(),
    })?;

    let inputs = raw
        .inputs
        .iter()
        .enumerate()
        .map(|(i, v)| parse_input(i, v, json_start))
        .collect::<Result<Vec<_>, _>>()?;

    let mut passes = raw
        .passes
        .iter()
        .enumerate()
        .map(|(i, v)| parse_pass(i, v, json_start))
        .collect::<Result<Vec<_>, _>>()?;
    if passes.is_empty() {
        passes.push(PassDeclaration::default());
    }
    if let Some(pb) = &raw.persistent_buffers {
        apply_persistent_buffers(&mut passes, pb, json_start)?;
    }

    let imported = match &raw.imported {
        Some(v) => parse_imported(v, json_start)?,
        None => Vec::new(),
    };

    let mut categories: Vec<String> = Vec::new();
    for c in raw.categories {
        if !categories.contains(&c) {
            categories.push(c);
        }
    }

    let doc = Document {
        name: raw.name,
        description: raw.description,
        credit: raw.credit,
        isf_version: raw
            .isf_version
            .as_ref()
            .map(scalar_to_string)
            .unwrap_or_else(|| "2".to_string()),
        vsn: raw.vsn.as_ref().map(scalar_to_string),
        categories,
        inputs,
        passes,
        imported,
        shader: ShaderSource {
            fragment: text[body_offset..].to_string(),
            vertex: vertex.map(str::to_string),
        },
        identity: DocumentId::of(text, vertex),
        header_offset: json_start,
        body_offset,
        body_line: text[..body_offset].matches('\n').count() + 1,
    };

    tracing::debug!(
        document = %doc.identity,
        inputs = doc.inputs.len(),
        passes = doc.passes.len(),
        "parsed ISF document"
    );
    Ok(doc)
}

/// Returns the byte range of the JSON text inside the header comment.
fn locate_header(text: &str) -> Result<(usize, usize), ParseError> {
    let lead = text.len() - text.trim_start().len();
    if !text[lead..].starts_with("/*") {
        return Err(ParseError::MissingHeader { offset: lead });
    }
    let start = lead + 2;
    let end = text[start..]
        .find("*/")
        .map(|k| start + k)
        .ok_or(ParseError::UnterminatedHeader { offset: lead })?;
    Ok((start, end))
}

/// serde_json reports 1-based line/column; convert to a byte offset within `json`.
fn offset_of(json: &str, line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let line_start: usize = json
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(json.len())
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_object<'a>(
    v: &'a Value,
    offset: usize,
    field: &'static str,
    context: &str,
) -> Result<&'a Map<String, Value>, ParseError> {
    v.as_object().ok_or_else(|| ParseError::InvalidField {
        offset,
        field,
        context: context.to_string(),
        reason: "must be an object".to_string(),
    })
}

fn parse_input(index: usize, v: &Value, offset: usize) -> Result<InputDeclaration, ParseError> {
    let context = format!("input {index}");
    let obj = as_object(v, offset, "INPUTS", &context)?;

    let name = obj
        .get("NAME")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::MissingField {
            offset,
            field: "NAME",
            context: context.clone(),
        })?;
    let context = format!("input '{name}'");
    let ty = obj
        .get("TYPE")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::MissingField {
            offset,
            field: "TYPE",
            context: context.clone(),
        })?;
    let kind = InputKind::from_isf(ty).ok_or_else(|| ParseError::UnknownInputType {
        offset,
        input: name.to_string(),
        ty: ty.to_string(),
    })?;

    let invalid = |field: &'static str, reason: String| ParseError::InvalidField {
        offset,
        field,
        context: context.clone(),
        reason,
    };

    let mut decl = InputDeclaration::new(name, kind);
    decl.label = match obj.get("LABEL") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(invalid("LABEL", "must be a string".to_string())),
    };

    if kind.is_sampler() {
        if matches!(kind, InputKind::Audio | InputKind::AudioFft) {
            if let Some(m) = obj.get("MAX") {
                let n = m
                    .as_u64()
                    .ok_or_else(|| invalid("MAX", "sample count must be a positive integer".into()))?;
                decl.max_samples = Some(u32::try_from(n).unwrap_or(u32::MAX));
            }
        }
        return Ok(decl);
    }

    let typed = |field: &'static str| -> Result<Option<InputValue>, ParseError> {
        match obj.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => typed_value(kind, v).map(Some).map_err(|r| invalid(field, r)),
        }
    };
    decl.default = typed("DEFAULT")?;
    decl.min = typed("MIN")?;
    decl.max = typed("MAX")?;
    decl.identity = typed("IDENTITY")?;

    if kind == InputKind::Long {
        if let Some(values) = obj.get("VALUES") {
            let arr = values
                .as_array()
                .ok_or_else(|| invalid("VALUES", "must be an array".into()))?;
            decl.values = arr
                .iter()
                .map(|v| number_to_i32(v).ok_or_else(|| invalid("VALUES", format!("{v} is not a number"))))
                .collect::<Result<_, _>>()?;
        }
        if let Some(labels) = obj.get("LABELS") {
            let arr = labels
                .as_array()
                .ok_or_else(|| invalid("LABELS", "must be an array".into()))?;
            decl.labels = arr
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid("LABELS", format!("{v} is not a string")))
                })
                .collect::<Result<_, _>>()?;
        }
    }

    Ok(decl)
}

fn number_to_i32(v: &Value) -> Option<i32> {
    if let Some(i) = v.as_i64() {
        return i32::try_from(i).ok();
    }
    v.as_f64().map(|f| f as i32)
}

fn number_to_f32(v: &Value) -> Option<f32> {
    v.as_f64().map(|f| f as f32)
}

fn floats<const N: usize>(v: &Value) -> Option<[f32; N]> {
    let arr = v.as_array()?;
    if arr.len() != N {
        return None;
    }
    let mut out = [0.0; N];
    for (o, x) in out.iter_mut().zip(arr) {
        *o = number_to_f32(x)?;
    }
    Some(out)
}

fn typed_value(kind: InputKind, v: &Value) -> Result<InputValue, String> {
    match kind {
        InputKind::Event | InputKind::Bool => match v {
            Value::Bool(b) => Ok(InputValue::Bool(*b)),
            Value::Number(n) => Ok(InputValue::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
            _ => Err(format!("expected a boolean, got {v}")),
        },
        InputKind::Long => number_to_i32(v)
            .map(InputValue::Long)
            .ok_or_else(|| format!("expected an integer, got {v}")),
        InputKind::Float => number_to_f32(v)
            .map(InputValue::Float)
            .ok_or_else(|| format!("expected a number, got {v}")),
        InputKind::Point2D => floats::<2>(v)
            .map(InputValue::Point2D)
            .ok_or_else(|| format!("expected [x, y], got {v}")),
        InputKind::Color => floats::<4>(v)
            .or_else(|| floats::<3>(v).map(|[r, g, b]| [r, g, b, 1.0]))
            .map(InputValue::Color)
            .ok_or_else(|| format!("expected [r, g, b, a], got {v}")),
        InputKind::Image | InputKind::Audio | InputKind::AudioFft => {
            Err("sampler inputs take no constant values".to_string())
        }
    }
}

fn flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.as_str() {
            "true" | "TRUE" | "1" => Some(true),
            "false" | "FALSE" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_pass(index: usize, v: &Value, offset: usize) -> Result<PassDeclaration, ParseError> {
    let context = format!("pass {index}");
    let obj = as_object(v, offset, "PASSES", &context)?;
    let invalid = |field: &'static str, reason: &str| ParseError::InvalidField {
        offset,
        field,
        context: context.clone(),
        reason: reason.to_string(),
    };

    let target = match obj.get("TARGET") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(invalid("TARGET", "must be a string")),
    };
    let persistent = match obj.get("PERSISTENT") {
        None => false,
        Some(v) => flag(v).ok_or_else(|| invalid("PERSISTENT", "must be a boolean"))?,
    };
    let float_buffer = match obj.get("FLOAT") {
        None => false,
        Some(v) => flag(v).ok_or_else(|| invalid("FLOAT", "must be a boolean"))?,
    };
    let dim = |field: &'static str| -> Result<Option<String>, ParseError> {
        match obj.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(invalid(field, "must be a number or an expression string")),
        }
    };

    Ok(PassDeclaration {
        target,
        persistent,
        float_buffer,
        width: dim("WIDTH")?,
        height: dim("HEIGHT")?,
    })
}

/// `PERSISTENT_BUFFERS` is either `["name", ...]` or `{ "name": { "FLOAT": true, ... } }`.
fn apply_persistent_buffers(
    passes: &mut [PassDeclaration],
    v: &Value,
    offset: usize,
) -> Result<(), ParseError> {
    let mut mark = |name: &str, float: bool| {
        for p in passes.iter_mut() {
            if p.target.as_deref() == Some(name) {
                p.persistent = true;
                p.float_buffer |= float;
            }
        }
    };
    match v {
        Value::Array(names) => {
            for n in names {
                if let Some(name) = n.as_str() {
                    mark(name, false);
                }
            }
            Ok(())
        }
        Value::Object(map) => {
            for (name, opts) in map {
                let float = opts.get("FLOAT").and_then(flag).unwrap_or(false);
                mark(name, float);
            }
            Ok(())
        }
        _ => Err(ParseError::InvalidField {
            offset,
            field: "PERSISTENT_BUFFERS",
            context: "ISF header".to_string(),
            reason: "must be an array or an object".to_string(),
        }),
    }
}

/// `IMPORTED` is either `{ "name": { "PATH": "..." } }` or `[{ "NAME": "...", "PATH": "..." }]`.
fn parse_imported(v: &Value, offset: usize) -> Result<Vec<ImportedImage>, ParseError> {
    let invalid = |reason: String| ParseError::InvalidField {
        offset,
        field: "IMPORTED",
        context: "ISF header".to_string(),
        reason,
    };
    let path_of = |o: &Value| o.get("PATH").and_then(Value::as_str).map(str::to_string);

    match v {
        Value::Object(map) => Ok(map
            .iter()
            .map(|(name, o)| ImportedImage {
                name: name.clone(),
                path: path_of(o),
            })
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|o| {
                let name = o
                    .get("NAME")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(format!("entry {o} has no NAME")))?;
                Ok(ImportedImage {
                    name: name.to_string(),
                    path: path_of(o),
                })
            })
            .collect(),
        _ => Err(invalid("must be an array or an object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"/*{
    "DESCRIPTION": "solid fill",
    "CREDIT": "test",
    "CATEGORIES": ["Generator", "Color", "Generator"],
    "INPUTS": [
        { "NAME": "level", "TYPE": "float", "DEFAULT": 0.5, "MIN": 0.0, "MAX": 1.0 },
        { "NAME": "tint", "TYPE": "color", "DEFAULT": [1.0, 0.5, 0.0] },
        { "NAME": "mode", "TYPE": "long", "VALUES": [0, 1, 2], "LABELS": ["a", "b", "c"], "DEFAULT": 1 },
        { "NAME": "inputImage", "TYPE": "image" }
    ]
}*/
void main() {
    gl_FragColor = vec4(level);
}
"#;

    #[test]
    fn parses_header_and_body() {
        let doc = parse(SIMPLE).unwrap();
        assert_eq!(doc.description.as_deref(), Some("solid fill"));
        assert_eq!(doc.categories, vec!["Generator", "Color"]);
        assert_eq!(doc.inputs.len(), 4);
        assert_eq!(doc.inputs[0].default, Some(InputValue::Float(0.5)));
        assert_eq!(
            doc.inputs[1].default,
            Some(InputValue::Color([1.0, 0.5, 0.0, 1.0]))
        );
        assert_eq!(doc.inputs[2].values, vec![0, 1, 2]);
        assert_eq!(doc.inputs[3].kind, InputKind::Image);
        assert_eq!(doc.passes.len(), 1, "implicit single pass");
        assert!(doc.shader.fragment.contains("gl_FragColor"));
        assert_eq!(doc.isf_version, "2");
        assert_eq!(doc.body_line, 11);
    }

    #[test]
    fn identity_follows_content() {
        let a = parse(SIMPLE).unwrap();
        let b = parse(SIMPLE).unwrap();
        let edited = SIMPLE.replace("vec4(level)", "vec4(level * 2.0)");
        assert_ne!(edited, SIMPLE);
        let c = parse(&edited).unwrap();
        assert_eq!(a.identity, b.identity);
        assert_ne!(a.identity, c.identity);
        let v = parse_with_vertex(SIMPLE, Some("void main(){ isf_vertShaderInit(); }")).unwrap();
        assert_ne!(a.identity, v.identity);
    }

    #[test]
    fn missing_header() {
        let err = parse("void main() {}").unwrap_err();
        assert_eq!(err, ParseError::MissingHeader { offset: 0 });
    }

    #[test]
    fn unterminated_header() {
        let err = parse("  /*{ \"INPUTS\": [] }").unwrap_err();
        assert_eq!(err, ParseError::UnterminatedHeader { offset: 2 });
    }

    #[test]
    fn json_error_reports_offset_in_text() {
        let text = "/*{\n  \"INPUTS\": [ , ]\n}*/\nvoid main(){}";
        let err = parse(text).unwrap_err();
        let ParseError::Json { offset, .. } = err else {
            panic!("expected json error, got {err:?}");
        };
        assert_eq!(&text[offset..offset + 1], ",");
    }

    #[test]
    fn unknown_input_type() {
        let text = r#"/*{ "INPUTS": [ { "NAME": "x", "TYPE": "matrix" } ] }*/"#;
        assert!(matches!(
            parse(text).unwrap_err(),
            ParseError::UnknownInputType { ref ty, .. } if ty == "matrix"
        ));
    }

    #[test]
    fn missing_input_fields() {
        let text = r#"/*{ "INPUTS": [ { "TYPE": "float" } ] }*/"#;
        assert!(matches!(
            parse(text).unwrap_err(),
            ParseError::MissingField { field: "NAME", .. }
        ));
        let text = r#"/*{ "INPUTS": [ { "NAME": "x" } ] }*/"#;
        assert!(matches!(
            parse(text).unwrap_err(),
            ParseError::MissingField { field: "TYPE", .. }
        ));
    }

    #[test]
    fn passes_not_an_array() {
        let text = r#"/*{ "PASSES": { "TARGET": "a" } }*/"#;
        assert!(matches!(
            parse(text).unwrap_err(),
            ParseError::InvalidField { field: "header", .. }
        ));
    }

    #[test]
    fn pass_flags_and_sizes() {
        let text = r#"/*{
            "PASSES": [
                { "TARGET": "half", "WIDTH": "$WIDTH/2", "HEIGHT": 64, "FLOAT": 1 },
                { "TARGET": "acc", "PERSISTENT": "true" },
                {}
            ]
        }*/ void main(){}"#;
        let doc = parse(text).unwrap();
        assert_eq!(doc.passes[0].width.as_deref(), Some("$WIDTH/2"));
        assert_eq!(doc.passes[0].height.as_deref(), Some("64"));
        assert!(doc.passes[0].float_buffer);
        assert!(doc.passes[1].persistent);
        assert_eq!(doc.passes[2].target, None);
        assert_eq!(doc.target_pass("acc"), Some(1));
    }

    #[test]
    fn v1_persistent_buffers() {
        let text = r#"/*{
            "PERSISTENT_BUFFERS": { "trail": { "FLOAT": true } },
            "PASSES": [ { "TARGET": "trail" }, {} ]
        }*/ void main(){}"#;
        let doc = parse(text).unwrap();
        assert!(doc.passes[0].persistent);
        assert!(doc.passes[0].float_buffer);
    }

    #[test]
    fn imported_images_both_forms() {
        let a = parse(r#"/*{ "IMPORTED": { "lut": { "PATH": "lut.png" } } }*/"#).unwrap();
        let b = parse(r#"/*{ "IMPORTED": [ { "NAME": "lut", "PATH": "lut.png" } ] }*/"#).unwrap();
        assert_eq!(a.imported, b.imported);
        assert!(a.is_imported("lut"));
    }
}
