//! Parameter values crossing the host boundary, and their binding to declared inputs.

use serde::Serialize;
use serde_json::Value;

use isf_core::ParamError;
use isf_doc::{Document, InputDeclaration, InputKind, InputValue};

use crate::backend::UniformValue;
use crate::textures::TextureId;

/// A host-supplied value for one declared input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Bool(bool),
    Long(i32),
    Point2D { x: f32, y: f32 },
    Color { r: f32, g: f32, b: f32, a: f32 },
    Image(TextureId),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Float(_) => "float",
            ParamValue::Bool(_) => "bool",
            ParamValue::Long(_) => "long",
            ParamValue::Point2D { .. } => "point2D",
            ParamValue::Color { .. } => "color",
            ParamValue::Image(_) => "image",
        }
    }

    pub fn image(&self) -> Option<TextureId> {
        match self {
            ParamValue::Image(id) => Some(*id),
            _ => None,
        }
    }

    /// Reject values whose tag does not match `decl`'s type.
    pub fn check(&self, decl: &InputDeclaration) -> Result<(), ParamError> {
        let ok = matches!(
            (self, decl.kind),
            (ParamValue::Float(_), InputKind::Float)
                | (ParamValue::Bool(_), InputKind::Bool | InputKind::Event)
                | (ParamValue::Long(_), InputKind::Long)
                | (ParamValue::Point2D { .. }, InputKind::Point2D)
                | (ParamValue::Color { .. }, InputKind::Color)
                | (
                    ParamValue::Image(_),
                    InputKind::Image | InputKind::Audio | InputKind::AudioFft
                )
        );
        if !ok {
            return Err(mismatch(decl, self.type_name()));
        }
        if let ParamValue::Long(v) = self {
            if !decl.values.is_empty() && !decl.values.contains(v) {
                return Err(ParamError::NotInValues {
                    name: decl.name.clone(),
                    value: i64::from(*v),
                });
            }
        }
        Ok(())
    }

    /// Coerce a host JSON value against `decl`'s type.
    ///
    /// Accepted shapes: numbers for `float`/`long`, booleans (or 0/1) for `bool`/`event`,
    /// `[x, y]` or `{"x","y"}` for `point2D`, `[r, g, b(, a)]` or `{"r","g","b"(,"a")}` for
    /// `color`, and a `"tex-<n>"` id string for image inputs.
    pub fn from_json(decl: &InputDeclaration, value: &Value) -> Result<Self, ParamError> {
        let bad = || mismatch(decl, json_kind(value));
        let v = match decl.kind {
            InputKind::Float => ParamValue::Float(value.as_f64().ok_or_else(bad)? as f32),
            InputKind::Long => {
                let n = value.as_f64().ok_or_else(bad)?;
                if n.fract() != 0.0 || n < f64::from(i32::MIN) || n > f64::from(i32::MAX) {
                    return Err(bad());
                }
                ParamValue::Long(n as i32)
            }
            InputKind::Bool | InputKind::Event => match value {
                Value::Bool(b) => ParamValue::Bool(*b),
                Value::Number(n) => ParamValue::Bool(n.as_f64().ok_or_else(bad)? != 0.0),
                _ => return Err(bad()),
            },
            InputKind::Point2D => {
                let xy = floats(value, &["x", "y"]).ok_or_else(bad)?;
                let [x, y] = xy[..] else {
                    return Err(bad());
                };
                ParamValue::Point2D { x, y }
            }
            InputKind::Color => {
                let mut c = floats(value, &["r", "g", "b", "a"])
                    .or_else(|| floats(value, &["r", "g", "b"]))
                    .ok_or_else(bad)?;
                if c.len() == 3 {
                    c.push(1.0);
                }
                let [r, g, b, a] = c[..] else {
                    return Err(bad());
                };
                ParamValue::Color { r, g, b, a }
            }
            InputKind::Image | InputKind::Audio | InputKind::AudioFft => {
                let s = value.as_str().ok_or_else(bad)?;
                ParamValue::Image(s.parse().map_err(|_| bad())?)
            }
        };
        v.check(decl)?;
        Ok(v)
    }

    pub fn from_input_value(v: InputValue) -> Self {
        match v {
            InputValue::Bool(b) => ParamValue::Bool(b),
            InputValue::Long(n) => ParamValue::Long(n),
            InputValue::Float(f) => ParamValue::Float(f),
            InputValue::Point2D([x, y]) => ParamValue::Point2D { x, y },
            InputValue::Color([r, g, b, a]) => ParamValue::Color { r, g, b, a },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(f64::from(*v)),
            ParamValue::Long(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Clamp numeric values into `decl`'s `[MIN, MAX]`. Returns the value and whether it moved.
    pub fn clamped(self, decl: &InputDeclaration) -> (Self, bool) {
        let out = match (self, decl.min, decl.max) {
            (ParamValue::Float(v), min, max) => {
                let lo = min.and_then(|m| m.as_f64()).map(|m| m as f32);
                let hi = max.and_then(|m| m.as_f64()).map(|m| m as f32);
                ParamValue::Float(clamp_opt(v, lo, hi))
            }
            (ParamValue::Long(v), min, max) if decl.values.is_empty() => {
                let lo = min.and_then(|m| m.as_f64()).map(|m| m as i32);
                let hi = max.and_then(|m| m.as_f64()).map(|m| m as i32);
                ParamValue::Long(clamp_opt(v, lo, hi))
            }
            (ParamValue::Point2D { x, y }, Some(InputValue::Point2D(lo)), Some(InputValue::Point2D(hi))) => {
                ParamValue::Point2D {
                    x: x.clamp(lo[0].min(hi[0]), hi[0].max(lo[0])),
                    y: y.clamp(lo[1].min(hi[1]), hi[1].max(lo[1])),
                }
            }
            (ParamValue::Color { r, g, b, a }, Some(InputValue::Color(lo)), Some(InputValue::Color(hi))) => {
                let c = |v: f32, i: usize| v.clamp(lo[i].min(hi[i]), hi[i].max(lo[i]));
                ParamValue::Color {
                    r: c(r, 0),
                    g: c(g, 1),
                    b: c(b, 2),
                    a: c(a, 3),
                }
            }
            (other, _, _) => other,
        };
        (out, out != self)
    }

    /// The uniform this value binds as. Images bind as samplers instead.
    pub fn to_uniform(&self) -> Option<UniformValue> {
        Some(match *self {
            ParamValue::Float(v) => UniformValue::Float(v),
            ParamValue::Bool(v) => UniformValue::Bool(v),
            ParamValue::Long(v) => UniformValue::Int(v),
            ParamValue::Point2D { x, y } => UniformValue::Vec2([x, y]),
            ParamValue::Color { r, g, b, a } => UniformValue::Vec4([r, g, b, a]),
            ParamValue::Image(_) => return None,
        })
    }
}

fn clamp_opt<T: PartialOrd + Copy>(v: T, lo: Option<T>, hi: Option<T>) -> T {
    let mut out = v;
    if let Some(lo) = lo {
        if out < lo {
            out = lo;
        }
    }
    if let Some(hi) = hi {
        if out > hi {
            out = hi;
        }
    }
    out
}

fn mismatch(decl: &InputDeclaration, found: &str) -> ParamError {
    ParamError::TypeMismatch {
        name: decl.name.clone(),
        expected: decl.kind.as_isf().to_string(),
        found: found.to_string(),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Array of exactly `keys.len()` numbers, or an object with exactly those keys.
fn floats(value: &Value, keys: &[&str]) -> Option<Vec<f32>> {
    match value {
        Value::Array(items) if items.len() == keys.len() => items
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect(),
        Value::Object(map) if map.len() == keys.len() => keys
            .iter()
            .map(|k| map.get(*k).and_then(Value::as_f64).map(|f| f as f32))
            .collect(),
        _ => None,
    }
}

/// Host-facing description of one declared input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<InputValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<InputValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<InputValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<InputValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_samples: Option<u32>,
}

/// Describe every declared input in declaration order. Defaults are the effective ones.
pub fn describe(doc: &Document) -> Vec<ParameterInfo> {
    doc.inputs
        .iter()
        .map(|i| ParameterInfo {
            name: i.name.clone(),
            kind: i.kind.as_isf(),
            label: i.label.clone(),
            default: i.effective_default(),
            min: i.min,
            max: i.max,
            identity: i.identity,
            values: i.values.clone(),
            labels: i.labels.clone(),
            max_samples: i.max_samples,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use isf_doc::parse;
    use serde_json::json;

    fn decl(kind: InputKind) -> InputDeclaration {
        InputDeclaration::new("p", kind)
    }

    #[test]
    fn tags_must_match_declared_type() {
        assert!(ParamValue::Float(1.0).check(&decl(InputKind::Float)).is_ok());
        assert!(ParamValue::Bool(true).check(&decl(InputKind::Event)).is_ok());
        let err = ParamValue::Bool(true).check(&decl(InputKind::Float)).unwrap_err();
        assert_eq!(
            err,
            ParamError::TypeMismatch {
                name: "p".into(),
                expected: "float".into(),
                found: "bool".into()
            }
        );
    }

    #[test]
    fn long_must_be_a_declared_value() {
        let mut d = decl(InputKind::Long);
        d.values = vec![0, 2, 4];
        assert!(ParamValue::Long(2).check(&d).is_ok());
        assert_eq!(
            ParamValue::Long(3).check(&d),
            Err(ParamError::NotInValues {
                name: "p".into(),
                value: 3
            })
        );
    }

    #[test]
    fn json_coercion() {
        assert_eq!(
            ParamValue::from_json(&decl(InputKind::Float), &json!(2)).unwrap(),
            ParamValue::Float(2.0)
        );
        assert_eq!(
            ParamValue::from_json(&decl(InputKind::Long), &json!(3.0)).unwrap(),
            ParamValue::Long(3)
        );
        assert!(ParamValue::from_json(&decl(InputKind::Long), &json!(3.5)).is_err());
        assert_eq!(
            ParamValue::from_json(&decl(InputKind::Point2D), &json!({ "x": 1, "y": 2 })).unwrap(),
            ParamValue::Point2D { x: 1.0, y: 2.0 }
        );
        assert_eq!(
            ParamValue::from_json(&decl(InputKind::Color), &json!([1, 0.5, 0])).unwrap(),
            ParamValue::Color {
                r: 1.0,
                g: 0.5,
                b: 0.0,
                a: 1.0
            }
        );
        assert!(matches!(
            ParamValue::from_json(&decl(InputKind::Image), &json!("tex-3")).unwrap(),
            ParamValue::Image(_)
        ));
        let err = ParamValue::from_json(&decl(InputKind::Color), &json!("red")).unwrap_err();
        assert!(err.to_string().contains("string"), "{err}");
    }

    #[test]
    fn clamping_respects_bounds() {
        let mut d = decl(InputKind::Float);
        d.min = Some(InputValue::Float(0.0));
        d.max = Some(InputValue::Float(1.0));
        assert_eq!(ParamValue::Float(3.0).clamped(&d), (ParamValue::Float(1.0), true));
        assert_eq!(ParamValue::Float(0.5).clamped(&d), (ParamValue::Float(0.5), false));
    }

    #[test]
    fn describe_lists_inputs_in_order() {
        let doc = parse(
            r#"/*{ "INPUTS": [
                { "NAME": "b", "TYPE": "float", "MIN": 0, "MAX": 2 },
                { "NAME": "a", "TYPE": "long", "VALUES": [1, 2], "LABELS": ["one", "two"] }
            ] }*/ void main(){}"#,
        )
        .unwrap();
        let info = describe(&doc);
        assert_eq!(info.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(info[1].default, Some(InputValue::Long(1)));

        let v = serde_json::to_value(&info[0]).unwrap();
        assert_eq!(v["type"], "float");
        assert_eq!(v["max"], json!(2.0));
        assert!(v.get("values").is_none());
    }
}
