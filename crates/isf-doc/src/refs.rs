//! Static scan of an ISF fragment body for image (sampler) references.
//!
//! The scan is textual: comments are blanked out, then every `IMG_*` macro and `texture*`
//! call contributes its first argument. References inside an `if (PASSINDEX == N)` block are
//! attributed to pass `N` only; everything else is read by every pass.

use std::sync::OnceLock;

use regex::Regex;

/// Implicit uniforms supplied by the engine; never declared by the author.
pub const IMPLICIT_INPUTS: &[&str] = &[
    "TIME",
    "TIMEDELTA",
    "RENDERSIZE",
    "PASSINDEX",
    "FRAMEINDEX",
    "DATE",
    "isf_FragNormCoord",
];

/// True for implicit input names, in either bare (`TIME`) or `$`-prefixed (`$TIME`) form.
pub fn is_implicit(name: &str) -> bool {
    let bare = name.strip_prefix('$').unwrap_or(name);
    IMPLICIT_INPUTS.contains(&bare) || matches!(bare, "WIDTH" | "HEIGHT")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerRef {
    pub name: String,
    /// Byte offset of the name inside the scanned body.
    pub offset: usize,
    /// `Some(n)` when the read sits inside an `if (PASSINDEX == n)` block.
    pub pass: Option<usize>,
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)//[^\n]*|/\*.*?\*/").expect("static regex"))
}

fn sampler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:IMG_NORM_PIXEL|IMG_PIXEL|IMG_THIS_PIXEL|IMG_THIS_NORM_PIXEL|IMG_SIZE|texture2D|texture2DRect|texture|textureSize|texelFetch)\s*\(\s*([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("static regex")
    })
}

fn pass_guard_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bif\s*\(\s*(?:PASSINDEX\s*==\s*(\d+)|(\d+)\s*==\s*PASSINDEX)\s*\)")
            .expect("static regex")
    })
}

fn frag_color_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:gl_FragColor|isf_FragColor)\b").expect("static regex"))
}

fn main_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bvoid\s+main\s*\(").expect("static regex"))
}

/// Replace comments by spaces, keeping byte offsets and newlines intact.
pub fn strip_comments(src: &str) -> String {
    comment_re()
        .replace_all(src, |caps: &regex::Captures<'_>| {
            caps[0]
                .chars()
                .map(|c| {
                    if c == '\n' {
                        "\n".to_string()
                    } else {
                        " ".repeat(c.len_utf8())
                    }
                })
                .collect::<String>()
        })
        .into_owned()
}

/// Byte ranges guarded by `if (PASSINDEX == n)`, paired with `n`.
fn pass_guards(src: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();

    for caps in pass_guard_re().captures_iter(src) {
        let Some(n) = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<usize>().ok())
        else {
            continue;
        };
        let mut i = caps.get(0).map(|m| m.end()).unwrap_or(0);
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        if i < bytes.len() && bytes[i] == b'{' {
            let start = i;
            let mut depth = 0usize;
            let mut end = bytes.len();
            for (j, b) in bytes.iter().enumerate().skip(start) {
                match b {
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = j + 1;
                            break;
                        }
                    }
                    _ => {}
                }
            }
            out.push((start..end, n));
        } else {
            // Single statement without braces.
            let end = src[i..].find(';').map(|k| i + k + 1).unwrap_or(bytes.len());
            out.push((i..end, n));
        }
    }
    out
}

/// All sampler references in `src`, in source order.
pub fn sampler_references(src: &str) -> Vec<SamplerRef> {
    let clean = strip_comments(src);
    let guards = pass_guards(&clean);

    sampler_re()
        .captures_iter(&clean)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            // Innermost guard wins: the shortest range containing the offset.
            let pass = guards
                .iter()
                .filter(|(r, _)| r.contains(&m.start()))
                .min_by_key(|(r, _)| r.len())
                .map(|(_, n)| *n);
            SamplerRef {
                name: m.as_str().to_string(),
                offset: m.start(),
                pass,
            }
        })
        .collect()
}

/// Distinct referenced names in first-use order.
pub fn referenced_names(src: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for r in sampler_references(src) {
        if !names.contains(&r.name) {
            names.push(r.name);
        }
    }
    names
}

/// Whether the body writes the fragment output at all.
pub fn writes_frag_color(src: &str) -> bool {
    frag_color_re().is_match(&strip_comments(src))
}

/// Whether the body defines `void main(...)`.
pub fn defines_main(src: &str) -> bool {
    main_re().is_match(&strip_comments(src))
}

/// First brace mismatch of a body, comments ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BraceMismatch {
    /// A `}` with no open block, at this byte offset.
    UnmatchedClose(usize),
    /// Blocks still open at the end of the body.
    Unclosed(usize),
}

pub fn brace_mismatch(src: &str) -> Option<BraceMismatch> {
    let mut depth = 0usize;
    for (offset, c) in strip_comments(src).char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(BraceMismatch::UnmatchedClose(offset)),
            '}' => depth -= 1,
            _ => {}
        }
    }
    (depth > 0).then_some(BraceMismatch::Unclosed(depth))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_img_macros_and_texture_calls() {
        let src = r#"
            void main() {
                vec4 a = IMG_THIS_PIXEL(inputImage);
                vec4 b = IMG_NORM_PIXEL( bufferA , isf_FragNormCoord);
                vec4 c = texture2D(noiseTex, vec2(0.5));
                gl_FragColor = a + b + c;
            }
        "#;
        assert_eq!(
            referenced_names(src),
            vec!["inputImage", "bufferA", "noiseTex"]
        );
    }

    #[test]
    fn comments_are_ignored() {
        let src = "// IMG_THIS_PIXEL(ghost)\n/* texture(other, uv) */\nvoid main(){}";
        assert!(referenced_names(src).is_empty());
    }

    #[test]
    fn passindex_blocks_scope_reads() {
        let src = r#"
            void main() {
                if (PASSINDEX == 0) {
                    gl_FragColor = IMG_THIS_PIXEL(inputImage);
                }
                else if (1 == PASSINDEX) {
                    if (TIME > 1.0) { gl_FragColor = IMG_THIS_PIXEL(bufferA); }
                }
                vec4 shared = IMG_THIS_PIXEL(lut);
            }
        "#;
        let refs = sampler_references(src);
        let find = |n: &str| refs.iter().find(|r| r.name == n).unwrap().pass;
        assert_eq!(find("inputImage"), Some(0));
        assert_eq!(find("bufferA"), Some(1));
        assert_eq!(find("lut"), None);
    }

    #[test]
    fn brace_less_guard_covers_one_statement() {
        let src = "void main(){ if (PASSINDEX == 2) gl_FragColor = IMG_THIS_PIXEL(a); gl_FragColor += IMG_THIS_PIXEL(b); }";
        let refs = sampler_references(src);
        assert_eq!(refs[0].pass, Some(2));
        assert_eq!(refs[1].pass, None);
    }

    #[test]
    fn implicit_names() {
        assert!(is_implicit("TIME"));
        assert!(is_implicit("$WIDTH"));
        assert!(!is_implicit("inputImage"));
    }

    #[test]
    fn frag_color_detection() {
        assert!(writes_frag_color("void main(){ gl_FragColor = vec4(1.0); }"));
        assert!(!writes_frag_color("void main(){ /* gl_FragColor */ }"));
    }

    #[test]
    fn main_detection_ignores_comments() {
        assert!(defines_main("void main() {}"));
        assert!(defines_main("void  main (void) {}"));
        assert!(!defines_main("// void main() {}\nvoid mainImage() {}"));
    }

    #[test]
    fn brace_balance() {
        assert_eq!(brace_mismatch("void main() { if (a) { b(); } }"), None);
        assert_eq!(brace_mismatch("void main() { /* } */ }"), None);
        assert_eq!(brace_mismatch("void main() { } }"), Some(BraceMismatch::UnmatchedClose(16)));
        assert_eq!(brace_mismatch("void main() { {"), Some(BraceMismatch::Unclosed(2)));
    }
}
