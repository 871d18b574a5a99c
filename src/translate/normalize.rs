//! Text shaping applied to inputs before cache keying and to provider output
//! before it is cached or returned.
//! Every function here is pure; compiled patterns live in process-wide statics.

use once_cell::sync::Lazy;
use regex::Regex;

static LETTER_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z])(\d)").unwrap());
static DIGIT_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)([A-Za-z])").unwrap());
static CJK_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([\x{4e00}-\x{9fff}])(\d)").unwrap());
static DIGIT_CJK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)([\x{4e00}-\x{9fff}])").unwrap());
static CAMEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z])([A-Z])").unwrap());
static JOIN_OPERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9])([+/|])([A-Za-z0-9])").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());
static BOUNDARY_CANDIDATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/|]").unwrap());
// Leftmost `<letters><digits><letters?>` run inside a single token.
static MIXED_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z]+)(\d+)([A-Za-z]*)").unwrap());
static SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([,.;:!?])").unwrap());
static SPACE_AFTER_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"([(\[{])\s+").unwrap());
static SPACE_BEFORE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([)\]}])").unwrap());
static TITLE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z-]*$").unwrap());

/// Collapse whitespace runs to one space per line, trim lines and drop empty
/// ones. Line breaks survive only when the input had any.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    if !text.contains('\n') && !text.contains('\r') {
        return collapse_line(text);
    }
    text.replace('\r', "")
        .split('\n')
        .map(collapse_line)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Insert spaces at letter/digit, CJK/digit and camel-case boundaries and
/// around `+ / |` when flanked by alphanumerics.
pub fn apply_boundary_spacing(text: &str) -> String {
    if !BOUNDARY_CANDIDATE.is_match(text) {
        return text.to_string();
    }
    let mut out = LETTER_DIGIT.replace_all(text, "${1} ${2}").into_owned();
    out = DIGIT_LETTER.replace_all(&out, "${1} ${2}").into_owned();
    out = CJK_DIGIT.replace_all(&out, "${1} ${2}").into_owned();
    out = DIGIT_CJK.replace_all(&out, "${1} ${2}").into_owned();
    out = CAMEL.replace_all(&out, "${1} ${2}").into_owned();
    // Matches consume the right operand, so chains like `a+b+c` need another pass.
    loop {
        let next = JOIN_OPERATOR.replace_all(&out, "${1} ${2} ${3}").into_owned();
        if next == out {
            break;
        }
        out = next;
    }
    MULTI_SPACE.replace_all(&out, " ").into_owned()
}

/// Split a token on its leftmost `<letters><digits><letters>` run, recursing
/// into the prefix, the trailing letters and the suffix.
pub fn split_mixed_token(token: &str) -> Vec<String> {
    let mut out = Vec::new();
    walk_mixed(token, &mut out);
    out
}

fn walk_mixed(value: &str, out: &mut Vec<String>) {
    if value.is_empty() {
        return;
    }
    let Some(caps) = MIXED_TOKEN.captures(value) else {
        out.push(value.to_string());
        return;
    };
    let whole = caps.get(0).expect("group 0 always participates");
    let prefix = &value[..whole.start()];
    let suffix = &value[whole.end()..];

    walk_mixed(prefix, out);
    out.push(caps[1].to_string());
    out.push(caps[2].to_string());
    walk_mixed(&caps[3], out);
    walk_mixed(suffix, out);
}

/// Cache-key form of an input: boundary-spaced, every mixed alphanumeric
/// token split apart, then normalized. Tokens are taken across line breaks,
/// so a multi-line input comes out as a single line.
pub fn prepare(text: &str) -> String {
    let spaced = apply_boundary_spacing(text);
    let split = spaced
        .split_whitespace()
        .flat_map(split_mixed_token)
        .collect::<Vec<_>>()
        .join(" ");
    normalize(&split)
}

/// Uppercase the output's first character when the input starts uppercase
/// and the output starts lowercase. Anything else is returned untouched.
pub fn shape_case(input: &str, output: &str) -> String {
    let trimmed_out = output.trim();
    let (Some(in_first), Some(out_first)) = (input.trim().chars().next(), trimmed_out.chars().next())
    else {
        return output.to_string();
    };
    if in_first.is_ascii_uppercase() && out_first.is_ascii_lowercase() {
        let mut shaped = String::with_capacity(trimmed_out.len());
        shaped.push(out_first.to_ascii_uppercase());
        shaped.push_str(&trimmed_out[out_first.len_utf8()..]);
        return shaped;
    }
    output.to_string()
}

/// True for short Latin labels: no `. ? ! , : ;`, at most four words, each
/// word letters and hyphens only.
pub fn should_title_case(text: &str) -> bool {
    let value = text.trim();
    if value.is_empty() {
        return false;
    }
    if value.contains(['.', '?', '!', ',', ':', ';']) {
        return false;
    }
    let words: Vec<&str> = value.split_whitespace().collect();
    words.len() <= 4 && words.iter().all(|w| TITLE_WORD.is_match(w))
}

pub fn to_title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Title-cased candidate for `text`, or `None` when it is not eligible.
/// The caller decides whether to apply it.
pub fn title_case_if_short(text: &str) -> Option<String> {
    should_title_case(text).then(|| to_title_case(text))
}

/// Clean raw provider output against the prepared input it answers.
/// Returns `None` for empty output and for output identical to the input.
pub fn postprocess(raw: Option<&str>, input: &str, title_case: bool) -> Option<String> {
    let raw = raw?;
    let mut out = apply_boundary_spacing(&normalize(raw));
    out = SPACE_BEFORE_PUNCT.replace_all(&out, "${1}").into_owned();
    out = SPACE_AFTER_OPEN.replace_all(&out, "${1}").into_owned();
    out = SPACE_BEFORE_CLOSE.replace_all(&out, "${1}").into_owned();
    out = MULTI_SPACE.replace_all(&out, " ").trim().to_string();
    out = shape_case(input, &out);
    if title_case {
        if let Some(titled) = title_case_if_short(&out) {
            out = titled;
        }
    }
    if out.is_empty() || out == input {
        return None;
    }
    Some(out)
}
