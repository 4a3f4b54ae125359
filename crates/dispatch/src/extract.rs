//! Recovering JSON from model output
//!
//! Models asked for JSON often wrap it in fences or prose, or make small
//! syntax slips. Strategies run from strict to permissive and the first
//! candidate that parses AND has the requested shape wins. A value of a
//! different shape is never returned; an object is never passed off as an
//! array or the other way round.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Top-level JSON shape a caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// Object or array.
    #[default]
    Any,
    Object,
    Array,
}

impl Shape {
    pub fn label(&self) -> &'static str {
        match self {
            Shape::Any => "any",
            Shape::Object => "object",
            Shape::Array => "array",
        }
    }

    /// Whether a parsed value is acceptable for this shape.
    ///
    /// Bare scalars never count as structured output.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::Any => value.is_object() || value.is_array(),
            Shape::Object => value.is_object(),
            Shape::Array => value.is_array(),
        }
    }

    /// Empty value of this shape; `Any` falls back to an object.
    pub fn empty(&self) -> Value {
        match self {
            Shape::Array => Value::Array(Vec::new()),
            Shape::Any | Shape::Object => Value::Object(serde_json::Map::new()),
        }
    }

    fn openers(&self) -> &'static [char] {
        match self {
            Shape::Any => &['{', '['],
            Shape::Object => &['{'],
            Shape::Array => &['['],
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Strategy that produced an extraction, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Verbatim,
    Fenced,
    Bracketed,
    ProseTrimmed,
    Repaired,
    Default,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Verbatim => "verbatim",
            Strategy::Fenced => "fenced",
            Strategy::Bracketed => "bracketed",
            Strategy::ProseTrimmed => "prose_trimmed",
            Strategy::Repaired => "repaired",
            Strategy::Default => "default",
        }
    }
}

/// Structured payload recovered from raw output.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// JSON text that parses to `value`.
    pub text: String,
    pub value: Value,
    pub strategy: Strategy,
}

/// How a caller wants structured output handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expectation {
    pub shape: Shape,
    /// Substitute the empty shape instead of failing.
    pub default_on_failure: bool,
}

impl Expectation {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            default_on_failure: false,
        }
    }

    pub fn or_default(mut self) -> Self {
        self.default_on_failure = true;
        self
    }
}

/// Every strategy failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("model output contains no valid JSON {shape}: {excerpt:?}")]
pub struct MalformedOutput {
    pub shape: Shape,
    /// Leading part of the raw output, for diagnostics.
    pub excerpt: String,
}

const EXCERPT_CHARS: usize = 120;

/// Recover a payload of the requested shape from raw model output.
pub fn extract(raw: &str, shape: Shape) -> Result<Extraction, MalformedOutput> {
    let found = verbatim(raw, shape)
        .or_else(|| fenced(raw, shape))
        .or_else(|| bracketed(raw, shape))
        .or_else(|| prose_trimmed(raw, shape))
        .or_else(|| repaired(raw, shape));

    match found {
        Some(extraction) => {
            debug!(strategy = extraction.strategy.label(), %shape, "structured output extracted");
            Ok(extraction)
        }
        None => Err(MalformedOutput {
            shape,
            excerpt: raw.chars().take(EXCERPT_CHARS).collect(),
        }),
    }
}

/// Like `extract`, but falls back to the empty value of the shape.
pub fn extract_or_default(raw: &str, shape: Shape) -> Extraction {
    extract(raw, shape).unwrap_or_else(|err| {
        debug!(error = %err, "no structured output, using empty default");
        let value = shape.empty();
        Extraction {
            text: value.to_string(),
            value,
            strategy: Strategy::Default,
        }
    })
}

fn parse_as(text: &str, shape: Shape) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|value| shape.matches(value))
}

fn accept(text: &str, shape: Shape, strategy: Strategy) -> Option<Extraction> {
    parse_as(text, shape).map(|value| Extraction {
        text: text.to_string(),
        value,
        strategy,
    })
}

fn verbatim(raw: &str, shape: Shape) -> Option<Extraction> {
    accept(raw, shape, Strategy::Verbatim)
}

fn fenced(raw: &str, shape: Shape) -> Option<Extraction> {
    fenced_blocks(raw)
        .into_iter()
        .find_map(|block| accept(block.trim(), shape, Strategy::Fenced))
}

fn bracketed(raw: &str, shape: Shape) -> Option<Extraction> {
    bracket_slice(raw, shape).and_then(|slice| accept(slice, shape, Strategy::Bracketed))
}

fn prose_trimmed(raw: &str, shape: Shape) -> Option<Extraction> {
    trim_prose(raw, shape).and_then(|body| accept(&body, shape, Strategy::ProseTrimmed))
}

fn repaired(raw: &str, shape: Shape) -> Option<Extraction> {
    let mut candidates: Vec<String> = fenced_blocks(raw)
        .into_iter()
        .map(|b| b.trim().to_string())
        .collect();
    candidates.extend(bracket_slice(raw, shape).map(str::to_string));
    candidates.extend(trim_prose(raw, shape));
    candidates.push(raw.trim().to_string());

    candidates
        .iter()
        .map(|c| repair(c))
        .find_map(|fixed| accept(&fixed, shape, Strategy::Repaired))
}

/// Interiors of ``` fenced blocks, in order. The label after the opening
/// fence is optional; an unterminated last block runs to the end of input.
fn fenced_blocks(raw: &str) -> Vec<&str> {
    const FENCE: &str = "```";
    let mut blocks = Vec::new();
    let mut rest = raw;

    while let Some(open) = rest.find(FENCE) {
        let after = &rest[open + FENCE.len()..];
        let line_end = after.find('\n').unwrap_or(after.len());
        let label = after[..line_end].trim();
        let is_label = label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'));
        let body = if is_label && line_end < after.len() {
            &after[line_end + 1..]
        } else if is_label {
            ""
        } else {
            after
        };

        match body.find(FENCE) {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + FENCE.len()..];
            }
            None => {
                blocks.push(body);
                break;
            }
        }
    }
    blocks
}

/// From the first opening bracket to the last closing bracket of the same kind.
///
/// Only the outermost opener counts: when it is of the wrong kind for `shape`
/// there is no slice, so a value nested inside the answer is never lifted out.
fn bracket_slice(raw: &str, shape: Shape) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let opener = raw[start..].chars().next()?;
    if !shape.openers().contains(&opener) {
        return None;
    }
    let closer = if opener == '{' { '}' } else { ']' };
    let end = raw.rfind(closer)?;
    (end > start).then(|| &raw[start..=end])
}

/// Drop whole lines of prose before the payload starts and after it ends.
///
/// The payload starts at the first line opening with a bracket of any kind.
fn trim_prose(raw: &str, shape: Shape) -> Option<String> {
    let lines: Vec<&str> = raw.lines().collect();
    let first = lines
        .iter()
        .position(|line| line.trim_start().starts_with(['{', '[']))?;
    if !lines[first]
        .trim_start()
        .starts_with(|c: char| shape.openers().contains(&c))
    {
        return None;
    }
    let last = lines.iter().rposition(|line| {
        line.trim_end().ends_with(['}', ']'])
    })?;
    (last >= first).then(|| lines[first..=last].join("\n"))
}

/// Fix small syntax slips: single-quoted strings, unquoted keys, trailing commas.
///
/// String contents are copied untouched apart from re-escaping quotes when a
/// single-quoted string is converted.
fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                let end = string_end(&chars, i, '"');
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' => {
                out.push('"');
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    match chars[i] {
                        '\\' if chars.get(i + 1) == Some(&'\'') => {
                            out.push('\'');
                            i += 2;
                        }
                        '\\' => {
                            out.push('\\');
                            if let Some(next) = chars.get(i + 1) {
                                out.push(*next);
                            }
                            i += 2;
                        }
                        '"' => {
                            out.push_str("\\\"");
                            i += 1;
                        }
                        other => {
                            out.push(other);
                            i += 1;
                        }
                    }
                }
                out.push('"');
                i += 1;
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(',');
                }
                i += 1;
            }
            c if (c.is_ascii_alphabetic() || c == '_') && expects_key(&out) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let next = chars[i..].iter().find(|c| !c.is_whitespace());
                if next == Some(&':') {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

/// Index just past the closing quote of the string starting at `start`.
fn string_end(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// A bare identifier here would be an object key.
fn expects_key(out: &str) -> bool {
    matches!(out.trim_end().chars().last(), Some('{') | Some(','))
}
