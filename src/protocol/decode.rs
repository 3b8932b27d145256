//! Reply payload decoding.
//!
//! A payload is either an untagged message (usually an engine error) or one
//! or more segments, each introduced by the result tag. Segments are scalars,
//! complex pairs, 1-D arrays/lists addressed as `name[i]`, or 2-D matrices
//! addressed as `name[i][j]`:
//!
//! ```text
//! RETVAL:1.550
//! RETVAL:(1.5,-2.25)
//! RETVAL:
//! beta[1] 1.4502 beta[2] 1.4471
//! RETVAL:
//! ex[0][0] 0.1 ex[0][1] 0.2 ex[1][0] 0.3 ex[1][1] 0.4
//! ```
//!
//! A zero-length payload is [`DecodedValue::Empty`]; any other untagged
//! payload, even one of only whitespace, is kept as a message.
//!
//! Decoding never fails. Anything that does not fit a known shape comes back
//! as text so callers can inspect what the engine actually said.

use num_complex::Complex64;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Tag the engine writes in front of every returned value.
pub const RESULT_TAG: &str = "RETVAL:";
/// Alternative spelling accepted wherever [`RESULT_TAG`] is.
pub const RESULT_TAG_ALIAS: &str = "RESULT:";

/// Largest index accepted in `name[i]` addressing.
const MAX_INDEX: usize = 1 << 20;
/// Unfilled slots a decoded array may hold beyond one per token.
const MAX_GAP_SLOTS: usize = 1024;

/// A single decoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Real(f64),
    Complex(Complex64),
    /// Non-numeric text, kept verbatim.
    Text(String),
}

/// Everything a reply can decode to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DecodedValue {
    /// No payload at all (fire-and-forget commands, exit acknowledgement).
    Empty,
    Scalar(Scalar),
    /// 1-D result; `None` marks indices the engine did not send.
    List(Vec<Option<Scalar>>),
    /// 2-D result, row-major; rows the engine did not send are empty.
    Matrix(Vec<Vec<Option<Scalar>>>),
    /// Untagged payload, returned as sent. Usually an error or status line.
    Message(String),
    /// Tagged segment whose structure could not be decoded.
    Raw(String),
    /// Several tagged segments in one payload, in order.
    Multi(Vec<DecodedValue>),
}

impl DecodedValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, DecodedValue::Empty)
    }

    /// Real scalar value, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Scalar(Scalar::Real(v)) => Some(*v),
            _ => None,
        }
    }

    /// Complex value; reals are widened.
    pub fn as_complex(&self) -> Option<Complex64> {
        match self {
            DecodedValue::Scalar(Scalar::Real(v)) => Some(Complex64::new(*v, 0.0)),
            DecodedValue::Scalar(Scalar::Complex(c)) => Some(*c),
            _ => None,
        }
    }

    /// Text of a textual scalar, message or undecodable segment.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedValue::Scalar(Scalar::Text(s))
            | DecodedValue::Message(s)
            | DecodedValue::Raw(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Option<Scalar>]> {
        match self {
            DecodedValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&[Vec<Option<Scalar>>]> {
        match self {
            DecodedValue::Matrix(rows) => Some(rows),
            _ => None,
        }
    }

    /// Clean up engine artifacts for display or comparison.
    ///
    /// Text loses the trailing `"\n\0"` the engine appends and surrounding
    /// whitespace. Lists lose the unused slot 0 of the engine's 1-based
    /// indexing.
    pub fn stripped(self) -> DecodedValue {
        match self {
            DecodedValue::Scalar(Scalar::Text(s)) => {
                DecodedValue::Scalar(Scalar::Text(strip_engine_text(&s)))
            }
            DecodedValue::Message(s) => DecodedValue::Message(strip_engine_text(&s)),
            DecodedValue::Raw(s) => DecodedValue::Raw(strip_engine_text(&s)),
            DecodedValue::List(mut items) => {
                if matches!(items.first(), Some(None)) {
                    items.remove(0);
                }
                DecodedValue::List(items)
            }
            DecodedValue::Multi(values) => {
                DecodedValue::Multi(values.into_iter().map(DecodedValue::stripped).collect())
            }
            other => other,
        }
    }
}

/// Remove NUL terminators and whitespace from both ends of engine text.
pub fn strip_engine_text(text: &str) -> String {
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Real(v) => write!(f, "{}", v),
            Scalar::Complex(c) => write!(f, "({},{})", c.re, c.im),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

fn fmt_items(f: &mut fmt::Formatter<'_>, items: &[Option<Scalar>]) -> fmt::Result {
    write!(f, "[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match item {
            Some(v) => write!(f, "{}", v)?,
            None => write!(f, "None")?,
        }
    }
    write!(f, "]")
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Empty => Ok(()),
            DecodedValue::Scalar(s) => write!(f, "{}", s),
            DecodedValue::List(items) => fmt_items(f, items),
            DecodedValue::Matrix(rows) => {
                write!(f, "[")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_items(f, row)?;
                }
                write!(f, "]")
            }
            DecodedValue::Message(s) | DecodedValue::Raw(s) => write!(f, "{}", s),
            DecodedValue::Multi(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
        }
    }
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"RETVAL:|RESULT:").expect("valid tag regex"))
}

fn complex_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(\s*([^,()]+?)\s*,\s*([^,()]+?)\s*\)").expect("valid complex regex")
    })
}

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^\[\]]*\[(\d+)\](?:\[(\d+)\])?$").expect("valid address regex")
    })
}

/// Decode a complete reply payload.
pub fn decode(payload: &str) -> DecodedValue {
    if payload.is_empty() {
        return DecodedValue::Empty;
    }

    let tags: Vec<(usize, usize)> = tag_regex()
        .find_iter(payload)
        .map(|m| (m.start(), m.end()))
        .collect();

    match tags.len() {
        0 => DecodedValue::Message(payload.to_string()),
        1 => decode_segment(&payload[tags[0].1..]),
        _ => {
            let segments = tags
                .iter()
                .enumerate()
                .map(|(k, &(_, body_start))| {
                    let body_end = tags.get(k + 1).map_or(payload.len(), |next| next.0);
                    decode_segment(&payload[body_start..body_end])
                })
                .collect();
            DecodedValue::Multi(segments)
        }
    }
}

/// Decode the body of one tagged segment (the text after the tag).
pub fn decode_segment(segment: &str) -> DecodedValue {
    if !segment.contains('[') {
        return DecodedValue::Scalar(decode_scalar(segment));
    }

    let tokens = tokenize(segment);
    let decoded = match tokens.first().and_then(|t| parse_address(t)) {
        Some(Address::One(start)) => decode_one_dim(&tokens, start),
        Some(Address::Two(..)) => decode_two_dim(&tokens),
        None => None,
    };
    decoded.unwrap_or_else(|| DecodedValue::Raw(segment.to_string()))
}

/// Decode a scalar token: `(re,im)` complex, a real, or verbatim text.
pub fn decode_scalar(text: &str) -> Scalar {
    let trimmed = text.trim_start();
    if trimmed.starts_with('(') {
        return parse_complex(trimmed)
            .map(Scalar::Complex)
            .unwrap_or_else(|| Scalar::Text(text.to_string()));
    }

    let first_line = trimmed.split('\n').next().unwrap_or("");
    let number = first_line.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    match number.parse::<f64>() {
        Ok(v) => Scalar::Real(v),
        Err(_) => Scalar::Text(text.to_string()),
    }
}

fn parse_complex(text: &str) -> Option<Complex64> {
    let caps = complex_regex().captures(text)?;
    let re = caps.get(1)?.as_str().parse::<f64>().ok()?;
    let im = caps.get(2)?.as_str().parse::<f64>().ok()?;
    Some(Complex64::new(re, im))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Address {
    One(usize),
    Two(usize, usize),
}

fn parse_address(token: &str) -> Option<Address> {
    let caps = address_regex().captures(token)?;
    let first = parse_index(caps.get(1)?.as_str())?;
    match caps.get(2) {
        Some(second) => Some(Address::Two(first, parse_index(second.as_str())?)),
        None => Some(Address::One(first)),
    }
}

fn parse_index(digits: &str) -> Option<usize> {
    digits.parse::<usize>().ok().filter(|&i| i <= MAX_INDEX)
}

/// Whitespace tokens with NUL terminators removed.
fn tokenize(segment: &str) -> Vec<&str> {
    segment
        .split_whitespace()
        .map(|t| t.trim_matches('\0'))
        .filter(|t| !t.is_empty())
        .collect()
}

fn place<T>(slots: &mut Vec<Option<T>>, index: usize, value: T) {
    if index >= slots.len() {
        slots.resize_with(index + 1, || None);
    }
    slots[index] = Some(value);
}

/// Sparse indices must not make the decoded shape much larger than the
/// reply that described it.
fn within_budget(slots: usize, tokens: usize) -> bool {
    slots <= tokens.saturating_add(MAX_GAP_SLOTS)
}

fn decode_one_dim(tokens: &[&str], start: usize) -> Option<DecodedValue> {
    let second = tokens.get(1)?;

    if second.contains('[') {
        // List form: every token is an element, starting at the first index.
        if !within_budget(start + tokens.len(), tokens.len()) {
            return None;
        }
        let mut items: Vec<Option<Scalar>> = Vec::with_capacity(start + tokens.len());
        items.resize_with(start, || None);
        items.extend(tokens.iter().map(|t| Some(decode_scalar(t))));
        return Some(DecodedValue::List(items));
    }

    // Array form: `name[i] value` pairs.
    if tokens.len() % 2 != 0 {
        return None;
    }
    let mut entries = Vec::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks(2) {
        match parse_address(pair[0])? {
            Address::One(i) => entries.push((i, pair[1])),
            Address::Two(..) => return None,
        }
    }
    let slots = entries.iter().map(|&(i, _)| i + 1).max().unwrap_or(0);
    if !within_budget(slots, tokens.len()) {
        return None;
    }

    let mut items = Vec::with_capacity(slots);
    for (i, value) in entries {
        place(&mut items, i, decode_scalar(value));
    }
    Some(DecodedValue::List(items))
}

fn decode_two_dim(tokens: &[&str]) -> Option<DecodedValue> {
    if tokens.len() % 2 != 0 {
        return None;
    }
    let mut entries = Vec::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks(2) {
        match parse_address(pair[0])? {
            Address::Two(i, j) => entries.push((i, j, pair[1])),
            Address::One(_) => return None,
        }
    }

    // Each row counts as a slot, plus the width of every row.
    let row_count = entries.iter().map(|&(i, _, _)| i + 1).max().unwrap_or(0);
    if !within_budget(row_count, tokens.len()) {
        return None;
    }
    let mut widths = vec![0usize; row_count];
    for &(i, j, _) in &entries {
        widths[i] = widths[i].max(j + 1);
    }
    let cells: usize = widths.iter().sum();
    if !within_budget(row_count + cells, tokens.len()) {
        return None;
    }

    let mut rows: Vec<Vec<Option<Scalar>>> =
        widths.iter().map(|&w| Vec::with_capacity(w)).collect();
    for (i, j, value) in entries {
        place(&mut rows[i], j, decode_scalar(value));
    }
    Some(DecodedValue::Matrix(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(v: f64) -> Option<Scalar> {
        Some(Scalar::Real(v))
    }

    #[test]
    fn untagged_payload_is_message() {
        let payload = "ERROR: unknown object app.foo\n\0";
        assert_eq!(decode(payload), DecodedValue::Message(payload.to_string()));
    }

    #[test]
    fn zero_length_payload_is_empty() {
        assert_eq!(decode(""), DecodedValue::Empty);
    }

    #[test]
    fn blank_untagged_payload_is_message() {
        let value = decode("\n\0");
        assert_eq!(value, DecodedValue::Message("\n\0".to_string()));
        assert_eq!(value.stripped(), DecodedValue::Message(String::new()));
    }

    #[test]
    fn real_scalar() {
        assert_eq!(decode("RETVAL:1.550\n\0").as_f64(), Some(1.55));
        assert_eq!(decode("RESULT:1.550\n\0").as_f64(), Some(1.55));
        assert_eq!(decode("RETVAL: -3e-6\n").as_f64(), Some(-3e-6));
    }

    #[test]
    fn complex_scalar() {
        let value = decode("RESULT:(1.5,-2.25)");
        assert_eq!(value, DecodedValue::Scalar(Scalar::Complex(Complex64::new(1.5, -2.25))));
        assert_eq!(value.as_complex(), Some(Complex64::new(1.5, -2.25)));
    }

    #[test]
    fn malformed_complex_falls_back_to_text() {
        assert_eq!(
            decode("RETVAL:(1.5,abc)"),
            DecodedValue::Scalar(Scalar::Text("(1.5,abc)".to_string()))
        );
    }

    #[test]
    fn non_numeric_scalar_is_verbatim_text() {
        assert_eq!(
            decode("RETVAL:C:\\work\\\n\0"),
            DecodedValue::Scalar(Scalar::Text("C:\\work\\\n\0".to_string()))
        );
    }

    #[test]
    fn one_dim_gap_filling() {
        let value = decode("RETVAL: a[2] 7.0\n\0");
        let items = value.as_list().expect("should be a list");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], None);
        assert_eq!(items[1], None);
        assert_eq!(items[2], real(7.0));
    }

    #[test]
    fn one_dim_array_of_mixed_scalars() {
        let value = decode("RETVAL:\nneff[1] 1.4502\nneff[2] (1.44,-0.001)\nneff[3] lossy\n\0");
        assert_eq!(
            value,
            DecodedValue::List(vec![
                None,
                real(1.4502),
                Some(Scalar::Complex(Complex64::new(1.44, -0.001))),
                Some(Scalar::Text("lossy".to_string())),
            ])
        );
    }

    #[test]
    fn one_dim_list_form_takes_every_token() {
        let value = decode("RETVAL: n[1] n[2] n[3]\n\0");
        assert_eq!(
            value,
            DecodedValue::List(vec![
                None,
                Some(Scalar::Text("n[1]".to_string())),
                Some(Scalar::Text("n[2]".to_string())),
                Some(Scalar::Text("n[3]".to_string())),
            ])
        );
    }

    #[test]
    fn single_structured_token_is_raw() {
        assert_eq!(
            decode("RETVAL: a[1]\n"),
            DecodedValue::Raw(" a[1]\n".to_string())
        );
    }

    #[test]
    fn two_dim_matrix() {
        let value = decode("RETVAL:\nf[0][1] 1.0 f[0][2] 2.0 f[1][1] 3.0 f[1][2] 4.0\n\0");
        assert_eq!(
            value,
            DecodedValue::Matrix(vec![
                vec![None, real(1.0), real(2.0)],
                vec![None, real(3.0), real(4.0)],
            ])
        );
    }

    #[test]
    fn two_dim_rows_start_at_first_index() {
        let value = decode("RETVAL: m[1][0] 5 m[1][1] 6\n");
        let rows = value.as_matrix().expect("should be a matrix");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_empty());
        assert_eq!(rows[1], vec![real(5.0), real(6.0)]);
    }

    #[test]
    fn bad_index_falls_back_to_raw() {
        assert_eq!(
            decode("RETVAL: a[x] 1.0"),
            DecodedValue::Raw(" a[x] 1.0".to_string())
        );
        assert_eq!(
            decode("RETVAL: a[1][2] 1.0 a[1][y] 2.0"),
            DecodedValue::Raw(" a[1][2] 1.0 a[1][y] 2.0".to_string())
        );
    }

    #[test]
    fn sparse_indices_fall_back_to_raw() {
        let matrix = "RETVAL: m[0][1048576] 1 m[1][1048576] 1 m[2][1048576] 1";
        assert!(matches!(decode(matrix), DecodedValue::Raw(_)));

        let array = "RETVAL: a[1048576] 1";
        assert!(matches!(decode(array), DecodedValue::Raw(_)));

        let list = "RETVAL: a[1048576] b[1] c[2]";
        assert!(matches!(decode(list), DecodedValue::Raw(_)));

        // Small gaps are still placed by index.
        let value = decode("RETVAL: a[500] 1");
        assert_eq!(value.as_list().expect("list").len(), 501);
    }

    #[test]
    fn bracketed_error_text_falls_back_to_raw() {
        let value = decode("RETVAL:app.subnodes[4] does not exist\n\0");
        assert_eq!(
            value,
            DecodedValue::Raw("app.subnodes[4] does not exist\n\0".to_string())
        );
    }

    #[test]
    fn multiple_segments_decode_independently() {
        let payload = "junk RETVAL:1.5\nRETVAL: a[0] 2.0\nRETVAL:(0,1)\n\0";
        let value = decode(payload);
        let DecodedValue::Multi(parts) = &value else {
            panic!("expected multi, got {value:?}");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], decode("RETVAL:1.5\n"));
        assert_eq!(parts[1], decode("RETVAL: a[0] 2.0\n"));
        assert_eq!(parts[2], decode("RETVAL:(0,1)\n\0"));
        assert_eq!(parts[1], DecodedValue::List(vec![real(2.0)]));
    }

    #[test]
    fn bad_segment_does_not_spoil_others() {
        let value = decode("RETVAL: a[q] 1\nRETVAL:2.5\n");
        assert_eq!(
            value,
            DecodedValue::Multi(vec![
                DecodedValue::Raw(" a[q] 1\n".to_string()),
                DecodedValue::Scalar(Scalar::Real(2.5)),
            ])
        );
    }

    #[test]
    fn stripped_removes_engine_terminators() {
        let value = decode("RETVAL:MyProject\n\0").stripped();
        assert_eq!(value.as_text(), Some("MyProject"));

        let list = decode("RETVAL: a[1] 1.0 a[2] 2.0").stripped();
        assert_eq!(list, DecodedValue::List(vec![real(1.0), real(2.0)]));
    }

    #[test]
    fn display_renders_gaps() {
        let value = decode("RETVAL: a[1] 1.5");
        assert_eq!(value.to_string(), "[None, 1.5]");
    }
}
