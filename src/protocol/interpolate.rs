//! Command template expansion.
//!
//! Outside `"..."` literals, every `{...}` region is evaluated and replaced
//! by its result. Within a region, each `%` takes the next positional value
//! (left to right across the whole template) and bare names are looked up in
//! a [`Namespace`]. Regions support numbers, `'text'` literals, parentheses,
//! unary `-`, and `+ - * /`; `+` concatenates when either side is text.
//!
//! ```text
//! app.defaultlambda = {%}            [1.55]        -> app.defaultlambda = 1.55
//! app.subnodes[{%+1}].nodename()     [0]           -> app.subnodes[1].nodename()
//! {wg}.writemat("{raw}")             wg="app.subnodes[1]"
//!                                                  -> app.subnodes[1].writemat("{raw}")
//! ```

use crate::error::TemplateError;
use std::collections::HashMap;
use std::fmt;

/// A value substituted into a command template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Int(i64),
    Real(f64),
    /// Spliced verbatim, without quotes.
    Text(String),
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Int(v) => write!(f, "{}", v),
            // Debug keeps a decimal point and switches to exponents for
            // very large or small magnitudes.
            TemplateValue::Real(v) => write!(f, "{:?}", v),
            TemplateValue::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for TemplateValue {
            fn from(v: $t) -> Self {
                TemplateValue::Int(v as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for TemplateValue {
    fn from(v: usize) -> Self {
        i64::try_from(v)
            .map(TemplateValue::Int)
            .unwrap_or(TemplateValue::Real(v as f64))
    }
}

impl From<f64> for TemplateValue {
    fn from(v: f64) -> Self {
        TemplateValue::Real(v)
    }
}

impl From<f32> for TemplateValue {
    fn from(v: f32) -> Self {
        TemplateValue::Real(v as f64)
    }
}

impl From<&str> for TemplateValue {
    fn from(v: &str) -> Self {
        TemplateValue::Text(v.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(v: String) -> Self {
        TemplateValue::Text(v)
    }
}

type Computed = Box<dyn Fn() -> TemplateValue + Send + Sync>;

enum Binding {
    Value(TemplateValue),
    Computed(Computed),
}

/// Named values available to template expressions.
///
/// Computed bindings are evaluated each time a template references them, so
/// a command sees the caller's state at send time.
#[derive(Default)]
pub struct Namespace {
    bindings: HashMap<String, Binding>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a fixed value, replacing any previous binding.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<TemplateValue>) {
        self.bindings
            .insert(name.into(), Binding::Value(value.into()));
    }

    /// Bind `name` to a closure evaluated on every lookup.
    pub fn bind<F>(&mut self, name: impl Into<String>, compute: F)
    where
        F: Fn() -> TemplateValue + Send + Sync + 'static,
    {
        self.bindings
            .insert(name.into(), Binding::Computed(Box::new(compute)));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.bindings.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Option<TemplateValue> {
        match self.bindings.get(name)? {
            Binding::Value(v) => Some(v.clone()),
            Binding::Computed(f) => Some(f()),
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.bindings.keys().collect();
        names.sort();
        f.debug_struct("Namespace").field("names", &names).finish()
    }
}

/// Expand a command template.
pub fn interpolate(
    template: &str,
    values: &[TemplateValue],
    namespace: &Namespace,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut args = Args { values, next: 0 };
    let mut pos = 0;

    loop {
        let Some(rel) = template[pos..].find('"') else {
            expand_run(&template[pos..], &mut args, namespace, &mut out)?;
            break;
        };
        let open = pos + rel;
        expand_run(&template[pos..open], &mut args, namespace, &mut out)?;

        let close = template[open + 1..]
            .find('"')
            .map(|r| open + 1 + r)
            .ok_or(TemplateError::UnterminatedQuote(open))?;
        out.push_str(&template[open..=close]);
        pos = close + 1;
    }

    Ok(out)
}

struct Args<'a> {
    values: &'a [TemplateValue],
    next: usize,
}

impl Args<'_> {
    fn take(&mut self) -> Result<TemplateValue, TemplateError> {
        let value = self
            .values
            .get(self.next)
            .cloned()
            .ok_or(TemplateError::MissingValue {
                index: self.next + 1,
                available: self.values.len(),
            })?;
        self.next += 1;
        Ok(value)
    }
}

/// Expand the `{...}` regions of an unquoted run.
fn expand_run(
    text: &str,
    args: &mut Args<'_>,
    namespace: &Namespace,
    out: &mut String,
) -> Result<(), TemplateError> {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let Some(close_rel) = rest[open + 1..].find('}') else {
            break;
        };
        let close = open + 1 + close_rel;
        out.push_str(&rest[..open]);
        let value = evaluate(&rest[open + 1..close], args, namespace)?;
        out.push_str(&value.to_string());
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Value(TemplateValue),
    Name(String),
    Op(char),
    Open,
    Close,
}

fn syntax(expr: &str, reason: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn evaluate(
    expr: &str,
    args: &mut Args<'_>,
    namespace: &Namespace,
) -> Result<TemplateValue, TemplateError> {
    let tokens = lex(expr, args)?;
    if tokens.is_empty() {
        return Err(syntax(expr, "empty expression"));
    }
    let mut parser = Parser {
        expr,
        tokens: &tokens,
        pos: 0,
        namespace,
    };
    let value = parser.sum()?;
    if parser.pos != tokens.len() {
        return Err(syntax(expr, "unexpected trailing input"));
    }
    Ok(value)
}

/// Tokenize an expression. Placeholders are resolved here so values are
/// consumed in order of appearance.
fn lex(expr: &str, args: &mut Args<'_>) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '%' => {
                tokens.push(Token::Value(args.take()?));
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .map(|p| i + 1 + p)
                    .ok_or_else(|| syntax(expr, "unterminated string literal"))?;
                let text: String = chars[i + 1..end].iter().collect();
                tokens.push(Token::Value(TemplateValue::Text(text)));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut integral = true;
                while i < chars.len() {
                    let d = chars[i];
                    if d.is_ascii_digit() {
                        i += 1;
                    } else if d == '.' {
                        integral = false;
                        i += 1;
                    } else if (d == 'e' || d == 'E') && i > start {
                        integral = false;
                        i += 1;
                        if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                            i += 1;
                        }
                    } else {
                        break;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = if integral {
                    literal
                        .parse::<i64>()
                        .map(TemplateValue::Int)
                        .or_else(|_| literal.parse::<f64>().map(TemplateValue::Real))
                } else {
                    literal.parse::<f64>().map(TemplateValue::Real)
                }
                .map_err(|_| syntax(expr, format!("invalid number `{}`", literal)))?;
                tokens.push(Token::Value(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(syntax(expr, format!("unexpected character `{}`", other))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    expr: &'a str,
    tokens: &'a [Token],
    pos: usize,
    namespace: &'a Namespace,
}

impl Parser<'_> {
    fn peek_op(&self, ops: &[char]) -> Option<char> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(c)) if ops.contains(c) => Some(*c),
            _ => None,
        }
    }

    fn sum(&mut self) -> Result<TemplateValue, TemplateError> {
        let mut lhs = self.product()?;
        while let Some(op) = self.peek_op(&['+', '-']) {
            self.pos += 1;
            let rhs = self.product()?;
            lhs = apply(op, lhs, rhs, self.expr)?;
        }
        Ok(lhs)
    }

    fn product(&mut self) -> Result<TemplateValue, TemplateError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek_op(&['*', '/']) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = apply(op, lhs, rhs, self.expr)?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<TemplateValue, TemplateError> {
        match self.peek_op(&['+', '-']) {
            Some(op) => {
                self.pos += 1;
                match (op, self.unary()?) {
                    (_, TemplateValue::Text(_)) => Err(TemplateError::TypeMismatch {
                        op,
                        expr: self.expr.to_string(),
                    }),
                    ('-', TemplateValue::Int(v)) => Ok(v
                        .checked_neg()
                        .map(TemplateValue::Int)
                        .unwrap_or(TemplateValue::Real(-(v as f64)))),
                    ('-', TemplateValue::Real(v)) => Ok(TemplateValue::Real(-v)),
                    (_, v) => Ok(v),
                }
            }
            None => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<TemplateValue, TemplateError> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| syntax(self.expr, "unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Value(v) => Ok(v.clone()),
            Token::Name(name) => self
                .namespace
                .resolve(name)
                .ok_or_else(|| TemplateError::UnknownName(name.clone())),
            Token::Open => {
                let value = self.sum()?;
                match self.tokens.get(self.pos) {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err(syntax(self.expr, "missing `)`")),
                }
            }
            Token::Close => Err(syntax(self.expr, "unexpected `)`")),
            Token::Op(c) => Err(syntax(self.expr, format!("unexpected `{}`", c))),
        }
    }
}

fn as_real(v: &TemplateValue) -> f64 {
    match v {
        TemplateValue::Int(i) => *i as f64,
        TemplateValue::Real(r) => *r,
        TemplateValue::Text(_) => f64::NAN,
    }
}

fn apply(
    op: char,
    lhs: TemplateValue,
    rhs: TemplateValue,
    expr: &str,
) -> Result<TemplateValue, TemplateError> {
    use TemplateValue::{Int, Real, Text};

    if matches!(lhs, Text(_)) || matches!(rhs, Text(_)) {
        return match op {
            '+' => Ok(Text(format!("{}{}", lhs, rhs))),
            _ => Err(TemplateError::TypeMismatch {
                op,
                expr: expr.to_string(),
            }),
        };
    }

    if op == '/' {
        let divisor = as_real(&rhs);
        if divisor == 0.0 {
            return Err(TemplateError::DivisionByZero(expr.to_string()));
        }
        return Ok(Real(as_real(&lhs) / divisor));
    }

    if let (Int(a), Int(b)) = (&lhs, &rhs) {
        let exact = match op {
            '+' => a.checked_add(*b),
            '-' => a.checked_sub(*b),
            _ => a.checked_mul(*b),
        };
        if let Some(v) = exact {
            return Ok(Int(v));
        }
    }

    let (a, b) = (as_real(&lhs), as_real(&rhs));
    Ok(Real(match op {
        '+' => a + b,
        '-' => a - b,
        _ => a * b,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(template: &str, values: &[TemplateValue]) -> Result<String, TemplateError> {
        interpolate(template, values, &Namespace::new())
    }

    #[test]
    fn plain_template_is_unchanged() {
        assert_eq!(expand("", &[]).expect("empty"), "");
        assert_eq!(
            expand("app.subnodes[1].nodename()", &[]).expect("plain"),
            "app.subnodes[1].nodename()"
        );
    }

    #[test]
    fn placeholders_consume_values_in_order() {
        let out = expand(
            "app.subnodes[{%}].subnodes[{%}].lambda = {%}",
            &[1.into(), 3.into(), 1.55.into()],
        )
        .expect("should expand");
        assert_eq!(out, "app.subnodes[1].subnodes[3].lambda = 1.55");
    }

    #[test]
    fn text_values_are_spliced_verbatim() {
        let out = expand("{%}.nodename()", &["app.subnodes[2]".into()]).expect("should expand");
        assert_eq!(out, "app.subnodes[2].nodename()");
    }

    #[test]
    fn arithmetic_in_regions() {
        let out = expand("app.subnodes[{%+1}].width = {2*%}", &[0.into(), 0.25.into()])
            .expect("should expand");
        assert_eq!(out, "app.subnodes[1].width = 0.5");
        assert_eq!(expand("{(1+2)*-3}", &[]).expect("parens"), "-9");
        assert_eq!(expand("{7/2}", &[]).expect("division"), "3.5");
    }

    #[test]
    fn names_resolve_from_namespace() {
        let mut ns = Namespace::new();
        ns.set("wg", "app.subnodes[1].subnodes[2]");
        ns.set("lam0", 1.31);
        let out = interpolate("{wg}.lambda = {lam0}", &[], &ns).expect("should expand");
        assert_eq!(out, "app.subnodes[1].subnodes[2].lambda = 1.31");
    }

    #[test]
    fn computed_bindings_run_at_expansion() {
        use std::sync::atomic::{AtomicI64, Ordering};
        use std::sync::Arc;

        let counter = Arc::new(AtomicI64::new(1));
        let shared = Arc::clone(&counter);
        let mut ns = Namespace::new();
        ns.bind("node", move || TemplateValue::Int(shared.load(Ordering::SeqCst)));

        assert_eq!(interpolate("app.subnodes[{node}]", &[], &ns).expect("first"), "app.subnodes[1]");
        counter.store(4, Ordering::SeqCst);
        assert_eq!(interpolate("app.subnodes[{node}]", &[], &ns).expect("second"), "app.subnodes[4]");
    }

    #[test]
    fn quoted_text_is_untouched() {
        let template = r#"app.subnodes[{%}].writemat("{not %} {x}") then "{%}""#;
        let out = expand(template, &[7.into()]).expect("should expand");
        assert_eq!(out, r#"app.subnodes[7].writemat("{not %} {x}") then "{%}""#);
    }

    #[test]
    fn values_are_shared_across_quoted_runs() {
        let out = expand(r#"{%}"lit"{%}"#, &[1.into(), 2.into()]).expect("should expand");
        assert_eq!(out, r#"1"lit"2"#);
    }

    #[test]
    fn string_concatenation() {
        let out = expand("{'app.subnodes[' + % + ']'}", &[3.into()]).expect("should expand");
        assert_eq!(out, "app.subnodes[3]");
    }

    #[test]
    fn unmatched_brace_stops_expansion() {
        let out = expand("a {%} b { c", &[1.into()]).expect("should expand");
        assert_eq!(out, "a 1 b { c");
    }

    #[test]
    fn missing_values_are_an_error() {
        let mut ns = Namespace::new();
        ns.set("x", 1);
        let err = interpolate("set {x} to {%}", &[], &ns).expect_err("should fail");
        assert_eq!(err, TemplateError::MissingValue { index: 1, available: 0 });

        assert!(expand("set {x} to {%}", &[]).is_err());
    }

    #[test]
    fn unknown_name_is_an_error() {
        let err = expand("{lambda0}", &[]).expect_err("should fail");
        assert_eq!(err, TemplateError::UnknownName("lambda0".to_string()));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(expand("{}", &[]), Err(TemplateError::Syntax { .. })));
        assert!(matches!(expand("{1 +}", &[]), Err(TemplateError::Syntax { .. })));
        assert!(matches!(expand("{(1}", &[]), Err(TemplateError::Syntax { .. })));
        assert!(matches!(expand("{1 2}", &[]), Err(TemplateError::Syntax { .. })));
        assert!(matches!(expand("{a#b}", &[]), Err(TemplateError::Syntax { .. })));
    }

    #[test]
    fn text_arithmetic_is_a_type_error() {
        assert!(matches!(
            expand("{% * 2}", &["abc".into()]),
            Err(TemplateError::TypeMismatch { op: '*', .. })
        ));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(matches!(
            expand("{1/0}", &[]),
            Err(TemplateError::DivisionByZero(_))
        ));
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            expand(r#"app.setwdir("C:\work)"#, &[]),
            Err(TemplateError::UnterminatedQuote(12))
        );
    }

    #[test]
    fn real_formatting_keeps_decimal_point() {
        assert_eq!(TemplateValue::Real(2.0).to_string(), "2.0");
        assert_eq!(TemplateValue::Real(1.55).to_string(), "1.55");
        assert_eq!(TemplateValue::Int(-4).to_string(), "-4");
    }
}
