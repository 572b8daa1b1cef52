//! CP-003: Ruby literal → `Value`.
//!
//! Recognizes the literal forms that appear as resource property values.
//! Anything else (method calls, interpolated strings, arithmetic) is kept
//! verbatim as `Value::Raw`.

use super::types::{Scalar, Value};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::LazyLock;

static SYMBOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:([A-Za-z_][A-Za-z0-9_]*[?!]?)$").expect("valid regex"));

static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9][0-9_]*$").expect("valid regex"));

static FLOAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]+\.[0-9]+$").expect("valid regex"));

static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][A-Za-z0-9_]*$").expect("valid regex"));

static NODE_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(node|default|override|normal)((?:\[[^\[\]]+\])+)$").expect("valid regex")
});

static NODE_DOTTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^node((?:\.[a-z_][A-Za-z0-9_]*)+)$").expect("valid regex")
});

static INDEX_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("valid regex"));

static NEW_STYLE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:([A-Za-z_][A-Za-z0-9_]*)|'([^']*)'|"([^"]*)"):\s+(.*)$"#)
        .expect("valid regex")
});

/// Parse one expression. Top-level comma-separated arguments become a
/// `Map` when every element is a `key => value` / `key: value` pair, and a
/// `List` otherwise.
pub fn parse_value(expr: &str) -> Value {
    let s = expr.trim();
    let parts = split_top_level(s, ',');
    if parts.len() > 1 {
        return parse_sequence(&parts).unwrap_or_else(|| Value::Raw(s.to_string()));
    }
    if let Some(map) = parse_pairs(&parts) {
        return map;
    }
    parse_single(s)
}

fn parse_sequence(parts: &[&str]) -> Option<Value> {
    if let Some(map) = parse_pairs(parts) {
        return Some(map);
    }
    Some(Value::List(parts.iter().map(|p| parse_single(p)).collect()))
}

fn parse_pairs(parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return None;
    }
    let mut map = IndexMap::new();
    for part in parts {
        let (key, value) = split_pair(part)?;
        map.insert(key, parse_single(value));
    }
    Some(Value::Map(map))
}

/// Split `key => value` or `key: value` into its halves.
pub fn split_pair(part: &str) -> Option<(String, &str)> {
    if let Some(pos) = find_top_level(part, "=>") {
        let key = unquote_key(part[..pos].trim())?;
        return Some((key, part[pos + 2..].trim()));
    }
    let caps = NEW_STYLE_KEY.captures(part)?;
    let key = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .to_string();
    let value = caps.get(4)?.as_str();
    // `a ? b : c` is not a pair
    if value.is_empty() {
        return None;
    }
    Some((key, value))
}

fn unquote_key(key: &str) -> Option<String> {
    if let Some(sym) = SYMBOL.captures(key) {
        return Some(sym[1].to_string());
    }
    match parse_single(key) {
        Value::Scalar(Scalar::String(s)) => Some(s),
        Value::Scalar(Scalar::Integer(i)) => Some(i.to_string()),
        Value::Reference(r) if !r.contains('.') => Some(r),
        _ => None,
    }
}

fn parse_single(expr: &str) -> Value {
    let s = expr.trim();
    if s.is_empty() {
        return Value::Raw(String::new());
    }

    if let Some(inner) = enclosed(s, '(', ')') {
        return parse_value(inner);
    }
    if s.starts_with('\'') {
        if let Some(text) = quoted_literal(s, '\'') {
            return Value::string(text);
        }
    }
    if s.starts_with('"') && !s.contains("#{") {
        if let Some(text) = quoted_literal(s, '"') {
            return Value::string(text);
        }
    }
    if let Some(words) = percent_words(s) {
        return words;
    }
    if let Some(caps) = SYMBOL.captures(s) {
        return Value::symbol(&caps[1]);
    }
    if let Some(rest) = s.strip_prefix(':') {
        if let Some(text) = quoted_literal(rest, '"').or_else(|| quoted_literal(rest, '\'')) {
            return Value::symbol(&text);
        }
    }
    match s {
        "true" => return Value::Scalar(Scalar::Bool(true)),
        "false" => return Value::Scalar(Scalar::Bool(false)),
        "nil" => return Value::Scalar(Scalar::Nil),
        _ => {}
    }
    if INTEGER.is_match(s) {
        // file modes keep their leading zero
        let digits = s.trim_start_matches('-');
        if digits.len() > 1 && digits.starts_with('0') {
            return Value::string(s);
        }
        if let Ok(i) = s.replace('_', "").parse::<i64>() {
            return Value::Scalar(Scalar::Integer(i));
        }
        return Value::Raw(s.to_string());
    }
    if FLOAT.is_match(s) {
        if let Ok(f) = s.parse::<f64>() {
            return Value::Scalar(Scalar::Float(f));
        }
    }
    if let Some(inner) = enclosed(s, '[', ']') {
        let parts = split_top_level(inner, ',');
        return Value::List(parts.iter().map(|p| parse_single(p)).collect());
    }
    if let Some(inner) = enclosed(s, '{', '}') {
        let parts = split_top_level(inner, ',');
        if parts.is_empty() {
            return Value::Map(IndexMap::new());
        }
        return parse_pairs(&parts).unwrap_or_else(|| Value::Raw(s.to_string()));
    }
    if let Some(reference) = node_reference(s) {
        return Value::Reference(reference);
    }
    if IDENT.is_match(s) {
        return Value::Reference(s.to_string());
    }
    Value::Raw(s.to_string())
}

/// `node['a'][:b]` / `node.a.b` → `node.a.b`. Attribute-file precedence
/// levels (`default[...]`) resolve to the same `node.` path.
pub fn node_reference(s: &str) -> Option<String> {
    if let Some(caps) = NODE_DOTTED.captures(s) {
        return Some(format!("node{}", &caps[1]));
    }
    let caps = NODE_INDEX.captures(s)?;
    let keys = index_path(&caps[2])?;
    Some(format!("node.{}", keys.join(".")))
}

/// Keys of an index chain such as `['nginx'][:port]`.
pub fn index_path(chain: &str) -> Option<Vec<String>> {
    INDEX_KEY
        .captures_iter(chain)
        .map(|k| index_key(&k[1]))
        .collect()
}

/// The key text of one `[...]` index.
pub fn index_key(raw: &str) -> Option<String> {
    let raw = raw.trim();
    match parse_single(raw) {
        Value::Scalar(Scalar::String(s)) | Value::Scalar(Scalar::Symbol(s)) => Some(s),
        Value::Scalar(Scalar::Integer(i)) => Some(i.to_string()),
        _ => None,
    }
}

fn percent_words(s: &str) -> Option<Value> {
    let mut chars = s.chars();
    if chars.next()? != '%' {
        return None;
    }
    let flavor = chars.next()?;
    if !matches!(flavor, 'w' | 'W' | 'i' | 'I') {
        return None;
    }
    let open = chars.next()?;
    let close = match open {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        '<' => '>',
        '|' => '|',
        _ => return None,
    };
    let body = s.get(3..)?.strip_suffix(close)?;
    if body.contains(close) {
        return None;
    }
    let items = body
        .split_whitespace()
        .map(|w| match flavor {
            'i' | 'I' => Value::symbol(w),
            _ => Value::string(w),
        })
        .collect();
    Some(Value::List(items))
}

/// Content of `s` if the whole of `s` is one quoted literal.
fn quoted_literal(s: &str, quote: char) -> Option<String> {
    let mut chars = s.char_indices();
    if chars.next()?.1 != quote {
        return None;
    }
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            match (quote, c) {
                ('"', 'n') => out.push('\n'),
                ('"', 't') => out.push('\t'),
                ('"', c) | (_, c @ ('\'' | '\\')) => out.push(c),
                (_, c) => {
                    out.push('\\');
                    out.push(c);
                }
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return (i + c.len_utf8() == s.len()).then_some(out);
        } else {
            out.push(c);
        }
    }
    None
}

/// Inner text if `s` is exactly one `open ... close` group.
fn enclosed(s: &str, open: char, close: char) -> Option<&str> {
    if !s.starts_with(open) || !s.ends_with(close) {
        return None;
    }
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            _ if c == open => depth += 1,
            _ if c == close => {
                depth -= 1;
                if depth == 0 {
                    return (i + c.len_utf8() == s.len()).then(|| &s[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_top_level(s: &str, needle: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if depth == 0 && s[i..].starts_with(needle) => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split on `sep` outside quotes and brackets. Empty trailing parts
/// (trailing commas) are dropped.
pub fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if c == sep && depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = s[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts.retain(|p| !p.is_empty());
    parts
}
