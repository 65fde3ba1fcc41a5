//! JSON pointer (RFC 6901) helpers
//!
//! `serde_json::Value::pointer` accepts malformed escapes silently; slicing
//! must reject them, so paths are parsed here first.

use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Split a pointer into unescaped reference tokens. `""` is the whole document.
pub fn parse(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(invalid(path, "must be empty or start with '/'"));
    };
    rest.split('/').map(|token| unescape(path, token)).collect()
}

fn unescape(path: &str, token: &str) -> Result<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(invalid(path, "'~' must be followed by '0' or '1'")),
        }
    }
    Ok(out)
}

pub fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Append one (unescaped) token to a pointer.
pub fn push(parent: &str, token: &str) -> String {
    format!("{}/{}", parent, escape(token))
}

fn invalid(path: &str, reason: &str) -> EngineError {
    EngineError::InvalidFieldPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Outcome of walking a pointer through a document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value),
    Missing,
    /// The walk hit a scalar before the last token; `depth` tokens resolved.
    ThroughScalar { depth: usize, scalar: &'a Value },
}

pub fn lookup<'a>(doc: &'a Value, path: &str) -> Result<Lookup<'a>> {
    let mut current = doc;
    for (depth, token) in parse(path)?.iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get(token),
            Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Null => None,
            scalar => return Ok(Lookup::ThroughScalar { depth, scalar }),
        };
        match next {
            Some(v) => current = v,
            None => return Ok(Lookup::Missing),
        }
    }
    Ok(Lookup::Found(current))
}

/// Resolve `path` in `doc`. Missing members, out-of-range indexes and paths
/// through scalars are `None`.
pub fn get<'a>(doc: &'a Value, path: &str) -> Result<Option<&'a Value>> {
    match lookup(doc, path)? {
        Lookup::Found(v) => Ok(Some(v)),
        Lookup::Missing | Lookup::ThroughScalar { .. } => Ok(None),
    }
}

/// Write `value` at `path`, creating intermediate objects.
pub fn set(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let tokens = parse(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut current = doc;
    for token in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return Err(invalid(path, "target parent is not an object")),
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        _ => Err(invalid(path, "target parent is not an object")),
    }
}
