//! `$name` reference resolution
//!
//! Walks arbitrary JSON and substitutes `$name` references against a
//! materialized binding map. Reference names match `[A-Za-z_][A-Za-z0-9_]*`,
//! longest-greedy. A string consisting solely of one reference (allowing
//! surrounding whitespace) is promoted to the bound value's native JSON
//! type; a reference embedded in other text splices string values raw and
//! serializes anything else to its compact JSON form. Missing references
//! stay literal and are reported back so callers can warn once per unique
//! name per iteration.
//!
//! Substitution is a fixpoint in one pass: bound values are never rescanned
//! for further references.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Outcome of resolving one JSON value
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    /// Unique referenced names with no binding
    pub missing: BTreeSet<String>,
}

/// Collect every `$name` referenced anywhere inside `value`.
pub fn collect_refs(value: &Value) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    collect_into(value, &mut refs);
    refs
}

/// Collect every `$name` referenced in a text body.
pub fn collect_text_refs(text: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    scan(text, |segment| {
        if let Segment::Reference(name) = segment {
            refs.insert(name.to_string());
        }
    });
    refs
}

/// Substitute references inside `value` against `bindings`.
pub fn resolve_value(value: &Value, bindings: &HashMap<String, Value>) -> Resolution {
    let mut missing = BTreeSet::new();
    let value = resolve_inner(value, bindings, &mut missing);
    Resolution { value, missing }
}

/// Substitute references inside free text (response bodies).
pub fn resolve_text(text: &str, bindings: &HashMap<String, Value>) -> (String, BTreeSet<String>) {
    let mut missing = BTreeSet::new();
    let resolved = splice_text(text, bindings, &mut missing);
    (resolved, missing)
}

fn collect_into(value: &Value, refs: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            refs.extend(collect_text_refs(s));
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_into(item, refs);
            }
        }
        _ => {}
    }
}

fn resolve_inner(
    value: &Value,
    bindings: &HashMap<String, Value>,
    missing: &mut BTreeSet<String>,
) -> Value {
    match value {
        Value::String(s) => resolve_string(s, bindings, missing),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_inner(item, bindings, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_inner(v, bindings, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(
    s: &str,
    bindings: &HashMap<String, Value>,
    missing: &mut BTreeSet<String>,
) -> Value {
    // Sole-reference promotion: the string is replaced by the bound value,
    // preserving its native type.
    if let Some(name) = sole_reference(s) {
        return match bindings.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.insert(name.to_string());
                Value::String(s.to_string())
            }
        };
    }
    Value::String(splice_text(s, bindings, missing))
}

/// `Some(name)` when the string is exactly one `$name` with optional
/// surrounding whitespace.
fn sole_reference(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let name = trimmed.strip_prefix('$')?;
    if name.is_empty() || !is_ident_start(name.chars().next()?) {
        return None;
    }
    if name.chars().skip(1).all(is_ident_char) {
        Some(name)
    } else {
        None
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Reference(&'a str),
}

/// Split text into literal runs and `$name` references, longest-greedy.
fn scan<'a>(text: &'a str, mut visit: impl FnMut(Segment<'a>)) {
    let bytes = text.as_bytes();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && is_ident_start(bytes[i + 1] as char) {
            let name_start = i + 1;
            let mut end = name_start + 1;
            while end < bytes.len() && is_ident_char(bytes[end] as char) {
                end += 1;
            }
            if literal_start < i {
                visit(Segment::Literal(&text[literal_start..i]));
            }
            visit(Segment::Reference(&text[name_start..end]));
            i = end;
            literal_start = end;
        } else {
            i += 1;
        }
    }

    if literal_start < text.len() {
        visit(Segment::Literal(&text[literal_start..]));
    }
}

fn splice_text(
    text: &str,
    bindings: &HashMap<String, Value>,
    missing: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    scan(text, |segment| match segment {
        Segment::Literal(s) => out.push_str(s),
        Segment::Reference(name) => match bindings.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(value) => out.push_str(&value.to_string()),
            None => {
                missing.insert(name.to_string());
                out.push('$');
                out.push_str(name);
            }
        },
    });
    out
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_sole_reference_promotes_type() {
        let b = bindings(&[("data", json!({"rows": [1, 2]}))]);
        let resolution = resolve_value(&json!({"input": "$data"}), &b);
        assert_eq!(resolution.value, json!({"input": {"rows": [1, 2]}}));
        assert!(resolution.missing.is_empty());
    }

    #[test]
    fn test_sole_reference_with_whitespace() {
        let b = bindings(&[("n", json!(42))]);
        let resolution = resolve_value(&json!("  $n "), &b);
        assert_eq!(resolution.value, json!(42));
    }

    #[test]
    fn test_embedded_number_serialized() {
        let b = bindings(&[("a", json!(10)), ("b", json!(20))]);
        let (text, missing) = resolve_text("sum=$a+$b", &b);
        assert_eq!(text, "sum=10+20");
        assert!(missing.is_empty());
    }

    #[test]
    fn test_embedded_string_spliced_raw() {
        let b = bindings(&[("who", json!("world"))]);
        let (text, _) = resolve_text("hello $who!", &b);
        assert_eq!(text, "hello world!");
    }

    #[test]
    fn test_embedded_object_compact_json() {
        let b = bindings(&[("obj", json!({"k": 1}))]);
        let (text, _) = resolve_text("got $obj.", &b);
        assert_eq!(text, "got {\"k\":1}.");
    }

    #[test]
    fn test_missing_reference_kept_literal() {
        let b = bindings(&[]);
        let (text, missing) = resolve_text("value: $ghost", &b);
        assert_eq!(text, "value: $ghost");
        assert_eq!(missing, ["ghost".to_string()].into_iter().collect());
    }

    #[test]
    fn test_missing_reported_once_per_name() {
        let b = bindings(&[]);
        let resolution = resolve_value(&json!(["$x", "$x", {"y": "$x"}]), &b);
        assert_eq!(resolution.missing.len(), 1);
    }

    #[test]
    fn test_longest_greedy_name_match() {
        let b = bindings(&[("abc", json!("long")), ("ab", json!("short"))]);
        let (text, _) = resolve_text("$abcd and $abc and $ab", &b);
        // `$abcd` matches the name `abcd`, which is unbound.
        assert_eq!(text, "$abcd and long and short");
    }

    #[test]
    fn test_dollar_without_ident_is_literal() {
        let b = bindings(&[("a", json!(1))]);
        let (text, missing) = resolve_text("cost: $5 and $ and $a", &b);
        assert_eq!(text, "cost: $5 and $ and 1");
        assert!(missing.is_empty());
    }

    #[test]
    fn test_nested_structures() {
        let b = bindings(&[("page", json!("<html>")), ("code", json!(200))]);
        let resolution = resolve_value(
            &json!({"req": {"body": "$page", "meta": ["status $code", true, null]}}),
            &b,
        );
        assert_eq!(
            resolution.value,
            json!({"req": {"body": "<html>", "meta": ["status 200", true, null]}})
        );
    }

    #[test]
    fn test_bound_null_promotes_to_null() {
        let b = bindings(&[("gone", Value::Null)]);
        let resolution = resolve_value(&json!({"x": "$gone"}), &b);
        assert_eq!(resolution.value, json!({"x": null}));
        assert!(resolution.missing.is_empty());
    }

    #[test]
    fn test_collect_refs() {
        let refs = collect_refs(&json!({"a": "$x", "b": ["$y and $z"], "c": 5}));
        let expected: BTreeSet<String> =
            ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        assert_eq!(refs, expected);
    }

    #[test]
    fn test_non_ascii_text_around_refs() {
        let b = bindings(&[("t", json!("ok"))]);
        let (text, _) = resolve_text("résultat: $t — fin", &b);
        assert_eq!(text, "résultat: ok — fin");
    }

    #[test]
    fn test_single_pass_no_recursive_expansion() {
        // A bound value containing reference-shaped text is not rescanned.
        let b = bindings(&[("a", json!("$b")), ("b", json!("boom"))]);
        let (text, _) = resolve_text("ref $a", &b);
        assert_eq!(text, "ref $b");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// resolve(resolve(x)) == resolve(x) when bound values contain
            /// no reference-shaped text.
            #[test]
            fn prop_fixpoint_for_ref_free_bindings(
                prefix in "[a-z ]{0,8}",
                suffix in "[a-z ]{0,8}",
                bound in "[a-z0-9 ]{0,12}",
            ) {
                let b = bindings(&[("v", Value::String(bound))]);
                let input = format!("{}$v{}", prefix, suffix);
                let (once, _) = resolve_text(&input, &b);
                let (twice, _) = resolve_text(&once, &b);
                prop_assert_eq!(once, twice);
            }
        }
    }
}
