//! Request-content matching for mock mode
//!
//! The "fine match" applied after candidate lookup: header equality
//! after redaction and dynamic-field removal, and body equality that is
//! structural for JSON object payloads under the fuzzy strategies.
//! String comparison normalizes canonical UUIDs so re-generated
//! identifiers do not break matching.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::config::MatchingStrategy;
use crate::rest::RestHandler;

/// Placeholder every canonical UUID maps to before string comparison.
const UUID_PLACEHOLDER: &str = "UUID_PLACEHOLDER";

/// Headers whose values change between otherwise-identical requests;
/// removed from both sides under the fuzzy strategies.
const DYNAMIC_HEADERS: [&str; 5] = [
    "Content-Length",
    "Content-Md5",
    "Date",
    "If-None-Match",
    "If-Modified-Since",
];

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^[0-9a-f]{8}-([0-9a-f]{4}-){3}[0-9a-f]{12}$").expect("static pattern")
    })
}

fn is_uuid(s: &str) -> bool {
    uuid_pattern().is_match(s)
}

fn normalize_string(s: &str) -> &str {
    if is_uuid(s) {
        UUID_PLACEHOLDER
    } else {
        s
    }
}

/// Compare serialized header maps. Both sides are parsed, stripped of
/// dynamic and ignored fields under fuzzy strategies, re-serialized
/// with sorted keys, redacted, and compared for equality.
pub fn headers_match(
    recorded_headers: &str,
    current_headers: &str,
    strategy: MatchingStrategy,
    ignore_fields: &[String],
    handler: &RestHandler,
) -> bool {
    let Some(mut recorded) = parse_header_map(recorded_headers) else {
        return false;
    };
    let Some(mut current) = parse_header_map(current_headers) else {
        return false;
    };

    if strategy.is_fuzzy() {
        for header in DYNAMIC_HEADERS {
            remove_case_insensitive(&mut recorded, header);
            remove_case_insensitive(&mut current, header);
        }
        for field in ignore_fields {
            remove_case_insensitive(&mut recorded, field);
            remove_case_insensitive(&mut current, field);
        }
    }

    let recorded_json = serde_json::to_string(&recorded).unwrap_or_default();
    let current_json = serde_json::to_string(&current).unwrap_or_default();
    handler.redact(&recorded_json) == handler.redact(&current_json)
}

fn parse_header_map(raw: &str) -> Option<BTreeMap<String, String>> {
    if raw.is_empty() {
        return Some(BTreeMap::new());
    }
    serde_json::from_str(raw).ok()
}

fn remove_case_insensitive(map: &mut BTreeMap<String, String>, key: &str) {
    map.retain(|k, _| !k.eq_ignore_ascii_case(key));
}

/// Compare request bodies per strategy. Under fuzzy strategies two
/// object-style JSON bodies are compared structurally; everything else
/// falls back to byte equality.
pub fn bodies_match(
    recorded: &[u8],
    current: &[u8],
    strategy: MatchingStrategy,
    ignore_fields: &[String],
) -> bool {
    if !strategy.is_fuzzy() {
        return recorded == current;
    }

    if recorded.is_empty() && current.is_empty() {
        return true;
    }

    let recorded_json = serde_json::from_slice::<Value>(recorded).ok();
    let current_json = serde_json::from_slice::<Value>(current).ok();
    match (recorded_json, current_json) {
        (Some(rec @ Value::Object(_)), Some(cur @ Value::Object(_))) => {
            let unordered = strategy == MatchingStrategy::FuzzyUnordered;
            json_values_match(&rec, &cur, unordered, ignore_fields)
        }
        _ => recorded == current,
    }
}

/// Recursive structural equivalence.
///
/// Objects need the same key set with each value matching; keys in
/// `ignore_fields` are skipped. Arrays need the same length, compared
/// element-wise or as an order-insensitive bipartite match. Strings are
/// equal after UUID normalization. Numbers compare by value.
pub fn json_values_match(
    recorded: &Value,
    current: &Value,
    unordered: bool,
    ignore_fields: &[String],
) -> bool {
    match (recorded, current) {
        (Value::Null, Value::Null) => true,
        (Value::Object(rec), Value::Object(cur)) => {
            if rec.len() != cur.len() {
                return false;
            }
            rec.iter().all(|(key, rec_value)| {
                if ignore_fields.iter().any(|f| f == key) {
                    return cur.contains_key(key);
                }
                match cur.get(key) {
                    Some(cur_value) => {
                        json_values_match(rec_value, cur_value, unordered, ignore_fields)
                    }
                    None => false,
                }
            })
        }
        (Value::Array(rec), Value::Array(cur)) => {
            if rec.len() != cur.len() {
                return false;
            }
            if unordered {
                unordered_arrays_match(rec, cur, ignore_fields)
            } else {
                rec.iter()
                    .zip(cur.iter())
                    .all(|(a, b)| json_values_match(a, b, unordered, ignore_fields))
            }
        }
        (Value::String(rec), Value::String(cur)) => {
            normalize_string(rec) == normalize_string(cur)
        }
        (Value::Number(rec), Value::Number(cur)) => rec.as_f64() == cur.as_f64(),
        (Value::Bool(rec), Value::Bool(cur)) => rec == cur,
        _ => false,
    }
}

/// Each recorded element must pair with exactly one unmatched current
/// element under the same recursive rule.
fn unordered_arrays_match(recorded: &[Value], current: &[Value], ignore_fields: &[String]) -> bool {
    let mut matched = vec![false; current.len()];
    recorded.iter().all(|rec_elem| {
        for (i, cur_elem) in current.iter().enumerate() {
            if matched[i] {
                continue;
            }
            if json_values_match(rec_elem, cur_elem, true, ignore_fields) {
                matched[i] = true;
                return true;
            }
        }
        false
    })
}
