//! Result summarization: bounded views of arbitrary JSON values.
//!
//! Two distinct ceilings apply, in order: the per-level caps (array head,
//! string length) while descending the value, then a global character
//! ceiling over the rendered response. Summarization is idempotent under
//! fixed parameters: re-truncating a truncated prefix reproduces the same
//! prefix, and an already-marked array is recognized and left alone.

use serde_json::Value;

/// Default array head kept per nesting level.
pub const DEFAULT_MAX_ITEMS: usize = 5;
/// Array head used by the `execute` surface.
pub const EXECUTE_MAX_ITEMS: usize = 10;
/// Array head used by the `list` and `search` surfaces.
pub const LIST_MAX_ITEMS: usize = 20;
/// Default string-length cap.
pub const DEFAULT_MAX_STRING_LENGTH: usize = 500;
/// Global ceiling on rendered response characters.
pub const MAX_RESPONSE_CHARS: usize = 25_000;

const STRING_MARKER: &str = "... (truncated)";
const RESPONSE_NOTICE: &str = "\n... (response truncated)";

/// Per-level truncation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Array elements kept per level.
    pub max_items: usize,
    /// Characters kept per string.
    pub max_string_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

impl Limits {
    /// The `execute` surface defaults.
    pub fn for_execute() -> Self {
        Self {
            max_items: EXECUTE_MAX_ITEMS,
            ..Self::default()
        }
    }

    /// The `list` / `search` surface defaults.
    pub fn for_listing() -> Self {
        Self {
            max_items: LIST_MAX_ITEMS,
            ..Self::default()
        }
    }
}

/// Summarize a value under the per-level caps. Returns the bounded value and
/// whether anything was cut.
pub fn summarize_value(value: &Value, limits: Limits) -> (Value, bool) {
    let mut truncated = false;
    let bounded = bound(value, limits, &mut truncated);
    (bounded, truncated)
}

fn items_marker(omitted: usize) -> String {
    format!("... ({omitted} more items)")
}

fn is_items_marker(value: &Value) -> bool {
    matches!(
        value,
        Value::String(s) if s.starts_with("... (") && s.ends_with(" more items)")
    )
}

fn bound(value: &Value, limits: Limits, truncated: &mut bool) -> Value {
    match value {
        Value::String(s) => {
            let count = s.chars().count();
            let marker_len = STRING_MARKER.chars().count();
            // A previously truncated string (prefix + marker) passes through.
            let already_marked = s.ends_with(STRING_MARKER)
                && count <= limits.max_string_length.saturating_add(marker_len);
            if count > limits.max_string_length && !already_marked {
                *truncated = true;
                let head: String = s.chars().take(limits.max_string_length).collect();
                Value::String(format!("{head}{STRING_MARKER}"))
            } else {
                value.clone()
            }
        }
        Value::Array(items) => {
            // An already-summarized array (head + marker) passes through so
            // summarization stays idempotent.
            let already_marked = items.len() == limits.max_items.saturating_add(1)
                && items.last().is_some_and(is_items_marker);
            if items.len() <= limits.max_items || already_marked {
                let keep = if already_marked {
                    limits.max_items
                } else {
                    items.len()
                };
                let mut bounded: Vec<Value> = items[..keep]
                    .iter()
                    .map(|item| bound(item, limits, truncated))
                    .collect();
                if already_marked {
                    bounded.push(items[keep].clone());
                }
                Value::Array(bounded)
            } else {
                *truncated = true;
                let mut bounded: Vec<Value> = items[..limits.max_items]
                    .iter()
                    .map(|item| bound(item, limits, truncated))
                    .collect();
                bounded.push(Value::String(items_marker(items.len() - limits.max_items)));
                Value::Array(bounded)
            }
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), bound(v, limits, truncated)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Enforce the global character ceiling over a rendered response, appending
/// a truncation notice when it bites.
pub fn enforce_response_ceiling(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let head: String = text.chars().take(max_chars).collect();
    (format!("{head}{RESPONSE_NOTICE}"), true)
}
