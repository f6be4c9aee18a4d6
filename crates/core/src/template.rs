// Placeholder rendering against node input

use crate::types::Payload;
use serde_json::Value;

/// Resolve a dot-separated path through nested objects
pub fn lookup<'a>(data: &'a Payload, path: &str) -> Option<&'a Value> {
    let mut keys = path.split('.');
    let mut value = data.get(keys.next()?)?;

    for key in keys {
        value = value.as_object()?.get(key)?;
    }

    Some(value)
}

/// Text form of a value when substituted into a string
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `{key}` and `{a.b}` placeholders with values from `data`.
/// Placeholders that do not resolve are left untouched.
pub fn render(text: &str, data: &Payload) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('{') {
        result.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find('}') {
            Some(end) => match resolve_placeholder(&after[..end], data) {
                Some(value) => {
                    result.push_str(&value);
                    rest = &after[end + 1..];
                }
                None => {
                    result.push('{');
                    rest = after;
                }
            },
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

/// Render every string inside a JSON structure
pub fn render_value(value: &Value, data: &Payload) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, data)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, data)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Placeholder names appearing in a template, sorted and deduplicated
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];
        if is_placeholder_name(name) {
            names.push(name.to_string());
            rest = &after[end + 1..];
        } else {
            rest = after;
        }
    }

    names.sort();
    names.dedup();
    names
}

/// Extract `name` from a whole-string `{{name}}` reference
pub fn parse_reference(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?.trim();
    is_placeholder_name(inner).then_some(inner)
}

fn resolve_placeholder(name: &str, data: &Payload) -> Option<String> {
    if !is_placeholder_name(name) {
        return None;
    }
    lookup(data, name).map(value_to_text)
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}
