//! Field access for loosely shaped JSON rows (relay events, legacy exports).
//!
//! Every lookup tries each key as given (snake_case) and in camelCase, and
//! treats `null` the same as a missing key.

use serde_json::Value;

pub(crate) fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for c in snake.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.trim().chars() {
        if c.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

/// First present, non-null value among `keys`.
pub(crate) fn lookup<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        for candidate in [key.to_string(), camel_case(key)] {
            match v.get(&candidate) {
                Some(Value::Null) | None => continue,
                Some(found) => return Some(found),
            }
        }
    }
    None
}

/// Trimmed, non-blank string. Numbers are accepted and stringified.
pub(crate) fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    match lookup(v, keys)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn i64_any(v: &Value, keys: &[&str]) -> Option<i64> {
    match lookup(v, keys)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn bool_any(v: &Value, keys: &[&str]) -> Option<bool> {
    match lookup(v, keys)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n == 1),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Array of strings, or a JSON-encoded array inside a string.
pub(crate) fn string_list_any(v: &Value, keys: &[&str]) -> Option<Vec<String>> {
    match lookup(v, keys)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) => serde_json::from_str(s).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_conversion() {
        assert_eq!(camel_case("order_item_id"), "orderItemId");
        assert_eq!(snake_case("orderItems"), "order_items");
        assert_eq!(snake_case("cash-movements"), "cash_movements");
        assert_eq!(snake_case("kds_tickets"), "kds_tickets");
    }

    #[test]
    fn test_lookup_skips_null_and_tries_camel_case() {
        let row = json!({ "order_id": null, "orderId": "o-1", "qty": " 3 " });
        assert_eq!(str_any(&row, &["order_id"]).as_deref(), Some("o-1"));
        assert_eq!(i64_any(&row, &["quantity", "qty"]), Some(3));
        assert_eq!(str_any(&row, &["missing"]), None);
    }

    #[test]
    fn test_bool_and_list_forms() {
        let row = json!({ "pendingSync": "yes", "checklist": "[\"a\",\"b\"]" });
        assert_eq!(bool_any(&row, &["pending_sync"]), Some(true));
        assert_eq!(
            string_list_any(&row, &["checklist"]),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
