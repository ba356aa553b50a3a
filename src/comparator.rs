use serde_json::{Map, Number, Value};

/// Rewrites `value` into its canonical form.
///
/// Object keys end up sorted, arrays keep their order, and numbers are
/// normalized by value so that `5`, `5.0` and `5e0` share one representation.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(canonical_number(n)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(fields) => {
            let mut entries: Vec<_> = fields.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        other => other.clone(),
    }
}

fn canonical_number(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Number::from(f as i64)
        }
        Some(f) if f.fract() == 0.0 && f >= 0.0 && f < u64::MAX as f64 => Number::from(f as u64),
        _ => n.clone(),
    }
}

/// Serialization used both for equality and for rendering diagnostics
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Canonical structural equality between a produced and an expected value
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    canonical_string(actual) == canonical_string(expected)
}
