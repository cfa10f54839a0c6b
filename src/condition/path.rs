//! Dotted-path lookup into JSON values

use serde_json::Value;

/// Resolve `a.b.0.c` against a JSON value
///
/// Object segments are keys, array segments are zero-based indices.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_lookup() {
        let ctx = json!({"steps": {"fetch": {"items": [{"id": 7}]}}});
        assert_eq!(lookup(&ctx, "steps.fetch.items.0.id"), Some(&json!(7)));
    }

    #[test]
    fn test_missing_segments() {
        let ctx = json!({"a": {"b": 1}});
        assert_eq!(lookup(&ctx, "a.c"), None);
        assert_eq!(lookup(&ctx, "a.b.c"), None);
        assert_eq!(lookup(&ctx, ""), None);
    }

    #[test]
    fn test_null_is_present() {
        let ctx = json!({"a": null});
        assert_eq!(lookup(&ctx, "a"), Some(&Value::Null));
    }
}
