//! Removal of sensitive fields before content leaves the node.
//!
//! Keys are matched case-insensitively against a denylist, at any depth.

use serde_json::Value;

/// Key names that are never transmitted.
pub const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwordhash",
    "resetpasswordtoken",
    "confirmationtoken",
    "token",
    "accesstoken",
    "refreshtoken",
    "apikey",
    "secret",
    "clientsecret",
    "privatekey",
];

/// Whether a key names a sensitive field.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect();
    SENSITIVE_KEYS.contains(&normalized.as_str())
}

/// Return a copy of `value` with every sensitive key removed, recursively.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !is_sensitive_key(k))
                .map(|(k, v)| (k.clone(), sanitize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_strips_nested_and_array_fields() {
        let input = json!({
            "title": "Ship log",
            "password": "hunter2",
            "author": {
                "name": "Ada",
                "reset_password_token": "abc",
                "API-Key": "k"
            },
            "items": [{"secret": 1, "keep": 2}]
        });

        let out = sanitize(&input);
        assert_eq!(
            out,
            json!({
                "title": "Ship log",
                "author": {"name": "Ada"},
                "items": [{"keep": 2}]
            })
        );
    }

    #[test]
    fn test_scalars_untouched() {
        assert_eq!(sanitize(&json!(5)), json!(5));
        assert_eq!(sanitize(&json!("password")), json!("password"));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map(
                    prop_oneof![Just("password".to_string()), Just("token".to_string()), "[a-z]{1,6}"],
                    inner,
                    0..4
                )
                .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn has_sensitive(value: &Value) -> bool {
        match value {
            Value::Object(map) => map.iter().any(|(k, v)| is_sensitive_key(k) || has_sensitive(v)),
            Value::Array(items) => items.iter().any(has_sensitive),
            _ => false,
        }
    }

    proptest! {
        #[test]
        fn sanitized_output_has_no_sensitive_keys(value in arb_json()) {
            prop_assert!(!has_sensitive(&sanitize(&value)));
        }

        #[test]
        fn sanitize_is_idempotent(value in arb_json()) {
            let once = sanitize(&value);
            prop_assert_eq!(sanitize(&once), once);
        }
    }
}
