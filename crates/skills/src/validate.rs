use serde_json::Value;

/// Checks `args` against a JSON schema. The error string lists every
/// violation so the model can correct its call.
pub fn validate_arguments(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid parameter schema: {}", e))?;

    let problems: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(format!("invalid arguments: {}", problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })
    }

    #[test]
    fn test_valid_arguments() {
        assert!(validate_arguments(&add_schema(), &json!({"a": 2, "b": 3})).is_ok());
    }

    #[test]
    fn test_missing_and_mistyped_arguments() {
        let err = validate_arguments(&add_schema(), &json!({"a": "two"})).unwrap_err();
        assert!(err.starts_with("invalid arguments"));
        assert!(err.contains("\"b\""));
        assert!(err.contains("/a"));
    }

    #[test]
    fn test_broken_schema_reported() {
        let err = validate_arguments(&json!({"type": "notatype"}), &json!({})).unwrap_err();
        assert!(err.starts_with("invalid parameter schema"));
    }
}
