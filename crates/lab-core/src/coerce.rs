use serde_json::{Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Integer,
    Float,
    Boolean,
    Structured,
    Text,
}

impl TypeClass {
    pub fn classify(declared: Option<&str>) -> Self {
        let t = match declared {
            Some(t) if !t.trim().is_empty() => t.trim().to_lowercase(),
            _ => return TypeClass::Text,
        };
        let has = |needles: &[&str]| needles.iter().any(|n| t.contains(n));
        if has(&["int"]) {
            TypeClass::Integer
        } else if has(&["float", "number", "double"]) {
            TypeClass::Float
        } else if has(&["bool"]) {
            TypeClass::Boolean
        } else if has(&["json", "dict", "list", "object"]) {
            TypeClass::Structured
        } else {
            TypeClass::Text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoerceError {
    #[error("expected an integer, got {0:?}")]
    NotInteger(String),
    #[error("expected a finite number, got {0:?}")]
    NotNumber(String),
    #[error("expected true/false, got {0:?}")]
    NotBoolean(String),
    #[error("expected structured JSON, got {raw:?}: {reason}")]
    NotStructured { raw: String, reason: String },
}

const TRUTHY: &[&str] = &["true", "1", "yes", "y"];
const FALSY: &[&str] = &["false", "0", "no", "n"];

fn parse_finite(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

// Mismatches are errors; nothing is coerced on a best-effort basis.
pub fn parse_typed(raw: &str, declared: Option<&str>) -> Result<Value, CoerceError> {
    let text = raw.trim();
    match TypeClass::classify(declared) {
        TypeClass::Integer => {
            let n = parse_finite(text).ok_or_else(|| CoerceError::NotInteger(text.to_string()))?;
            if n.fract() != 0.0 || n.abs() > i64::MAX as f64 {
                return Err(CoerceError::NotInteger(text.to_string()));
            }
            Ok(Value::from(n as i64))
        }
        TypeClass::Float => parse_finite(text)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| CoerceError::NotNumber(text.to_string())),
        TypeClass::Boolean => {
            let lowered = text.to_lowercase();
            if TRUTHY.contains(&lowered.as_str()) {
                Ok(Value::Bool(true))
            } else if FALSY.contains(&lowered.as_str()) {
                Ok(Value::Bool(false))
            } else {
                Err(CoerceError::NotBoolean(text.to_string()))
            }
        }
        TypeClass::Structured => {
            serde_json::from_str(text).map_err(|e| CoerceError::NotStructured {
                raw: text.to_string(),
                reason: e.to_string(),
            })
        }
        TypeClass::Text => Ok(Value::String(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_matches_by_substring() {
        assert_eq!(TypeClass::classify(Some("int")), TypeClass::Integer);
        assert_eq!(TypeClass::classify(Some("Integer")), TypeClass::Integer);
        assert_eq!(TypeClass::classify(Some("float64")), TypeClass::Float);
        assert_eq!(TypeClass::classify(Some("Number")), TypeClass::Float);
        assert_eq!(TypeClass::classify(Some("double")), TypeClass::Float);
        assert_eq!(TypeClass::classify(Some("bool")), TypeClass::Boolean);
        assert_eq!(TypeClass::classify(Some("List[int]")), TypeClass::Integer);
        assert_eq!(TypeClass::classify(Some("dict")), TypeClass::Structured);
        assert_eq!(TypeClass::classify(Some("JSON")), TypeClass::Structured);
        assert_eq!(TypeClass::classify(Some("str")), TypeClass::Text);
        assert_eq!(TypeClass::classify(Some("  ")), TypeClass::Text);
        assert_eq!(TypeClass::classify(None), TypeClass::Text);
    }

    #[test]
    fn integers_must_be_exact() {
        assert_eq!(parse_typed("700", Some("int")), Ok(json!(700)));
        assert_eq!(parse_typed(" -3 ", Some("int")), Ok(json!(-3)));
        assert_eq!(parse_typed("1e3", Some("int")), Ok(json!(1000)));
        assert!(parse_typed("7.5", Some("int")).is_err());
        assert!(parse_typed("abc", Some("int")).is_err());
        assert!(parse_typed("inf", Some("int")).is_err());
        assert!(parse_typed("NaN", Some("int")).is_err());
    }

    #[test]
    fn floats_reject_non_finite() {
        assert_eq!(parse_typed("0.25", Some("float")), Ok(json!(0.25)));
        assert!(parse_typed("infinity", Some("float")).is_err());
        assert!(parse_typed("fast", Some("double")).is_err());
    }

    #[test]
    fn booleans_accept_fixed_tokens() {
        for t in ["true", "TRUE", "1", "yes", "Y"] {
            assert_eq!(parse_typed(t, Some("bool")), Ok(json!(true)), "{}", t);
        }
        for t in ["false", "0", "No", "n"] {
            assert_eq!(parse_typed(t, Some("boolean")), Ok(json!(false)), "{}", t);
        }
        assert_eq!(
            parse_typed("maybe", Some("bool")),
            Err(CoerceError::NotBoolean("maybe".to_string()))
        );
    }

    #[test]
    fn structured_requires_valid_json() {
        assert_eq!(parse_typed("[1, 2]", Some("list")), Ok(json!([1, 2])));
        assert_eq!(parse_typed("{\"a\": 1}", Some("dict")), Ok(json!({"a": 1})));
        assert!(matches!(
            parse_typed("{a: 1}", Some("json")),
            Err(CoerceError::NotStructured { .. })
        ));
    }

    #[test]
    fn unknown_types_pass_text_through() {
        assert_eq!(parse_typed(" left ", Some("str")), Ok(json!("left")));
        assert_eq!(parse_typed("12", None), Ok(json!("12")));
    }
}
