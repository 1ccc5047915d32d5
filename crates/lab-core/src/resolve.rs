use lab_schemas::{display_value, ProtocolStep, TaskSpec};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub fn normalize_key(key: &str) -> String {
    lab_schemas::normalize_name(key)
}

pub fn is_populated(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Protocol,
    Default,
    Missing,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueSource::Protocol => "protocol",
            ValueSource::Default => "default",
            ValueSource::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Effective {
    pub value: Option<Value>,
    pub source: ValueSource,
}

impl Effective {
    fn missing() -> Self {
        Self {
            value: None,
            source: ValueSource::Missing,
        }
    }
}

pub fn effective_value(step: &ProtocolStep, spec: Option<&TaskSpec>, key: &str) -> Effective {
    if let Some((_, v)) = step.param(key) {
        if is_populated(Some(v)) {
            return Effective {
                value: Some(v.clone()),
                source: ValueSource::Protocol,
            };
        }
    }
    let default = spec
        .and_then(|s| s.param(key))
        .and_then(|(_, d)| d.default.as_ref());
    if is_populated(default) {
        return Effective {
            value: default.cloned(),
            source: ValueSource::Default,
        };
    }
    Effective::missing()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamRow {
    pub key: String,
    pub tag: Option<String>,
    pub value_type: Option<String>,
    pub effective: Effective,
    pub override_value: Option<Value>,
}

impl ParamRow {
    pub fn is_overridden(&self) -> bool {
        self.override_value.is_some()
    }

    pub fn shown(&self) -> Option<&Value> {
        self.override_value
            .as_ref()
            .or(self.effective.value.as_ref())
    }

    pub fn shown_text(&self) -> String {
        self.shown()
            .map(|v| display_value(&self.key, v))
            .unwrap_or_default()
    }
}

// Row order follows first appearance: protocol keys, then schema keys, then
// override-only keys. Display casing prefers the protocol, then the schema.
pub fn resolve_step(
    step: &ProtocolStep,
    spec: Option<&TaskSpec>,
    overrides: Option<&Map<String, Value>>,
) -> Vec<ParamRow> {
    let mut order: Vec<String> = Vec::new();
    let mut canonical: BTreeMap<String, String> = BTreeMap::new();
    let mut note = |key: &str| {
        let id = normalize_key(key);
        if !canonical.contains_key(&id) {
            canonical.insert(id.clone(), key.to_string());
            order.push(id);
        }
    };
    for key in step.param_keys() {
        note(key);
    }
    if let Some(spec) = spec {
        for key in spec.params.keys() {
            note(key);
        }
    }
    if let Some(overrides) = overrides {
        for key in overrides.keys() {
            note(key);
        }
    }

    order
        .into_iter()
        .map(|id| {
            let key = canonical.remove(&id).unwrap_or_else(|| id.clone());
            let descriptor = spec.and_then(|s| s.param(&key)).map(|(_, d)| d);
            let override_value = overrides.and_then(|m| {
                m.iter()
                    .find(|(k, _)| normalize_key(k) == id)
                    .map(|(_, v)| v.clone())
            });
            ParamRow {
                effective: effective_value(step, spec, &key),
                tag: descriptor.and_then(|d| d.tag.clone()),
                value_type: descriptor.and_then(|d| d.value_type.clone()),
                key,
                override_value,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_schemas::ParamDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn step(params: Value) -> ProtocolStep {
        ProtocolStep {
            id: None,
            order_index: 0,
            step_name: "nafc".to_string(),
            task_type: "Nafc".to_string(),
            params: params.as_object().cloned(),
        }
    }

    fn spec(default: Option<Value>) -> TaskSpec {
        let mut params = BTreeMap::new();
        params.insert(
            "iti".to_string(),
            ParamDescriptor {
                tag: Some("Inter-trial interval".to_string()),
                value_type: Some("int".to_string()),
                default,
            },
        );
        TaskSpec {
            name: "Nafc".to_string(),
            params,
        }
    }

    #[test]
    fn populated_excludes_null_empty_string_and_empty_object() {
        assert!(!is_populated(None));
        assert!(!is_populated(Some(&Value::Null)));
        assert!(!is_populated(Some(&json!(""))));
        assert!(!is_populated(Some(&json!({}))));
        assert!(is_populated(Some(&json!(0))));
        assert!(is_populated(Some(&json!(false))));
        assert!(is_populated(Some(&json!([]))));
        assert!(is_populated(Some(&json!(" "))));
    }

    #[test]
    fn source_priority_over_all_layer_combinations() {
        let layer_values = [None, Some(Value::Null), Some(json!("")), Some(json!({})), Some(json!(900))];
        for protocol in &layer_values {
            for default in &layer_values {
                let params = match protocol {
                    Some(v) => json!({ "ITI": v }),
                    None => json!({}),
                };
                let got = effective_value(&step(params), Some(&spec(default.clone())), "iti");
                let expected = if is_populated(protocol.as_ref()) {
                    ValueSource::Protocol
                } else if is_populated(default.as_ref()) {
                    ValueSource::Default
                } else {
                    ValueSource::Missing
                };
                assert_eq!(got.source, expected, "protocol={:?} default={:?}", protocol, default);
                if expected == ValueSource::Missing {
                    assert_eq!(got.value, None);
                }
            }
        }
    }

    #[test]
    fn default_applies_when_protocol_omits_key() {
        let got = effective_value(&step(json!({})), Some(&spec(Some(json!(500)))), "iti");
        assert_eq!(
            got,
            Effective {
                value: Some(json!(500)),
                source: ValueSource::Default
            }
        );
    }

    #[test]
    fn case_variants_collapse_to_one_row_with_protocol_casing() {
        let overrides = json!({ "iTi": 650 });
        let rows = resolve_step(
            &step(json!({ "ITI": 700, "graduation": { "type": "NTrials", "value": { "current_trial": 5 } } })),
            Some(&spec(Some(json!(500)))),
            overrides.as_object(),
        );
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["ITI", "graduation"]);
        assert_eq!(rows[0].effective.source, ValueSource::Protocol);
        assert_eq!(rows[0].override_value, Some(json!(650)));
        assert_eq!(rows[0].tag.as_deref(), Some("Inter-trial interval"));
        assert_eq!(rows[0].shown_text(), "650");
        assert_eq!(rows[1].shown_text(), "5");
    }

    #[test]
    fn override_only_keys_still_get_a_row() {
        let overrides = json!({ "reward": 20 });
        let rows = resolve_step(&step(json!({})), None, overrides.as_object());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "reward");
        assert_eq!(rows[0].effective.source, ValueSource::Missing);
        assert!(rows[0].is_overridden());
    }
}
