use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamDescriptor>,
}

impl TaskSpec {
    pub fn param(&self, key: &str) -> Option<(&str, &ParamDescriptor)> {
        let wanted = normalize_name(key);
        self.params
            .iter()
            .find(|(k, _)| normalize_name(k) == wanted)
            .map(|(k, d)| (k.as_str(), d))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    by_name: BTreeMap<String, TaskSpec>,
}

impl TaskCatalog {
    pub fn new(specs: impl IntoIterator<Item = TaskSpec>) -> Self {
        let mut by_name = BTreeMap::new();
        for spec in specs {
            by_name.insert(normalize_name(&spec.name), spec);
        }
        Self { by_name }
    }

    pub fn get(&self, task_type: &str) -> Option<&TaskSpec> {
        self.by_name.get(&normalize_name(task_type))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSpec> {
        self.by_name.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Graduation {
    NTrials { current_trial: u64 },
}

impl Graduation {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        match self {
            Graduation::NTrials { current_trial } => json!({
                "type": "NTrials",
                "value": { "current_trial": current_trial }
            }),
        }
    }

    pub fn trial_count(&self) -> u64 {
        match self {
            Graduation::NTrials { current_trial } => *current_trial,
        }
    }
}

pub fn display_value(key: &str, value: &Value) -> String {
    if normalize_name(key) == crate::GRADUATION_KEY {
        if let Some(g) = Graduation::from_value(value) {
            return g.trial_count().to_string();
        }
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}
