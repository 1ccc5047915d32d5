use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStep {
    #[serde(default)]
    pub id: Option<i64>,
    pub order_index: usize,
    pub step_name: String,
    pub task_type: String,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

impl ProtocolStep {
    pub fn param(&self, key: &str) -> Option<(&str, &Value)> {
        let wanted = crate::normalize_name(key);
        self.params
            .as_ref()?
            .iter()
            .find(|(k, _)| crate::normalize_name(k) == wanted)
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn param_keys(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .flat_map(|m| m.keys())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub steps: Vec<ProtocolStep>,
}

impl Protocol {
    // Steps ordered by `order_index`; the backend does not guarantee response order.
    pub fn ordered_steps(&self) -> Vec<&ProtocolStep> {
        let mut steps: Vec<&ProtocolStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order_index);
        steps
    }

    pub fn step(&self, order_index: usize) -> Option<&ProtocolStep> {
        self.steps.iter().find(|s| s.order_index == order_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStepCreate {
    pub order_index: usize,
    pub step_name: String,
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCreate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<ProtocolStepCreate>,
}
