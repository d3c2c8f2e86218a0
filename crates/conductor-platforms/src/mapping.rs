use std::collections::HashMap;

use serde_json::{Map, Value};

use conductor_types::{ActionType, Platform};

/// Key-rename rules applied when the fallback dispatcher re-routes an action
/// from one platform to another. The mapping belongs to the adapter
/// registry, not to the decision: producers stay platform-agnostic.
///
/// Unmapped keys pass through unchanged, so adapters only declare the keys
/// whose dialect differs (Notion "status_property" vs Trello "list_id").
#[derive(Debug, Clone, Default)]
pub struct FieldMappings {
    rules: HashMap<(Platform, Platform, ActionType), Vec<(String, String)>>,
}

impl FieldMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in renames between the stock platform dialects.
    pub fn with_default_rules() -> Self {
        let mut mappings = Self::new();
        mappings.add_rule(
            Platform::Notion,
            Platform::Trello,
            ActionType::CreateTask,
            &[("status_property", "list_id"), ("page_title", "name")],
        );
        mappings.add_rule(
            Platform::Notion,
            Platform::Trello,
            ActionType::UpdateTask,
            &[("status_property", "list_id"), ("page_id", "card_id")],
        );
        mappings.add_rule(
            Platform::Trello,
            Platform::Notion,
            ActionType::CreateTask,
            &[("list_id", "status_property"), ("name", "page_title")],
        );
        mappings.add_rule(
            Platform::Slack,
            Platform::Gmail,
            ActionType::Notify,
            &[("channel", "to"), ("message", "body")],
        );
        mappings.add_rule(
            Platform::Sheets,
            Platform::Drive,
            ActionType::AppendRow,
            &[("spreadsheet_id", "file_id")],
        );
        mappings
    }

    pub fn add_rule(
        &mut self,
        from: Platform,
        to: Platform,
        action_type: ActionType,
        renames: &[(&str, &str)],
    ) {
        self.rules.insert(
            (from, to, action_type),
            renames
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        );
    }

    /// Translate `params` from one platform's dialect to another's.
    /// Identity when no rule is registered or params are not an object.
    pub fn map_params(
        &self,
        action_type: ActionType,
        from: Platform,
        to: Platform,
        params: &Value,
    ) -> Value {
        let Some(renames) = self.rules.get(&(from, to, action_type)) else {
            return params.clone();
        };
        let Some(obj) = params.as_object() else {
            return params.clone();
        };
        let mut out = Map::with_capacity(obj.len());
        for (key, value) in obj {
            let mapped = renames
                .iter()
                .find(|(src, _)| src == key)
                .map(|(_, dst)| dst.clone())
                .unwrap_or_else(|| key.clone());
            out.insert(mapped, value.clone());
        }
        Value::Object(out)
    }
}
