use dashmap::DashMap;
use handlebars::Handlebars;
use serde_json::Value;
use tracing::warn;

/// Shared variable namespace for one run.
///
/// Every executor in a run holds the same manager, so writes made by one
/// node are visible to every node that executes after it. Concurrent
/// writers to the same key race; the map keeps whichever write lands last.
#[derive(Debug, Default)]
pub struct VariableManager {
    vars: DashMap<String, Value>,
}

impl VariableManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.vars.get(key).map(|v| v.value().clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.vars.remove(key).map(|(_, v)| v)
    }

    /// Snapshot of the whole namespace.
    pub fn get_all(&self) -> serde_json::Map<String, Value> {
        self.vars
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Substitute `{{variable}}` placeholders against the current namespace.
    ///
    /// A template that fails to render (unknown variable, broken syntax) is
    /// returned unchanged so a bad placeholder never kills a run.
    pub fn resolve_template(&self, template: &str) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        let context = Value::Object(self.get_all());
        match handlebars.render_template(template, &context) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("template left unresolved: {e}");
                template.to_string()
            }
        }
    }

    /// Deep template resolution: strings are substituted, arrays and objects
    /// are walked, everything else passes through untouched.
    pub fn resolve_template_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_template(s)),
            Value::Array(items) => Value::Array(
                items.iter().map(|v| self.resolve_template_value(v)).collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_template_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_has_remove() {
        let vars = VariableManager::new();
        assert!(!vars.has("name"));
        vars.set("name", json!("ops"));
        assert!(vars.has("name"));
        assert_eq!(vars.get("name"), Some(json!("ops")));
        assert_eq!(vars.remove("name"), Some(json!("ops")));
        assert!(vars.get("name").is_none());
    }

    #[test]
    fn resolves_placeholders() {
        let vars = VariableManager::new();
        vars.set("last_message", json!("restart web-01"));
        assert_eq!(
            vars.resolve_template("please {{last_message}} now"),
            "please restart web-01 now"
        );
    }

    #[test]
    fn plain_strings_pass_through() {
        let vars = VariableManager::new();
        assert_eq!(vars.resolve_template("no placeholders here"), "no placeholders here");
    }

    #[test]
    fn unknown_variable_keeps_original_text() {
        let vars = VariableManager::new();
        assert_eq!(vars.resolve_template("hi {{missing}}"), "hi {{missing}}");
    }

    #[test]
    fn broken_syntax_keeps_original_text() {
        let vars = VariableManager::new();
        vars.set("x", json!("y"));
        assert_eq!(vars.resolve_template("oops {{x"), "oops {{x");
    }

    #[test]
    fn deep_resolution_preserves_shape() {
        let vars = VariableManager::new();
        vars.set("host", json!("web-01"));
        let resolved = vars.resolve_template_value(&json!({
            "url": "https://{{host}}/health",
            "retries": 3,
            "tags": ["{{host}}", true]
        }));
        assert_eq!(
            resolved,
            json!({
                "url": "https://web-01/health",
                "retries": 3,
                "tags": ["web-01", true]
            })
        );
    }
}
