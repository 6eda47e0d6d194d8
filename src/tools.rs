//! Typed tool invocation
//!
//! Tools are named, side-effecting actions the assistant can take on the
//! user's behalf: create a goal, log a mood, add an expense. Their
//! parameter schemas are described by the registry at load time, so
//! validation is data-driven: required flags, enum values and numeric
//! types are checked locally before anything touches the network.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;

use crate::config::EngineConfig;
use crate::error::{ApiError, FieldError};

/// Declared type of one tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
}

/// Schema for one tool parameter, as served by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
}

/// One entry of the tool registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub title: String,
    pub description: String,
    pub params: BTreeMap<String, ParamSpec>,
}

/// Discriminated result of one execution request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Seam for the registry/execution endpoint.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn list(&self) -> Result<Vec<ToolDescriptor>, ApiError>;

    async fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolOutcome, ApiError>;
}

/// Validate parameters against a descriptor.
///
/// Returns the empty vector when the input is acceptable. Every failing
/// field gets its own entry, in declaration order, so a form can annotate
/// each input. Parameters the descriptor does not mention are ignored, as
/// the backend ignores them too.
pub fn validate_params(descriptor: &ToolDescriptor, params: &Map<String, Value>) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for (name, spec) in &descriptor.params {
        let value = params.get(name).filter(|v| !v.is_null());
        let Some(value) = value else {
            if spec.required {
                errors.push(FieldError::new(name, "required"));
            }
            continue;
        };

        if let Some(allowed) = &spec.allowed {
            match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => {}
                _ => {
                    errors.push(FieldError::new(
                        name,
                        format!("must be one of: {}", allowed.join(", ")),
                    ));
                }
            }
            continue;
        }

        match spec.param_type {
            ParamType::String => {
                if !value.is_string() {
                    errors.push(FieldError::new(name, "must be a string"));
                }
            }
            ParamType::Number => {
                if !is_number(value) {
                    errors.push(FieldError::new(name, "must be a number"));
                }
            }
            ParamType::Integer => {
                if !is_integer(value) {
                    errors.push(FieldError::new(name, "must be an integer"));
                }
            }
            ParamType::Boolean => {
                if !is_boolean(value) {
                    errors.push(FieldError::new(name, "must be a boolean"));
                }
            }
            ParamType::Array => {
                if !value.is_array() {
                    errors.push(FieldError::new(name, "must be a list"));
                }
            }
        }
    }

    errors
}

// The backend coerces string-typed form input, so "250" is an acceptable
// number and "true" an acceptable boolean.

fn is_number(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::String(s) => s.trim().parse::<i64>().is_ok(),
        _ => false,
    }
}

fn is_boolean(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => matches!(s.trim(), "true" | "false"),
        _ => false,
    }
}

/// Fetch-once cache over the tool registry.
///
/// Descriptors are immutable for the life of the engine; the first lookup
/// loads them, later lookups hit the cache.
pub struct ToolCatalog {
    backend: Arc<dyn ToolBackend>,
    descriptors: OnceCell<Vec<ToolDescriptor>>,
}

impl ToolCatalog {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend,
            descriptors: OnceCell::new(),
        }
    }

    pub async fn descriptors(&self) -> Result<&[ToolDescriptor], ApiError> {
        self.descriptors
            .get_or_try_init(|| async {
                let descriptors = self.backend.list().await?;
                tracing::debug!(count = descriptors.len(), "loaded tool registry");
                Ok(descriptors)
            })
            .await
            .map(Vec::as_slice)
    }

    pub async fn find(&self, name: &str) -> Result<Option<ToolDescriptor>, ApiError> {
        Ok(self
            .descriptors()
            .await?
            .iter()
            .find(|d| d.name == name)
            .cloned())
    }

    pub async fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolOutcome, ApiError> {
        self.backend.execute(name, params).await
    }
}

/// REST client for the tool registry and execution endpoints.
pub struct HttpToolBackend {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpToolBackend {
    pub fn new(config: &EngineConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
        }
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = self
            .apply_auth(request)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    async fn list(&self) -> Result<Vec<ToolDescriptor>, ApiError> {
        let request = self.client.get(format!("{}/tools", self.base_url));
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::unknown(format!("Failed to parse tool registry: {e}")))
    }

    async fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolOutcome, ApiError> {
        let request = self
            .client
            .post(format!("{}/tools/execute", self.base_url))
            .json(&json!({ "tool": name, "params": params }));
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::unknown(format!("Failed to parse tool outcome: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    fn param(param_type: ParamType, required: bool) -> ParamSpec {
        ParamSpec {
            param_type,
            allowed: None,
            required,
            format: None,
            items: None,
        }
    }

    fn enum_param(values: &[&str], required: bool) -> ParamSpec {
        ParamSpec {
            param_type: ParamType::String,
            allowed: Some(values.iter().map(ToString::to_string).collect()),
            required,
            format: None,
            items: None,
        }
    }

    pub fn create_goal() -> ToolDescriptor {
        ToolDescriptor {
            name: "career.create_goal".to_string(),
            title: "Create Career Goal".to_string(),
            description: "Create a new career goal for the user.".to_string(),
            params: BTreeMap::from([
                ("title".to_string(), param(ParamType::String, true)),
                ("description".to_string(), param(ParamType::String, false)),
                (
                    "priority".to_string(),
                    enum_param(&["low", "medium", "high", "urgent"], false),
                ),
                ("target_date".to_string(), param(ParamType::String, false)),
            ]),
        }
    }

    pub fn add_expense() -> ToolDescriptor {
        ToolDescriptor {
            name: "finance.add_expense".to_string(),
            title: "Add Expense".to_string(),
            description: "Create a new expense record.".to_string(),
            params: BTreeMap::from([
                ("amount".to_string(), param(ParamType::Number, true)),
                ("category".to_string(), param(ParamType::String, true)),
                ("description".to_string(), param(ParamType::String, true)),
            ]),
        }
    }

    pub fn complete_habit() -> ToolDescriptor {
        ToolDescriptor {
            name: "habits.complete_today".to_string(),
            title: "Complete Habit Today".to_string(),
            description: "Mark a habit as completed for today.".to_string(),
            params: BTreeMap::from([
                ("habit_id".to_string(), param(ParamType::Integer, true)),
                ("notes".to_string(), param(ParamType::String, false)),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn valid_params_pass() {
        let errors = validate_params(
            &fixtures::create_goal(),
            &params(&[("title", json!("Learn Rust")), ("priority", json!("high"))]),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn missing_required_param_is_reported() {
        let errors = validate_params(&fixtures::create_goal(), &params(&[]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "title");
        assert_eq!(errors[0].message, "required");
    }

    #[test]
    fn null_counts_as_missing() {
        let errors = validate_params(
            &fixtures::create_goal(),
            &params(&[("title", Value::Null)]),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "title");
    }

    #[test]
    fn enum_violation_is_reported() {
        let errors = validate_params(
            &fixtures::create_goal(),
            &params(&[("title", json!("x")), ("priority", json!("critical"))]),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "priority");
        assert!(errors[0].message.contains("low, medium, high, urgent"));
    }

    #[test]
    fn number_accepts_numeric_strings() {
        let base = params(&[
            ("category", json!("groceries")),
            ("description", json!("weekly shop")),
        ]);

        let mut ok_number = base.clone();
        ok_number.insert("amount".to_string(), json!(250.5));
        assert!(validate_params(&fixtures::add_expense(), &ok_number).is_empty());

        let mut ok_string = base.clone();
        ok_string.insert("amount".to_string(), json!("250"));
        assert!(validate_params(&fixtures::add_expense(), &ok_string).is_empty());

        let mut bad = base;
        bad.insert("amount".to_string(), json!("lots"));
        let errors = validate_params(&fixtures::add_expense(), &bad);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "amount");
    }

    #[test]
    fn integer_rejects_fractions() {
        let errors = validate_params(
            &fixtures::complete_habit(),
            &params(&[("habit_id", json!(2.5))]),
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "habit_id");

        assert!(validate_params(
            &fixtures::complete_habit(),
            &params(&[("habit_id", json!(7))]),
        )
        .is_empty());
        assert!(validate_params(
            &fixtures::complete_habit(),
            &params(&[("habit_id", json!("7"))]),
        )
        .is_empty());
    }

    #[test]
    fn multiple_errors_are_collected_in_field_order() {
        let errors = validate_params(
            &fixtures::add_expense(),
            &params(&[("amount", json!("lots"))]),
        );
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["amount", "category", "description"]);
    }

    #[test]
    fn extra_params_are_ignored() {
        let errors = validate_params(
            &fixtures::complete_habit(),
            &params(&[("habit_id", json!(1)), ("mystery", json!("ignored"))]),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn descriptor_round_trips_registry_wire_shape() {
        let wire = json!({
            "name": "mood.log",
            "title": "Log Mood",
            "description": "Log your current mood.",
            "params": {
                "mood_score": { "type": "number", "required": true },
                "primary_emotion": { "type": "string", "required": false },
                "frequency": { "type": "string", "enum": ["daily", "weekly"], "required": false },
                "logged_at": { "type": "string", "format": "date-time", "required": false }
            }
        });
        let descriptor: ToolDescriptor = serde_json::from_value(wire).unwrap();
        assert_eq!(descriptor.params["mood_score"].param_type, ParamType::Number);
        assert!(descriptor.params["mood_score"].required);
        assert_eq!(
            descriptor.params["frequency"].allowed.as_deref(),
            Some(["daily".to_string(), "weekly".to_string()].as_slice())
        );
        assert_eq!(
            descriptor.params["logged_at"].format.as_deref(),
            Some("date-time")
        );
    }
}
