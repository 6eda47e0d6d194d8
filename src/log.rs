//! Interaction log store
//!
//! Every conversation turn is one record in a flat, append-only log owned by
//! the backend. The engine only ever appends new records or deletes whole
//! records; nothing is edited in place, so a re-read of the log is always a
//! faithful reconstruction of history.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::error::ApiError;

/// How many records one `list` call asks for. The log is small relative to
/// the rest of the platform's data; a single page is the whole history.
const LIST_PAGE_SIZE: u32 = 10_000;

/// The originator of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    UserMessage,
    AssistantMessage,
    System,
}

/// One stored conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: i64,
    #[serde(rename = "interaction_type")]
    pub kind: InteractionKind,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    /// True for a system record flagged as the start of a new session.
    ///
    /// Metadata is free-form JSON owned by the backend; anything missing or
    /// malformed is simply "not a boundary", never an error.
    pub fn is_session_boundary(&self) -> bool {
        self.kind == InteractionKind::System
            && self
                .metadata
                .as_ref()
                .and_then(|m| m.get("new_session"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// Explicit session title carried by a boundary record, if any.
    pub fn session_title(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("title")?.as_str()
    }
}

/// A record to append; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewInteraction {
    #[serde(rename = "interaction_type")]
    pub kind: InteractionKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewInteraction {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            kind: InteractionKind::UserMessage,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            kind: InteractionKind::AssistantMessage,
            content: content.into(),
            metadata: None,
        }
    }

    /// A session boundary marker. The title is optional; readers fall back
    /// to deriving one from the first user message.
    pub fn boundary(title: Option<&str>) -> Self {
        let metadata = match title {
            Some(title) => json!({ "new_session": true, "title": title }),
            None => json!({ "new_session": true }),
        };
        Self {
            kind: InteractionKind::System,
            content: String::new(),
            metadata: Some(metadata),
        }
    }

    /// An assistant record summarizing a tool invocation outcome.
    pub fn tool_result(tool: &str, content: impl Into<String>, ok: bool) -> Self {
        Self {
            kind: InteractionKind::AssistantMessage,
            content: content.into(),
            metadata: Some(json!({ "tool_call": { "tool": tool, "ok": ok } })),
        }
    }
}

/// Storage seam for the interaction log.
///
/// `list` returns the full log in total order: `created_at` ascending, ties
/// broken by insertion order.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Interaction>, ApiError>;

    async fn create(&self, draft: &NewInteraction) -> Result<Interaction, ApiError>;

    /// Hard-delete the given records. Returns how many were removed.
    async fn bulk_delete(&self, ids: &[i64]) -> Result<u64, ApiError>;

    /// Wipe the whole log. Returns how many records were removed.
    async fn delete_all(&self) -> Result<u64, ApiError>;

    async fn mark_all_read(&self) -> Result<(), ApiError>;
}

/// REST client for the mini-assistant interactions endpoints.
pub struct HttpInteractionStore {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpInteractionStore {
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

#[derive(Debug, Deserialize)]
struct DeletedCount {
    #[serde(default)]
    deleted: u64,
}

#[async_trait]
impl InteractionStore for HttpInteractionStore {
    async fn list(&self) -> Result<Vec<Interaction>, ApiError> {
        let request = self
            .client
            .get(format!("{}/interactions", self.base_url))
            .query(&[("limit", LIST_PAGE_SIZE), ("offset", 0)]);

        let mut interactions: Vec<Interaction> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::unknown(format!("Failed to parse interactions: {e}")))?;

        // The endpoint returns newest-first; the engine works in log order.
        interactions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(interactions)
    }

    async fn create(&self, draft: &NewInteraction) -> Result<Interaction, ApiError> {
        let request = self
            .client
            .post(format!("{}/interactions", self.base_url))
            .json(draft);

        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::unknown(format!("Failed to parse interaction: {e}")))
    }

    async fn bulk_delete(&self, ids: &[i64]) -> Result<u64, ApiError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let request = self
            .client
            .post(format!("{}/interactions/bulk-delete", self.base_url))
            .json(&json!({ "ids": ids }));

        let counted: DeletedCount = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::unknown(format!("Failed to parse delete response: {e}")))?;
        Ok(counted.deleted)
    }

    async fn delete_all(&self) -> Result<u64, ApiError> {
        let request = self
            .client
            .post(format!("{}/interactions/delete-all", self.base_url));

        let counted: DeletedCount = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::unknown(format!("Failed to parse delete response: {e}")))?;
        Ok(counted.deleted)
    }

    async fn mark_all_read(&self) -> Result<(), ApiError> {
        let request = self
            .client
            .post(format!("{}/interactions/read", self.base_url));
        self.send(request).await?;
        Ok(())
    }
}

/// The backend serializes timestamps either as RFC 3339 or as a naive
/// datetime in UTC; accept both.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
}
