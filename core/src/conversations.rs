use crate::dispatch::RequestDispatcher;
use crate::error::ApiError;
use crate::transport::ApiRequest;
use chrono::NaiveDateTime;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;

pub const CONVERSATIONS_PATH: &str = "/ai/conversations";
pub const MESSAGES_PATH: &str = "/ai/messages";
pub const MODELS_PATH: &str = "/ai/models";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub last_preview: String,
}

impl ConversationSummary {
    pub fn display_title(&self) -> &str {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title,
            _ => "Untitled conversation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub role: MessageRole,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: NaiveDateTime,
}

#[derive(Deserialize)]
struct Items<T> {
    items: Vec<T>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<Value>,
}

/// Server-side conversation history for the signed-in user.
#[derive(Clone)]
pub struct ConversationsApi {
    dispatcher: RequestDispatcher,
}

impl ConversationsApi {
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let page: Items<ConversationSummary> = self
            .dispatcher
            .dispatch_json(ApiRequest::get(CONVERSATIONS_PATH))
            .await?;
        Ok(page.items)
    }

    /// Messages of one conversation, oldest first.
    pub async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, ApiError> {
        let request = ApiRequest::get(MESSAGES_PATH).query("conversation_id", conversation_id);
        let body: Value = match self.dispatcher.dispatch_json(request).await {
            Ok(body) => body,
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {
                return Err(ApiError::ConversationNotFound)
            }
            Err(err) => return Err(err),
        };
        let items = body
            .get("items")
            .filter(|items| items.is_array())
            .cloned()
            .ok_or_else(|| ApiError::MalformedResponse("Invalid response shape".to_string()))?;
        serde_json::from_value(items).map_err(|err| ApiError::MalformedResponse(err.to_string()))
    }

    pub async fn rename(&self, conversation_id: i64, title: &str) -> Result<(), ApiError> {
        let request = ApiRequest::put(format!("{CONVERSATIONS_PATH}/{conversation_id}"))
            .with_body(json!({ "title": title.trim() }));
        self.dispatcher.dispatch(request).await.map_err(not_found)?;
        tracing::info!(conversation_id, "conversation renamed");
        Ok(())
    }

    pub async fn delete(&self, conversation_id: i64) -> Result<(), ApiError> {
        let request = ApiRequest::delete(format!("{CONVERSATIONS_PATH}/{conversation_id}"));
        self.dispatcher.dispatch(request).await.map_err(not_found)?;
        tracing::info!(conversation_id, "conversation deleted");
        Ok(())
    }

    /// Model names the backend can serve. Failures yield an empty list.
    pub async fn models(&self) -> Vec<String> {
        let list = match self
            .dispatcher
            .dispatch_json::<ModelList>(ApiRequest::get(MODELS_PATH))
            .await
        {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load model list");
                return Vec::new();
            }
        };
        let mut seen = HashSet::new();
        list.models
            .into_iter()
            .filter_map(|model| model.as_str().map(|name| name.trim().to_string()))
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect()
    }
}

fn not_found(err: ApiError) -> ApiError {
    if err.status() == Some(StatusCode::NOT_FOUND) {
        ApiError::ConversationNotFound
    } else {
        err
    }
}

/// Backend timestamps are ISO 8601 without an offset. Offsets, when present,
/// are folded into UTC.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub fn parse(raw: &str) -> Option<NaiveDateTime> {
        let raw = raw.trim();
        NaiveDateTime::parse_from_str(raw, FORMAT)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok())
            .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
    }
}
