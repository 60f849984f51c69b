use crate::conversations::timestamp;
use crate::dispatch::RequestDispatcher;
use crate::error::ApiError;
use crate::transport::ApiRequest;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const TASKS_PATH: &str = "/inbox/tasks";
pub const ARCHIVE_PATH: &str = "/inbox/archive";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(with = "timestamp")]
    pub created_at: NaiveDateTime,
    #[serde(with = "timestamp")]
    pub updated_at: NaiveDateTime,
}

/// Partial update; absent fields are left untouched on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_done: Option<bool>,
}

impl TaskPatch {
    pub fn done(is_done: bool) -> Self {
        Self {
            is_done: Some(is_done),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.notes.is_none() && self.is_done.is_none()
    }
}

#[derive(Serialize)]
struct NewTask<'a> {
    title: &'a str,
    notes: Option<&'a str>,
}

#[derive(Deserialize)]
struct TaskList {
    items: Vec<Task>,
}

#[derive(Deserialize)]
struct TaskEnvelope {
    item: Task,
}

#[derive(Clone)]
pub struct InboxApi {
    dispatcher: RequestDispatcher,
}

impl InboxApi {
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Open tasks.
    pub async fn tasks(&self) -> Result<Vec<Task>, ApiError> {
        let list: TaskList = self.dispatcher.dispatch_json(ApiRequest::get(TASKS_PATH)).await?;
        Ok(list.items)
    }

    /// Archived tasks.
    pub async fn archive(&self) -> Result<Vec<Task>, ApiError> {
        let list: TaskList = self
            .dispatcher
            .dispatch_json(ApiRequest::get(ARCHIVE_PATH))
            .await?;
        Ok(list.items)
    }

    pub async fn create(&self, title: &str, notes: Option<&str>) -> Result<Task, ApiError> {
        let request = ApiRequest::post(TASKS_PATH).json(&NewTask {
            title: title.trim(),
            notes,
        })?;
        let created: TaskEnvelope = self.dispatcher.dispatch_json(request).await?;
        tracing::info!(task_id = created.item.id, "task created");
        Ok(created.item)
    }

    pub async fn update(&self, task_id: i64, patch: &TaskPatch) -> Result<Task, ApiError> {
        let request = ApiRequest::patch(format!("{TASKS_PATH}/{task_id}")).json(patch)?;
        let updated: TaskEnvelope = self.dispatcher.dispatch_json(request).await?;
        Ok(updated.item)
    }

    pub async fn archive_task(&self, task_id: i64) -> Result<Task, ApiError> {
        let request = ApiRequest::post(format!("{TASKS_PATH}/{task_id}/archive"));
        let archived: TaskEnvelope = self.dispatcher.dispatch_json(request).await?;
        tracing::info!(task_id, "task archived");
        Ok(archived.item)
    }
}
