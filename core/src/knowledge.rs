use crate::dispatch::RequestDispatcher;
use crate::error::{ApiError, TransportError};
use crate::transport::{ApiRequest, FileUpload};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const FILES_UPLOAD_PATH: &str = "/files/upload";
pub const FILES_LIST_PATH: &str = "/files/list";
pub const FILES_DELETE_PATH: &str = "/files/delete";
pub const FILES_SEARCH_PATH: &str = "/files/search";

/// Bounds the backend accepts for `k` on a search.
pub const MIN_SEARCH_HITS: u32 = 1;
pub const MAX_SEARCH_HITS: u32 = 20;

const UPLOAD_FIELD: &str = "file";

/// What the backend reports after indexing an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub file: String,
    #[serde(default)]
    pub chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedFile {
    pub deleted: String,
    #[serde(default)]
    pub removed_from_index: bool,
}

/// One passage of the knowledge base matching a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Smaller is closer.
    pub distance: f64,
}

impl SearchHit {
    /// The file the passage came from, when the index recorded it.
    pub fn source(&self) -> Option<&str> {
        ["filename", "stored_name", "source"]
            .iter()
            .find_map(|key| self.metadata.get(*key).and_then(Value::as_str))
    }
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
struct SearchResults {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Serialize)]
struct SearchQuery<'a> {
    query: &'a str,
    k: u32,
}

/// The documents behind knowledge-grounded chat answers.
#[derive(Clone)]
pub struct KnowledgeApi {
    dispatcher: RequestDispatcher,
}

impl KnowledgeApi {
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Stored file names, as accepted by [`KnowledgeApi::delete`].
    pub async fn list(&self) -> Result<Vec<String>, ApiError> {
        let list: FileList = self
            .dispatcher
            .dispatch_json(ApiRequest::get(FILES_LIST_PATH))
            .await?;
        Ok(list.files)
    }

    /// Uploads `bytes` as `file_name` and waits until the backend has indexed it.
    pub async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<UploadReceipt, ApiError> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(TransportError::InvalidRequest("file name must not be empty".into()).into());
        }
        let request = ApiRequest::post(FILES_UPLOAD_PATH).upload(FileUpload {
            field: UPLOAD_FIELD.to_string(),
            file_name: file_name.to_string(),
            bytes,
        });
        let receipt: UploadReceipt = self.dispatcher.dispatch_json(request).await?;
        tracing::info!(file = %receipt.file, chunks = receipt.chunks, "file indexed");
        Ok(receipt)
    }

    pub async fn upload_path(&self, path: &Path) -> Result<UploadReceipt, ApiError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                TransportError::InvalidRequest(format!("{} has no usable file name", path.display()))
            })?;
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            TransportError::InvalidRequest(format!("failed to read {}: {err}", path.display()))
        })?;
        self.upload(file_name, bytes).await
    }

    pub async fn delete(&self, name: &str) -> Result<DeletedFile, ApiError> {
        let request = ApiRequest::delete(FILES_DELETE_PATH).query("name", name.trim());
        let deleted: DeletedFile = self.dispatcher.dispatch_json(request).await?;
        tracing::info!(
            file = %deleted.deleted,
            removed_from_index = deleted.removed_from_index,
            "file deleted"
        );
        Ok(deleted)
    }

    /// Closest passages first. `k` is clamped to what the backend accepts.
    pub async fn search(&self, query: &str, k: u32) -> Result<Vec<SearchHit>, ApiError> {
        let request = ApiRequest::post(FILES_SEARCH_PATH).json(&SearchQuery {
            query: query.trim(),
            k: k.clamp(MIN_SEARCH_HITS, MAX_SEARCH_HITS),
        })?;
        let results: SearchResults = self.dispatcher.dispatch_json(request).await?;
        Ok(results.hits)
    }
}
