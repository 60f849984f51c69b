pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod conversations;
pub mod dispatch;
pub mod error;
pub mod inbox;
pub mod knowledge;
pub mod session;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use auth::RefreshCoordinator;
pub use chat::{ChatSession, StreamOptions, StreamOutcome, StreamPhase};
pub use client::ParleyClient;
pub use config::{ClientSettings, ConfigError};
pub use conversations::{ConversationSummary, ConversationsApi, MessageRole, StoredMessage};
pub use dispatch::RequestDispatcher;
pub use error::{ApiError, RefreshError, TransportError};
pub use inbox::{InboxApi, Task, TaskPatch};
pub use knowledge::{DeletedFile, KnowledgeApi, SearchHit, UploadReceipt};
pub use session::{
    Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore, SessionState,
    UserSnapshot,
};
pub use transport::{
    ApiRequest, ApiResponse, FileUpload, HttpTransport, ReqwestTransport, StreamingResponse,
};
