mod chat_flow_tests;
mod session_flow_tests;

use parley_core::testing::ScriptedTransport;
use parley_core::{ClientSettings, FileCredentialStore, ParleyClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// A client whose credentials live in `dir` and whose backend is `transport`.
pub(crate) fn scripted_client(dir: &Path, transport: Arc<ScriptedTransport>) -> ParleyClient {
    let settings = ClientSettings {
        request_timeout: Duration::from_secs(5),
        credentials_path: dir.join("credentials.json"),
        ..ClientSettings::default()
    };
    let store = Arc::new(FileCredentialStore::new(settings.credentials_path.clone()));
    ParleyClient::new(settings, transport, store)
}
