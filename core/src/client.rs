use crate::auth::RefreshCoordinator;
use crate::chat::ChatSession;
use crate::config::ClientSettings;
use crate::conversations::ConversationsApi;
use crate::dispatch::RequestDispatcher;
use crate::error::{ApiError, TransportError};
use crate::inbox::InboxApi;
use crate::knowledge::KnowledgeApi;
use crate::session::{Credential, CredentialStore, FileCredentialStore, SessionState, UserSnapshot};
use crate::transport::{ApiRequest, HttpTransport, ReqwestTransport};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const ME_PATH: &str = "/user/me";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenGrant {
    token: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    user: Option<UserSnapshot>,
}

impl TokenGrant {
    fn into_credential(self) -> Result<Credential, ApiError> {
        let access_token = self
            .token
            .or(self.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::MalformedResponse("No token returned".to_string()))?;
        Ok(Credential::new(
            access_token,
            self.refresh_token.filter(|token| !token.is_empty()),
            self.user,
        ))
    }
}

#[derive(Deserialize)]
struct MeResponse {
    user: UserSnapshot,
}

/// Entry point wiring one session, its refresh coordinator and dispatcher.
#[derive(Clone)]
pub struct ParleyClient {
    settings: ClientSettings,
    transport: Arc<dyn HttpTransport>,
    dispatcher: RequestDispatcher,
}

impl ParleyClient {
    pub fn new(
        settings: ClientSettings,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let session = SessionState::open(store);
        let refresher =
            RefreshCoordinator::new(session, transport.clone(), settings.request_timeout);
        let dispatcher =
            RequestDispatcher::new(transport.clone(), refresher, settings.request_timeout);
        Self {
            settings,
            transport,
            dispatcher,
        }
    }

    /// Real HTTP transport, credentials persisted at `settings.credentials_path`.
    pub fn from_settings(settings: ClientSettings) -> Result<Self, TransportError> {
        let transport = Arc::new(ReqwestTransport::new(settings.base_url.clone())?);
        let store = Arc::new(FileCredentialStore::new(settings.credentials_path.clone()));
        tracing::debug!(base_url = %settings.base_url, "created parley client");
        Ok(Self::new(settings, transport, store))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &SessionState {
        self.dispatcher.session()
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Exchanges email and password for a session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserSnapshot>, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH)
            .anonymous()
            .json(&LoginRequest {
                email: email.trim(),
                password,
            })?;
        let grant: TokenGrant = self
            .dispatcher
            .dispatch_json(request)
            .await
            .map_err(rejected_credentials)?;
        let credential = grant.into_credential()?;
        let user = credential.user.clone();
        self.session().set(credential);
        tracing::info!(user_id = ?user.as_ref().map(|user| user.id), "logged in");
        Ok(user)
    }

    /// Creates an account and keeps the session it returns.
    ///
    /// Registration grants no refresh token, so the session cannot renew itself.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Option<UserSnapshot>, ApiError> {
        let request = ApiRequest::post(REGISTER_PATH)
            .anonymous()
            .json(&RegisterRequest {
                name: name.trim(),
                email: email.trim(),
                password,
            })?;
        let grant: TokenGrant = self.dispatcher.dispatch_json(request).await?;
        let credential = grant.into_credential()?;
        let user = credential.user.clone();
        self.session().set(credential);
        tracing::info!(user_id = ?user.as_ref().map(|user| user.id), "registered");
        Ok(user)
    }

    /// Fetches the profile of the signed-in user and records it in the session.
    pub async fn me(&self) -> Result<UserSnapshot, ApiError> {
        let response: MeResponse = self.dispatcher.dispatch_json(ApiRequest::get(ME_PATH)).await?;
        self.session().replace_user(response.user.clone());
        Ok(response.user)
    }

    pub fn logout(&self) {
        self.session().clear();
        tracing::info!("logged out");
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_authenticated()
    }

    /// A fresh chat surface sharing this client's session.
    pub fn chat_session(&self) -> ChatSession {
        ChatSession::new(self.transport.clone(), self.session().clone())
    }

    pub fn conversations(&self) -> ConversationsApi {
        ConversationsApi::new(self.dispatcher.clone())
    }

    pub fn inbox(&self) -> InboxApi {
        InboxApi::new(self.dispatcher.clone())
    }

    pub fn knowledge(&self) -> KnowledgeApi {
        KnowledgeApi::new(self.dispatcher.clone())
    }
}

// A 401 on login means wrong credentials, not an expired session.
fn rejected_credentials(err: ApiError) -> ApiError {
    match err {
        ApiError::AuthExpired { message } => ApiError::Status {
            status: StatusCode::UNAUTHORIZED,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryCredentialStore;
    use crate::testing::{ScriptedReply, ScriptedTransport};
    use serde_json::json;

    fn client(transport: Arc<ScriptedTransport>) -> (ParleyClient, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let client = ParleyClient::new(ClientSettings::default(), transport, store.clone());
        (client, store)
    }

    #[tokio::test]
    async fn login_stores_tokens_and_user() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            LOGIN_PATH,
            ScriptedReply::json(
                200,
                json!({
                    "token": "access-1",
                    "refresh_token": "refresh-1",
                    "user": {"id": 3, "name": "Ann", "email": "ann@example.com"}
                }),
            ),
        );
        let (client, store) = client(transport.clone());

        let user = client.login(" ann@example.com ", "pw").await.expect("login");
        assert_eq!(user.map(|user| user.id), Some(3));
        assert!(client.is_authenticated());
        assert_eq!(client.session().refresh_token().as_deref(), Some("refresh-1"));
        assert_eq!(
            store.snapshot().and_then(|credential| credential.access_token),
            Some("access-1".to_string())
        );

        let sent = &transport.requests_to(LOGIN_PATH)[0];
        assert!(!sent.authenticated);
        assert_eq!(sent.bearer, None);
        assert_eq!(sent.body, Some(json!({"email": "ann@example.com", "password": "pw"})));
    }

    #[tokio::test]
    async fn login_accepts_access_token_field() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(LOGIN_PATH, ScriptedReply::json(200, json!({"access_token": "a"})));
        let (client, _) = client(transport);

        assert_eq!(client.login("a@b.c", "pw").await.expect("login"), None);
        assert_eq!(client.session().access_token().as_deref(), Some("a"));
        assert_eq!(client.session().refresh_token(), None);
    }

    #[tokio::test]
    async fn login_without_token_fails() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(LOGIN_PATH, ScriptedReply::json(200, json!({"user": null})));
        let (client, _) = client(transport);

        match client.login("a@b.c", "pw").await {
            Err(ApiError::MalformedResponse(text)) => assert_eq!(text, "No token returned"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn wrong_password_is_not_an_expired_session() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(LOGIN_PATH, ScriptedReply::json(401, json!({"message": "bad credentials"})));
        let (client, _) = client(transport.clone());

        let err = client.login("a@b.c", "nope").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status, .. } if status == StatusCode::UNAUTHORIZED));
        assert_eq!(err.to_string(), "bad credentials");
        assert_eq!(transport.count(crate::auth::REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn me_updates_the_stored_user() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            ME_PATH,
            ScriptedReply::json(200, json!({"user": {"id": 9, "name": "Bo", "email": "bo@x.io"}})),
        );
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new(
            "access",
            Some("refresh".into()),
            None,
        )));
        let client = ParleyClient::new(ClientSettings::default(), transport.clone(), store.clone());

        let user = client.me().await.expect("me");
        assert_eq!(user.name, "Bo");
        assert_eq!(client.session().user(), Some(user.clone()));
        assert_eq!(store.snapshot().and_then(|credential| credential.user), Some(user));
        assert_eq!(transport.requests_to(ME_PATH)[0].bearer.as_deref(), Some("access"));
    }

    #[tokio::test]
    async fn register_keeps_session_without_refresh_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            REGISTER_PATH,
            ScriptedReply::json(201, json!({"access_token": "new", "user": {"id": 4}})),
        );
        let (client, _) = client(transport);

        let user = client.register("Cy", "cy@x.io", "pw").await.expect("register");
        assert_eq!(user.map(|user| user.id), Some(4));
        assert_eq!(client.session().access_token().as_deref(), Some("new"));
        assert_eq!(client.session().refresh_token(), None);
    }

    #[tokio::test]
    async fn logout_clears_store() {
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new(
            "access", None, None,
        )));
        let client = ParleyClient::new(
            ClientSettings::default(),
            Arc::new(ScriptedTransport::new()),
            store.clone(),
        );
        assert!(client.is_authenticated());

        client.logout();
        assert!(!client.is_authenticated());
        assert_eq!(store.snapshot(), None);
    }
}
