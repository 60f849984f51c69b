use crate::auth::RefreshCoordinator;
use crate::error::{ApiError, TransportError};
use crate::session::SessionState;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Replays allowed after an authentication failure.
pub const MAX_AUTH_REPLAYS: u32 = 1;

/// Sends ordinary API calls with the session credential.
///
/// A 401 triggers one renewal through the [`RefreshCoordinator`] and one replay
/// of the identical request. Every other failure is returned as-is.
#[derive(Clone)]
pub struct RequestDispatcher {
    transport: Arc<dyn HttpTransport>,
    refresher: RefreshCoordinator,
    timeout: Duration,
}

impl RequestDispatcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        refresher: RefreshCoordinator,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            refresher,
            timeout,
        }
    }

    pub fn session(&self) -> &SessionState {
        self.refresher.session()
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request`, returning the response only when it succeeded.
    pub async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut bearer = if request.authenticated {
            self.session().access_token()
        } else {
            request.bearer.clone()
        };

        let mut attempt = 0;
        loop {
            let mut outgoing = request.clone();
            outgoing.bearer = bearer.clone();
            let response = self.send_once(outgoing).await?;

            if response.status.is_success() {
                return Ok(response);
            }

            let may_replay = request.authenticated
                && response.status == StatusCode::UNAUTHORIZED
                && attempt < MAX_AUTH_REPLAYS;
            if !may_replay {
                return Err(ApiError::from_status(response.status, &response.body));
            }

            tracing::debug!(
                method = %request.method,
                path = %request.path,
                attempt,
                "access token rejected, refreshing before replay"
            );
            bearer = Some(self.refresher.ensure_fresh_token().await?);
            attempt += 1;
        }
    }

    /// Sends and decodes a JSON response body.
    pub async fn dispatch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, ApiError> {
        let response = self.dispatch(request).await?;
        response
            .json()
            .map_err(|err| ApiError::MalformedResponse(err.to_string()))
    }

    async fn send_once(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = tokio::time::timeout(self.timeout, self.transport.execute(request))
            .await
            .map_err(|_| TransportError::Timeout(Some(self.timeout)))??;
        Ok(response)
    }
}
