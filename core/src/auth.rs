use crate::error::{parse_error_message, RefreshError, TransportError};
use crate::session::SessionState;
use crate::transport::{ApiRequest, HttpTransport};
use parking_lot::Mutex;
use serde::Deserialize;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub const REFRESH_PATH: &str = "/auth/refresh";

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

/// Renewal cycle state. `InFlight` owns the callers waiting on the cycle.
enum RefreshCycle {
    Idle,
    InFlight { waiters: Vec<Waiter> },
}

#[derive(Deserialize)]
struct RefreshPayload {
    token: Option<String>,
}

/// Single-flight access token renewal.
///
/// Callers that arrive while a renewal is running are queued and settled with
/// the outcome of that same renewal. The renewal runs on its own task so a
/// caller that gives up waiting never strands the others.
#[derive(Clone)]
pub struct RefreshCoordinator {
    session: SessionState,
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
    cycle: Arc<Mutex<RefreshCycle>>,
}

impl RefreshCoordinator {
    pub fn new(session: SessionState, transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self {
            session,
            transport,
            timeout,
            cycle: Arc::new(Mutex::new(RefreshCycle::Idle)),
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.cycle.lock(), RefreshCycle::InFlight { .. })
    }

    /// Returns a renewed access token, joining the running renewal if any.
    pub async fn ensure_fresh_token(&self) -> Result<String, RefreshError> {
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut cycle = self.cycle.lock();
            match &mut *cycle {
                RefreshCycle::InFlight { waiters } => {
                    waiters.push(tx);
                    tracing::debug!(waiting = waiters.len(), "joined in-flight token refresh");
                    false
                }
                RefreshCycle::Idle => {
                    *cycle = RefreshCycle::InFlight { waiters: vec![tx] };
                    true
                }
            }
        };

        if leader {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let refresh_token = coordinator.session.refresh_token();
                let outcome = match refresh_token.as_deref() {
                    Some(refresh_token) => coordinator.renew(refresh_token).await,
                    None => Err(RefreshError::NoRefreshToken),
                };
                coordinator.settle(refresh_token.as_deref(), outcome);
            });
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RefreshError::Transport(TransportError::Connect(
                "token refresh was abandoned".to_string(),
            ))),
        }
    }

    async fn renew(&self, refresh_token: &str) -> Result<String, RefreshError> {
        tracing::info!("refreshing access token");

        let request = ApiRequest::post(REFRESH_PATH)
            .bearer(refresh_token)
            .anonymous();
        let response = tokio::time::timeout(self.timeout, self.transport.execute(request))
            .await
            .map_err(|_| TransportError::Timeout(Some(self.timeout)))??;

        if !response.status.is_success() {
            return Err(RefreshError::Rejected {
                status: Some(response.status.as_u16()),
                message: parse_error_message(response.status, &response.body),
            });
        }

        response
            .json::<RefreshPayload>()
            .ok()
            .and_then(|payload| payload.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RefreshError::Rejected {
                status: Some(response.status.as_u16()),
                message: "refresh response did not contain a token".to_string(),
            })
    }

    /// Publishes the outcome and drains every waiter of this cycle.
    ///
    /// `refresh_token` is the token the renewal was made with. If the session
    /// moved on meanwhile (logout, a new login) it is left untouched and the
    /// renewed token is discarded.
    fn settle(&self, refresh_token: Option<&str>, outcome: Result<String, RefreshError>) {
        let outcome = match outcome {
            Ok(token) => match refresh_token {
                Some(refresh_token)
                    if self.session.replace_access_token(refresh_token, token.clone()) =>
                {
                    Ok(token)
                }
                _ => {
                    tracing::info!("session changed during token refresh, discarding renewed token");
                    Err(RefreshError::SessionChanged)
                }
            },
            Err(err) => {
                if self.session.clear_if_refresh_token(refresh_token) {
                    tracing::warn!(error = %err, "token refresh failed, session cleared");
                } else {
                    tracing::warn!(error = %err, "token refresh failed after the session changed");
                }
                Err(err)
            }
        };

        let waiters = match mem::replace(&mut *self.cycle.lock(), RefreshCycle::Idle) {
            RefreshCycle::InFlight { waiters } => waiters,
            RefreshCycle::Idle => Vec::new(),
        };
        tracing::debug!(waiters = waiters.len(), ok = outcome.is_ok(), "token refresh settled");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
