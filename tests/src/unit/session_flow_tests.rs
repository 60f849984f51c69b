use super::{scripted_client, test_runtime};
use futures::future::join;
use parley_core::auth::REFRESH_PATH;
use parley_core::client::LOGIN_PATH;
use parley_core::conversations::CONVERSATIONS_PATH;
use parley_core::inbox::TASKS_PATH;
use parley_core::testing::{ScriptedReply, ScriptedTransport};
use parley_core::{ApiError, RefreshError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn login_reply() -> ScriptedReply {
    ScriptedReply::json(
        200,
        json!({
            "token": "access-1",
            "refresh_token": "refresh-1",
            "user": {"id": 1, "name": "Ann", "email": "ann@example.com"}
        }),
    )
}

#[test]
fn session_survives_restart_through_credential_file() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(LOGIN_PATH, login_reply());

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");
    assert!(temp_dir.path().join("credentials.json").exists());

    let reopened = scripted_client(temp_dir.path(), transport);
    assert!(reopened.is_authenticated());
    assert_eq!(reopened.session().refresh_token().as_deref(), Some("refresh-1"));
    assert_eq!(
        reopened.session().user().map(|user| user.email),
        Some("ann@example.com".to_string())
    );

    reopened.logout();
    assert!(!temp_dir.path().join("credentials.json").exists());
    assert!(!scripted_client(temp_dir.path(), Arc::new(ScriptedTransport::new())).is_authenticated());
}

#[test]
fn expired_token_is_renewed_once_for_parallel_calls() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(LOGIN_PATH, login_reply());
    transport
        .reply(CONVERSATIONS_PATH, ScriptedReply::json(401, json!({"msg": "Token has expired"})))
        .reply(CONVERSATIONS_PATH, ScriptedReply::json(200, json!({"items": []})));
    transport
        .reply(TASKS_PATH, ScriptedReply::json(401, json!({"msg": "Token has expired"})))
        .reply(TASKS_PATH, ScriptedReply::json(200, json!({"items": []})));
    transport
        .reply(REFRESH_PATH, ScriptedReply::json(200, json!({"token": "access-2"})))
        .latency(REFRESH_PATH, Duration::from_millis(30));

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let conversations = client.conversations();
    let inbox = client.inbox();
    let (listed, tasks) = runtime.block_on(join(conversations.list(), inbox.tasks()));
    assert!(listed.expect("conversations").is_empty());
    assert!(tasks.expect("tasks").is_empty());

    assert_eq!(transport.count(REFRESH_PATH), 1);
    assert_eq!(
        transport.requests_to(REFRESH_PATH)[0].bearer.as_deref(),
        Some("refresh-1")
    );
    let replayed = transport.requests_to(TASKS_PATH);
    assert_eq!(replayed[0].bearer.as_deref(), Some("access-1"));
    assert_eq!(replayed[1].bearer.as_deref(), Some("access-2"));

    let reopened = scripted_client(temp_dir.path(), Arc::new(ScriptedTransport::new()));
    assert_eq!(reopened.session().access_token().as_deref(), Some("access-2"));
}

#[test]
fn rejected_refresh_signs_out_everywhere() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(LOGIN_PATH, login_reply());
    transport.reply(TASKS_PATH, ScriptedReply::json(401, json!({"msg": "Token has expired"})));
    transport.reply(REFRESH_PATH, ScriptedReply::json(401, json!({"msg": "Token has been revoked"})));

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let err = runtime.block_on(client.inbox().tasks()).unwrap_err();
    assert!(matches!(err, ApiError::RefreshFailed(_)));
    assert!(err.is_auth_failure());
    assert!(!client.is_authenticated());
    assert!(!temp_dir.path().join("credentials.json").exists());
    assert_eq!(transport.count(TASKS_PATH), 1);
}

#[test]
fn logout_during_renewal_stays_signed_out() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(LOGIN_PATH, login_reply());
    transport.reply(TASKS_PATH, ScriptedReply::json(401, json!({"msg": "Token has expired"})));
    transport
        .reply(REFRESH_PATH, ScriptedReply::json(200, json!({"token": "access-2"})))
        .latency(REFRESH_PATH, Duration::from_millis(50));

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let inbox = client.inbox();
    let (tasks, ()) = runtime.block_on(async {
        let logout = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.logout();
        };
        tokio::join!(inbox.tasks(), logout)
    });

    let err = tasks.unwrap_err();
    assert!(matches!(err, ApiError::RefreshFailed(RefreshError::SessionChanged)));
    assert!(!client.is_authenticated());
    assert!(!temp_dir.path().join("credentials.json").exists());
    assert_eq!(transport.count(TASKS_PATH), 1);
}
