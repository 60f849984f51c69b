use super::{scripted_client, test_runtime};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_core::chat::{StreamOptions, StreamOutcome, StreamPhase, CHAT_STREAM_PATH};
use parley_core::client::LOGIN_PATH;
use parley_core::conversations::{MessageRole, CONVERSATIONS_PATH, MESSAGES_PATH};
use parley_core::knowledge::{FILES_LIST_PATH, FILES_UPLOAD_PATH};
use parley_core::testing::{ScriptedChunk, ScriptedReply, ScriptedTransport};
use parley_core::ApiError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn logged_in(transport: &ScriptedTransport) {
    transport.reply(
        LOGIN_PATH,
        ScriptedReply::json(200, json!({"token": "access-1", "refresh_token": "refresh-1"})),
    );
}

#[test]
fn login_chat_browse_and_logout() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    logged_in(&transport);
    let sources = STANDARD.encode(r#"["handbook.pdf"]"#);
    transport.reply(
        CHAT_STREAM_PATH,
        ScriptedReply::stream(
            200,
            vec![
                ScriptedChunk::now("Leave is "),
                ScriptedChunk::after(Duration::from_millis(5), "20 days."),
            ],
        )
        .with_header("X-Conversation-Id", "31")
        .with_header("X-Knowledge-Sources-B64", &sources),
    );
    transport.reply(
        CONVERSATIONS_PATH,
        ScriptedReply::json(
            200,
            json!({"items": [{"id": 31, "title": "Leave policy", "created_at": "2024-06-01T10:00:00", "last_preview": "Leave is 20 days."}]}),
        ),
    );
    transport.reply(
        MESSAGES_PATH,
        ScriptedReply::json(
            200,
            json!({"items": [
                {"id": 1, "role": "user", "content": "How much leave?", "created_at": "2024-06-01T10:00:00"},
                {"id": 2, "role": "assistant", "content": "Leave is 20 days.", "created_at": "2024-06-01T10:00:02"}
            ]}),
        ),
    );

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let chat = client.chat_session();
    let options = StreamOptions::new("llama3.1").with_knowledge(3);
    let mut reply = String::new();
    let outcome = runtime
        .block_on(chat.start("How much leave?", &options, |text| reply.push_str(text)))
        .expect("stream");
    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(reply, "Leave is 20 days.");
    assert_eq!(chat.conversation_id(), Some(31));
    assert_eq!(chat.knowledge_sources(), vec!["handbook.pdf"]);

    let sent = &transport.requests_to(CHAT_STREAM_PATH)[0];
    assert_eq!(sent.bearer.as_deref(), Some("access-1"));
    assert_eq!(
        sent.body,
        Some(json!({
            "model": "llama3.1",
            "message": "How much leave?",
            "conversation_id": null,
            "use_knowledge": true,
            "topk": 3
        }))
    );

    let conversations = runtime
        .block_on(client.conversations().list())
        .expect("conversations");
    assert_eq!(conversations[0].id, 31);
    let messages = runtime
        .block_on(client.conversations().messages(31))
        .expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);

    client.logout();
    assert!(!client.is_authenticated());
}

#[test]
fn stale_token_on_stream_surfaces_auth_expired() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    logged_in(&transport);
    transport.reply(CHAT_STREAM_PATH, ScriptedReply::text(401, ""));

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let chat = client.chat_session();
    let err = runtime
        .block_on(chat.start("hi", &StreamOptions::new("llama3.1"), |_| {}))
        .unwrap_err();
    assert!(matches!(err, ApiError::AuthExpired { .. }));
    assert_eq!(chat.phase(), StreamPhase::Failed);
    assert_eq!(chat.last_error().as_deref(), Some("HTTP 401"));
    assert_eq!(transport.count(parley_core::auth::REFRESH_PATH), 0);
    assert!(client.is_authenticated());
}

#[test]
fn backend_error_marker_ends_the_reply() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = Arc::new(ScriptedTransport::new());
    logged_in(&transport);
    transport.reply(
        CHAT_STREAM_PATH,
        ScriptedReply::stream(
            200,
            vec![
                ScriptedChunk::now("Partial answer "),
                ScriptedChunk::now("[ERR"),
                ScriptedChunk::now("OR] ReadTimeout: ollama did not respond"),
                ScriptedChunk::now("ignored"),
            ],
        )
        .with_header("X-Conversation-Id", "8"),
    );

    let client = scripted_client(temp_dir.path(), transport);
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let chat = client.chat_session();
    let mut seen = Vec::new();
    let err = runtime
        .block_on(chat.start("hi", &StreamOptions::new("llama3.1"), |text| {
            seen.push(text.to_string())
        }))
        .unwrap_err();

    assert!(matches!(err, ApiError::StreamProtocol(_)));
    assert_eq!(
        seen,
        vec![
            "Partial answer ",
            "[ERR",
            "OR] ReadTimeout: ollama did not respond"
        ]
    );
    assert_eq!(
        chat.last_error().as_deref(),
        Some("OR] ReadTimeout: ollama did not respond")
    );
    assert_eq!(chat.conversation_id(), Some(8));
}

#[test]
fn uploaded_file_grounds_the_next_reply() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let document = temp_dir.path().join("handbook.md");
    std::fs::write(&document, "# Leave\nEveryone gets 20 days.").expect("write document");

    let transport = Arc::new(ScriptedTransport::new());
    logged_in(&transport);
    transport.reply(
        FILES_UPLOAD_PATH,
        ScriptedReply::json(200, json!({"file": "handbook.md", "chunks": 2})),
    );
    transport.reply(FILES_LIST_PATH, ScriptedReply::json(200, json!({"files": ["handbook.md"]})));
    transport.reply(
        CHAT_STREAM_PATH,
        ScriptedReply::stream(200, vec![ScriptedChunk::now("20 days.")])
            .with_header("X-Knowledge-Sources", "handbook.md"),
    );

    let client = scripted_client(temp_dir.path(), transport.clone());
    runtime
        .block_on(client.login("ann@example.com", "pw"))
        .expect("login");

    let knowledge = client.knowledge();
    let receipt = runtime
        .block_on(knowledge.upload_path(&document))
        .expect("upload");
    assert_eq!(receipt.chunks, 2);
    assert_eq!(runtime.block_on(knowledge.list()).expect("list"), vec!["handbook.md"]);

    let chat = client.chat_session();
    runtime
        .block_on(chat.start(
            "How much leave?",
            &StreamOptions::new("llama3.1").with_knowledge(5),
            |_| {},
        ))
        .expect("stream");
    assert_eq!(chat.knowledge_sources(), vec!["handbook.md"]);

    let upload = &transport.requests_to(FILES_UPLOAD_PATH)[0];
    assert_eq!(upload.bearer.as_deref(), Some("access-1"));
    assert_eq!(
        upload.upload.as_ref().map(|file| file.file_name.as_str()),
        Some("handbook.md")
    );
}
