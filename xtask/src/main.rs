use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use parley_core::auth::REFRESH_PATH;
use parley_core::chat::{StreamOutcome, CHAT_STREAM_PATH};
use parley_core::client::LOGIN_PATH;
use parley_core::conversations::CONVERSATIONS_PATH;
use parley_core::inbox::TASKS_PATH;
use parley_core::telemetry;
use parley_core::testing::{ScriptedChunk, ScriptedReply, ScriptedTransport};
use parley_core::{ClientSettings, FileCredentialStore, ParleyClient};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Parley")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted session: login, an expired token, a streamed reply, logout.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn scripted_backend() -> Arc<ScriptedTransport> {
    let transport = Arc::new(ScriptedTransport::new());
    transport.reply(
        LOGIN_PATH,
        ScriptedReply::json(
            200,
            json!({
                "token": "smoke-access-1",
                "refresh_token": "smoke-refresh",
                "user": {"id": 1, "name": "Smoke", "email": "smoke@parley.local"}
            }),
        ),
    );
    transport
        .reply(TASKS_PATH, ScriptedReply::json(401, json!({"msg": "Token has expired"})))
        .reply(TASKS_PATH, ScriptedReply::json(200, json!({"items": []})));
    transport
        .reply(CONVERSATIONS_PATH, ScriptedReply::json(401, json!({"msg": "Token has expired"})))
        .reply(CONVERSATIONS_PATH, ScriptedReply::json(200, json!({"items": []})));
    transport
        .reply(REFRESH_PATH, ScriptedReply::json(200, json!({"token": "smoke-access-2"})))
        .latency(REFRESH_PATH, Duration::from_millis(20));
    transport.reply(
        CHAT_STREAM_PATH,
        ScriptedReply::stream(
            200,
            vec![
                ScriptedChunk::now("pong "),
                ScriptedChunk::after(Duration::from_millis(10), "from the scripted backend"),
            ],
        )
        .with_header("X-Conversation-Id", "1")
        .with_header("X-Knowledge-Sources", "smoke.md"),
    );
    transport
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let settings = ClientSettings {
        credentials_path: temp_dir.path().join("credentials.json"),
        ..ClientSettings::default()
    };
    let transport = scripted_backend();
    let store = Arc::new(FileCredentialStore::new(settings.credentials_path.clone()));
    let client = ParleyClient::new(settings, transport.clone(), store);

    runtime
        .block_on(client.login("smoke@parley.local", "smoke"))
        .context("login failed")?;

    let inbox = client.inbox();
    let history = client.conversations();
    let (tasks, conversations) =
        runtime.block_on(async { tokio::join!(inbox.tasks(), history.list()) });
    tasks.context("task list failed")?;
    conversations.context("conversation list failed")?;
    ensure!(
        transport.count(REFRESH_PATH) == 1,
        "expected one shared refresh, saw {}",
        transport.count(REFRESH_PATH)
    );

    let chat = client.chat_session();
    let mut reply = String::new();
    let outcome = runtime
        .block_on(chat.start(
            "ping from xtask",
            &client.settings().stream_options(),
            |text| reply.push_str(text),
        ))
        .context("chat stream failed")?;
    ensure!(outcome == StreamOutcome::Completed, "stream ended as {outcome:?}");

    info!(
        reply = %reply,
        conversation_id = ?chat.conversation_id(),
        sources = ?chat.knowledge_sources(),
        requests = transport.requests().len(),
        "smoke session completed"
    );

    client.logout();
    ensure!(!client.is_authenticated(), "logout left a session behind");
    Ok(())
}
