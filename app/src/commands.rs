use crate::cli::{ChatArgs, ConversationsCommand, FilesCommand, TasksCommand};
use anyhow::{anyhow, bail, Context, Result};
use parley_core::chat::{ChatSession, StreamOptions, StreamOutcome};
use parley_core::conversations::{ConversationSummary, StoredMessage};
use parley_core::inbox::{Task, TaskPatch};
use parley_core::knowledge::SearchHit;
use parley_core::{ApiError, ParleyClient};
use std::io::{self, BufRead, Write};
use tokio::runtime::Runtime;

/// Turns a library failure into something a person can act on.
pub fn explain(err: ApiError) -> anyhow::Error {
    if err.is_auth_failure() {
        anyhow!("{}. Run `parley login` to sign in again.", err.user_message())
    } else {
        anyhow!(err.user_message())
    }
}

fn require_login(client: &ParleyClient) -> Result<()> {
    if client.is_authenticated() {
        Ok(())
    } else {
        bail!("Not signed in. Run `parley login <email>` first.")
    }
}

fn read_secret(prompt: &str, provided: Option<String>) -> Result<String> {
    if let Some(value) = provided {
        return Ok(value);
    }
    eprint!("{prompt}");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        bail!("{} must not be empty", prompt.trim_end_matches(": "));
    }
    Ok(value)
}

pub fn login(runtime: &Runtime, client: &ParleyClient, email: &str, password: Option<String>) -> Result<()> {
    let password = read_secret("Password: ", password)?;
    let user = runtime
        .block_on(client.login(email, &password))
        .map_err(|err| anyhow!(err.user_message()))?;
    match user {
        Some(user) => println!("Signed in as {} <{}>", user.name, user.email),
        None => println!("Signed in as {email}"),
    }
    Ok(())
}

pub fn register(
    runtime: &Runtime,
    client: &ParleyClient,
    name: &str,
    email: &str,
    password: Option<String>,
) -> Result<()> {
    let password = read_secret("Password: ", password)?;
    runtime
        .block_on(client.register(name, email, &password))
        .map_err(|err| anyhow!(err.user_message()))?;
    println!("Account created for {email}");
    Ok(())
}

pub fn logout(client: &ParleyClient) -> Result<()> {
    client.logout();
    println!("Signed out");
    Ok(())
}

pub fn whoami(runtime: &Runtime, client: &ParleyClient) -> Result<()> {
    require_login(client)?;
    let user = runtime.block_on(client.me()).map_err(explain)?;
    println!("{} <{}> (id {})", user.name, user.email, user.id);
    Ok(())
}

pub fn chat(runtime: &Runtime, client: &ParleyClient, args: &ChatArgs) -> Result<()> {
    require_login(client)?;
    let options = stream_options(client, args);
    let session = client.chat_session();
    if let Some(id) = args.conversation {
        session.resume(id);
    }

    if let Some(message) = args.message_text() {
        runtime
            .block_on(stream_reply(&session, &message, &options))
            .map_err(explain)?;
        if let Some(id) = session.conversation_id() {
            eprintln!("conversation {id}");
        }
        return Ok(());
    }

    eprintln!("Chatting with {}. `/new` starts over, `/quit` or Ctrl-D leaves.", options.model);
    let stdin = io::stdin();
    loop {
        eprint!("> ");
        io::stderr().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                session.new_conversation();
                eprintln!("(new conversation)");
            }
            message => {
                if let Err(err) = runtime.block_on(stream_reply(&session, message, &options)) {
                    if err.is_auth_failure() {
                        return Err(explain(err));
                    }
                    eprintln!("error: {}", err.user_message());
                }
            }
        }
    }
    Ok(())
}

fn stream_options(client: &ParleyClient, args: &ChatArgs) -> StreamOptions {
    let mut options = client.settings().stream_options();
    if let Some(model) = &args.model {
        options.model = model.clone();
    }
    options.use_knowledge |= args.knowledge;
    if let Some(top_k) = args.top_k {
        options.top_k = top_k;
    }
    options
}

/// Streams one reply to stdout. Ctrl-C cancels the reply, not the program.
async fn stream_reply(
    session: &ChatSession,
    message: &str,
    options: &StreamOptions,
) -> Result<(), ApiError> {
    stream_reply_to(session, message, options, &mut io::stdout()).await
}

/// Writes each increment to `out` as it arrives. A failed write, such as a
/// closed pipe, cancels the reply.
async fn stream_reply_to<W: Write + Send>(
    session: &ChatSession,
    message: &str,
    options: &StreamOptions,
    out: &mut W,
) -> Result<(), ApiError> {
    let mut write_error = None;
    let outcome = {
        let exchange = session.start(message, options, |text| {
            if write_error.is_some() {
                return;
            }
            if let Err(err) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
                write_error = Some(err);
                session.cancel();
            }
        });
        tokio::pin!(exchange);

        tokio::select! {
            outcome = &mut exchange => outcome,
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
                exchange.await
            }
        }
    };

    if let Some(err) = write_error {
        tracing::debug!(error = %err, "output closed, reply cancelled");
        return outcome.map(|_| ());
    }
    // Best effort; the reply itself is already written.
    writeln!(out).ok();

    match outcome {
        Ok(StreamOutcome::Completed) => {
            let sources = session.knowledge_sources();
            if !sources.is_empty() {
                writeln!(out, "{}", format_sources(&sources)).ok();
            }
            Ok(())
        }
        Ok(StreamOutcome::Cancelled) => {
            eprintln!("(cancelled)");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

pub fn conversations(runtime: &Runtime, client: &ParleyClient, command: &ConversationsCommand) -> Result<()> {
    require_login(client)?;
    let api = client.conversations();
    match command {
        ConversationsCommand::List => {
            let conversations = runtime.block_on(api.list()).map_err(explain)?;
            if conversations.is_empty() {
                println!("No conversations yet");
            }
            for conversation in &conversations {
                println!("{}", format_conversation(conversation));
            }
        }
        ConversationsCommand::Show { id } => {
            let messages = runtime.block_on(api.messages(*id)).map_err(explain)?;
            for message in &messages {
                println!("{}", format_message(message));
            }
        }
        ConversationsCommand::Rename { id, title } => {
            let title = title.join(" ");
            if title.trim().is_empty() {
                bail!("title must not be empty");
            }
            runtime.block_on(api.rename(*id, &title)).map_err(explain)?;
            println!("Renamed conversation {id}");
        }
        ConversationsCommand::Delete { id } => {
            runtime.block_on(api.delete(*id)).map_err(explain)?;
            println!("Deleted conversation {id}");
        }
    }
    Ok(())
}

pub fn models(runtime: &Runtime, client: &ParleyClient) -> Result<()> {
    let models = runtime.block_on(client.conversations().models());
    if models.is_empty() {
        eprintln!("No models available");
    }
    let current = &client.settings().model;
    for model in models {
        let marker = if &model == current { '*' } else { ' ' };
        println!("{marker} {model}");
    }
    Ok(())
}

pub fn tasks(runtime: &Runtime, client: &ParleyClient, command: &TasksCommand) -> Result<()> {
    require_login(client)?;
    let inbox = client.inbox();
    match command {
        TasksCommand::List => print_tasks(&runtime.block_on(inbox.tasks()).map_err(explain)?),
        TasksCommand::Archived => print_tasks(&runtime.block_on(inbox.archive()).map_err(explain)?),
        TasksCommand::Add { title, notes } => {
            let title = title.join(" ");
            let task = runtime
                .block_on(inbox.create(&title, notes.as_deref()))
                .map_err(explain)?;
            println!("{}", format_task(&task));
        }
        TasksCommand::Done { id, undo } => {
            let task = runtime
                .block_on(inbox.update(*id, &TaskPatch::done(!undo)))
                .map_err(explain)?;
            println!("{}", format_task(&task));
        }
        TasksCommand::Archive { id } => {
            let task = runtime.block_on(inbox.archive_task(*id)).map_err(explain)?;
            println!("Archived: {}", task.title);
        }
    }
    Ok(())
}

pub fn files(runtime: &Runtime, client: &ParleyClient, command: &FilesCommand) -> Result<()> {
    require_login(client)?;
    let knowledge = client.knowledge();
    match command {
        FilesCommand::List => {
            let files = runtime.block_on(knowledge.list()).map_err(explain)?;
            if files.is_empty() {
                println!("No files uploaded");
            }
            for file in files {
                println!("{file}");
            }
        }
        FilesCommand::Upload { paths } => {
            for path in paths {
                let receipt = runtime
                    .block_on(knowledge.upload_path(path))
                    .map_err(explain)
                    .with_context(|| format!("failed to upload {}", path.display()))?;
                println!("Indexed {} ({} chunks)", receipt.file, receipt.chunks);
            }
        }
        FilesCommand::Delete { name } => {
            let deleted = runtime.block_on(knowledge.delete(name)).map_err(explain)?;
            if deleted.removed_from_index {
                println!("Deleted {}", deleted.deleted);
            } else {
                println!("Deleted {} (it was not in the index)", deleted.deleted);
            }
        }
        FilesCommand::Search { query, top_k } => {
            let query = query.join(" ");
            if query.trim().is_empty() {
                bail!("query must not be empty");
            }
            let hits = runtime
                .block_on(knowledge.search(&query, *top_k))
                .map_err(explain)?;
            if hits.is_empty() {
                println!("No matching passages");
            }
            for (index, hit) in hits.iter().enumerate() {
                println!("{}", format_hit(index + 1, hit));
            }
        }
    }
    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("Nothing here");
    }
    for task in tasks {
        println!("{}", format_task(task));
    }
}

pub fn format_task(task: &Task) -> String {
    let check = if task.is_done { 'x' } else { ' ' };
    match task.notes.as_deref().map(str::trim).filter(|notes| !notes.is_empty()) {
        Some(notes) => format!("[{check}] #{} {} ({notes})", task.id, task.title),
        None => format!("[{check}] #{} {}", task.id, task.title),
    }
}

pub fn format_conversation(conversation: &ConversationSummary) -> String {
    let mut line = format!(
        "#{:<5} {}  {}",
        conversation.id,
        conversation.created_at.format("%Y-%m-%d %H:%M"),
        conversation.display_title()
    );
    let preview = conversation.last_preview.trim();
    if !preview.is_empty() {
        line.push_str("\n       ");
        line.push_str(preview);
    }
    line
}

pub fn format_message(message: &StoredMessage) -> String {
    format!("{}: {}", message.role.as_str(), message.content)
}

pub fn format_sources(sources: &[String]) -> String {
    let mut out = String::from("Sources:");
    for (index, source) in sources.iter().enumerate() {
        out.push_str(&format!("\n  [{}] {source}", index + 1));
    }
    out
}

pub fn format_hit(rank: usize, hit: &SearchHit) -> String {
    let source = hit.source().unwrap_or("unknown source");
    let passage = hit.document.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("[{rank}] {source} (distance {:.3})\n    {passage}", hit.distance)
}
