use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Terminal client for the Parley chat backend")]
pub struct Cli {
    /// Backend base URL, overriding parley.yaml and PARLEY_BASE_URL.
    #[arg(long, global = true)]
    pub base_url: Option<Url>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and remember the session.
    Login {
        email: String,
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },
    /// Create an account and sign in with it.
    Register {
        name: String,
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored session.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// Send a message, or start an interactive chat when none is given.
    Chat(ChatArgs),
    #[command(subcommand)]
    Conversations(ConversationsCommand),
    /// List models the backend can serve.
    Models,
    #[command(subcommand)]
    Tasks(TasksCommand),
    #[command(subcommand)]
    Files(FilesCommand),
}

#[derive(Args, Debug, Default)]
pub struct ChatArgs {
    pub message: Vec<String>,
    /// Continue an existing conversation instead of starting a new one.
    #[arg(long, short = 'c')]
    pub conversation: Option<i64>,
    #[arg(long, short = 'm')]
    pub model: Option<String>,
    /// Ground answers in the knowledge base.
    #[arg(long, short = 'k')]
    pub knowledge: bool,
    #[arg(long)]
    pub top_k: Option<u32>,
}

impl ChatArgs {
    pub fn message_text(&self) -> Option<String> {
        let text = self.message.join(" ");
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Stored conversations.
#[derive(Subcommand, Debug)]
pub enum ConversationsCommand {
    List,
    Show { id: i64 },
    Rename { id: i64, title: Vec<String> },
    Delete { id: i64 },
}

/// Inbox tasks.
#[derive(Subcommand, Debug)]
pub enum TasksCommand {
    List,
    Archived,
    Add {
        title: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Done {
        id: i64,
        /// Mark the task as not done.
        #[arg(long)]
        undo: bool,
    },
    Archive { id: i64 },
}

/// Documents in the knowledge base.
#[derive(Subcommand, Debug)]
pub enum FilesCommand {
    List,
    /// Upload and index one or more files.
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    Delete { name: String },
    /// Show the passages closest to a query.
    Search {
        query: Vec<String>,
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: u32,
    },
}
