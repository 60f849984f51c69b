pub mod cli;
pub mod commands;

pub use cli::{ChatArgs, Cli, Command, ConversationsCommand, FilesCommand, TasksCommand};
