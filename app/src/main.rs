use anyhow::Context;
use clap::Parser;
use parley::{commands, Cli, Command};
use parley_core::telemetry;
use parley_core::{ClientSettings, ParleyClient};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(telemetry::DEFAULT_DIRECTIVES));
    telemetry::init_tracing(filter)?;

    let cli = Cli::parse();
    let mut settings = ClientSettings::load().map_err(|err| anyhow::anyhow!(err.user_message()))?;
    if let Some(base_url) = cli.base_url.clone() {
        settings.base_url = base_url;
    }
    tracing::debug!(base_url = %settings.base_url, model = %settings.model, "settings loaded");

    let runtime = Runtime::new()?;
    let client = ParleyClient::from_settings(settings).context("failed to set up HTTP client")?;

    match &cli.command {
        Command::Login { email, password } => {
            commands::login(&runtime, &client, email, password.clone())
        }
        Command::Register {
            name,
            email,
            password,
        } => commands::register(&runtime, &client, name, email, password.clone()),
        Command::Logout => commands::logout(&client),
        Command::Whoami => commands::whoami(&runtime, &client),
        Command::Chat(args) => commands::chat(&runtime, &client, args),
        Command::Conversations(command) => commands::conversations(&runtime, &client, command),
        Command::Models => commands::models(&runtime, &client),
        Command::Tasks(command) => commands::tasks(&runtime, &client, command),
        Command::Files(command) => commands::files(&runtime, &client, command),
    }
}
