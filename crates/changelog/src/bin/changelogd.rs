use changelog::{ChangelogService, Config, SqliteStorage};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "changelogd", about = "Replication changelog server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the changelog until interrupted (default)
    Run,
    /// Print the state of every domain as JSON and exit
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    info!("Server ID: {}", config.server.server_id);

    if let Some(parent) = config.server.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("Opening database at: {:?}", config.server.db_path);
    let storage = Arc::new(SqliteStorage::open(
        &config.server.db_path,
        &config.storage,
    )?);

    let service = Arc::new(ChangelogService::open(
        storage,
        config.server.server_id,
        config.changelog.clone(),
    )?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Status => {
            let statuses = service.domain_statuses()?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            println!("newest cookie: {}", service.newest_cookie());
            println!(
                "last change number: {}",
                service.cn_index_db().last_generated_change_number()
            );
        }
        Command::Run => {
            let handle = service.start();
            info!("Changelog server running");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            handle.shutdown().await;
            service.close();
        }
    }

    Ok(())
}
