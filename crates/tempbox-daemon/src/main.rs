use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tempbox_core::{AliasDirectory, Mail, SqliteMailStore};
use tempbox_mail::{ImapConnector, IngestEngine, IngestHandle};

mod config_mod;

use config_mod::{DaemonConfig, default_config_path, default_config_template, write_text_atomic};

#[derive(Parser, Debug)]
#[command(name = "tempbox", version, about = "Disposable email alias service")]
struct Cli {
    /// Config file to use instead of the search path.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the ingestion daemon until interrupted.
    Run,
    /// Issue one alias and print its mailbox whenever it changes.
    Watch,
    /// Write a config template.
    InitConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempbox=info,tempbox_mail=info,tempbox_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);
    if command == Command::InitConfig {
        let path = cli.config.unwrap_or_else(default_config_path);
        if path.exists() {
            return Err(anyhow!("{} already exists", path.display()));
        }
        write_text_atomic(&path, default_config_template())?;
        println!("{}", path.display());
        return Ok(());
    }

    let config = config_mod::load_config(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(command, config))
}

async fn run(command: Command, config: DaemonConfig) -> Result<()> {
    let (directory, handle) = start_daemon(&config).await?;
    let result = match command {
        Command::Watch => watch_one_alias(&config, &directory).await,
        _ => tokio::signal::ctrl_c().await.map_err(Into::into),
    };
    handle.shutdown();
    result
}

async fn start_daemon(config: &DaemonConfig) -> Result<(Arc<AliasDirectory>, IngestHandle)> {
    let store = SqliteMailStore::connect(&config.db_path).await?;
    store.init().await?;
    info!(db_path = %config.db_path, "mail store ready");

    let directory = Arc::new(AliasDirectory::new(
        config.alias.domain.clone(),
        config.alias.ttl,
    ));
    let handle = IngestEngine::start(
        ImapConnector::new(config.imap.clone()),
        config.ingest_settings(),
        directory.clone(),
        Arc::new(store),
    );
    info!(
        host = %config.imap.host,
        mailbox = %config.imap.mailbox,
        domain = %config.alias.domain,
        "tempbox running"
    );
    Ok((directory, handle))
}

/// Polls the alias on the ingest interval; each query keeps it alive.
async fn watch_one_alias(config: &DaemonConfig, directory: &AliasDirectory) -> Result<()> {
    let alias = directory.issue();
    println!("{}", serde_json::to_string(&alias)?);

    let mut last: Option<Vec<Mail>> = None;
    let mut ticker = tokio::time::interval(config.ingest.poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            res = tokio::signal::ctrl_c() => return res.map_err(Into::into),
        }
        let snapshot = match directory.query(&alias.owner_id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(code = err.code(), error = %err, "alias no longer queryable");
                return Err(err.into());
            }
        };
        if last.as_ref() != Some(&snapshot.mails) {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            last = Some(snapshot.mails);
        }
    }
}
