use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use blobferry::config::{AppConfig, CliConfig, FileConfig};
use blobferry::transfer_manager::{
    BlobClient, ReachabilityProbe, SqliteTransferStore, TransferDelegate, TransferManager,
    TransferProperties, TransferRecord, TransferRequest, TransferState,
};

/// Restoration id the CLI registers its single client under.
const CLI_RESTORATION_ID: &str = "cli";

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "blobferry", about = "Durable, resumable blob transfers")]
struct CliArgs {
    /// Path to the SQLite progress store.
    #[clap(long, value_parser = parse_path)]
    store_path: Option<PathBuf>,

    /// Base URL of the object-storage service.
    #[clap(long)]
    service_url: Option<String>,

    /// Optional TOML config file; its values override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    config: Option<PathBuf>,

    /// Block size in bytes used for decomposition.
    #[clap(long)]
    block_size: Option<u64>,

    /// Maximum number of concurrently running work units.
    #[clap(long)]
    max_concurrent: Option<usize>,

    /// Request timeout in seconds.
    #[clap(long)]
    request_timeout_secs: Option<u64>,

    /// Opaque bearer token sent to the service.
    #[clap(long)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file to a blob.
    Upload {
        #[clap(value_parser = parse_path)]
        source: PathBuf,
        /// Blob name, or a full URL.
        blob: String,
    },
    /// Download a blob to a local file.
    Download {
        /// Blob name, or a full URL.
        blob: String,
        #[clap(value_parser = parse_path)]
        destination: PathBuf,
    },
    /// Resume every persisted transfer and wait for completion.
    Resume,
    /// List persisted transfers.
    Status,
}

/// Serves the CLI's single client and logs state changes.
struct CliDelegate {
    client: Arc<BlobClient>,
}

impl TransferDelegate for CliDelegate {
    fn client_for_restoration_id(&self, _restoration_id: &str) -> Option<Arc<BlobClient>> {
        Some(self.client.clone())
    }

    fn transfer_did_change_state(&self, transfer_id: &str, new_state: TransferState) {
        info!("{} -> {}", transfer_id, new_state.as_db_str());
    }
}

fn blob_url(service_url: &str, blob: &str) -> String {
    if blob.starts_with("http://") || blob.starts_with("https://") {
        blob.to_string()
    } else {
        format!("{}/blobs/{}", service_url, blob)
    }
}

/// Poll until every listed transfer reaches a terminal state.
async fn wait_terminal(manager: &TransferManager, ids: &[String]) -> Result<()> {
    loop {
        let mut done = true;
        for id in ids {
            match manager.transfer(id) {
                Some(record) if !record.state().is_terminal()
                    && record.state() != TransferState::Failed =>
                {
                    done = false;
                }
                _ => {}
            }
        }
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let mut failures = Vec::new();
    for id in ids {
        if let Some(record) = manager.transfer(id) {
            info!("{} finished as {}", id, record.state().as_db_str());
            if record.state() == TransferState::Failed {
                if let TransferRecord::Blob(blob) = record {
                    failures.push(format!(
                        "{}: {}",
                        id,
                        blob.error_message.unwrap_or_else(|| "unknown error".into())
                    ));
                }
            }
        }
    }
    if !failures.is_empty() {
        bail!("{} transfer(s) failed:\n{}", failures.len(), failures.join("\n"));
    }
    Ok(())
}

fn print_status(manager: &TransferManager) {
    if manager.is_empty() {
        println!("No transfers");
        return;
    }
    for i in 0..manager.len() {
        let Some(record) = manager.get(i) else { continue };
        match record {
            TransferRecord::Blob(blob) => {
                println!(
                    "{}  {}  {}  {} -> {}  ({} blocks)",
                    blob.id,
                    blob.direction.as_str(),
                    blob.state.as_db_str(),
                    blob.source,
                    blob.destination,
                    blob.total_blocks,
                );
                if let Some(message) = &blob.error_message {
                    println!("    error: {}", message);
                }
            }
            TransferRecord::Group(group) => {
                println!("{}  GROUP  {}", group.id, group.state.as_db_str());
            }
            TransferRecord::Block(block) => {
                println!(
                    "{}  BLOCK  {}  [{}, {})",
                    block.id,
                    block.state.as_db_str(),
                    block.start_range,
                    block.end_range,
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let args = CliArgs::parse();
    let file_config = args
        .config
        .as_ref()
        .map(|path| FileConfig::load(path))
        .transpose()?;
    let cli_config = CliConfig {
        store_path: args.store_path.clone(),
        service_url: args.service_url.clone(),
        max_concurrent: args.max_concurrent,
        block_size: args.block_size,
        request_timeout_secs: args.request_timeout_secs,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening transfer store at {:?}...", config.store_path);
    let store = Arc::new(SqliteTransferStore::open(&config.store_path)?);
    let manager = Arc::new(TransferManager::new(store, config.transfer.clone())?);

    let mut client = BlobClient::new(
        Duration::from_secs(config.transfer.request_timeout_secs),
        manager.session_id().to_string(),
    )?;
    if let Some(token) = args.auth_token.clone() {
        client = client.with_bearer_token(token);
    }
    let client = Arc::new(client);
    manager.register_client(CLI_RESTORATION_ID, client.clone());
    manager.set_delegate(Arc::new(CliDelegate { client }));

    let shutdown = CancellationToken::new();
    manager.spawn(shutdown.clone());

    let probe = ReachabilityProbe::new(
        config.service_url.clone(),
        Duration::from_secs(config.transfer.probe_interval_secs),
        Duration::from_secs(5),
    );
    tokio::spawn({
        let reachability = manager.reachability();
        let token = shutdown.clone();
        async move { probe.run(reachability, token).await }
    });

    let properties = TransferProperties {
        content_type: None,
        block_size: config.transfer.block_size,
    };

    let result = match &args.command {
        Command::Upload { source, blob } => {
            let id = manager.add(
                TransferRequest::upload(
                    source.to_string_lossy().to_string(),
                    blob_url(&config.service_url, blob),
                    CLI_RESTORATION_ID.to_string(),
                )
                .with_properties(properties),
            );
            wait_terminal(&manager, &[id]).await
        }
        Command::Download { blob, destination } => {
            let id = manager.add(
                TransferRequest::download(
                    blob_url(&config.service_url, blob),
                    destination.to_string_lossy().to_string(),
                    CLI_RESTORATION_ID.to_string(),
                )
                .with_properties(properties),
            );
            wait_terminal(&manager, &[id]).await
        }
        Command::Resume => {
            manager.resume_all();
            let ids: Vec<String> = (0..manager.len())
                .filter_map(|i| manager.get(i).map(|r| r.id().to_string()))
                .collect();
            wait_terminal(&manager, &ids).await
        }
        Command::Status => {
            print_status(&manager);
            Ok(())
        }
    };

    shutdown.cancel();
    result
}
