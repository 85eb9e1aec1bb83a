use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clipsaver_core::SyncSettings;
use clipsaver_sync::{SheetSync, SyncError};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "clipsaver-sync", about = "Upload images to Drive and link them into a sheet")]
struct SyncArgs {
    /// Sync settings JSON; environment variables are used when absent.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: SyncCommand,
}

#[derive(Subcommand, Debug)]
enum SyncCommand {
    /// Resolve credentials, running the browser authorization if needed.
    Login,
    /// Print the cell the next image would be linked into.
    Find,
    /// Upload an image and write its formula into the matched cell.
    Upload { file: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = SyncArgs::parse();
    if let Err(err) = run(args).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: SyncArgs) -> Result<(), SyncError> {
    let contents = match &args.settings {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|source| SyncError::Io {
            path: path.clone(),
            source,
        })?),
        None => None,
    };
    let (settings, source) = SyncSettings::resolve(contents.as_deref(), |key| {
        std::env::var(key).ok()
    });
    info!(?source, mode = %settings.auth_mode, "sync settings loaded");

    let sync = SheetSync::connect(settings).await?;
    match args.command {
        SyncCommand::Login => {
            match sync.authenticator().current_expiry().await {
                Some(expiry) => println!("authorized; token valid until {expiry}"),
                None => println!("authorized"),
            }
        }
        SyncCommand::Find => {
            let cell = sync.find_target_cell().await?;
            println!("{cell}");
        }
        SyncCommand::Upload { file } => {
            let result = sync.upload_and_link(&file).await?;
            println!("Uploaded to Sheets ({}) via {}", result.cell, result.link);
        }
    }
    Ok(())
}
