use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use velsync_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "velsync")]
#[command(about = "Sync Velog RSS posts into the generated blog data module")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed and merge new posts into the data module
    Sync,
    /// Report which posts would be added, without writing anything
    Preview,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: existing={} fetched={} new={}{}",
                summary.existing_posts,
                summary.fetched_items,
                summary.new_posts,
                if summary.wrote_file {
                    ""
                } else {
                    " (store unchanged)"
                }
            );
        }
        Commands::Preview => {
            let drafts = pipeline.preview().await?;
            if drafts.is_empty() {
                println!("no new posts");
            }
            for draft in &drafts {
                println!("[{}] {} ({}) {}", draft.category, draft.title, draft.date, draft.url);
            }
        }
    }

    Ok(())
}
