use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use xswap_engine::swap::store::{DealRepository as _, SqliteDealStore};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "data/deals.sqlite")]
    store_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Every stored deal, oldest first.
    List,
    Active,
    Get {
        #[arg(long)]
        r_hash: String,
    },
}

fn main() -> Result<()> {
    xswap_engine::logging::init().ok();
    let args = Args::parse();

    let store = SqliteDealStore::open(args.store_path.clone())
        .with_context(|| format!("open deal store {}", args.store_path.display()))?;

    // Serialized straight to text: unit amounts can exceed what a JSON value holds.
    let out = match args.command {
        Command::List => serde_json::to_string_pretty(&store.load_all()?)?,
        Command::Active => serde_json::to_string_pretty(&store.list_active()?)?,
        Command::Get { r_hash } => {
            let deal = store
                .get(&r_hash)?
                .with_context(|| format!("deal {r_hash} not found"))?;
            serde_json::to_string_pretty(&deal)?
        }
    };

    println!("{out}");
    Ok(())
}
