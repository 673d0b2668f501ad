//! Freight node command line.
//!
//! ```text
//! freight-node send <FILE>   transfer FILE to this node's download directory
//! freight-node pending       list stored requests that have not finished
//! ```

mod config;
mod node;

use std::path::Path;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use config::NodeConfig;
use node::Node;

const USAGE: &str = "usage: freight-node <send FILE | pending>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,freight_requests=debug,freight_transfer=debug,freight_node=debug")
        }))
        .init();

    let cfg = NodeConfig::load()?;
    tracing::info!(name = %cfg.name, identity = %cfg.identity(), "freight node starting");
    let node = Node::new(cfg)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("send") => {
            let file = args.get(1).context(USAGE)?;
            let dest = node.send_to_self(Path::new(file)).await?;
            println!("{}", dest.display());
        }
        Some("pending") => {
            for rec in node.pending()? {
                println!(
                    "{}\t{:?}\t{}/{} blocks",
                    rec.id, rec.status, rec.progress.successful_blocks, rec.progress.total_blocks
                );
            }
        }
        _ => anyhow::bail!(USAGE),
    }
    Ok(())
}
