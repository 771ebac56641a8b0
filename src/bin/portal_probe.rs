use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use portal_sync::config;
use portal_sync::portal::{Portal, PortalSession};

/// Log in and probe the session, without touching the datastore.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let session = PortalSession::new(&cfg.portal)?;
    session.authenticate().await?;
    println!("login ok");

    if session.is_valid().await {
        println!("session probe: authenticated");
    } else {
        println!("session probe: portal answered with the sign-in page");
    }
    Ok(())
}
