use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

mod bookmarks;
mod cli;
mod config;
mod connection;
mod error;
mod models;
mod remote;
mod session;
mod tree;
mod upload;

#[cfg(test)]
mod testing;

use bookmarks::{Bookmarks, JsonBookmarkStore};
use cli::{Args, Command, StdinPrompt};
use config::ConfigManager;
use connection::{ConnectionResolver, VastPortMapper};
use session::{spawn_session, SshConnector};

fn init_logging(log_dir: &Path) -> Result<()> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let log_file = log_dir.join(format!(
        "sshdrop_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = File::create(&log_file).context("Failed to create log file")?;

    fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(EnvFilter::from_default_env().add_directive("sshdrop=debug".parse()?))
        .with_ansi(false)
        .with_writer(file)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_dir)?;

    let manager = ConfigManager::new()?;
    let config = manager.load_config()?;
    debug!("Loaded config from {:?}", manager.get_config_path());

    let resolver = ConnectionResolver::new(
        &config.ssh_file_config,
        config.excluded_host_prefixes.clone(),
        config.remap_container_port,
        Arc::new(VastPortMapper),
    );

    if let Command::Hosts = args.command {
        for host in resolver.list_hosts()? {
            println!("{}", host);
        }
        return Ok(());
    }

    let alias = match args.host {
        Some(alias) => alias,
        None => resolver
            .list_hosts()?
            .into_iter()
            .next()
            .context("No hosts found in SSH config")?,
    };

    let store = JsonBookmarkStore::new(manager.get_bookmarks_path());
    debug!("Bookmarks file: {:?}", store.path());
    let bookmarks = Bookmarks::load(Box::new(store));
    let connector = Arc::new(SshConnector::new(resolver, &config));
    let (session, events) = spawn_session(&config, connector, Arc::new(StdinPrompt), bookmarks);
    let printer = tokio::spawn(cli::print_events(events));

    let result = match session.switch_host(&alias).await {
        Ok(_) => cli::run(&session, &config, args.command).await,
        Err(e) => Err(e),
    };

    session.shutdown().await;
    drop(session);
    let _ = printer.await;

    if let Err(e) = &result {
        debug!("Exiting with error: {:#}", e);
    }
    result
}
