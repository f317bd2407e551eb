//! dchyper - serve directories over HYPER or fetch from a HYPER server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dchyper::hyper::{BufferPool, DownloadManager, HyperServer};
use dchyper::storage::{FileStorage, StorageSet};
use dchyper::HyperConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "HYPER segment transfer for Direct Connect peers")]
struct Args {
    /// TOML file with engine settings
    #[arg(long, global = true, env = "DCHYPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve local directories
    Serve {
        #[arg(long, default_value = "0.0.0.0:4111")]
        bind: String,

        /// Share as NAME=DIR, served under /NAME (repeatable)
        #[arg(long = "share", required = true, action = clap::ArgAction::Append)]
        shares: Vec<String>,
    },
    /// Download one segment
    Fetch {
        /// Server address (host:port)
        #[arg(long)]
        server: String,

        /// Remote path, e.g. /share/video.avi
        #[arg(long)]
        path: String,

        #[arg(long, default_value_t = 0)]
        offset: i64,

        #[arg(long, default_value_t = 1024 * 1024)]
        length: i32,

        /// Write the bytes here instead of printing a summary
        #[arg(long)]
        out: Option<PathBuf>,

        /// Seconds to wait for the session to come up
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
    /// Ask for the size of a remote file
    Size {
        #[arg(long)]
        server: String,

        #[arg(long)]
        path: String,

        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}

fn parse_share(arg: &str) -> Result<(String, PathBuf)> {
    let (name, dir) = arg
        .split_once('=')
        .with_context(|| format!("share must be NAME=DIR, got {:?}", arg))?;
    if name.is_empty() || dir.is_empty() {
        bail!("share must be NAME=DIR, got {:?}", arg);
    }
    Ok((format!("/{}", name.trim_matches('/')), PathBuf::from(dir)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => HyperConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HyperConfig::default(),
    };

    match args.command {
        Command::Serve { bind, shares } => serve(config, &bind, &shares).await,
        Command::Fetch {
            server,
            path,
            offset,
            length,
            out,
            connect_timeout,
        } => {
            let manager = DownloadManager::new(config);
            let session = manager.add_session(&server);
            tokio::time::timeout(Duration::from_secs(connect_timeout), session.wait_active())
                .await
                .with_context(|| format!("no session to {} after {}s", server, connect_timeout))?;

            let data = manager
                .download_segment(&format!("{}{}", server, path), offset, length)
                .await?
                .with_context(|| format!("no answer for {} at offset {}", path, offset))?;

            match out {
                Some(out) => {
                    tokio::fs::write(&out, &data[..])
                        .await
                        .with_context(|| format!("writing {}", out.display()))?;
                    info!("wrote {} bytes to {}", data.len(), out.display());
                }
                None => println!("{} bytes", data.len()),
            }
            Ok(())
        }
        Command::Size {
            server,
            path,
            connect_timeout,
        } => {
            let manager = DownloadManager::new(config);
            manager.add_session(&server);
            let size = tokio::time::timeout(
                Duration::from_secs(connect_timeout),
                manager.get_file_size(&format!("{}{}", server, path)),
            )
            .await
            .with_context(|| format!("no session to {} after {}s", server, connect_timeout))??;
            println!("{}", size);
            Ok(())
        }
    }
}

async fn serve(config: HyperConfig, bind: &str, shares: &[String]) -> Result<()> {
    let pool = BufferPool::new(config.segment_buffer_size, config.pooled_buffers);
    let storages = StorageSet::new();
    for share in shares {
        let (prefix, dir) = parse_share(share)?;
        if !dir.is_dir() {
            bail!("share directory {} does not exist", dir.display());
        }
        storages.add(FileStorage::new(prefix, dir, pool.clone(), config.storage_queue_depth));
    }
    for line in storages.debug_lines() {
        info!("{}", line);
    }

    let server = HyperServer::bind(bind, config, pool, Arc::new(storages))
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("serving on {} (Ctrl-C to stop)", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!(sessions = server.session_count(), "shutting down");
    server.shutdown();
    Ok(())
}
