//! sshrelay
//!
//! Relays everything sent to a local port to a port on a remote host, through
//! an SSH connection authenticated with a private key.
//!
//! ## Usage
//! ```bash
//! sshrelay --port-mapping 80:8080 --remote me@remote.example.com --protocol http --http-cache
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use sshrelay::{Config, HttpRelay, Options, Protocol, ResponseCache, SshDialer, TcpRelay, Tunneler};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let opts = Options::parse();
    let config = Config::from_options(opts).context("could not parse CLI options")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if config.verbose { "debug" } else { "warn" }),
    )
    .init();
    debug!("Starting with {:?}", config);

    let dialer = Arc::new(SshDialer::from_config(&config).context("could not init dialer")?);

    let tunneler: Box<dyn Tunneler> = match config.protocol {
        Protocol::Http => {
            debug!("Initializing http relay");
            if config.http_cache {
                let cache = ResponseCache::load(
                    &config.http_cache_file,
                    config.http_cache_ttl,
                    config.http_cache_serve_stale,
                )
                .context("could not load http cache")?;
                info!(
                    "Caching responses in {} for {}s",
                    cache.path().display(),
                    config.http_cache_ttl.as_secs()
                );
                Box::new(HttpRelay::with_cache(
                    dialer,
                    config.local_port,
                    config.remote_port,
                    Arc::new(cache),
                ))
            } else {
                Box::new(HttpRelay::new(dialer, config.local_port, config.remote_port))
            }
        }
        Protocol::Tcp => {
            debug!("Initializing tcp relay");
            Box::new(TcpRelay::new(dialer, config.local_port, config.remote_port))
        }
    };

    info!(
        "Forwarding all {} traffic sent to localhost:{} to {}@{}:{}",
        config.protocol, config.local_port, config.user, config.remote_host, config.remote_port
    );

    tunneler.tunnel().await.context("relay stopped")?;
    Ok(())
}
