//! Command line options and the validated configuration built from them.
//!
//! Every option can also come from the environment (or a `.env` file loaded
//! by `main`). Nothing here touches the network.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::cache::DEFAULT_TTL;
use crate::error::TunnelError;

const SSH_DIR: &str = ".ssh";
const SSH_KEY: &str = "id_rsa";
const KNOWN_HOSTS_FILE: &str = "known_hosts";
const CACHE_FILE: &str = ".sshrelay.httpcache.json";

/// Variables consulted, in order, for the SSH user when `--remote` has none.
const USER_VARS: &[&str] = &["USER", "LOGNAME", "USERNAME"];

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Tcp,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sshrelay")]
#[command(
    version,
    about = "Forward a local port to a port on a remote host over SSH",
    after_help = "Example: sshrelay --port-mapping 80:8080 --remote me@remote.example.com --identity ~/.ssh/sshrelay_rsa"
)]
pub struct Options {
    /// local:remote or port. If remote is not specified the local port is used
    #[arg(short, long, env = "SSHRELAY_PORT_MAPPING")]
    pub port_mapping: String,

    /// username@remote.example.com or remote.example.com. The current user is used when no username is given
    #[arg(short, long, env = "SSHRELAY_REMOTE")]
    pub remote: String,

    /// Private key used to authenticate (default: ~/.ssh/id_rsa)
    #[arg(short, long, env = "SSHRELAY_IDENTITY")]
    pub identity: Option<PathBuf>,

    /// Known hosts file (default: ~/.ssh/known_hosts)
    #[arg(short = 'o', long, env = "SSHRELAY_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// Network protocol to use when tunneling
    #[arg(short = 'n', long, value_enum, default_value_t = Protocol::Tcp)]
    pub protocol: Protocol,

    /// HTTP only. Cache successful responses to GET requests on disk
    #[arg(short = 'c', long)]
    pub http_cache: bool,

    /// HTTP only. Seconds to keep successful responses in the cache (default: 12 hours)
    #[arg(short = 't', long, value_name = "SECS")]
    pub http_cache_ttl: Option<u64>,

    /// HTTP only. Always answer from the cache when an entry exists, however old
    #[arg(short = 's', long)]
    pub http_cache_serve_stale: bool,

    /// HTTP only. Cache file (default: ~/.sshrelay.httpcache.json)
    #[arg(long, value_name = "PATH")]
    pub http_cache_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub ssh_key_path: PathBuf,
    pub known_hosts_path: PathBuf,
    pub user: String,
    pub remote_host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub http_cache: bool,
    pub http_cache_ttl: Duration,
    pub http_cache_serve_stale: bool,
    pub http_cache_file: PathBuf,
    pub verbose: bool,
}

impl Config {
    /// Validate `opts`, filling in defaults from the home directory and the
    /// login environment.
    pub fn from_options(opts: Options) -> Result<Self, TunnelError> {
        let home = directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        let login = USER_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|user| !user.is_empty()));
        Self::resolve(opts, home.as_deref(), login)
    }

    fn resolve(
        opts: Options,
        home: Option<&Path>,
        login: Option<String>,
    ) -> Result<Self, TunnelError> {
        let (local_port, remote_port) = parse_port_mapping(&opts.port_mapping)?;

        let (user, remote_host) = match opts.remote.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => {
                let user = login.ok_or_else(|| {
                    TunnelError::Config(
                        "no user in --remote and none found in the environment".to_string(),
                    )
                })?;
                (user, opts.remote.clone())
            }
        };
        if user.is_empty() || remote_host.is_empty() {
            return Err(TunnelError::Config(format!(
                "invalid remote '{}', expected [user@]host",
                opts.remote
            )));
        }

        let cache_options_given = opts.http_cache
            || opts.http_cache_ttl.is_some()
            || opts.http_cache_serve_stale
            || opts.http_cache_file.is_some();
        if opts.protocol == Protocol::Tcp && cache_options_given {
            return Err(TunnelError::Config(
                "protocol tcp does not accept http-cache, http-cache-ttl, http-cache-serve-stale or http-cache-file"
                    .to_string(),
            ));
        }

        let in_home = |relative: &[&str]| -> Result<PathBuf, TunnelError> {
            let home = home.ok_or_else(|| {
                TunnelError::Config("could not determine the home directory".to_string())
            })?;
            Ok(relative.iter().fold(home.to_path_buf(), |path, part| path.join(part)))
        };

        let ssh_key_path = match opts.identity {
            Some(path) => path,
            None => in_home(&[SSH_DIR, SSH_KEY])?,
        };
        let known_hosts_path = match opts.known_hosts {
            Some(path) => path,
            None => in_home(&[SSH_DIR, KNOWN_HOSTS_FILE])?,
        };
        let http_cache_file = match opts.http_cache_file {
            Some(path) => path,
            None => in_home(&[CACHE_FILE]).unwrap_or_else(|_| PathBuf::from(CACHE_FILE)),
        };

        let http_cache_ttl = match opts.http_cache_ttl {
            Some(0) | None => DEFAULT_TTL,
            Some(secs) => Duration::from_secs(secs),
        };

        Ok(Self {
            ssh_key_path,
            known_hosts_path,
            user,
            remote_host,
            local_port,
            remote_port,
            protocol: opts.protocol,
            http_cache: opts.http_cache,
            http_cache_ttl,
            http_cache_serve_stale: opts.http_cache_serve_stale,
            http_cache_file,
            verbose: opts.verbose,
        })
    }
}

/// Parse `local:remote`, or a single port used for both ends.
pub fn parse_port_mapping(mapping: &str) -> Result<(u16, u16), TunnelError> {
    let parse = |port: &str| {
        port.trim().parse::<u16>().map_err(|_| {
            TunnelError::Config(format!(
                "invalid port mapping '{}', expected local[:remote]",
                mapping
            ))
        })
    };

    match mapping.split_once(':') {
        Some((local, remote)) => Ok((parse(local)?, parse(remote)?)),
        None => {
            let port = parse(mapping)?;
            Ok((port, port))
        }
    }
}
