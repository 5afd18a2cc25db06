//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, else `./lockstep.toml`)
//! - Merging CLI with file config (CLI takes precedence)

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::core::node::Role;

/// Lockstep - shared lock-step playback on a local network.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Session role. Defaults to guest when `--connect` is given, else host.
    #[clap(long, value_enum)]
    pub role: Option<Role>,

    /// Address to accept peers on (host, or a guest relaying for others).
    #[clap(long)]
    pub listen: Option<SocketAddr>,

    /// Host or relay address to join through (guest).
    #[clap(long)]
    pub connect: Option<SocketAddr>,

    /// Host address dialed directly when `--connect` (a relay) is gone.
    #[clap(long)]
    pub fallback: Option<SocketAddr>,

    /// Six-digit join code. The host generates one when absent.
    #[clap(long)]
    pub session_code: Option<String>,

    /// Stable identity of this peer. Random when absent.
    #[clap(long)]
    pub peer_id: Option<String>,

    /// Display name for this peer.
    #[clap(long)]
    pub display_name: Option<String>,

    /// Playlist entry (host). Repeat for several tracks.
    #[clap(long = "track")]
    #[serde(default)]
    pub tracks: Vec<PathBuf>,

    /// Peer granted operator rights on join (host). Repeatable.
    #[clap(long = "op")]
    #[serde(default)]
    pub operators: Vec<String>,

    /// Directory for all persistent data (slot storage, peer registry, logs).
    /// Defaults to ~/.lockstep/
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// TOML file merged underneath the command line.
    #[clap(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(default)]
    pub verbose: u8,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        Self::resolve(Args::parse())
    }

    fn resolve(mut cli_args: Args) -> Self {
        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(Self::resolve_path);
        cli_args.tracks = std::mem::take(&mut cli_args.tracks)
            .into_iter()
            .map(Self::resolve_path)
            .collect();

        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("lockstep.toml"));
        if let Some(file_args) = Self::from_file(&path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Args>(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                eprintln!("ignoring {}: {e}", path.display());
                None
            }
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.role.is_some() {
            file.role = cli.role;
        }
        if cli.listen.is_some() {
            file.listen = cli.listen;
        }
        if cli.connect.is_some() {
            file.connect = cli.connect;
        }
        if cli.fallback.is_some() {
            file.fallback = cli.fallback;
        }
        if cli.session_code.is_some() {
            file.session_code = cli.session_code;
        }
        if cli.peer_id.is_some() {
            file.peer_id = cli.peer_id;
        }
        if cli.display_name.is_some() {
            file.display_name = cli.display_name;
        }
        if !cli.tracks.is_empty() {
            file.tracks = cli.tracks;
        }
        if !cli.operators.is_empty() {
            file.operators = cli.operators;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        file.config = cli.config;
        file
    }

    /// Role after applying the `--connect` default.
    pub fn role(&self) -> Role {
        self.role.unwrap_or(if self.connect.is_some() { Role::Guest } else { Role::Host })
    }
}
