//! Clap option structs for `got` and `gotd`

use crate::protocol::DEFAULT_PORT;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// got: list, browse and move files on a gotd server
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientOpts {
    /// Server address (host[:port], default port 9876)
    #[arg(short = 'a', long)]
    pub addr: String,

    /// Print the elapsed time of the operation
    #[arg(short = 't', long = "time")]
    pub time: bool,

    /// Hide progress bars
    #[arg(long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// List the server's working directory
    #[command(visible_aliases = ["l", "ls", "ll"])]
    List,

    /// Change the server's working directory
    #[command(visible_aliases = ["c", "cd"])]
    Change { dir: String },

    /// Upload a file or directory into the server's working directory
    #[command(visible_aliases = ["u", "up"])]
    Upload { path: PathBuf },

    /// Download a file or directory into the current directory
    #[command(visible_aliases = ["d", "down"])]
    Download { path: String },
}

/// gotd: serve one working directory to got clients
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct DaemonOpts {
    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Initial working directory
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Append plain-text log lines to this file
    #[arg(long = "log-file", conflicts_with = "journal")]
    pub log_file: Option<PathBuf>,

    /// Append JSONL journal records to this file
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

impl DaemonOpts {
    /// `host:port` to bind, bracketing IPv6 hosts.
    pub fn bind_addr(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }
}
