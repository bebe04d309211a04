//! got: remote working-directory file transfer
//!
//! A `gotd` server exposes one working directory; the `got` client lists
//! it, moves it, and uploads or downloads files and whole directories in
//! 4 KiB chunks over a small framed RPC protocol.

pub mod archive;
pub mod cli;
pub mod client;
pub mod error;
pub mod listing;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod rpc;
pub mod server;
pub mod url;
