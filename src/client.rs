//! Got client: the four operations against one server.
//!
//! Every operation opens its own connection. Uploads and downloads run a
//! progress reporter beside the chunk loop and post each chunk's length
//! after it was moved.

use crate::archive::{self, TempArchive};
use crate::error::{Result, TransferError};
use crate::progress::{self, ProgressHandle, TerminalRender};
use crate::protocol::{keys, method, CHUNK_SIZE};
use crate::protocol_core::{DownloadHeader, Kind, Metadata, TransferMetadata};
use crate::rpc::{Channel, ClientCall};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub struct Client {
    channel: Channel,
    local_dir: PathBuf,
    quiet: bool,
}

fn join_error(e: tokio::task::JoinError) -> TransferError {
    TransferError::Io(std::io::Error::other(format!("worker task failed: {e}")))
}

fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::Protocol(format!("{} has no file name", path.display())))
}

/// Run `op` until it completes or `cancel` fires. On cancellation `op` is
/// dropped before returning `None`, so partial files and temporary
/// archives it owns are already removed.
pub async fn until_cancelled<T>(cancel: &CancellationToken, op: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = op => Some(out),
    }
}

impl Client {
    /// Client for the server at `addr` (`host:port`), writing downloads
    /// into the process's current directory.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            channel: Channel::new(addr),
            local_dir: PathBuf::from("."),
            quiet: false,
        }
    }

    /// Directory downloads land in. Defaults to `.`.
    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = dir.into();
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn progress(&self, tag: &str, total: u64) -> ProgressHandle {
        let render = if self.quiet {
            TerminalRender::hidden()
        } else {
            TerminalRender::new()
        };
        progress::start(tag, total, render)
    }

    pub async fn list_files(&self) -> Result<String> {
        let reply = self.channel.unary(method::LIST, &Metadata::new()).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Move the server's working directory; returns the new listing.
    pub async fn change_dir(&self, path: &str) -> Result<String> {
        let md = Metadata::new().with(keys::PATH, path);
        let reply = self.channel.unary(method::CHDIR, &md).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Upload `path` into the server's working directory under its base
    /// name. A directory travels as one archive and is unpacked remotely.
    /// Returns the number of bytes sent.
    pub async fn upload_file(&self, path: &Path) -> Result<u64> {
        // Canonical so `.` and `..` upload under their real names.
        let path = &tokio::fs::canonicalize(path)
            .await
            .map_err(|e| TransferError::from_lookup(e, &path.display().to_string()))?;
        let md = tokio::fs::metadata(path).await?;
        let name = base_name(path)?;

        let (kind, _archive, source) = if md.is_dir() {
            // The guard rides along with the packing so an abandoned
            // upload still removes the archive once packing returns.
            let tmp = TempArchive::alongside(path);
            let src = path.to_path_buf();
            let tmp = tokio::task::spawn_blocking(move || -> Result<TempArchive> {
                archive::pack(&src, tmp.path())?;
                Ok(tmp)
            })
            .await
            .map_err(join_error)??;
            let source = tmp.path().to_path_buf();
            (Kind::Directory, Some(tmp), source)
        } else {
            (Kind::File, None, path.to_path_buf())
        };

        let mut file = File::open(&source).await?;
        let total = file.metadata().await?.len();
        let meta = TransferMetadata {
            name,
            kind,
            size: total,
        };

        let progress = self.progress("upload", total);
        let outcome = async {
            let mut call = self.channel.call(method::UPLOAD, &meta.to_upload_request()).await?;
            let sent = send_chunks(&mut call, &mut file, &progress).await?;
            call.close_send().await?;
            let header = call.header().await?;
            if header.get(keys::OK) != Some("true") {
                return Err(call.failure("upload not confirmed by server".into()).await);
            }
            while call.recv().await?.is_some() {}
            Ok::<u64, TransferError>(sent)
        }
        .await;
        settle(progress, outcome).await
    }

    /// Download `path` from the server's working directory into the
    /// local directory. Nothing is created locally when the server
    /// reports the path missing. Returns the number of bytes received.
    ///
    /// `path` must end in a name (`docs`, `a/b.txt`); `.` and `..` are
    /// refused because the local target is named after it.
    pub async fn download_file(&self, path: &str) -> Result<u64> {
        let name = base_name(Path::new(path))?;
        let md = Metadata::new().with(keys::PATH, path);
        let mut call = self.channel.call(method::DOWNLOAD, &md).await?;
        call.close_send().await?;

        let header = DownloadHeader::decode(&call.header().await?)?;
        let meta = match header.into_result(&name) {
            Ok(meta) => meta,
            Err(msg) => return Err(call.failure(msg).await),
        };

        match meta.kind {
            Kind::File => {
                let target = self.local_dir.join(&meta.name);
                let received = self.receive_chunks(&mut call, &target, meta.size).await;
                if received.is_err() {
                    let _ = tokio::fs::remove_file(&target).await;
                }
                received
            }
            Kind::Directory => {
                let tmp = TempArchive::new_in(&self.local_dir, &meta.name);
                let received = self.receive_chunks(&mut call, tmp.path(), meta.size).await?;
                let dest = self.local_dir.clone();
                tokio::task::spawn_blocking(move || {
                    let unpacked = archive::unpack(tmp.path(), &dest);
                    drop(tmp);
                    unpacked
                })
                .await
                .map_err(join_error)??;
                Ok(received)
            }
        }
    }

    async fn receive_chunks(
        &self,
        call: &mut ClientCall<TcpStream>,
        target: &Path,
        total: u64,
    ) -> Result<u64> {
        let progress = self.progress("download", total);
        let outcome = async {
            let mut out = File::create(target).await?;
            let mut received = 0u64;
            while let Some(chunk) = call.recv().await? {
                out.write_all(&chunk).await?;
                received += chunk.len() as u64;
                progress.notify(chunk.len() as u64).await;
            }
            out.flush().await?;
            Ok::<u64, TransferError>(received)
        }
        .await;
        settle(progress, outcome).await
    }
}

/// End the progress bar to match the transfer's outcome.
async fn settle(progress: ProgressHandle, outcome: Result<u64>) -> Result<u64> {
    if outcome.is_err() {
        progress.cancel();
    }
    progress.finish().await;
    outcome
}

/// Stream `file` as request chunks; the last one is cut to the bytes read.
async fn send_chunks(
    call: &mut ClientCall<TcpStream>,
    file: &mut File,
    progress: &ProgressHandle,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(sent);
        }
        call.send(&buf[..n]).await?;
        sent += n as u64;
        progress.notify(n as u64).await;
    }
}
