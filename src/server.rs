//! Got daemon: serves one shared working directory.
//!
//! Each accepted connection is handled on its own task and may carry any
//! number of sequential calls. All connections see the same
//! [`WorkingDir`]: a `change` issued by one client moves every client.

use crate::archive::{self, TempArchive};
use crate::error::{Result, TransferError};
use crate::listing::format_listing;
use crate::logger::Logger;
use crate::protocol::{keys, method, CHUNK_SIZE};
use crate::protocol_core::{DownloadHeader, Kind, Metadata, TransferMetadata};
use crate::rpc::{accept_call, ServerCall};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Duration;

/// The directory every operation resolves paths against.
#[derive(Debug, Clone)]
pub struct WorkingDir {
    current: Arc<Mutex<PathBuf>>,
}

impl WorkingDir {
    pub fn new(root: &Path) -> Result<Self> {
        let canonical = root
            .canonicalize()
            .map_err(|e| TransferError::from_lookup(e, &root.display().to_string()))?;
        if !canonical.is_dir() {
            return Err(TransferError::NotFound(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            current: Arc::new(Mutex::new(canonical)),
        })
    }

    pub fn get(&self) -> PathBuf {
        self.current.lock().clone()
    }

    /// Move to `target`, relative to the current directory unless absolute.
    ///
    /// `enter` runs on the resolved directory before it becomes current;
    /// the directory only moves when `target` exists, is a directory and
    /// `enter` succeeds. Blocking, call from a blocking context.
    pub fn change<T>(&self, target: &str, enter: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let base = self.get();
        let canonical = base
            .join(target)
            .canonicalize()
            .map_err(|e| TransferError::from_lookup(e, target))?;
        if !canonical.is_dir() {
            return Err(TransferError::NotFound(format!("{} is not a directory", target)));
        }
        let entered = enter(&canonical)?;
        *self.current.lock() = canonical;
        Ok(entered)
    }
}

fn join_error(e: tokio::task::JoinError) -> TransferError {
    TransferError::Io(std::io::Error::other(format!("worker task failed: {e}")))
}

fn required<'m>(md: &'m Metadata, key: &str) -> Result<&'m str> {
    match md.get(key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TransferError::Protocol(format!("request metadata missing {:?}", key))),
    }
}

/// Bytes to serve for a download, decided before the header is sent.
struct Prepared {
    file: File,
    kind: Kind,
    size: u64,
    // Removes the packed archive once the response is done.
    _archive: Option<TempArchive>,
}

pub struct Server {
    cwd: WorkingDir,
    logger: Arc<dyn Logger>,
}

impl Server {
    pub fn new(root: &Path, logger: Arc<dyn Logger>) -> Result<Self> {
        Ok(Self {
            cwd: WorkingDir::new(root)?,
            logger,
        })
    }

    /// Accept connections until the listener fails permanently.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.logger.error("accept", &e.to_string());
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let peer = peer.to_string();
                if let Err(e) = server.handle_connection(stream, &peer).await {
                    server.logger.error("connection", &format!("{}: {}", peer, e));
                }
            });
        }
    }

    /// Serve calls on one connection until the client disconnects.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some((m, md)) = accept_call(&mut stream).await? {
            let op = method::name(m);
            self.logger.call(op, peer);
            let mut call = ServerCall::new(&mut stream, md);
            let outcome = match m {
                method::LIST => self.list_files(&mut call).await,
                method::CHDIR => self.change_dir(&mut call).await,
                method::UPLOAD => self.upload_file(&mut call).await,
                method::DOWNLOAD => self.download_file(&mut call).await,
                other => Err(TransferError::Protocol(format!("unknown method {}", other))),
            };
            if let Err(e) = &outcome {
                self.logger.error(op, &e.to_string());
            }
            call.finish(&outcome).await?;
            if outcome.is_err() && !call.request_done() {
                // The client learns of the failure from the STATUS on its next
                // send. Read what it already sent so closing does not reset
                // the connection before that STATUS is delivered.
                let _ = call.drain().await;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn list_files<S>(&self, call: &mut ServerCall<'_, S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        call.expect_end().await?;
        let dir = self.cwd.get();
        let info = tokio::task::spawn_blocking(move || format_listing(&dir))
            .await
            .map_err(join_error)??;
        call.send(info.as_bytes()).await
    }

    async fn change_dir<S>(&self, call: &mut ServerCall<'_, S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = required(call.metadata(), keys::PATH)?.to_string();
        call.expect_end().await?;
        let cwd = self.cwd.clone();
        let info = tokio::task::spawn_blocking(move || {
            cwd.change(&target, |dir| Ok(format_listing(dir)?))
        })
        .await
        .map_err(join_error)??;
        call.send(info.as_bytes()).await
    }

    async fn upload_file<S>(&self, call: &mut ServerCall<'_, S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let meta = TransferMetadata::from_upload_request(call.metadata())?;
        let rel = archive::safe_relative(Path::new(&meta.name))?;
        if rel.as_os_str().is_empty() {
            return Err(TransferError::Protocol(format!("bad upload name {:?}", meta.name)));
        }
        let cwd = self.cwd.get();

        let bytes = match meta.kind {
            Kind::File => {
                let target = cwd.join(&rel);
                let mut file = File::create(&target).await?;
                let received = receive_into(call, &mut file).await;
                drop(file);
                if received.is_err() {
                    if let Err(e) = tokio::fs::remove_file(&target).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            self.logger.cleanup_failed(&target, &e.to_string());
                        }
                    }
                }
                received?
            }
            Kind::Directory => {
                let base = rel
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".to_string());
                let tmp = TempArchive::new_in(&cwd, &base);
                let mut file = File::create(tmp.path()).await?;
                let bytes = receive_into(call, &mut file).await?;
                drop(file);
                let dest = cwd.clone();
                tokio::task::spawn_blocking(move || {
                    let unpacked = archive::unpack(tmp.path(), &dest);
                    drop(tmp);
                    unpacked
                })
                .await
                .map_err(join_error)??;
                bytes
            }
        };

        call.send_header(&Metadata::new().with(keys::OK, "true")).await?;
        self.logger.transfer_done(method::name(method::UPLOAD), &cwd.join(&rel), bytes);
        Ok(())
    }

    async fn download_file<S>(&self, call: &mut ServerCall<'_, S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let requested = required(call.metadata(), keys::PATH)?.to_string();
        call.expect_end().await?;

        let mut prepared = match self.prepare_download(&requested).await {
            Ok(p) => p,
            Err(e) => {
                let header = DownloadHeader::Failed(e.status_message());
                call.send_header(&header.encode()).await?;
                return Err(e);
            }
        };
        let header = DownloadHeader::Ready {
            kind: prepared.kind,
            size: prepared.size,
        };
        call.send_header(&header.encode()).await?;

        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = prepared.file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            call.send(&chunk[..n]).await?;
            sent += n as u64;
        }

        self.logger.transfer_done(
            method::name(method::DOWNLOAD),
            &self.cwd.get().join(&requested),
            sent,
        );
        Ok(())
    }

    async fn prepare_download(&self, requested: &str) -> Result<Prepared> {
        let source = self
            .cwd
            .get()
            .join(requested)
            .canonicalize()
            .map_err(|e| TransferError::from_lookup(e, requested))?;
        let md = tokio::fs::metadata(&source)
            .await
            .map_err(|e| TransferError::from_lookup(e, requested))?;

        if !md.is_dir() {
            let file = File::open(&source).await?;
            return Ok(Prepared {
                file,
                kind: Kind::File,
                size: md.len(),
                _archive: None,
            });
        }

        let tmp = TempArchive::alongside(&source);
        let tmp = tokio::task::spawn_blocking(move || -> Result<TempArchive> {
            archive::pack(&source, tmp.path())?;
            Ok(tmp)
        })
            .await
            .map_err(join_error)??;
        let file = File::open(tmp.path()).await?;
        let size = file.metadata().await?.len();
        Ok(Prepared {
            file,
            kind: Kind::Directory,
            size,
            _archive: Some(tmp),
        })
    }
}

/// Append every request chunk to `file`.
async fn receive_into<S>(call: &mut ServerCall<'_, S>, file: &mut File) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut total = 0u64;
    while let Some(chunk) = call.recv().await? {
        if chunk.len() > CHUNK_SIZE {
            return Err(TransferError::Protocol(format!(
                "chunk of {} bytes exceeds {}",
                chunk.len(),
                CHUNK_SIZE
            )));
        }
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(total)
}

/// Bind `bind` and serve `root` until the process exits.
/// Failing to bind is the only error this returns.
pub async fn serve(bind: &str, root: &Path, logger: Arc<dyn Logger>) -> Result<()> {
    let server = Arc::new(Server::new(root, logger)?);
    let listener = TcpListener::bind(bind).await?;
    server.run(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::rpc::ClientCall;
    use std::fs;
    use tempfile::TempDir;

    fn server_for(root: &Path) -> Arc<Server> {
        Arc::new(Server::new(root, Arc::new(NoopLogger)).unwrap())
    }

    fn resolved(dir: &Path) -> Result<PathBuf> {
        Ok(dir.to_path_buf())
    }

    #[test]
    fn test_change_dir_missing_leaves_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let wd = WorkingDir::new(tmp.path()).unwrap();
        let before = wd.get();

        assert!(matches!(wd.change("nope", resolved), Err(TransferError::NotFound(_))));
        assert_eq!(wd.get(), before);

        fs::write(tmp.path().join("file"), b"x").unwrap();
        assert!(matches!(wd.change("file", resolved), Err(TransferError::NotFound(_))));
        assert_eq!(wd.get(), before);

        let moved = wd.change("sub", resolved).unwrap();
        assert_eq!(moved, before.join("sub"));
        assert_eq!(wd.change("..", resolved).unwrap(), before);
    }

    #[test]
    fn test_working_dir_is_shared_between_clones() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        let wd = WorkingDir::new(tmp.path()).unwrap();
        let other = wd.clone();
        wd.change("a", resolved).unwrap();
        assert!(other.get().ends_with("a"));
    }

    #[test]
    fn test_change_dir_failed_listing_leaves_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let wd = WorkingDir::new(tmp.path()).unwrap();
        let before = wd.get();

        let refused = wd.change("sub", |_| -> Result<()> {
            Err(TransferError::Io(std::io::Error::other("unreadable")))
        });
        assert!(matches!(refused, Err(TransferError::Io(_))));
        assert_eq!(wd.get(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_change_dir_into_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        // Permission bits do not stop a privileged user.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let wd = WorkingDir::new(tmp.path()).unwrap();
        let before = wd.get();
        let listed = wd.change("locked", |dir| Ok(format_listing(dir)?));
        assert!(matches!(listed, Err(TransferError::Io(_))));
        assert_eq!(wd.get(), before);
        assert!(format_listing(&wd.get()).is_ok());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_upload_without_name_is_protocol_error() {
        let tmp = TempDir::new().unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let md = Metadata::new().with(keys::TYPE, keys::TYPE_FILE);
        let mut call = ClientCall::start(client_io, method::UPLOAD, &md).await.unwrap();
        let outcome = async {
            call.send(b"data").await?;
            call.close_send().await?;
            call.header().await
        }
        .await;
        assert!(matches!(outcome, Err(TransferError::Protocol(_))), "got {:?}", outcome);
        drop(call);
        srv.await.unwrap().unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_truncates_existing_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), vec![b'x'; 10_000]).unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let meta = TransferMetadata {
            name: "notes.txt".into(),
            kind: Kind::File,
            size: 0,
        };
        let mut call = ClientCall::start(client_io, method::UPLOAD, &meta.to_upload_request())
            .await
            .unwrap();
        call.send(b"short").await.unwrap();
        call.close_send().await.unwrap();
        assert_eq!(call.header().await.unwrap().get(keys::OK), Some("true"));
        assert_eq!(call.recv().await.unwrap(), None);
        drop(call);
        srv.await.unwrap().unwrap();
        assert_eq!(fs::read(tmp.path().join("notes.txt")).unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_upload_oversize_chunk_removes_partial_file() {
        let tmp = TempDir::new().unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let meta = TransferMetadata {
            name: "big.bin".into(),
            kind: Kind::File,
            size: 0,
        };
        let mut call = ClientCall::start(client_io, method::UPLOAD, &meta.to_upload_request())
            .await
            .unwrap();
        let outcome = async {
            call.send(&[7u8; CHUNK_SIZE]).await?;
            call.send(&vec![7u8; CHUNK_SIZE + 1]).await?;
            call.close_send().await?;
            call.header().await
        }
        .await;
        assert!(matches!(outcome, Err(TransferError::Protocol(_))), "got {:?}", outcome);
        drop(call);
        srv.await.unwrap().unwrap();
        assert!(!tmp.path().join("big.bin").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_failure_stops_client_stream() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("x")).unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let md = Metadata::new().with(keys::NAME, "x");
        let mut call = ClientCall::start(client_io, method::UPLOAD, &md).await.unwrap();
        let chunk = [1u8; CHUNK_SIZE];
        let mut accepted = 0usize;
        let mut failure = None;
        for _ in 0..100 {
            match call.send(&chunk).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(failure, Some(TransferError::Io(_))), "got {:?}", failure);
        assert!(accepted < 100);
        drop(call);
        srv.await.unwrap().unwrap();
        assert!(tmp.path().join("x").is_dir());
    }

    #[tokio::test]
    async fn test_upload_rejects_escaping_name() {
        let tmp = TempDir::new().unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let md = Metadata::new().with(keys::NAME, "../evil");
        let mut call = ClientCall::start(client_io, method::UPLOAD, &md).await.unwrap();
        call.close_send().await.unwrap();
        assert!(matches!(call.header().await, Err(TransferError::Protocol(_))));
        drop(call);
        srv.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_missing_sends_error_header() {
        let tmp = TempDir::new().unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let md = Metadata::new().with(keys::PATH, "ghost.bin");
        let mut call = ClientCall::start(client_io, method::DOWNLOAD, &md).await.unwrap();
        call.close_send().await.unwrap();
        let header = DownloadHeader::decode(&call.header().await.unwrap()).unwrap();
        let msg = match header {
            DownloadHeader::Failed(msg) => msg,
            other => panic!("expected failure header, got {:?}", other),
        };
        assert!(matches!(call.failure(msg).await, TransferError::NotFound(_)));
        drop(call);
        srv.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_download_directory_removes_archive() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("data/sub")).unwrap();
        fs::write(tmp.path().join("data/sub/a.txt"), b"alpha").unwrap();
        let server = server_for(tmp.path());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let srv = tokio::spawn(async move { server.handle_connection(server_io, "test").await });

        let md = Metadata::new().with(keys::PATH, "data");
        let mut call = ClientCall::start(client_io, method::DOWNLOAD, &md).await.unwrap();
        call.close_send().await.unwrap();
        let meta = DownloadHeader::decode(&call.header().await.unwrap())
            .unwrap()
            .into_result("data")
            .unwrap();
        assert_eq!(meta.kind, Kind::Directory);
        let mut received = 0u64;
        while let Some(chunk) = call.recv().await.unwrap() {
            assert!(chunk.len() <= CHUNK_SIZE);
            received += chunk.len() as u64;
        }
        assert_eq!(received, meta.size);
        drop(call);
        srv.await.unwrap().unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["data".to_string()]);
    }
}
