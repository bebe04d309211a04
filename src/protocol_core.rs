//! Shared protocol logic for the client and server engines
//!
//! Frame header handling, the key/value metadata codec, and the typed
//! views (`TransferMetadata`, `DownloadHeader`) the engines work with
//! instead of raw metadata maps.

use crate::error::{Result, TransferError};
use crate::protocol::{keys, MAGIC, MAX_FRAME_SIZE, VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Validate frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(TransferError::Transport(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; 11] {
    let mut header = [0u8; 11];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; 11]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(TransferError::Transport("invalid magic in frame header".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(TransferError::Transport(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    Ok((frame_type, payload_len))
}

fn transport(e: std::io::Error) -> TransferError {
    TransferError::Transport(e.to_string())
}

/// Write one frame. Socket failures surface as `Transport`.
pub async fn write_frame<S>(stream: &mut S, t: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let hdr = build_frame_header(t, payload.len() as u32);
    stream.write_all(&hdr).await.map_err(transport)?;
    if !payload.is_empty() {
        stream.write_all(payload).await.map_err(transport)?;
    }
    stream.flush().await.map_err(transport)?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF before any header byte.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<(u8, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 11];
    let mut filled = 0;
    while filled < hdr.len() {
        let n = stream.read(&mut hdr[filled..]).await.map_err(transport)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TransferError::Transport("connection closed mid-frame".into()));
        }
        filled += n;
    }
    let (typ, len_u32) = parse_frame_header(&hdr)?;
    let len = len_u32 as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.map_err(transport)?;
    }
    Ok(Some((typ, payload)))
}

/// Append a u16-length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(TransferError::Protocol(format!(
            "string too long: {} bytes (max {})",
            s.len(),
            u16::MAX
        )));
    }
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Read a u16-length-prefixed UTF-8 string starting at `*off`.
pub fn get_str(buf: &[u8], off: &mut usize) -> Result<String> {
    if buf.len() < *off + 2 {
        return Err(TransferError::Protocol("truncated string length".into()));
    }
    let n = u16::from_le_bytes([buf[*off], buf[*off + 1]]) as usize;
    *off += 2;
    if buf.len() < *off + n {
        return Err(TransferError::Protocol("truncated string body".into()));
    }
    let s = std::str::from_utf8(&buf[*off..*off + n])
        .map_err(|e| TransferError::Protocol(format!("invalid UTF-8: {e}")))?;
    *off += n;
    Ok(s.to_string())
}

/// Small key/value map carried alongside a call.
///
/// Encoded as `count u16 | (key str | value str)*`. Insertion order is
/// kept; inserting an existing key replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pairs: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + self.pairs.len() * 16);
        out.extend_from_slice(&(self.pairs.len() as u16).to_le_bytes());
        for (k, v) in &self.pairs {
            put_str(&mut out, k)?;
            put_str(&mut out, v)?;
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TransferError::Protocol("truncated metadata".into()));
        }
        let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let mut off = 2;
        let mut md = Metadata::new();
        for _ in 0..count {
            let k = get_str(buf, &mut off)?;
            let v = get_str(buf, &mut off)?;
            md.insert(&k, v);
        }
        if off != buf.len() {
            return Err(TransferError::Protocol("trailing bytes after metadata".into()));
        }
        Ok(md)
    }
}

/// Whether a transfer carries a plain file or a packed directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Directory,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::File => keys::TYPE_FILE,
            Kind::Directory => keys::TYPE_DIR,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            keys::TYPE_FILE => Ok(Kind::File),
            keys::TYPE_DIR => Ok(Kind::Directory),
            other => Err(TransferError::Protocol(format!("unknown transfer type {:?}", other))),
        }
    }
}

/// Out-of-band description of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub name: String,
    pub kind: Kind,
    /// Announced byte count; only meaningful for downloads.
    pub size: u64,
}

impl TransferMetadata {
    /// Request metadata for an upload: `name` and `type`.
    pub fn to_upload_request(&self) -> Metadata {
        Metadata::new()
            .with(keys::NAME, self.name.clone())
            .with(keys::TYPE, self.kind.as_str())
    }

    /// Parse upload request metadata. A missing or empty `name` is a
    /// protocol error; a missing `type` means a plain file.
    pub fn from_upload_request(md: &Metadata) -> Result<Self> {
        let name = match md.get(keys::NAME) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => return Err(TransferError::Protocol("save file name not defined".into())),
        };
        let kind = match md.get(keys::TYPE) {
            Some(t) => Kind::parse(t)?,
            None => Kind::File,
        };
        Ok(Self { name, kind, size: 0 })
    }
}

/// Response header of a download, decided before any chunk is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadHeader {
    Ready { kind: Kind, size: u64 },
    /// The server will send no data. A present `error` key fails the call
    /// even when its value is empty.
    Failed(String),
}

impl DownloadHeader {
    pub fn encode(&self) -> Metadata {
        match self {
            DownloadHeader::Ready { kind, size } => Metadata::new()
                .with(keys::TYPE, kind.as_str())
                .with(keys::SIZE, size.to_string()),
            DownloadHeader::Failed(msg) => Metadata::new().with(keys::ERROR, msg.clone()),
        }
    }

    pub fn decode(md: &Metadata) -> Result<Self> {
        if let Some(msg) = md.get(keys::ERROR) {
            return Ok(DownloadHeader::Failed(msg.to_string()));
        }
        let kind = Kind::parse(
            md.get(keys::TYPE)
                .ok_or_else(|| TransferError::Protocol("download header missing type".into()))?,
        )?;
        let size = md
            .get(keys::SIZE)
            .ok_or_else(|| TransferError::Protocol("download header missing size".into()))?
            .parse::<u64>()
            .map_err(|e| TransferError::Protocol(format!("bad size in download header: {e}")))?;
        Ok(DownloadHeader::Ready { kind, size })
    }

    /// Typed view for the engines: the metadata, or the remote failure.
    pub fn into_result(self, name: &str) -> std::result::Result<TransferMetadata, String> {
        match self {
            DownloadHeader::Ready { kind, size } => Ok(TransferMetadata {
                name: name.to_string(),
                kind,
                size,
            }),
            DownloadHeader::Failed(msg) => Err(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(frame::DATA, 4096);
        let (typ, len) = parse_frame_header(&header).unwrap();
        assert_eq!(typ, frame::DATA);
        assert_eq!(len, 4096);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(frame::CALL, 10);
        header[0..4].copy_from_slice(b"WRNG");
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(frame::CALL, 10);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size_edge_cases() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[test]
    fn test_metadata_insert_replaces() {
        let mut md = Metadata::new().with("name", "a");
        md.insert("name", "b");
        assert_eq!(md.get("name"), Some("b"));
        let decoded = Metadata::decode(&md.encode().unwrap()).unwrap();
        assert_eq!(decoded, md);
    }

    #[test]
    fn test_metadata_decode_rejects_truncation() {
        let bytes = Metadata::new().with("path", "docs").encode().unwrap();
        assert!(Metadata::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Metadata::decode(&[]).is_err());
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(Metadata::decode(&extra).is_err());
    }

    #[test]
    fn test_upload_request_requires_name() {
        let md = Metadata::new().with(keys::TYPE, keys::TYPE_DIR);
        assert!(matches!(
            TransferMetadata::from_upload_request(&md),
            Err(TransferError::Protocol(_))
        ));
        let md = md.with(keys::NAME, "");
        assert!(TransferMetadata::from_upload_request(&md).is_err());
    }

    #[test]
    fn test_upload_request_defaults_to_file() {
        let md = Metadata::new().with(keys::NAME, "notes.txt");
        let meta = TransferMetadata::from_upload_request(&md).unwrap();
        assert_eq!(meta.kind, Kind::File);
        assert_eq!(meta.name, "notes.txt");
    }

    #[test]
    fn test_download_header_error_supersedes() {
        let md = Metadata::new()
            .with(keys::TYPE, keys::TYPE_FILE)
            .with(keys::SIZE, "10")
            .with(keys::ERROR, "");
        assert_eq!(
            DownloadHeader::decode(&md).unwrap(),
            DownloadHeader::Failed(String::new())
        );
    }

    #[test]
    fn test_download_header_ready() {
        let header = DownloadHeader::Ready { kind: Kind::Directory, size: 10240 };
        let decoded = DownloadHeader::decode(&header.encode()).unwrap();
        let meta = decoded.into_result("data").unwrap();
        assert_eq!(meta.kind, Kind::Directory);
        assert_eq!(meta.size, 10240);
    }

    #[test]
    fn test_download_header_missing_fields() {
        let md = Metadata::new().with(keys::TYPE, keys::TYPE_FILE);
        assert!(DownloadHeader::decode(&md).is_err());
        let md = Metadata::new().with(keys::SIZE, "1");
        assert!(DownloadHeader::decode(&md).is_err());
        let md = Metadata::new().with(keys::TYPE, "link").with(keys::SIZE, "1");
        assert!(DownloadHeader::decode(&md).is_err());
    }

    #[tokio::test]
    async fn test_frame_io_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_frame(&mut a, frame::DATA, b"hello").await.unwrap();
        write_frame(&mut a, frame::END, &[]).await.unwrap();
        drop(a);
        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some((frame::DATA, b"hello".to_vec()))
        );
        assert_eq!(read_frame(&mut b).await.unwrap(), Some((frame::END, Vec::new())));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }
}
