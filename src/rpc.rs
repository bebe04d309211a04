//! Streaming RPC substrate over framed TCP.
//!
//! Every call has the same shape:
//!
//! ```text
//! client -> server:  CALL(method | metadata)  DATA*  END
//! server -> client:  HEADER(metadata)  DATA*  STATUS(code | message)
//! ```
//!
//! Unary calls carry their reply in a single DATA frame. Client-streaming
//! calls send chunks as request DATA; server-streaming calls send them as
//! response DATA after the HEADER. A non-OK STATUS may arrive at any point
//! and ends the call.

use crate::error::{Result, TransferError};
use crate::protocol::{frame, status, timeouts};
use crate::protocol_core::{
    get_str, parse_frame_header, put_str, read_frame, validate_frame_size, write_frame, Metadata,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

fn encode_status(code: u8, message: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1 + 2 + message.len());
    out.push(code);
    put_str(&mut out, message)?;
    Ok(out)
}

fn decode_status(payload: &[u8]) -> Result<(u8, String)> {
    if payload.is_empty() {
        return Err(TransferError::Transport("empty STATUS frame".into()));
    }
    let mut off = 1;
    let msg = get_str(payload, &mut off)?;
    Ok((payload[0], msg))
}

fn status_result(payload: &[u8]) -> Result<()> {
    let (code, msg) = decode_status(payload)?;
    if code == status::OK {
        Ok(())
    } else {
        Err(TransferError::from_status(code, msg))
    }
}

/// Client handle for a server address. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct Channel {
    addr: String,
}

impl Channel {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        let stream = match timeout(
            Duration::from_millis(timeouts::CONNECT_MS),
            TcpStream::connect(&self.addr),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(TransferError::Transport(format!("connect {}: {}", self.addr, e)))
            }
            Err(_) => {
                return Err(TransferError::Transport(format!(
                    "connect {}: timed out after {} ms",
                    self.addr,
                    timeouts::CONNECT_MS
                )))
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Open a call and send its request metadata.
    pub async fn call(&self, method: u8, md: &Metadata) -> Result<ClientCall<TcpStream>> {
        let stream = self.connect().await?;
        ClientCall::start(stream, method, md).await
    }

    /// Request metadata in, single reply message out.
    pub async fn unary(&self, method: u8, md: &Metadata) -> Result<Vec<u8>> {
        let mut call = self.call(method, md).await?;
        call.close_send().await?;
        call.header().await?;
        let reply = call
            .recv()
            .await?
            .ok_or_else(|| TransferError::Protocol("unary call returned no reply".into()))?;
        match call.recv().await? {
            None => Ok(reply),
            Some(_) => Err(TransferError::Protocol("unary call returned extra messages".into())),
        }
    }
}

const FRAME_HEADER_LEN: usize = 11;

/// Client side of one in-flight call.
///
/// Response bytes are buffered in `inbox` so a STATUS sent while the
/// request is still streaming can be picked up between sends.
pub struct ClientCall<S> {
    stream: S,
    inbox: Vec<u8>,
    header: Option<Metadata>,
    finished: bool,
}

impl<S> ClientCall<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn start(mut stream: S, method: u8, md: &Metadata) -> Result<Self> {
        let mut payload = vec![method];
        payload.extend_from_slice(&md.encode()?);
        write_frame(&mut stream, frame::CALL, &payload).await?;
        Ok(Self {
            stream,
            inbox: Vec::new(),
            header: None,
            finished: false,
        })
    }

    /// Send one request message. Fails with the server's error once it
    /// has ended the call, even if the socket would still take the bytes.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_ended().await?;
        match write_frame(&mut self.stream, frame::DATA, data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.remote_failure().await.unwrap_or(err)),
        }
    }

    /// Half-close: no more request messages.
    pub async fn close_send(&mut self) -> Result<()> {
        match write_frame(&mut self.stream, frame::END, &[]).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.remote_failure().await.unwrap_or(err)),
        }
    }

    /// Response metadata; waits for it if it has not arrived yet.
    pub async fn header(&mut self) -> Result<Metadata> {
        if let Some(md) = &self.header {
            return Ok(md.clone());
        }
        match self.next_frame().await? {
            (frame::HEADER, payload) => {
                let md = Metadata::decode(&payload)?;
                self.header = Some(md.clone());
                Ok(md)
            }
            (frame::STATUS, payload) => {
                self.finished = true;
                status_result(&payload)?;
                Err(TransferError::Protocol("call ended without a header".into()))
            }
            (t, _) => Err(TransferError::Protocol(format!("expected HEADER, got frame {}", t))),
        }
    }

    /// Next response message, `None` once the call completed successfully.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        if self.header.is_none() {
            self.header().await?;
        }
        match self.next_frame().await? {
            (frame::DATA, payload) => Ok(Some(payload)),
            (frame::STATUS, payload) => {
                self.finished = true;
                status_result(&payload)?;
                Ok(None)
            }
            (t, _) => Err(TransferError::Protocol(format!("unexpected frame {} in response", t))),
        }
    }

    /// The error for a call whose header announced failure: the STATUS
    /// that follows when the server sent one, otherwise `message` itself.
    pub async fn failure(&mut self, message: String) -> TransferError {
        if let Some(err) = self.remote_failure().await {
            return err;
        }
        if message.is_empty() {
            TransferError::Protocol("remote reported an unspecified error".into())
        } else {
            TransferError::Protocol(message)
        }
    }

    async fn remote_failure(&mut self) -> Option<TransferError> {
        if self.finished {
            return None;
        }
        loop {
            match self.next_frame().await {
                Ok((frame::STATUS, payload)) => {
                    self.finished = true;
                    return status_result(&payload).err();
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Take whatever response bytes are ready without waiting, and fail if
    /// the first buffered frame is a STATUS.
    async fn check_ended(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        tokio::select! {
            biased;
            read = self.stream.read_buf(&mut self.inbox) => {
                read.map_err(|e| TransferError::Transport(e.to_string()))?;
            }
            _ = std::future::ready(()) => {}
        }
        match self.peek_frame_type()? {
            Some(frame::STATUS) => match self.remote_failure().await {
                Some(err) => Err(err),
                None => Err(TransferError::Protocol("call ended before the request was sent".into())),
            },
            _ => Ok(()),
        }
    }

    fn peek_frame_type(&self) -> Result<Option<u8>> {
        if self.inbox.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        hdr.copy_from_slice(&self.inbox[..FRAME_HEADER_LEN]);
        Ok(Some(parse_frame_header(&hdr)?.0))
    }

    /// Split one complete frame off the front of `inbox`.
    fn take_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        if self.inbox.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        hdr.copy_from_slice(&self.inbox[..FRAME_HEADER_LEN]);
        let (t, len) = parse_frame_header(&hdr)?;
        let len = len as usize;
        validate_frame_size(len)?;
        if self.inbox.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.inbox[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.inbox.drain(..FRAME_HEADER_LEN + len);
        Ok(Some((t, payload)))
    }

    async fn next_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            let n = self
                .stream
                .read_buf(&mut self.inbox)
                .await
                .map_err(|e| TransferError::Transport(e.to_string()))?;
            if n == 0 {
                let msg = if self.inbox.is_empty() {
                    "connection closed by server"
                } else {
                    "connection closed mid-frame"
                };
                return Err(TransferError::Transport(msg.into()));
            }
        }
    }
}

/// Read the CALL frame that opens the next call on a server connection.
/// `None` means the client closed the connection between calls.
pub async fn accept_call<S>(stream: &mut S) -> Result<Option<(u8, Metadata)>>
where
    S: AsyncRead + Unpin,
{
    match read_frame(stream).await? {
        None => Ok(None),
        Some((frame::CALL, payload)) => {
            if payload.is_empty() {
                return Err(TransferError::Protocol("empty CALL frame".into()));
            }
            Ok(Some((payload[0], Metadata::decode(&payload[1..])?)))
        }
        Some((t, _)) => Err(TransferError::Protocol(format!("expected CALL, got frame {}", t))),
    }
}

/// Server side of one in-flight call.
pub struct ServerCall<'a, S> {
    stream: &'a mut S,
    metadata: Metadata,
    request_done: bool,
    header_sent: bool,
}

impl<'a, S> ServerCall<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, metadata: Metadata) -> Self {
        Self {
            stream,
            metadata,
            request_done: false,
            header_sent: false,
        }
    }

    /// Request metadata sent with CALL.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the client's END has been consumed.
    pub fn request_done(&self) -> bool {
        self.request_done
    }

    /// Next request message, `None` once the client half-closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.request_done {
            return Ok(None);
        }
        match read_frame(&mut *self.stream).await? {
            Some((frame::DATA, payload)) => Ok(Some(payload)),
            Some((frame::END, _)) => {
                self.request_done = true;
                Ok(None)
            }
            Some((t, _)) => Err(TransferError::Protocol(format!("unexpected frame {} in request", t))),
            None => Err(TransferError::Transport("client closed the stream before END".into())),
        }
    }

    /// Consume the rest of the request, rejecting any message.
    pub async fn expect_end(&mut self) -> Result<()> {
        match self.recv().await? {
            None => Ok(()),
            Some(_) => Err(TransferError::Protocol("call takes no request messages".into())),
        }
    }

    pub async fn send_header(&mut self, md: &Metadata) -> Result<()> {
        if self.header_sent {
            return Err(TransferError::Protocol("header already sent".into()));
        }
        write_frame(&mut *self.stream, frame::HEADER, &md.encode()?).await?;
        self.header_sent = true;
        Ok(())
    }

    /// Send one response message; an empty header goes first if none was sent.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.header_sent {
            self.send_header(&Metadata::new()).await?;
        }
        write_frame(&mut *self.stream, frame::DATA, data).await
    }

    /// Discard request messages up to the client's END, so a client still
    /// streaming reaches the point where it reads the STATUS.
    pub async fn drain(&mut self) -> Result<()> {
        while self.recv().await?.is_some() {}
        Ok(())
    }

    /// Terminate the call with the handler's outcome.
    pub async fn finish(&mut self, outcome: &Result<()>) -> Result<()> {
        let payload = match outcome {
            Ok(()) => {
                if !self.header_sent {
                    self.send_header(&Metadata::new()).await?;
                }
                encode_status(status::OK, "")?
            }
            Err(e) => encode_status(e.status_code(), &e.status_message())?,
        };
        write_frame(&mut *self.stream, frame::STATUS, &payload).await
    }
}
