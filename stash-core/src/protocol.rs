//! Synchronization commands
//!
//! Every message is one pkt-line inside one encrypted packet. Commands are a
//! closed set resolved from their wire names by [`Command::from_pkt_line`];
//! each variant carries its already-validated parameters.
//!
//! Payloads too large for one packet travel as a run of `SEND_STREAM` chunks
//! (slices of one deflated buffer) closed by an empty `SEND_PACKFILE` or
//! `SEND_OBJECT`. The receiver reassembles and inflates them with a
//! [`StreamBuffer`].

use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::compression::{deflate, inflate};
use crate::config::REPOSITORY_SUFFIX;
use crate::error::{Result, StashError};
use crate::object::ObjectId;
use crate::pktline::{PktLine, STREAM_COMMAND};
use crate::transport::SecureChannel;

/// Deflated payloads above this size are streamed
pub const STREAM_THRESHOLD: usize = 8000;

/// Size of each stream chunk
pub const STREAM_CHUNK: usize = 1010;

/// Cap on buffered stream bytes per connection
pub const MAX_STREAM_BUFFER: usize = 256 * 1024 * 1024;

const MAX_ERROR_LEN: usize = 1000;

/// Wire names
pub mod wire {
    pub const LOGIN: &str = "stash-login";
    pub const ERROR: &str = "stash-error";
    pub const AUTHORIZED: &str = "stash-authorized";
    pub const RECEIVE_OBJECT: &str = "stash-receive-object";
    pub const SEND_OBJECT: &str = "stash-send-object";
    pub const RECEIVE_HEAD_COMMIT: &str = "stash-receive-head-commit";
    pub const UPDATE_HEAD: &str = "stash-update-head";
    pub const SEND_STREAM: &str = super::STREAM_COMMAND;
    pub const SEND_PACKFILE: &str = "stash-send-packfile";
    pub const OK: &str = "stash-ok";
}

/// `username@repository@branch@password`
#[derive(Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    pub repository: String,
    pub branch: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(
        username: impl Into<String>,
        repository: impl Into<String>,
        branch: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            repository: repository.into(),
            branch: branch.into(),
            password: password.into(),
        }
    }

    /// Parse a login payload. The password is the remainder after the third
    /// `@`, so it may itself contain `@`.
    pub fn parse(payload: &str) -> Result<Self> {
        let mut parts = payload.splitn(4, '@');
        let (username, repository, branch, password) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(u), Some(r), Some(b), Some(p)) if !u.is_empty() && !r.is_empty() && !b.is_empty() => {
                    (u, r, b, p)
                }
                _ => return Err(StashError::Protocol("malformed login request".into())),
            };
        let repository = repository.strip_suffix(REPOSITORY_SUFFIX).unwrap_or(repository);
        Ok(Self::new(username, repository, branch, password))
    }

    pub fn to_payload(&self) -> String {
        format!("{}@{}@{}@{}", self.username, self.repository, self.branch, self.password)
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("repository", &self.repository)
            .field("branch", &self.branch)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(LoginRequest),
    Error(String),
    Authorized,
    /// Ask for an object by id
    ReceiveObject(ObjectId),
    /// Object payload, `None` when the object does not exist or when this
    /// closes a stream
    SendObject(Option<Vec<u8>>),
    /// Ask for a branch's ref contents
    ReceiveHeadCommit(String),
    UpdateHead(ObjectId),
    SendStream(Vec<u8>),
    /// Packfile records; empty when closing a stream
    SendPackfile(Vec<u8>),
    Ok,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Login(_) => wire::LOGIN,
            Command::Error(_) => wire::ERROR,
            Command::Authorized => wire::AUTHORIZED,
            Command::ReceiveObject(_) => wire::RECEIVE_OBJECT,
            Command::SendObject(_) => wire::SEND_OBJECT,
            Command::ReceiveHeadCommit(_) => wire::RECEIVE_HEAD_COMMIT,
            Command::UpdateHead(_) => wire::UPDATE_HEAD,
            Command::SendStream(_) => wire::SEND_STREAM,
            Command::SendPackfile(_) => wire::SEND_PACKFILE,
            Command::Ok => wire::OK,
        }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        let mut text = message.to_string();
        if text.len() > MAX_ERROR_LEN {
            let mut cut = MAX_ERROR_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Command::Error(text)
    }

    pub fn to_pkt_line(&self) -> PktLine {
        let plain = |payload: Vec<u8>| PktLine::new(self.name(), payload, false);
        match self {
            Command::Login(login) => plain(login.to_payload().into_bytes()),
            Command::Error(message) => plain(message.clone().into_bytes()),
            Command::Authorized | Command::Ok => plain(Vec::new()),
            Command::ReceiveObject(id) | Command::UpdateHead(id) => plain(id.to_hex().into_bytes()),
            Command::ReceiveHeadCommit(branch) => plain(branch.clone().into_bytes()),
            Command::SendObject(None) => plain(Vec::new()),
            Command::SendObject(Some(data)) => PktLine::new(self.name(), data.clone(), true),
            Command::SendStream(chunk) => PktLine::new(self.name(), chunk.clone(), true),
            Command::SendPackfile(data) if data.is_empty() => plain(Vec::new()),
            Command::SendPackfile(data) => PktLine::new(self.name(), data.clone(), true),
        }
    }

    pub fn from_pkt_line(line: PktLine) -> Result<Self> {
        let text = |payload: Vec<u8>| {
            String::from_utf8(payload)
                .map_err(|_| StashError::Protocol(format!("{} payload is not UTF-8", line.command)))
        };
        let id = |payload: Vec<u8>| -> Result<ObjectId> {
            let hex = String::from_utf8(payload)
                .map_err(|_| StashError::Protocol("object id is not UTF-8".into()))?;
            ObjectId::from_hex(hex.trim()).map_err(|e| StashError::Protocol(e.to_string()))
        };

        let command = match line.command.as_str() {
            wire::LOGIN => Command::Login(LoginRequest::parse(&text(line.payload.clone())?)?),
            wire::ERROR => Command::Error(String::from_utf8_lossy(&line.payload).into_owned()),
            wire::AUTHORIZED => Command::Authorized,
            wire::RECEIVE_OBJECT => Command::ReceiveObject(id(line.payload.clone())?),
            wire::SEND_OBJECT if !line.compressed && line.payload.is_empty() => Command::SendObject(None),
            wire::SEND_OBJECT => Command::SendObject(Some(line.payload.clone())),
            wire::RECEIVE_HEAD_COMMIT => Command::ReceiveHeadCommit(text(line.payload.clone())?),
            wire::UPDATE_HEAD => Command::UpdateHead(id(line.payload.clone())?),
            wire::SEND_STREAM => Command::SendStream(line.payload.clone()),
            wire::SEND_PACKFILE => Command::SendPackfile(line.payload.clone()),
            wire::OK => Command::Ok,
            other => return Err(StashError::Protocol(format!("unknown command {:?}", other))),
        };
        Ok(command)
    }
}

/// Which message closes a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    Packfile,
    Object,
}

/// Reassembles `SEND_STREAM` chunks
#[derive(Debug, Default)]
pub struct StreamBuffer {
    chunks: Vec<u8>,
}

impl StreamBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if self.chunks.len() + chunk.len() > MAX_STREAM_BUFFER {
            self.chunks.clear();
            return Err(StashError::Protocol("stream exceeds the buffer limit".into()));
        }
        self.chunks.extend_from_slice(chunk);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Inflate and clear whatever has been buffered; `None` if nothing was
    pub fn take(&mut self) -> Result<Option<Vec<u8>>> {
        if self.chunks.is_empty() {
            return Ok(None);
        }
        let chunks = std::mem::take(&mut self.chunks);
        inflate(&chunks).map(Some)
    }
}

/// A [`SecureChannel`] speaking [`Command`]s
pub struct Connection<S> {
    channel: SecureChannel<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(channel: SecureChannel<S>) -> Self {
        Self { channel }
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        let packet = command.to_pkt_line().encode()?;
        tracing::debug!("-> {} ({} bytes)", command.name(), packet.len());
        self.channel.send_packet(&packet).await
    }

    pub async fn recv(&mut self) -> Result<Command> {
        let packet = self.channel.recv_packet().await?;
        let command = Command::from_pkt_line(PktLine::decode(&packet)?)?;
        tracing::debug!("<- {}", command.name());
        Ok(command)
    }

    /// Send a request and wait for its reply
    pub async fn request(&mut self, command: &Command) -> Result<Command> {
        self.send(command).await?;
        self.recv().await
    }

    /// Wait for `OK`; an `ERROR` reply becomes [`StashError::Remote`]
    pub async fn expect_ok(&mut self) -> Result<()> {
        match self.recv().await? {
            Command::Ok => Ok(()),
            Command::Error(message) => Err(StashError::Remote(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Send a packfile or object payload inline, or as a stream when its
    /// deflated form exceeds [`STREAM_THRESHOLD`]
    pub async fn send_bulk(&mut self, kind: BulkKind, data: Vec<u8>) -> Result<()> {
        let compressed = deflate(&data)?;
        if compressed.len() <= STREAM_THRESHOLD {
            let command = match kind {
                BulkKind::Packfile => Command::SendPackfile(data),
                BulkKind::Object => Command::SendObject(Some(data)),
            };
            return self.send(&command).await;
        }

        tracing::debug!(
            "streaming {} deflated bytes in {}-byte chunks",
            compressed.len(),
            STREAM_CHUNK
        );
        for chunk in compressed.chunks(STREAM_CHUNK) {
            self.send(&Command::SendStream(chunk.to_vec())).await?;
        }
        let terminal = match kind {
            BulkKind::Packfile => Command::SendPackfile(Vec::new()),
            BulkKind::Object => Command::SendObject(None),
        };
        self.send(&terminal).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.channel.shutdown().await
    }
}

/// Error for a reply that does not fit the exchange
pub fn unexpected(command: &Command) -> StashError {
    StashError::Protocol(format!("unexpected {} reply", command.name()))
}
