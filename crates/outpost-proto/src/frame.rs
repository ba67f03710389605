//! V1 message codec.
//!
//! Header is `version(1) | command(1)`, integers big-endian, strings
//! length-prefixed (`u16` for short fields, `u32` for JSON payloads).

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Version byte opening every framed message.
pub const VERSION_V1: u8 = 0x01;

/// First byte of a multiplexed frame; seeing it where a V1 command is
/// expected means the peer upgraded the connection to a mux session.
pub const VERSION_MUX: u8 = 0x02;

/// Longest allowed short string field (auth user/pass, event names).
const MAX_STRING: usize = 4096;

/// Longest allowed event JSON payload.
const MAX_EVENT_PAYLOAD: usize = 64 * 1024;

/// Codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("unexpected command {0:?} in this state")]
    UnexpectedCommand(Command),

    #[error("unknown response status: {0:#04x}")]
    UnknownStatus(u8),

    #[error("field of {0} bytes exceeds the frame limit")]
    FieldTooLarge(usize),

    #[error("field is not valid UTF-8")]
    InvalidString,

    #[error("request rejected: {0:?}")]
    Rejected(RespStatus),

    #[error("invalid event payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Auth = 0x01,
    Register = 0x02,
    Bind = 0x03,
    Event = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Resp = 0x07,
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Auth),
            0x02 => Ok(Command::Register),
            0x03 => Ok(Command::Bind),
            0x04 => Ok(Command::Event),
            0x05 => Ok(Command::Ping),
            0x06 => Ok(Command::Pong),
            0x07 => Ok(Command::Resp),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// Response status carried by `Resp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RespStatus {
    Success = 0x00,
    AuthFailed = 0x01,
    ProtocolError = 0x02,
}

impl TryFrom<u8> for RespStatus {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(RespStatus::Success),
            0x01 => Ok(RespStatus::AuthFailed),
            0x02 => Ok(RespStatus::ProtocolError),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

/// A named, JSON-carrying server-to-client event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    payload: Vec<u8>,
}

impl Event {
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Read the two-byte header and return the command.
///
/// Returns `Ok(None)` when the first byte is [`VERSION_MUX`]: the peer has
/// switched the connection to a multiplexed session and the byte stream no
/// longer contains V1 frames.
pub async fn read_command<R>(r: &mut R) -> Result<Option<Command>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let version = r.read_u8().await?;

    match version {
        VERSION_V1 => Ok(Some(Command::try_from(r.read_u8().await?)?)),
        VERSION_MUX => Ok(None),
        other => Err(FrameError::UnsupportedVersion(other)),
    }
}

/// Read a command, treating a mux upgrade as a protocol violation.
pub async fn expect_command<R>(r: &mut R) -> Result<Command, FrameError>
where
    R: AsyncRead + Unpin,
{
    read_command(r)
        .await?
        .ok_or(FrameError::UnsupportedVersion(VERSION_MUX))
}

async fn read_string<R>(r: &mut R) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await? as usize;
    if len > MAX_STRING {
        return Err(FrameError::FieldTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    String::from_utf8(buf).map_err(|_| FrameError::InvalidString)
}

async fn write_string<W>(w: &mut W, s: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if s.len() > MAX_STRING {
        return Err(FrameError::FieldTooLarge(s.len()));
    }

    w.write_u16(s.len() as u16).await?;
    w.write_all(s.as_bytes()).await?;

    Ok(())
}

pub async fn write_auth<W>(w: &mut W, user: &str, pass: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION_V1, Command::Auth as u8]).await?;
    write_string(w, user).await?;
    write_string(w, pass).await?;
    w.flush().await?;

    Ok(())
}

pub async fn read_auth<R>(r: &mut R) -> Result<(String, String), FrameError>
where
    R: AsyncRead + Unpin,
{
    let user = read_string(r).await?;
    let pass = read_string(r).await?;

    Ok((user, pass))
}

pub async fn write_register<W>(w: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION_V1, Command::Register as u8]).await?;
    w.flush().await?;

    Ok(())
}

pub async fn write_bind<W>(w: &mut W, id: Uuid) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION_V1, Command::Bind as u8]).await?;
    w.write_all(id.as_bytes()).await?;
    w.flush().await?;

    Ok(())
}

pub async fn read_bind<R>(r: &mut R) -> Result<Uuid, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 16];
    r.read_exact(&mut buf).await?;

    Ok(Uuid::from_bytes(buf))
}

pub async fn write_event<W, T>(w: &mut W, name: &str, payload: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(payload)?;
    if json.len() > MAX_EVENT_PAYLOAD {
        return Err(FrameError::FieldTooLarge(json.len()));
    }

    w.write_all(&[VERSION_V1, Command::Event as u8]).await?;
    write_string(w, name).await?;
    w.write_u32(json.len() as u32).await?;
    w.write_all(&json).await?;
    w.flush().await?;

    Ok(())
}

pub async fn read_event<R>(r: &mut R) -> Result<Event, FrameError>
where
    R: AsyncRead + Unpin,
{
    let name = read_string(r).await?;

    let len = r.read_u32().await? as usize;
    if len > MAX_EVENT_PAYLOAD {
        return Err(FrameError::FieldTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;

    Ok(Event { name, payload })
}

pub async fn write_ping<W>(w: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION_V1, Command::Ping as u8]).await?;
    w.flush().await?;

    Ok(())
}

pub async fn write_pong<W>(w: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION_V1, Command::Pong as u8]).await?;
    w.flush().await?;

    Ok(())
}

pub async fn write_resp<W>(w: &mut W, status: RespStatus) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&[VERSION_V1, Command::Resp as u8, status as u8])
        .await?;
    w.flush().await?;

    Ok(())
}

pub async fn read_resp<R>(r: &mut R) -> Result<RespStatus, FrameError>
where
    R: AsyncRead + Unpin,
{
    RespStatus::try_from(r.read_u8().await?)
}

/// Read a `Resp` frame (header included) and fail unless it is a success.
pub async fn expect_success<R>(r: &mut R) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match expect_command(r).await? {
        Command::Resp => match read_resp(r).await? {
            RespStatus::Success => Ok(()),
            status => Err(FrameError::Rejected(status)),
        },
        cmd => Err(FrameError::UnexpectedCommand(cmd)),
    }
}
