//! Wire codec for the `COMMAND;PAYLOAD` text protocol.
//!
//! Every frame is one UTF-8 line. The command is everything before the first
//! `;` and the payload is everything after it, so chat text may itself contain
//! semicolons. Server `MESSAGE` payloads carry an `OWNER|BODY` pair split on the
//! first `|`.

use std::{fmt, io};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const COMMAND_DELIMITER: char = ';';
const OWNER_DELIMITER: char = '|';

/// Longest line accepted from a peer, newline included.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frames a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Message { text: String },
    JoinRoom { room: String },
    QuitRoom,
    ChangeName { name: String },
    Disconnect,
}

/// Frames the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Connected { name: String },
    Message { owner: String, body: String },
    Error { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is missing the ';' command delimiter")]
    MissingDelimiter,
    #[error("frame has an empty command")]
    EmptyCommand,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("message frame is missing the '|' owner delimiter")]
    MissingOwner,
}

impl ClientFrame {
    /// Decodes one client line. An empty line means the peer is going away.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        if line.is_empty() {
            return Ok(ClientFrame::Disconnect);
        }

        let (command, payload) = split_command(line)?;
        match command {
            "MESSAGE" => Ok(ClientFrame::Message {
                text: payload.to_string(),
            }),
            "JOIN_ROOM" => Ok(ClientFrame::JoinRoom {
                room: payload.to_string(),
            }),
            "QUIT_ROOM" => Ok(ClientFrame::QuitRoom),
            "CHANGE_NAME" => Ok(ClientFrame::ChangeName {
                name: payload.to_string(),
            }),
            "DISCONNECT" => Ok(ClientFrame::Disconnect),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ClientFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientFrame::Message { text } => write!(f, "MESSAGE;{text}"),
            ClientFrame::JoinRoom { room } => write!(f, "JOIN_ROOM;{room}"),
            ClientFrame::QuitRoom => f.write_str("QUIT_ROOM;"),
            ClientFrame::ChangeName { name } => write!(f, "CHANGE_NAME;{name}"),
            ClientFrame::Disconnect => f.write_str("DISCONNECT;"),
        }
    }
}

impl ServerFrame {
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let (command, payload) = split_command(line)?;
        match command {
            "CONNECTED" => Ok(ServerFrame::Connected {
                name: payload.to_string(),
            }),
            "MESSAGE" => {
                let (owner, body) = payload
                    .split_once(OWNER_DELIMITER)
                    .ok_or(DecodeError::MissingOwner)?;
                Ok(ServerFrame::Message {
                    owner: owner.to_string(),
                    body: body.to_string(),
                })
            }
            "ERROR" => Ok(ServerFrame::Error {
                reason: payload.to_string(),
            }),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFrame::Connected { name } => write!(f, "CONNECTED;{name}"),
            ServerFrame::Message { owner, body } => write!(f, "MESSAGE;{owner}|{body}"),
            ServerFrame::Error { reason } => write!(f, "ERROR;{reason}"),
        }
    }
}

fn split_command(line: &str) -> Result<(&str, &str), DecodeError> {
    let (command, payload) = line
        .split_once(COMMAND_DELIMITER)
        .ok_or(DecodeError::MissingDelimiter)?;
    if command.is_empty() {
        return Err(DecodeError::EmptyCommand);
    }
    Ok((command, payload))
}

/// Reads one newline-terminated line, without its line ending.
///
/// Returns `Ok(None)` once the peer has closed its side. Lines longer than
/// [`MAX_FRAME_LEN`] are rejected with `InvalidData`.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut pending = Vec::new();
    read_frame_resumable(reader, &mut pending).await
}

/// Same as [`read_frame`], but bytes of an unfinished line are kept in
/// `pending` across calls.
///
/// This makes it usable as a `select!` branch: when another branch wins, the
/// partial line stays in `pending` and the next call continues it. `pending`
/// is empty again after every returned frame.
pub async fn read_frame_resumable<R>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = MAX_FRAME_LEN.saturating_sub(pending.len()) as u64;
    (&mut *reader)
        .take(remaining)
        .read_until(b'\n', pending)
        .await?;
    if pending.is_empty() {
        return Ok(None);
    }
    if pending.last() != Some(&b'\n') && pending.len() >= MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {MAX_FRAME_LEN} bytes"),
        ));
    }

    let line = String::from_utf8(std::mem::take(pending))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes a frame followed by `\n` and flushes so the peer sees it promptly.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: fmt::Display,
{
    let mut encoded = frame.to_string().into_bytes();
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
