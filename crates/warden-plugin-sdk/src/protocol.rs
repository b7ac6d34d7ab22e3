//! Wire format shared by the host and plugin processes.
//!
//! Every message is one JSON object on its own line. The host sends a
//! [`Request`] naming a function and carrying a single string payload; the
//! plugin answers with a [`Response`] holding either a string result or an
//! [`RpcError`]. Ids are chosen by the client and echoed back unchanged.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest message line [`read_line`] accepts, newline included.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub id: u64,
    pub function: String,
    pub payload: String,
}

impl Request {
    pub fn new(id: u64, function: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id,
            function: function.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(String),
    Error(RpcError),
}

impl Response {
    pub fn ok(id: u64, result: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result.into()),
        }
    }

    pub fn err(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn into_result(self) -> Result<String, RpcError> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        }
    }
}

/// Error reported by the plugin in place of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No handler is registered under the requested name.
    UnknownFunction,
    /// The handler ran and returned an error.
    HandlerFailed,
    /// The request line could not be decoded.
    BadRequest,
}

/// Serializes `message` and writes it followed by a newline, then flushes.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Reads the next line from `reader`. Returns `Ok(None)` on a clean EOF.
///
/// A line longer than [`MAX_LINE_BYTES`] is an `InvalidData` error; the
/// stream is out of sync after that and should be dropped.
pub async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_line_limited(reader, MAX_LINE_BYTES).await
}

async fn read_line_limited<R>(reader: &mut R, limit: usize) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_line(&mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message exceeds {limit} bytes"),
        ));
    }
    Ok(Some(line))
}
