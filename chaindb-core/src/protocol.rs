//! Request/response protocol between table clients and table servers
//!
//! Messages are `bincode` bodies behind a 4-byte little-endian length
//! prefix. The same framing carries the coordination service protocol.

use crate::error::{ClientError, ClientResult};
use crate::kv::Entry;
use crate::stats::StatsSnapshot;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted unless configured otherwise
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Put = 10,
    Get = 20,
    Del = 30,
    Size = 40,
    GetKeys = 50,
    GetTable = 60,
    Stats = 70,
    Error = 99,
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Put => "PUT",
            OpCode::Get => "GET",
            OpCode::Del => "DEL",
            OpCode::Size => "SIZE",
            OpCode::GetKeys => "GETKEYS",
            OpCode::GetTable => "GETTABLE",
            OpCode::Stats => "STATS",
            OpCode::Error => "ERROR",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            10 => Ok(OpCode::Put),
            20 => Ok(OpCode::Get),
            30 => Ok(OpCode::Del),
            40 => Ok(OpCode::Size),
            50 => Ok(OpCode::GetKeys),
            60 => Ok(OpCode::GetTable),
            70 => Ok(OpCode::Stats),
            99 => Ok(OpCode::Error),
            _ => Err(()),
        }
    }
}

/// Client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    Del { key: String },
    Size,
    GetKeys,
    GetTable,
    Stats,
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Put { .. } => OpCode::Put,
            Request::Get { .. } => OpCode::Get,
            Request::Del { .. } => OpCode::Del,
            Request::Size => OpCode::Size,
            Request::GetKeys => OpCode::GetKeys,
            Request::GetTable => OpCode::GetTable,
            Request::Stats => OpCode::Stats,
        }
    }

    /// Key carried by the request, if the opcode takes one
    pub fn key(&self) -> Option<&str> {
        match self {
            Request::Put { key, .. } | Request::Get { key } | Request::Del { key } => Some(key),
            _ => None,
        }
    }
}

/// Reason carried by an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Key absent from the table
    NotFound,
    /// Malformed payload (e.g. empty key)
    InvalidArgument,
    /// Local write applied, forwarding to the replica failed
    ForwardFailed,
    Internal,
}

/// Server response; the success variant matches the request's opcode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Value(Vec<u8>),
    Size(usize),
    Keys(Vec<String>),
    Table(Vec<Entry>),
    Stats(StatsSnapshot),
    Error {
        op: OpCode,
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn error(op: OpCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            op,
            code,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> ClientResult<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = bincode::serialize(message)?;
    let length = u32::try_from(body.len()).map_err(|_| ClientError::FrameTooLarge(body.len()))?;

    writer.write_all(&length.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before
/// sending a new frame.
pub async fn read_frame<R, M>(reader: &mut R, max_frame_bytes: usize) -> ClientResult<Option<M>>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut length_bytes = [0u8; 4];
    let first = reader.read(&mut length_bytes).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut length_bytes[first..]).await?;

    let length = u32::from_le_bytes(length_bytes) as usize;
    if length > max_frame_bytes {
        return Err(ClientError::FrameTooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}
