//! Error types shared across ChainDB
//!
//! Storage, transport and coordination each have their own error enum.
//! `DbError` is what the database layers and the membership protocol
//! return; it wraps the other three.

use crate::protocol::ErrorCode;
use thiserror::Error;

/// Storage engine errors (table and bucket lists)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("Invalid size: {0} (must be at least 1)")]
    InvalidSize(usize),

    #[error("Invalid key: keys must be non-empty")]
    InvalidKey,

    #[error("Key not found: {0}")]
    NotFound(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Remote table client and transport errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl From<bincode::Error> for ClientError {
    fn from(err: bincode::Error) -> Self {
        ClientError::Codec(err.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Coordination service errors
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Ephemeral nodes cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<ClientError> for CoordError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Io(e) => CoordError::Io(e),
            ClientError::Codec(e) => CoordError::Codec(e),
            other => CoordError::Connection(other.to_string()),
        }
    }
}

pub type CoordResult<T> = Result<T, CoordError>;

/// Errors surfaced by the database layers and the membership protocol
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Coord(#[from] CoordError),

    /// The local write committed but the replica did not accept it
    #[error("Forward of '{key}' to replica failed: {source}")]
    ForwardFailed {
        key: String,
        #[source]
        source: ClientError,
    },

    #[error("No chain members registered")]
    NoChain,
}

pub type DbResult<T> = Result<T, DbError>;
