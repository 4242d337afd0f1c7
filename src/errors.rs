use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain is not started")]
    NotStarted,
    #[error("chain is stopped")]
    Stopped,
    #[error("no Raft leader")]
    NoLeader,
    #[error("{0}")]
    BadMessage(String),
    #[error("{0}")]
    Validation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("raft error: {0}")]
    Raft(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<raft::Error> for ChainError {
    fn from(err: raft::Error) -> Self {
        ChainError::Raft(err.to_string())
    }
}

impl From<protobuf::ProtobufError> for ChainError {
    fn from(err: protobuf::ProtobufError) -> Self {
        ChainError::BadMessage(err.to_string())
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
