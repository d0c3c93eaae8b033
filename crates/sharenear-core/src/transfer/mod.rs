//! 文件传输模块
//!
//! 拉取式分块传输:
//! - `encoder`: 发送端，整文件加密后按请求逐块发送
//! - `decoder`: 接收端，逐块请求、重组并解密
//! - `wire`: 分块帧格式

pub mod decoder;
pub mod encoder;
pub mod wire;

pub use decoder::{
    ChunkOutcome, ChunkRequest, DecryptJob, SessionFailure, SessionId, SessionStatus,
    TimeoutAction, TransferDecoder, TransferSession,
};
pub use encoder::{OutgoingFile, PlainFile, SendProgress, ServedChunk, TransferEncoder};
pub use wire::{ChunkFrame, ChunkHeader, WireError, decode_chunk, encode_chunk};

use crate::crypto::CryptoError;
use crate::signaling::{FileId, ProtocolError};

/// 默认分块大小 (16 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// 传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u32),
    #[error("file too large: {0} bytes")]
    TooLarge(u64),
    #[error("unknown file: {0}")]
    UnknownFile(FileId),
    #[error("no transfer in progress for file {0}")]
    UnknownSession(FileId),
    #[error("file {0} already announced")]
    DuplicateFile(FileId),
    #[error("chunk {index} out of range for {file_id} ({count} chunks)")]
    IndexOutOfRange {
        file_id: FileId,
        index: u64,
        count: u64,
    },
    #[error("chunk {index} carries {len} bytes, more than the announced chunk size")]
    OversizedChunk { index: u64, len: usize },
    #[error("malformed chunk: {0}")]
    Malformed(#[from] WireError),
    #[error("invalid file metadata: {0}")]
    InvalidMeta(#[from] ProtocolError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
