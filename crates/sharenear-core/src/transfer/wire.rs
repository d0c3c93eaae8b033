//! 分块帧格式
//!
//! 每个分块是对端传输上的一条二进制消息:
//!
//! ```text
//! {"fileId":"…","index":3,"isLast":false} 0x00 <密文分块>
//! ```
//!
//! JSON 头中不会出现原始 0x00（serde_json 会转义控制字符），
//! 因此第一个 0x00 就是分隔符。

use serde::{Deserialize, Serialize};

use crate::signaling::FileId;

/// 头与数据之间的保留分隔字节
pub const SEPARATOR: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub file_id: FileId,
    pub index: u64,
    pub is_last: bool,
}

/// 解码后的分块帧，`body` 借用原始消息
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    pub header: ChunkHeader,
    pub body: &'a [u8],
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("chunk frame has no separator")]
    MissingSeparator,
    #[error("malformed chunk header: {0}")]
    BadHeader(#[from] serde_json::Error),
}

/// 编码一个分块帧
pub fn encode_chunk(header: &ChunkHeader, body: &[u8]) -> Result<Vec<u8>, WireError> {
    let head = serde_json::to_vec(header)?;
    let mut frame = Vec::with_capacity(head.len() + 1 + body.len());
    frame.extend_from_slice(&head);
    frame.push(SEPARATOR);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// 在分隔符处拆分头和数据
pub fn decode_chunk(frame: &[u8]) -> Result<ChunkFrame<'_>, WireError> {
    let split = frame
        .iter()
        .position(|b| *b == SEPARATOR)
        .ok_or(WireError::MissingSeparator)?;
    let header: ChunkHeader = serde_json::from_slice(&frame[..split])?;
    Ok(ChunkFrame {
        header,
        body: &frame[split + 1..],
    })
}
