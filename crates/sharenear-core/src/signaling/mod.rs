//! 信令模块
//!
//! 包含:
//! - 对端 / 房间 / 文件 ID 类型
//! - 客户端与服务器之间的信令消息（带类型标签的封闭枚举）

pub mod protocol;

pub use protocol::{
    ClientMessage, FileId, FileMeta, MAX_CHUNK_COUNT, MAX_CHUNK_SIZE, MAX_FILE_SIZE, PeerId,
    ProtocolError, Route, RoomId, ServerMessage,
};
