//! 信令协议消息格式
//!
//! 所有信令消息都是带 `type` 标签的 JSON 对象：
//! - `type`: kebab-case 消息类型，如 `join-room`、`ice-candidate`
//! - 其余字段: camelCase
//!
//! 客户端发送 [`ClientMessage`]，服务器转发 [`ServerMessage`]。
//! 中继只根据类型标签路由，不解析 `sdp`/`candidate` 等载荷内容。

use base64::{Engine as _, engine::general_purpose};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::crypto::NONCE_LEN;

/// 房间号长度
pub const ROOM_ID_LEN: usize = 6;

/// 房间号字符集（大写 base-36）
const ROOM_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 单个分块的最大字节数
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// 单个文件密文的最大字节数，整个文件会读入内存
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// 单个文件的最大分块数
pub const MAX_CHUNK_COUNT: u64 = 1 << 20;

/// sdp / candidate 等不透明载荷的上限
pub const MAX_SIGNAL_BYTES: usize = 64 * 1024;

const MAX_PASSWORD_BYTES: usize = 1024;
const MAX_CHAT_BYTES: usize = 4096;
const MAX_NAME_BYTES: usize = 1024;

static ROOM_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Z]{6}$").unwrap());

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id! {
    /// 对端 ID，每个存活的信令连接唯一
    PeerId
}

string_id! {
    /// 房间号
    RoomId
}

string_id! {
    /// 文件 ID，由发送端为每个共享文件生成
    FileId
}

impl PeerId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl FileId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl RoomId {
    /// 生成随机房间号（不检查冲突，冲突由注册表负责重试）
    pub fn generate<R: rand::Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..ROOM_ID_LEN)
            .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn is_well_formed(&self) -> bool {
        ROOM_ID_PATTERN.is_match(&self.0)
    }
}

/// 文件元数据，通过 `file-meta` 在房间内广播
///
/// `size` 是密文长度，接收端据此计算分块数量。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Base64 编码的 AEAD nonce
    pub nonce: String,
    pub chunk_size: u32,
}

impl FileMeta {
    /// 分块数量: `ceil(size / chunk_size)`
    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(u64::from(self.chunk_size.max(1)))
    }

    /// 解码 nonce
    pub fn nonce_bytes(&self) -> Result<[u8; NONCE_LEN], ProtocolError> {
        let bytes = general_purpose::STANDARD
            .decode(&self.nonce)
            .map_err(|_| ProtocolError::InvalidNonce)?;
        bytes.try_into().map_err(|_| ProtocolError::InvalidNonce)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        non_empty("fileId", self.file_id.as_str())?;
        non_empty("name", &self.name)?;
        bounded("name", &self.name, MAX_NAME_BYTES)?;
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(self.chunk_size));
        }
        if self.size == 0 {
            return Err(ProtocolError::Empty { field: "size" });
        }
        if self.size > MAX_FILE_SIZE {
            return Err(ProtocolError::FileTooLarge(self.size));
        }
        if self.chunk_count() > MAX_CHUNK_COUNT {
            return Err(ProtocolError::TooManyChunks(self.chunk_count()));
        }
        self.nonce_bytes().map(|_| ())
    }
}

/// 信令协议错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u32),
    #[error("invalid nonce encoding")]
    InvalidNonce,
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),
    #[error("too many chunks: {0}")]
    TooManyChunks(u64),
}

/// 客户端 -> 服务器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateRoom { password: String },
    JoinRoom { room_id: RoomId, password: String },
    LeaveRoom,
    Offer { to: PeerId, sdp: String },
    Answer { to: PeerId, sdp: String },
    IceCandidate { to: PeerId, candidate: String },
    RequestChunk { to: PeerId, file_id: FileId, index: u64 },
    FileMeta { room_id: RoomId, metadata: FileMeta },
    ChatMessage { room_id: RoomId, message: String },
}

/// 中继路由方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// 由房间注册表处理（创建/加入/离开）
    Registry,
    /// 定向发送给某个对端
    Peer(&'a PeerId),
    /// 广播给房间内除发送者以外的所有成员
    Room(&'a RoomId),
}

impl ClientMessage {
    /// 解析并校验客户端消息
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 消息类型标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create-room",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RequestChunk { .. } => "request-chunk",
            Self::FileMeta { .. } => "file-meta",
            Self::ChatMessage { .. } => "chat-message",
        }
    }

    pub fn route(&self) -> Route<'_> {
        match self {
            Self::CreateRoom { .. } | Self::JoinRoom { .. } | Self::LeaveRoom => Route::Registry,
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::RequestChunk { to, .. } => Route::Peer(to),
            Self::FileMeta { room_id, .. } | Self::ChatMessage { room_id, .. } => {
                Route::Room(room_id)
            }
        }
    }

    /// 中继边界校验
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::CreateRoom { password } => bounded("password", password, MAX_PASSWORD_BYTES),
            Self::JoinRoom { room_id, password } => {
                well_formed(room_id)?;
                bounded("password", password, MAX_PASSWORD_BYTES)
            }
            Self::LeaveRoom => Ok(()),
            Self::Offer { to, sdp } | Self::Answer { to, sdp } => {
                non_empty("to", to.as_str())?;
                non_empty("sdp", sdp)?;
                bounded("sdp", sdp, MAX_SIGNAL_BYTES)
            }
            Self::IceCandidate { to, candidate } => {
                non_empty("to", to.as_str())?;
                non_empty("candidate", candidate)?;
                bounded("candidate", candidate, MAX_SIGNAL_BYTES)
            }
            Self::RequestChunk { to, file_id, .. } => {
                non_empty("to", to.as_str())?;
                non_empty("fileId", file_id.as_str())
            }
            Self::FileMeta { room_id, metadata } => {
                well_formed(room_id)?;
                metadata.validate()
            }
            Self::ChatMessage { room_id, message } => {
                well_formed(room_id)?;
                non_empty("message", message)?;
                bounded("message", message, MAX_CHAT_BYTES)
            }
        }
    }
}

/// 服务器 -> 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// 连接建立后分配的对端 ID
    Welcome { peer_id: PeerId },
    RoomCreated { room_id: RoomId },
    JoinResult {
        success: bool,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        #[serde(default)]
        members: Vec<PeerId>,
    },
    UserJoined { peer_id: PeerId, members: Vec<PeerId> },
    UserLeft { peer_id: PeerId },
    Offer { from: PeerId, sdp: String },
    Answer { from: PeerId, sdp: String },
    IceCandidate { from: PeerId, candidate: String },
    RequestChunk { from: PeerId, file_id: FileId, index: u64 },
    FileMeta { from: PeerId, metadata: FileMeta },
    ChatMessage { from: PeerId, message: String },
    Error { message: String },
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// 把客户端的定向/广播消息改写为带 `from` 的转发形式
    ///
    /// 注册表类消息没有转发形式，返回 `None`。
    pub fn forwarded(from: &PeerId, msg: ClientMessage) -> Option<Self> {
        let from = from.clone();
        let forwarded = match msg {
            ClientMessage::Offer { sdp, .. } => Self::Offer { from, sdp },
            ClientMessage::Answer { sdp, .. } => Self::Answer { from, sdp },
            ClientMessage::IceCandidate { candidate, .. } => Self::IceCandidate { from, candidate },
            ClientMessage::RequestChunk { file_id, index, .. } => Self::RequestChunk {
                from,
                file_id,
                index,
            },
            ClientMessage::FileMeta { metadata, .. } => Self::FileMeta { from, metadata },
            ClientMessage::ChatMessage { message, .. } => Self::ChatMessage { from, message },
            ClientMessage::CreateRoom { .. }
            | ClientMessage::JoinRoom { .. }
            | ClientMessage::LeaveRoom => return None,
        };
        Some(forwarded)
    }
}

fn well_formed(room_id: &RoomId) -> Result<(), ProtocolError> {
    if room_id.is_well_formed() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidRoomId(room_id.to_string()))
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        Err(ProtocolError::Empty { field })
    } else {
        Ok(())
    }
}

fn bounded(field: &'static str, value: &str, max: usize) -> Result<(), ProtocolError> {
    if value.len() > max {
        Err(ProtocolError::TooLong { field, max })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> FileMeta {
        FileMeta {
            file_id: FileId::new("f1"),
            name: "photo.jpg".to_string(),
            size: 100_000,
            mime_type: "image/jpeg".to_string(),
            nonce: general_purpose::STANDARD.encode([7u8; NONCE_LEN]),
            chunk_size: 16_384,
        }
    }

    #[test]
    fn test_parse_join_room() {
        let msg =
            ClientMessage::decode(r#"{"type":"join-room","roomId":"AB12CD","password":"hunter2"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: RoomId::new("AB12CD"),
                password: "hunter2".to_string()
            }
        );
        assert_eq!(msg.route(), Route::Registry);
    }

    #[test]
    fn test_ice_candidate_tag() {
        let msg = ClientMessage::IceCandidate {
            to: PeerId::new("p2"),
            candidate: "10.0.0.2:4000".to_string(),
        };
        let text = msg.encode().unwrap();
        assert!(text.contains("\"type\":\"ice-candidate\""), "{text}");
        assert_eq!(msg.route(), Route::Peer(&PeerId::new("p2")));
    }

    #[test]
    fn test_request_chunk_camel_case() {
        let msg = ServerMessage::RequestChunk {
            from: PeerId::new("p1"),
            file_id: FileId::new("f1"),
            index: 3,
        };
        let text = msg.encode().unwrap();
        assert!(text.contains("\"fileId\":\"f1\""), "{text}");
        assert!(!text.contains("file_id"));
    }

    #[test]
    fn test_reject_bad_room_id() {
        let err = ClientMessage::decode(r#"{"type":"join-room","roomId":"ab12","password":""}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRoomId(_)));
    }

    #[test]
    fn test_reject_unknown_kind() {
        let err = ClientMessage::decode(r#"{"type":"shutdown"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_file_meta_validation() {
        assert!(meta().validate().is_ok());
        assert_eq!(meta().chunk_count(), 7);

        let mut bad_nonce = meta();
        bad_nonce.nonce = "AAAA".to_string();
        assert!(matches!(bad_nonce.validate(), Err(ProtocolError::InvalidNonce)));

        let mut bad_chunk = meta();
        bad_chunk.chunk_size = 0;
        assert!(matches!(
            bad_chunk.validate(),
            Err(ProtocolError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn test_file_meta_size_bounds() {
        let mut huge = meta();
        huge.size = u64::MAX / 2;
        huge.chunk_size = 1;
        assert!(matches!(huge.validate(), Err(ProtocolError::FileTooLarge(_))));

        let mut tiny_chunks = meta();
        tiny_chunks.size = MAX_CHUNK_COUNT + 1;
        tiny_chunks.chunk_size = 1;
        assert!(matches!(
            tiny_chunks.validate(),
            Err(ProtocolError::TooManyChunks(n)) if n == MAX_CHUNK_COUNT + 1
        ));

        let mut largest = meta();
        largest.size = MAX_FILE_SIZE;
        largest.chunk_size = 16_384;
        assert!(largest.validate().is_ok());
    }

    #[test]
    fn test_forwarded_replaces_to_with_from() {
        let sender = PeerId::new("p1");
        let msg = ClientMessage::Offer {
            to: PeerId::new("p2"),
            sdp: "token".to_string(),
        };
        assert_eq!(
            ServerMessage::forwarded(&sender, msg),
            Some(ServerMessage::Offer {
                from: sender.clone(),
                sdp: "token".to_string()
            })
        );
        assert_eq!(ServerMessage::forwarded(&sender, ClientMessage::LeaveRoom), None);
    }

    #[test]
    fn test_generated_room_id_well_formed() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert!(RoomId::generate(&mut rng).is_well_formed());
        }
    }
}
