//! 接收端解码器
//!
//! 每个文件一个状态机:
//!
//! ```text
//! Announced -> Requesting(0) -> Requesting(1) -> ... -> AllChunksReceived
//!           -> Decrypting -> Complete | Failed
//! ```
//!
//! 拉取式流控：只有消费完第 *i* 块才会请求第 *i+1* 块，因此同一
//! (发送端, 接收端, 文件) 内的顺序完全由请求决定。
//!
//! 解密在调用方拿到房间密钥后进行（见 [`TransferDecoder::take_decrypt_job`]），
//! 某个文件解密失败不影响其它会话。

use log::{debug, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::TransferError;
use super::wire::decode_chunk;
use crate::crypto::{CryptoError, NONCE_LEN};
use crate::signaling::{ClientMessage, FileId, FileMeta, PeerId};

/// 会话标识：发送端 + 文件 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub sender: PeerId,
    pub file_id: FileId,
}

impl SessionId {
    pub fn new(sender: PeerId, file_id: FileId) -> Self {
        Self { sender, file_id }
    }
}

/// 会话失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionFailure {
    #[error("decryption failed (room password mismatch?)")]
    Decryption,
    #[error("reassembled {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("chunk {index} not delivered after {attempts} requests")]
    Timeout { index: u64, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Announced,
    Requesting(u64),
    AllChunksReceived,
    Decrypting,
    Complete,
    Failed(SessionFailure),
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

/// 发给发送端的分块请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub to: PeerId,
    pub file_id: FileId,
    pub index: u64,
}

impl From<ChunkRequest> for ClientMessage {
    fn from(req: ChunkRequest) -> Self {
        ClientMessage::RequestChunk {
            to: req.to,
            file_id: req.file_id,
            index: req.index,
        }
    }
}

/// 处理一个分块后的下一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 请求下一块
    Request(ChunkRequest),
    /// 已保存，无需动作（重复或非当前请求的分块）
    Stored,
    /// 所有分块到齐，密文已拼接，等待解密
    Ready(SessionId),
    /// 拼接失败
    Failed(SessionId, SessionFailure),
}

/// 超时检查的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    Retry(ChunkRequest),
    GaveUp(SessionId, SessionFailure),
}

/// 待解密的密文
#[derive(Debug)]
pub struct DecryptJob {
    pub id: SessionId,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// 单个文件的接收会话
#[derive(Debug)]
pub struct TransferSession {
    meta: FileMeta,
    sender: PeerId,
    nonce: [u8; NONCE_LEN],
    slots: Vec<Option<Vec<u8>>>,
    received_bytes: u64,
    status: SessionStatus,
    requested_at: Option<Instant>,
    attempts: u32,
    assembled: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

impl TransferSession {
    fn new(sender: PeerId, meta: FileMeta) -> Result<Self, TransferError> {
        meta.validate()?;
        let nonce = meta.nonce_bytes()?;
        let count = usize::try_from(meta.chunk_count())
            .map_err(|_| TransferError::TooLarge(meta.size))?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| TransferError::TooLarge(meta.size))?;
        slots.resize(count, None);
        Ok(Self {
            meta,
            sender,
            nonce,
            slots,
            received_bytes: 0,
            status: SessionStatus::Announced,
            requested_at: None,
            attempts: 0,
            assembled: None,
            payload: None,
        })
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.meta.size
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// 拼接后的密文长度（解密前）
    pub fn assembled_len(&self) -> Option<usize> {
        self.assembled.as_ref().map(Vec::len)
    }

    /// 解密后的明文
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.payload.take()
    }

    fn id(&self) -> SessionId {
        SessionId::new(self.sender.clone(), self.meta.file_id.clone())
    }

    fn first_missing(&self) -> Option<u64> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|i| i as u64)
    }

    fn request(&mut self, index: u64, now: Instant) -> ChunkRequest {
        if self.status != SessionStatus::Requesting(index) {
            self.attempts = 0;
        }
        self.status = SessionStatus::Requesting(index);
        self.requested_at = Some(now);
        self.attempts += 1;
        ChunkRequest {
            to: self.sender.clone(),
            file_id: self.meta.file_id.clone(),
            index,
        }
    }

    /// 按索引顺序拼接所有分块
    fn assemble(&mut self) -> ChunkOutcome {
        self.requested_at = None;
        let mut ciphertext = Vec::with_capacity(self.received_bytes as usize);
        for slot in self.slots.drain(..) {
            ciphertext.extend(slot.unwrap_or_default());
        }

        let actual = ciphertext.len() as u64;
        if actual != self.meta.size {
            let failure = SessionFailure::SizeMismatch {
                expected: self.meta.size,
                actual,
            };
            self.status = SessionStatus::Failed(failure.clone());
            return ChunkOutcome::Failed(self.id(), failure);
        }

        self.assembled = Some(ciphertext);
        self.status = SessionStatus::AllChunksReceived;
        ChunkOutcome::Ready(self.id())
    }
}

/// 接收端解码器
#[derive(Debug)]
pub struct TransferDecoder {
    sessions: HashMap<SessionId, TransferSession>,
    request_timeout: Duration,
    max_retries: u32,
}

impl TransferDecoder {
    pub fn new(request_timeout: Duration, max_retries: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            request_timeout,
            max_retries,
        }
    }

    /// 收到 `file-meta`：分配会话并请求第 0 块
    pub fn announce(
        &mut self,
        from: &PeerId,
        meta: FileMeta,
        now: Instant,
    ) -> Result<ChunkRequest, TransferError> {
        let id = SessionId::new(from.clone(), meta.file_id.clone());
        if self.sessions.contains_key(&id) {
            return Err(TransferError::DuplicateFile(id.file_id));
        }

        let mut session = TransferSession::new(from.clone(), meta)?;
        debug!(
            "New transfer {} from {}: {} bytes in {} chunks",
            session.meta.name,
            from,
            session.meta.size,
            session.slot_count()
        );
        let request = session.request(0, now);
        self.sessions.insert(id, session);
        Ok(request)
    }

    /// 处理对端传输上收到的一个分块帧
    pub fn accept_chunk(
        &mut self,
        from: &PeerId,
        frame: &[u8],
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        let frame = decode_chunk(frame)?;
        let header = frame.header;
        let id = SessionId::new(from.clone(), header.file_id.clone());
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| TransferError::UnknownSession(header.file_id.clone()))?;

        if !matches!(session.status, SessionStatus::Requesting(_)) {
            debug!("Ignoring chunk {} of {}: {:?}", header.index, id.file_id, session.status);
            return Ok(ChunkOutcome::Stored);
        }

        let count = session.slot_count() as u64;
        if header.index >= count {
            return Err(TransferError::IndexOutOfRange {
                file_id: header.file_id,
                index: header.index,
                count,
            });
        }
        if frame.body.len() > session.meta.chunk_size as usize {
            return Err(TransferError::OversizedChunk {
                index: header.index,
                len: frame.body.len(),
            });
        }

        // 重复的分块覆盖同一个槽位
        let slot = &mut session.slots[header.index as usize];
        if let Some(previous) = slot.replace(frame.body.to_vec()) {
            session.received_bytes -= previous.len() as u64;
        }
        session.received_bytes += frame.body.len() as u64;

        let current = session.status == SessionStatus::Requesting(header.index);
        if header.is_last || (current && header.index + 1 == count) {
            return Ok(match session.first_missing() {
                None => session.assemble(),
                Some(missing) => {
                    warn!(
                        "Last chunk of {} arrived with chunk {} missing",
                        id.file_id, missing
                    );
                    ChunkOutcome::Request(session.request(missing, now))
                }
            });
        }

        if current {
            return Ok(ChunkOutcome::Request(session.request(header.index + 1, now)));
        }
        Ok(ChunkOutcome::Stored)
    }

    /// 取出已拼接的密文进行解密，会话进入 `Decrypting`
    pub fn take_decrypt_job(&mut self, id: &SessionId) -> Option<DecryptJob> {
        let session = self.sessions.get_mut(id)?;
        if session.status != SessionStatus::AllChunksReceived {
            return None;
        }
        let ciphertext = session.assembled.take()?;
        session.status = SessionStatus::Decrypting;
        Some(DecryptJob {
            id: id.clone(),
            nonce: session.nonce,
            ciphertext,
        })
    }

    /// 所有分块到齐但尚未开始解密的会话（例如还在等待密钥）
    pub fn awaiting_decryption(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.status == SessionStatus::AllChunksReceived)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// 记录解密结果
    pub fn finish(
        &mut self,
        id: &SessionId,
        result: Result<Vec<u8>, CryptoError>,
    ) -> Option<&mut TransferSession> {
        let session = self.sessions.get_mut(id)?;
        if session.status != SessionStatus::Decrypting {
            return None;
        }
        match result {
            Ok(plaintext) => {
                session.payload = Some(plaintext);
                session.status = SessionStatus::Complete;
            }
            Err(e) => {
                warn!("Failed to decrypt {}: {}", session.meta.name, e);
                session.status = SessionStatus::Failed(SessionFailure::Decryption);
            }
        }
        Some(session)
    }

    /// 重发超时的请求，超过重试次数的会话标记为失败
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<TimeoutAction> {
        let mut actions = Vec::new();
        for session in self.sessions.values_mut() {
            let SessionStatus::Requesting(index) = session.status else {
                continue;
            };
            let Some(requested_at) = session.requested_at else {
                continue;
            };
            if now.duration_since(requested_at) < self.request_timeout {
                continue;
            }

            if session.attempts > self.max_retries {
                let failure = SessionFailure::Timeout {
                    index,
                    attempts: session.attempts,
                };
                session.status = SessionStatus::Failed(failure.clone());
                session.requested_at = None;
                actions.push(TimeoutAction::GaveUp(session.id(), failure));
            } else {
                debug!("Re-requesting chunk {} of {}", index, session.meta.file_id);
                actions.push(TimeoutAction::Retry(session.request(index, now)));
            }
        }
        actions
    }

    /// 丢弃某个发送端的所有会话，返回被丢弃的会话
    pub fn abandon_peer(&mut self, peer: &PeerId) -> Vec<TransferSession> {
        let ids: Vec<SessionId> = self
            .sessions
            .keys()
            .filter(|id| &id.sender == peer)
            .cloned()
            .collect();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect()
    }

    pub fn session(&self, id: &SessionId) -> Option<&TransferSession> {
        self.sessions.get(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<TransferSession> {
        self.sessions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
