//! 发送端编码器
//!
//! 整个文件读入内存，用一个新的随机 nonce 一次性加密，然后把密文按固定大小切块。
//! 发送端从不主动推送分块，只在收到某个对端对第 *i* 块的 `request-chunk` 后
//! 才发送第 *i* 块。每个 (对端, 文件) 的进度独立记录。

use base64::{Engine as _, engine::general_purpose};
use log::debug;
use std::collections::HashMap;
use std::path::Path;

use super::TransferError;
use super::wire::{ChunkHeader, encode_chunk};
use crate::crypto::{RoomKey, random_nonce};
use crate::signaling::{FileId, FileMeta, MAX_CHUNK_COUNT, MAX_CHUNK_SIZE, MAX_FILE_SIZE, PeerId};

/// 待发送的明文文件
#[derive(Debug, Clone)]
pub struct PlainFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl PlainFile {
    /// 读取文件并猜测 MIME 类型
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Self {
            name,
            mime_type,
            data,
        })
    }
}

/// 已加密、等待被拉取的文件
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    meta: FileMeta,
    ciphertext: Vec<u8>,
}

impl OutgoingFile {
    /// 用房间密钥一次性加密整个文件
    pub fn seal(file: &PlainFile, key: &RoomKey, chunk_size: u32) -> Result<Self, TransferError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        let nonce = random_nonce();
        let ciphertext = key.seal(&nonce, &file.data)?;
        let size = ciphertext.len() as u64;
        if size > MAX_FILE_SIZE || size.div_ceil(u64::from(chunk_size)) > MAX_CHUNK_COUNT {
            return Err(TransferError::TooLarge(size));
        }

        let meta = FileMeta {
            file_id: FileId::random(),
            name: file.name.clone(),
            size,
            mime_type: file.mime_type.clone(),
            nonce: general_purpose::STANDARD.encode(nonce),
            chunk_size,
        };

        Ok(Self { meta, ciphertext })
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn chunk_count(&self) -> u64 {
        self.meta.chunk_count()
    }

    /// 第 `index` 块密文，以及它是否是最后一块
    pub fn chunk(&self, index: u64) -> Option<(&[u8], bool)> {
        let count = self.chunk_count();
        if index >= count {
            return None;
        }
        let chunk_size = self.meta.chunk_size as usize;
        let start = usize::try_from(index).ok()?.checked_mul(chunk_size)?;
        let end = (start + chunk_size).min(self.ciphertext.len());
        Some((&self.ciphertext[start..end], index + 1 == count))
    }
}

/// 某个对端拉取某个文件的进度
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendProgress {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub total_chunks: u64,
    pub last_index: Option<u64>,
}

/// 响应一次请求的结果
#[derive(Debug, Clone)]
pub struct ServedChunk {
    pub frame: Vec<u8>,
    pub is_last: bool,
    pub progress: SendProgress,
}

/// 发送端编码器
#[derive(Debug, Default)]
pub struct TransferEncoder {
    files: HashMap<FileId, OutgoingFile>,
    progress: HashMap<(PeerId, FileId), SendProgress>,
}

impl TransferEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个可供拉取的文件，返回要广播的元数据
    pub fn register(&mut self, file: OutgoingFile) -> FileMeta {
        let meta = file.meta.clone();
        debug!(
            "Registered {} ({} bytes, {} chunks)",
            meta.name,
            meta.size,
            file.chunk_count()
        );
        self.files.insert(meta.file_id.clone(), file);
        meta
    }

    /// 响应 `request-chunk`
    pub fn serve(
        &mut self,
        peer: &PeerId,
        file_id: &FileId,
        index: u64,
    ) -> Result<ServedChunk, TransferError> {
        let file = self
            .files
            .get(file_id)
            .ok_or_else(|| TransferError::UnknownFile(file_id.clone()))?;
        let (body, is_last) = file
            .chunk(index)
            .ok_or_else(|| TransferError::IndexOutOfRange {
                file_id: file_id.clone(),
                index,
                count: file.chunk_count(),
            })?;

        let header = ChunkHeader {
            file_id: file_id.clone(),
            index,
            is_last,
        };
        let frame = encode_chunk(&header, body)?;

        let progress = self
            .progress
            .entry((peer.clone(), file_id.clone()))
            .or_insert_with(|| SendProgress {
                total_chunks: file.chunk_count(),
                ..Default::default()
            });
        progress.chunks_sent += 1;
        progress.bytes_sent += body.len() as u64;
        progress.last_index = Some(index);

        Ok(ServedChunk {
            frame,
            is_last,
            progress: progress.clone(),
        })
    }

    pub fn progress(&self, peer: &PeerId, file_id: &FileId) -> Option<&SendProgress> {
        self.progress.get(&(peer.clone(), file_id.clone()))
    }

    /// 丢弃某个对端的所有发送进度
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.progress.retain(|(p, _), _| p != peer);
    }

    pub fn file(&self, file_id: &FileId) -> Option<&OutgoingFile> {
        self.files.get(file_id)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileMeta> {
        self.files.values().map(OutgoingFile::meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_LEN, TAG_LEN};
    use crate::transfer::wire::decode_chunk;

    fn key() -> RoomKey {
        RoomKey::new([5u8; KEY_LEN])
    }

    fn plain(len: usize) -> PlainFile {
        PlainFile {
            name: "data.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: (0..len).map(|i| (i % 251) as u8).collect(),
        }
    }

    #[test]
    fn test_meta_describes_ciphertext() {
        let file = OutgoingFile::seal(&plain(1000), &key(), 256).unwrap();
        let meta = file.meta();
        assert_eq!(meta.size, 1000 + TAG_LEN as u64);
        assert_eq!(meta.chunk_size, 256);
        assert_eq!(file.chunk_count(), 4);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_fresh_nonce_per_file() {
        let a = OutgoingFile::seal(&plain(10), &key(), 256).unwrap();
        let b = OutgoingFile::seal(&plain(10), &key(), 256).unwrap();
        assert_ne!(a.meta().nonce, b.meta().nonce);
        assert_ne!(a.meta().file_id, b.meta().file_id);
    }

    #[test]
    fn test_chunks_cover_ciphertext() {
        let file = OutgoingFile::seal(&plain(1000), &key(), 256).unwrap();
        let total: usize = (0..file.chunk_count())
            .map(|i| file.chunk(i).unwrap().0.len())
            .sum();
        assert_eq!(total as u64, file.meta().size);

        let (last, is_last) = file.chunk(3).unwrap();
        assert!(is_last);
        assert_eq!(last.len(), 1016 - 3 * 256);
        assert!(file.chunk(4).is_none());
    }

    #[test]
    fn test_serve_tracks_progress_per_peer() {
        let mut encoder = TransferEncoder::new();
        let meta = encoder.register(OutgoingFile::seal(&plain(600), &key(), 256).unwrap());
        let alice = PeerId::new("alice");
        let bob = PeerId::new("bob");

        let served = encoder.serve(&alice, &meta.file_id, 0).unwrap();
        let frame = decode_chunk(&served.frame).unwrap();
        assert_eq!(frame.header.index, 0);
        assert!(!frame.header.is_last);
        assert_eq!(frame.body.len(), 256);

        encoder.serve(&alice, &meta.file_id, 1).unwrap();
        encoder.serve(&bob, &meta.file_id, 0).unwrap();

        let alice_progress = encoder.progress(&alice, &meta.file_id).unwrap();
        assert_eq!(alice_progress.chunks_sent, 2);
        assert_eq!(alice_progress.last_index, Some(1));
        assert_eq!(encoder.progress(&bob, &meta.file_id).unwrap().chunks_sent, 1);

        encoder.forget_peer(&alice);
        assert!(encoder.progress(&alice, &meta.file_id).is_none());
        assert!(encoder.progress(&bob, &meta.file_id).is_some());
    }

    #[test]
    fn test_serve_rejects_bad_requests() {
        let mut encoder = TransferEncoder::new();
        let meta = encoder.register(OutgoingFile::seal(&plain(100), &key(), 256).unwrap());
        let peer = PeerId::new("p");

        assert!(matches!(
            encoder.serve(&peer, &FileId::new("nope"), 0),
            Err(TransferError::UnknownFile(_))
        ));
        assert!(matches!(
            encoder.serve(&peer, &meta.file_id, 1),
            Err(TransferError::IndexOutOfRange { count: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert!(matches!(
            OutgoingFile::seal(&plain(10), &key(), 0),
            Err(TransferError::InvalidChunkSize(0))
        ));
    }
}
