//! 房间密钥缓存
//!
//! 每个 (房间号, 密码) 组合只派生一次。并发请求同一组合时只有一个会真正执行
//! KDF，其余等待同一结果。KDF 在阻塞线程池中运行。

use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use super::room_key::{CryptoError, PasswordKdf, RoomKey};
use crate::signaling::RoomId;

/// 缓存键: 房间号 + 密码摘要（不保存明文密码）
type CacheKey = (RoomId, [u8; 32]);

#[derive(Clone)]
pub struct KeyCache {
    kdf: Arc<dyn PasswordKdf>,
    entries: Arc<Mutex<HashMap<CacheKey, Arc<OnceCell<RoomKey>>>>>,
}

impl KeyCache {
    pub fn new(kdf: Arc<dyn PasswordKdf>) -> Self {
        Self {
            kdf,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 获取或派生房间密钥
    pub async fn get_or_derive(
        &self,
        room_id: &RoomId,
        password: &str,
    ) -> Result<RoomKey, CryptoError> {
        let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        let cell = {
            let mut entries = self.entries.lock().await;
            entries
                .entry((room_id.clone(), digest))
                .or_default()
                .clone()
        };

        let key = cell
            .get_or_try_init(|| async {
                debug!("Deriving key for room {}", room_id);
                let kdf = self.kdf.clone();
                let password = password.to_string();
                let room_id = room_id.clone();
                tokio::task::spawn_blocking(move || RoomKey::derive(kdf.as_ref(), &password, &room_id))
                    .await
                    .unwrap_or_else(|e| Err(CryptoError::KeyDerivation(e.to_string())))
            })
            .await?;

        Ok(key.clone())
    }

    /// 已缓存的组合数量
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
