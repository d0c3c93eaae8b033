//! 房间密钥
//!
//! 同一房间的所有成员各自从房间密码派生出相同的对称密钥，密钥本身从不传输：
//! - 盐: SHA-256(域分隔串 ‖ 房间号)
//! - KDF: Argon2id，输出 32 字节
//! - AEAD: ChaCha20-Poly1305，96 位随机 nonce
//!
//! 密码不一致时派生出的密钥不同，解密会因认证标签不匹配而失败。

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::signaling::RoomId;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// Poly1305 认证标签长度，密文比明文长这么多字节
pub const TAG_LEN: usize = 16;

const SALT_DOMAIN: &[u8] = b"sharenear/room-salt/v1";

/// 加密错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,
}

/// 基于密码的密钥派生
pub trait PasswordKdf: Send + Sync {
    fn derive(&self, password: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError>;
}

/// Argon2id 密钥派生
#[derive(Debug, Clone)]
pub struct Argon2Kdf {
    params: Params,
}

impl Argon2Kdf {
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// 自定义代价参数（测试中使用低代价参数）
    pub fn with_params(params: Params) -> Self {
        Self { params }
    }
}

impl Default for Argon2Kdf {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordKdf for Argon2Kdf {
    fn derive(&self, password: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut key = [0u8; KEY_LEN];
        argon
            .hash_password_into(password, salt, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }
}

/// 房间号对应的盐
pub fn room_salt(room_id: &RoomId) -> [u8; 32] {
    Sha256::new()
        .chain_update(SALT_DOMAIN)
        .chain_update(room_id.as_str().as_bytes())
        .finalize()
        .into()
}

/// 生成随机 nonce
pub fn random_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

/// 房间共享密钥
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey {
    key: [u8; KEY_LEN],
}

impl RoomKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// 从房间密码派生密钥
    pub fn derive(
        kdf: &dyn PasswordKdf,
        password: &str,
        room_id: &RoomId,
    ) -> Result<Self, CryptoError> {
        let salt = room_salt(room_id);
        kdf.derive(password.as_bytes(), &salt).map(Self::new)
    }

    /// 一次性加密整个载荷，返回 `密文 ‖ 标签`
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)
    }

    /// 解密并校验认证标签
    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

#[cfg(test)]
pub(crate) fn fast_kdf() -> Argon2Kdf {
    Argon2Kdf::with_params(Params::new(8, 1, 1, Some(KEY_LEN)).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = RoomKey::new([3u8; KEY_LEN]);
        let nonce = random_nonce();
        let plaintext = b"Hello, ShareNear!";

        let sealed = key.seal(&nonce, plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);
        assert_eq!(key.open(&nonce, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_same_password_same_key() {
        let kdf = fast_kdf();
        let room = RoomId::new("AB12CD");
        let a = RoomKey::derive(&kdf, "hunter2", &room).unwrap();
        let b = RoomKey::derive(&kdf, "hunter2", &room).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_room_id_is_salt() {
        let kdf = fast_kdf();
        let a = RoomKey::derive(&kdf, "hunter2", &RoomId::new("AB12CD")).unwrap();
        let b = RoomKey::derive(&kdf, "hunter2", &RoomId::new("AB12CE")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let kdf = fast_kdf();
        let room = RoomId::new("AB12CD");
        let sender = RoomKey::derive(&kdf, "hunter2", &room).unwrap();
        let receiver = RoomKey::derive(&kdf, "wrong", &room).unwrap();

        let nonce = random_nonce();
        let sealed = sender.seal(&nonce, b"top secret").unwrap();
        assert_eq!(receiver.open(&nonce, &sealed), Err(CryptoError::Decryption));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = RoomKey::new([9u8; KEY_LEN]);
        let nonce = random_nonce();
        let mut sealed = key.seal(&nonce, b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(key.open(&nonce, &sealed), Err(CryptoError::Decryption));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = RoomKey::new([1u8; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "RoomKey(..)");
    }
}
