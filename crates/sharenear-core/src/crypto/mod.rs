//! ShareNear Crypto Module
//!
//! - 房间密钥派生 (Argon2id，房间号作为盐)
//! - 整文件 AEAD 加密 (ChaCha20-Poly1305)
//! - 派生结果缓存

pub mod cache;
pub mod room_key;

pub use cache::KeyCache;
pub use room_key::{
    Argon2Kdf, CryptoError, KEY_LEN, NONCE_LEN, PasswordKdf, RoomKey, TAG_LEN, random_nonce,
};
