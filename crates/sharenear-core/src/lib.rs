//! ShareNear Core Library
//!
//! 基于房间的点对点加密文件共享
//!
//! # 模块
//!
//! - **signaling**: 信令消息格式
//! - **room**: 房间注册表（服务器端）
//! - **relay**: 信令中继（服务器端）
//! - **crypto**: 房间密钥派生和整文件 AEAD 加密
//! - **transfer**: 拉取式分块传输的编码器和解码器
//! - **peer**: 对端连接状态和直连传输
//! - **client**: 事件驱动的客户端
//!
//! # 使用示例
//!
//! ## 创建房间并共享文件
//!
//! ```ignore
//! use sharenear_core::{ClientEvent, ClientSettings, client};
//!
//! let settings = ClientSettings::load();
//! let mut running = client::connect(&settings).await?;
//! running.handle.create_room("hunter2")?;
//! running.handle.share_file("photo.jpg")?;
//!
//! while let Some(event) = running.events.recv().await {
//!     if let ClientEvent::RoomCreated { room_id } = event {
//!         println!("Room: {room_id}");
//!     }
//! }
//! ```
//!
//! ## 加入房间并接收文件
//!
//! ```ignore
//! running.handle.join_room(RoomId::new("AB12CD"), "hunter2")?;
//!
//! while let Some(event) = running.events.recv().await {
//!     if let ClientEvent::FileReceived { file, .. } = event {
//!         file.save(&settings.download_dir).await?;
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod peer;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod transfer;

// Client re-exports
pub use client::{ClientCommand, ClientEvent, ClientHandle, ClientOptions, ReceivedFile};
pub use config::ClientSettings;

// Server re-exports
pub use relay::{Outbox, Relay};
pub use room::{RoomError, RoomRegistry};

// Protocol re-exports
pub use signaling::{ClientMessage, FileId, FileMeta, PeerId, RoomId, ServerMessage};

// Transfer re-exports
pub use crypto::{KeyCache, RoomKey};
pub use transfer::{TransferDecoder, TransferEncoder};
