//! 传输协商接口
//!
//! 协商消息（offer / answer / candidate）对中继是不透明字符串，
//! 具体格式由实现决定。传输层的异步事件通过 [`TransportEvent`] 通道上报。

use async_trait::async_trait;

use crate::signaling::PeerId;

/// 传输层事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 本地产生的候选地址，需要经中继发给对端
    LocalCandidate { peer: PeerId, candidate: String },
    /// 传输已打开
    Opened { peer: PeerId },
    /// 收到一条二进制消息
    Frame { peer: PeerId, data: Vec<u8> },
    /// 传输关闭或建立失败
    Closed { peer: PeerId, reason: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed session description: {0}")]
    BadDescription(String),
    #[error("no negotiation in progress with {0}")]
    UnknownPeer(PeerId),
    #[error("transport to {0} is not open")]
    NotOpen(PeerId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 点对点传输协商
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// 发起方：创建 offer
    async fn create_offer(&self, peer: &PeerId) -> Result<String, TransportError>;

    /// 应答方：处理 offer 并返回 answer
    async fn accept_offer(&self, peer: &PeerId, sdp: &str) -> Result<String, TransportError>;

    /// 发起方：处理 answer
    async fn accept_answer(&self, peer: &PeerId, sdp: &str) -> Result<(), TransportError>;

    /// 应用对端的候选地址（远端描述已设置后才会调用）
    async fn add_candidate(&self, peer: &PeerId, candidate: &str) -> Result<(), TransportError>;

    /// 发送一条二进制消息
    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// 关闭到某个对端的传输
    async fn close(&self, peer: &PeerId);
}
