//! 对端连接模块（客户端）
//!
//! - `manager`: 每个远端成员的连接状态机
//! - `negotiator`: 传输协商接口
//! - `direct`: TCP + WebSocket 直连实现

pub mod direct;
pub mod manager;
pub mod negotiator;

pub use direct::DirectNegotiator;
pub use manager::{Dispatch, PeerManager, PeerState};
pub use negotiator::{Negotiator, TransportError, TransportEvent};
