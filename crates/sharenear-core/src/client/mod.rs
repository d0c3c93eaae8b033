//! 客户端模块
//!
//! 事件驱动的客户端：连接信令服务器，与房间内的其它成员建立直连传输，
//! 共享文件并接收对端共享的文件。

pub mod connection;
pub mod driver;
pub mod events;

pub use connection::{connect, connect_relay};
pub use driver::{ClientOptions, RelayChannel, RunningClient, ShareClient};
pub use events::{ClientCommand, ClientEvent, ClientHandle, ReceivedFile};
