//! 信令中继模块（服务器端）

pub mod router;

pub use router::{Outbox, Relay};
