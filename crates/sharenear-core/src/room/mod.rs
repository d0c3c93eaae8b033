//! 房间模块（服务器端）

pub mod registry;

pub use registry::{Created, Departure, Joined, Room, RoomError, RoomRegistry};
