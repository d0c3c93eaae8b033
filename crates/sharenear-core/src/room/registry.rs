//! 房间注册表
//!
//! 维护活跃房间、成员列表和密码校验。
//!
//! 注册表本身不做同步，由唯一的所有者（服务器的中继任务）串行调用，
//! 因此 create / join / leave 对每个房间都是原子的。

use log::{debug, info};
use std::collections::HashMap;

use crate::signaling::{PeerId, RoomId};

/// 房间操作错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Invalid room ID or password")]
    InvalidCredentials,
}

/// 活跃房间
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    password: String,
    /// 按加入顺序排列
    members: Vec<PeerId>,
}

impl Room {
    fn new(id: RoomId, password: String, creator: PeerId) -> Self {
        Self {
            id,
            password,
            members: vec![creator],
        }
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }
}

/// 成员离开房间的记录，中继据此广播 `user-left`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    /// 离开后剩余的成员
    pub remaining: Vec<PeerId>,
}

impl Departure {
    /// 房间是否因此被删除
    pub fn room_closed(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// 创建房间的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub room_id: RoomId,
    /// 创建者此前所在的房间
    pub left: Vec<Departure>,
}

/// 加入房间的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// 包含新成员在内的完整成员列表
    pub members: Vec<PeerId>,
    pub left: Vec<Departure>,
}

/// 房间注册表
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建房间，创建者成为唯一成员
    pub fn create_room(&mut self, creator: &PeerId, password: &str) -> Created {
        let mut rng = rand::thread_rng();
        self.create_room_with(creator, password, || RoomId::generate(&mut rng))
    }

    /// 使用给定的房间号生成器创建房间
    ///
    /// 生成器会被反复调用，直到得到一个不与活跃房间冲突的房间号。
    pub fn create_room_with<F>(&mut self, creator: &PeerId, password: &str, mut next_id: F) -> Created
    where
        F: FnMut() -> RoomId,
    {
        let left = self.leave(creator);

        let room_id = loop {
            let candidate = next_id();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
            debug!("Room id {} collides with an active room, retrying", candidate);
        };

        self.rooms.insert(
            room_id.clone(),
            Room::new(room_id.clone(), password.to_string(), creator.clone()),
        );
        info!("Room {} created by {}", room_id, creator);

        Created { room_id, left }
    }

    /// 加入房间
    ///
    /// 房间不存在返回 `RoomNotFound`，密码不完全一致返回 `InvalidCredentials`。
    /// 校验通过后才会离开此前所在的房间。
    pub fn join_room(
        &mut self,
        room_id: &RoomId,
        peer: &PeerId,
        password: &str,
    ) -> Result<Joined, RoomError> {
        let room = self.rooms.get(room_id).ok_or(RoomError::RoomNotFound)?;
        if room.password != password {
            return Err(RoomError::InvalidCredentials);
        }
        if room.contains(peer) {
            return Ok(Joined {
                members: room.members.clone(),
                left: Vec::new(),
            });
        }

        let left = self.leave(peer);
        let room = self.rooms.get_mut(room_id).ok_or(RoomError::RoomNotFound)?;
        room.members.push(peer.clone());
        info!("{} joined room {}", peer, room_id);

        Ok(Joined {
            members: room.members.clone(),
            left,
        })
    }

    /// 把对端从它所在的每个房间移除，删除变空的房间
    pub fn leave(&mut self, peer: &PeerId) -> Vec<Departure> {
        let mut departures = Vec::new();

        for room in self.rooms.values_mut() {
            if let Some(pos) = room.members.iter().position(|m| m == peer) {
                room.members.remove(pos);
                departures.push(Departure {
                    room_id: room.id.clone(),
                    peer_id: peer.clone(),
                    remaining: room.members.clone(),
                });
            }
        }

        for departure in &departures {
            if departure.room_closed() {
                self.rooms.remove(&departure.room_id);
                info!("Room {} is empty and was removed", departure.room_id);
            } else {
                debug!("{} left room {}", peer, departure.room_id);
            }
        }

        departures
    }

    pub fn members(&self, room_id: &RoomId) -> Option<&[PeerId]> {
        self.rooms.get(room_id).map(Room::members)
    }

    pub fn is_member(&self, room_id: &RoomId, peer: &PeerId) -> bool {
        self.rooms.get(room_id).is_some_and(|room| room.contains(peer))
    }

    /// 对端当前所在的房间
    pub fn room_of(&self, peer: &PeerId) -> Option<&RoomId> {
        self.rooms
            .values()
            .find(|room| room.contains(peer))
            .map(|room| &room.id)
    }

    /// 两个对端是否在同一个房间
    pub fn share_room(&self, a: &PeerId, b: &PeerId) -> bool {
        self.rooms
            .values()
            .any(|room| room.contains(a) && room.contains(b))
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
