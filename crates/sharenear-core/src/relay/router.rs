//! 信令中继
//!
//! 纯转发：按对端 ID 定向发送，或按房间号广播给除发送者外的所有成员。
//! 中继只看消息类型标签，不解析载荷。
//!
//! # 投递语义
//!
//! - 每次发送最多转发一次，不做跨重连去重
//! - 只保证同一发送者到同一接收者的顺序
//! - 目标没有存活连接时静默丢弃

use log::{debug, warn};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::room::{Departure, RoomRegistry};
use crate::signaling::{ClientMessage, PeerId, Route, ServerMessage};

/// 每个连接的出站队列
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// 信令中继状态
///
/// 由单个任务独占持有，所有注册表修改都在该任务内串行执行。
#[derive(Debug, Default)]
pub struct Relay {
    registry: RoomRegistry,
    peers: HashMap<PeerId, Outbox>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// 当前存活连接数
    pub fn connected(&self) -> usize {
        self.peers.len()
    }

    /// 注册新连接并下发对端 ID
    pub fn connect(&mut self, peer: PeerId, outbox: Outbox) {
        debug!("Peer {} connected", peer);
        let welcome = ServerMessage::Welcome {
            peer_id: peer.clone(),
        };
        self.peers.insert(peer.clone(), outbox);
        self.deliver(&peer, welcome);
    }

    /// 连接断开：离开所有房间并通知剩余成员
    pub fn disconnect(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        let departures = self.registry.leave(peer);
        self.announce_departures(&departures);
        debug!("Peer {} disconnected", peer);
    }

    /// 处理一条客户端消息
    pub fn handle(&mut self, from: &PeerId, msg: ClientMessage) {
        if !self.peers.contains_key(from) {
            warn!("Ignoring {} from unknown peer {}", msg.kind(), from);
            return;
        }
        if let Err(e) = msg.validate() {
            self.deliver(from, ServerMessage::error(e.to_string()));
            return;
        }

        match msg.route() {
            Route::Registry => self.handle_registry(from, msg),
            Route::Peer(to) => {
                let to = to.clone();
                if !self.registry.share_room(from, &to) {
                    debug!("Dropping {} from {}: {} is not in the same room", msg.kind(), from, to);
                    return;
                }
                let kind = msg.kind();
                if let Some(forwarded) = ServerMessage::forwarded(from, msg)
                    && !self.deliver(&to, forwarded)
                {
                    debug!("Dropping {} from {}: {} is unreachable", kind, from, to);
                }
            }
            Route::Room(room_id) => {
                let room_id = room_id.clone();
                if !self.registry.is_member(&room_id, from) {
                    self.deliver(
                        from,
                        ServerMessage::error(format!("Not a member of room {room_id}")),
                    );
                    return;
                }
                let members = self
                    .registry
                    .members(&room_id)
                    .map(<[PeerId]>::to_vec)
                    .unwrap_or_default();
                if let Some(forwarded) = ServerMessage::forwarded(from, msg) {
                    self.broadcast(&members, from, &forwarded);
                }
            }
        }
    }

    fn handle_registry(&mut self, from: &PeerId, msg: ClientMessage) {
        match msg {
            ClientMessage::CreateRoom { password } => {
                let created = self.registry.create_room(from, &password);
                self.announce_departures(&created.left);
                self.deliver(
                    from,
                    ServerMessage::RoomCreated {
                        room_id: created.room_id,
                    },
                );
            }
            ClientMessage::JoinRoom { room_id, password } => {
                let reply = match self.registry.join_room(&room_id, from, &password) {
                    Ok(joined) => {
                        self.announce_departures(&joined.left);
                        self.broadcast(
                            &joined.members,
                            from,
                            &ServerMessage::UserJoined {
                                peer_id: from.clone(),
                                members: joined.members.clone(),
                            },
                        );
                        ServerMessage::JoinResult {
                            success: true,
                            message: "Joined room successfully".to_string(),
                            room_id: Some(room_id),
                            members: joined.members,
                        }
                    }
                    Err(e) => {
                        debug!("{} failed to join {}: {}", from, room_id, e);
                        ServerMessage::JoinResult {
                            success: false,
                            message: e.to_string(),
                            room_id: None,
                            members: Vec::new(),
                        }
                    }
                };
                self.deliver(from, reply);
            }
            ClientMessage::LeaveRoom => {
                let departures = self.registry.leave(from);
                self.announce_departures(&departures);
            }
            other => warn!("{} is not a registry message", other.kind()),
        }
    }

    fn announce_departures(&self, departures: &[Departure]) {
        for departure in departures {
            let left = ServerMessage::UserLeft {
                peer_id: departure.peer_id.clone(),
            };
            self.broadcast(&departure.remaining, &departure.peer_id, &left);
        }
    }

    fn broadcast(&self, members: &[PeerId], except: &PeerId, msg: &ServerMessage) {
        for member in members.iter().filter(|m| *m != except) {
            self.deliver(member, msg.clone());
        }
    }

    /// 投递给某个对端，没有存活连接时返回 `false`
    fn deliver(&self, to: &PeerId, msg: ServerMessage) -> bool {
        match self.peers.get(to) {
            Some(outbox) => outbox.send(msg).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{FileId, RoomId};

    struct TestPeer {
        id: PeerId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestPeer {
        fn connect(relay: &mut Relay, id: &str) -> Self {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let id = PeerId::new(id);
            relay.connect(id.clone(), tx);
            assert_eq!(
                rx.try_recv().unwrap(),
                ServerMessage::Welcome {
                    peer_id: id.clone()
                }
            );
            Self { id, rx }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn create(relay: &mut Relay, peer: &mut TestPeer, password: &str) -> RoomId {
        relay.handle(
            &peer.id,
            ClientMessage::CreateRoom {
                password: password.to_string(),
            },
        );
        match peer.drain().pop() {
            Some(ServerMessage::RoomCreated { room_id }) => room_id,
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    fn join(relay: &mut Relay, peer: &mut TestPeer, room_id: &RoomId, password: &str) -> ServerMessage {
        relay.handle(
            &peer.id,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
                password: password.to_string(),
            },
        );
        peer.drain().pop().unwrap()
    }

    #[test]
    fn test_join_broadcasts_user_joined() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        let mut b = TestPeer::connect(&mut relay, "b");
        let mut c = TestPeer::connect(&mut relay, "c");

        let room_id = create(&mut relay, &mut a, "hunter2");

        match join(&mut relay, &mut b, &room_id, "hunter2") {
            ServerMessage::JoinResult {
                success, members, ..
            } => {
                assert!(success);
                assert_eq!(members, vec![a.id.clone(), b.id.clone()]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(
            a.drain(),
            vec![ServerMessage::UserJoined {
                peer_id: b.id.clone(),
                members: vec![a.id.clone(), b.id.clone()],
            }]
        );

        match join(&mut relay, &mut c, &room_id, "wrong") {
            ServerMessage::JoinResult {
                success, message, ..
            } => {
                assert!(!success);
                assert_eq!(message, "Invalid room ID or password");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_directed_messages() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        let mut b = TestPeer::connect(&mut relay, "b");
        let room_id = create(&mut relay, &mut a, "pw");
        join(&mut relay, &mut b, &room_id, "pw");
        a.drain();

        relay.handle(
            &a.id,
            ClientMessage::Offer {
                to: b.id.clone(),
                sdp: "offer-sdp".to_string(),
            },
        );
        relay.handle(
            &b.id,
            ClientMessage::RequestChunk {
                to: a.id.clone(),
                file_id: FileId::new("f1"),
                index: 0,
            },
        );

        assert_eq!(
            b.drain(),
            vec![ServerMessage::Offer {
                from: a.id.clone(),
                sdp: "offer-sdp".to_string()
            }]
        );
        assert_eq!(
            a.drain(),
            vec![ServerMessage::RequestChunk {
                from: b.id.clone(),
                file_id: FileId::new("f1"),
                index: 0
            }]
        );
    }

    #[test]
    fn test_unreachable_peer_is_dropped() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        create(&mut relay, &mut a, "pw");

        relay.handle(
            &a.id,
            ClientMessage::Answer {
                to: PeerId::new("ghost"),
                sdp: "x".to_string(),
            },
        );
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_directed_requires_shared_room() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        let mut b = TestPeer::connect(&mut relay, "b");
        create(&mut relay, &mut a, "pw");
        create(&mut relay, &mut b, "pw");

        relay.handle(
            &a.id,
            ClientMessage::IceCandidate {
                to: b.id.clone(),
                candidate: "127.0.0.1:1".to_string(),
            },
        );
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_broadcast_requires_membership() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        let mut b = TestPeer::connect(&mut relay, "b");
        let room_id = create(&mut relay, &mut a, "pw");

        relay.handle(
            &b.id,
            ClientMessage::ChatMessage {
                room_id: room_id.clone(),
                message: "hi".to_string(),
            },
        );
        assert!(matches!(b.drain().as_slice(), [ServerMessage::Error { .. }]));
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_chat_excludes_sender() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        let mut b = TestPeer::connect(&mut relay, "b");
        let room_id = create(&mut relay, &mut a, "pw");
        join(&mut relay, &mut b, &room_id, "pw");
        a.drain();

        relay.handle(
            &a.id,
            ClientMessage::ChatMessage {
                room_id,
                message: "hello".to_string(),
            },
        );
        assert!(a.drain().is_empty());
        assert_eq!(
            b.drain(),
            vec![ServerMessage::ChatMessage {
                from: a.id.clone(),
                message: "hello".to_string()
            }]
        );
    }

    #[test]
    fn test_disconnect_broadcasts_user_left() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");
        let mut b = TestPeer::connect(&mut relay, "b");
        let room_id = create(&mut relay, &mut a, "pw");
        join(&mut relay, &mut b, &room_id, "pw");
        a.drain();

        relay.disconnect(&b.id);
        assert_eq!(
            a.drain(),
            vec![ServerMessage::UserLeft {
                peer_id: b.id.clone()
            }]
        );
        assert_eq!(relay.connected(), 1);

        relay.disconnect(&a.id);
        assert!(!relay.registry().contains(&room_id));
    }

    #[test]
    fn test_invalid_message_gets_error_reply() {
        let mut relay = Relay::new();
        let mut a = TestPeer::connect(&mut relay, "a");

        relay.handle(
            &a.id,
            ClientMessage::JoinRoom {
                room_id: RoomId::new("bad"),
                password: String::new(),
            },
        );
        assert!(matches!(a.drain().as_slice(), [ServerMessage::Error { .. }]));
    }
}
