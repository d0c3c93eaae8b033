//! 对端连接状态
//!
//! 每个远端成员一条链路：
//!
//! ```text
//! Idle -> Connecting -> Connected -> Closed
//! ```
//!
//! 这里只维护状态，不做 I/O。调用方根据返回值驱动 [`Negotiator`](super::Negotiator)。

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::signaling::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting { since: Instant, initiator: bool },
    Connected,
    Closed,
}

/// 发往某个对端的帧如何处理
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// 传输已打开，立即发送
    Send(Vec<u8>),
    /// 传输未打开，已排队
    Queued,
    /// 链路已关闭，丢弃
    Dropped,
}

#[derive(Debug)]
struct PeerLink {
    state: PeerState,
    remote_description: bool,
    pending_candidates: Vec<String>,
    outbox: VecDeque<Vec<u8>>,
}

impl PeerLink {
    fn new(state: PeerState) -> Self {
        Self {
            state,
            remote_description: false,
            pending_candidates: Vec::new(),
            outbox: VecDeque::new(),
        }
    }
}

/// 对端连接管理器
#[derive(Debug)]
pub struct PeerManager {
    local: Option<PeerId>,
    links: HashMap<PeerId, PeerLink>,
    connect_timeout: Duration,
}

impl PeerManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            local: None,
            links: HashMap::new(),
            connect_timeout,
        }
    }

    /// 设置本端 ID（收到 `welcome` 后）
    pub fn set_local(&mut self, peer: PeerId) {
        self.local = Some(peer);
    }

    pub fn local(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    /// 收到 `user-joined`：已在房间内的成员向新成员发起连接
    ///
    /// 返回 `true` 表示调用方应创建 offer。
    pub fn on_member_joined(&mut self, newcomer: &PeerId, now: Instant) -> bool {
        if self.local.as_ref() == Some(newcomer) {
            return false;
        }
        let link = self
            .links
            .entry(newcomer.clone())
            .or_insert_with(|| PeerLink::new(PeerState::Idle));
        match link.state {
            PeerState::Idle | PeerState::Closed => {
                link.state = PeerState::Connecting {
                    since: now,
                    initiator: true,
                };
                link.remote_description = false;
                true
            }
            PeerState::Connecting { .. } | PeerState::Connected => false,
        }
    }

    /// 收到 offer：作为应答方进入 Connecting
    ///
    /// 返回原来的状态，如果原来已连接，调用方应先关闭旧传输。
    pub fn on_offer(&mut self, from: &PeerId, now: Instant) -> PeerState {
        let link = self
            .links
            .entry(from.clone())
            .or_insert_with(|| PeerLink::new(PeerState::Idle));
        let previous = link.state;
        link.state = PeerState::Connecting {
            since: now,
            initiator: false,
        };
        link.remote_description = false;
        previous
    }

    /// 远端描述已设置，返回缓存的候选地址
    pub fn remote_description_set(&mut self, peer: &PeerId) -> Vec<String> {
        match self.links.get_mut(peer) {
            Some(link) => {
                link.remote_description = true;
                std::mem::take(&mut link.pending_candidates)
            }
            None => Vec::new(),
        }
    }

    /// 收到候选地址
    ///
    /// 远端描述已设置时返回该地址供立即应用，否则缓存。
    pub fn on_candidate(&mut self, from: &PeerId, candidate: String) -> Option<String> {
        let link = self
            .links
            .entry(from.clone())
            .or_insert_with(|| PeerLink::new(PeerState::Idle));
        if link.state == PeerState::Closed {
            debug!("Ignoring candidate from closed peer {}", from);
            return None;
        }
        if link.remote_description {
            Some(candidate)
        } else {
            link.pending_candidates.push(candidate);
            None
        }
    }

    /// 传输已打开，返回排队中的帧
    pub fn on_transport_open(&mut self, peer: &PeerId) -> Vec<Vec<u8>> {
        match self.links.get_mut(peer) {
            Some(link) => {
                link.state = PeerState::Connected;
                link.outbox.drain(..).collect()
            }
            None => {
                warn!("Transport opened for unknown peer {}", peer);
                Vec::new()
            }
        }
    }

    /// 发送或排队
    pub fn send_or_queue(&mut self, peer: &PeerId, frame: Vec<u8>) -> Dispatch {
        let link = self
            .links
            .entry(peer.clone())
            .or_insert_with(|| PeerLink::new(PeerState::Idle));
        match link.state {
            PeerState::Connected => Dispatch::Send(frame),
            PeerState::Closed => Dispatch::Dropped,
            PeerState::Idle | PeerState::Connecting { .. } => {
                link.outbox.push_back(frame);
                Dispatch::Queued
            }
        }
    }

    /// 传输关闭，丢弃排队的帧
    pub fn on_transport_closed(&mut self, peer: &PeerId) {
        if let Some(link) = self.links.get_mut(peer) {
            link.state = PeerState::Closed;
            link.remote_description = false;
            link.pending_candidates.clear();
            link.outbox.clear();
        }
    }

    /// 对端离开房间
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.links.remove(peer).is_some()
    }

    /// 清空所有链路（离开房间或中继断开），返回被移除的对端
    pub fn reset(&mut self) -> Vec<PeerId> {
        self.links.drain().map(|(peer, _)| peer).collect()
    }

    /// 关闭连接超时的链路
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let mut expired = Vec::new();
        for (peer, link) in &mut self.links {
            if let PeerState::Connecting { since, .. } = link.state
                && now.duration_since(since) >= self.connect_timeout
            {
                link.state = PeerState::Closed;
                link.outbox.clear();
                link.pending_candidates.clear();
                expired.push(peer.clone());
            }
        }
        expired
    }

    pub fn state(&self, peer: &PeerId) -> Option<PeerState> {
        self.links.get(peer).map(|l| l.state)
    }

    pub fn queued(&self, peer: &PeerId) -> usize {
        self.links.get(peer).map_or(0, |l| l.outbox.len())
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links
            .iter()
            .filter(|(_, l)| l.state == PeerState::Connected)
            .map(|(p, _)| p.clone())
            .collect()
    }
}
