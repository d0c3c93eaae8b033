//! 直连传输
//!
//! 基于 TCP + WebSocket 的 [`Negotiator`] 实现：
//!
//! 1. 发起方监听一个随机端口，offer 中携带一次性令牌
//! 2. 发起方把 `host:port` 作为候选地址经中继发给应答方
//! 3. 应答方拨号，握手后第一条文本消息是令牌
//! 4. 令牌匹配后双方进入 Open，每个分块帧是一条二进制消息

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, client_async};

use super::negotiator::{Negotiator, TransportError, TransportEvent};
use crate::signaling::PeerId;

/// offer / answer 的内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SessionDescription {
    token: String,
}

impl SessionDescription {
    fn parse(sdp: &str) -> Result<Self, TransportError> {
        serde_json::from_str(sdp).map_err(|e| TransportError::BadDescription(e.to_string()))
    }

    fn encode(&self) -> String {
        serde_json::json!({ "token": self.token }).to_string()
    }
}

#[derive(Debug)]
struct Link {
    token: String,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<AbortHandle>,
}

impl Link {
    fn new(token: String) -> Self {
        Self {
            token,
            outgoing: None,
            task: None,
        }
    }
}

type Links = Arc<Mutex<HashMap<PeerId, Link>>>;

/// 直连协商器
pub struct DirectNegotiator {
    bind_host: String,
    advertise_host: Option<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    links: Links,
}

impl DirectNegotiator {
    pub fn new(
        bind_host: impl Into<String>,
        advertise_host: Option<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            bind_host: bind_host.into(),
            advertise_host,
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 对外通告的主机名
    fn candidate_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.bind_host == "0.0.0.0" => "127.0.0.1".to_string(),
            None => self.bind_host.clone(),
        }
    }

    async fn replace_link(&self, peer: &PeerId, link: Link) {
        let old = self.links.lock().await.insert(peer.clone(), link);
        if let Some(task) = old.and_then(|l| l.task) {
            task.abort();
        }
    }
}

#[async_trait]
impl Negotiator for DirectNegotiator {
    async fn create_offer(&self, peer: &PeerId) -> Result<String, TransportError> {
        let listener = TcpListener::bind((self.bind_host.as_str(), 0)).await?;
        let port = listener.local_addr()?.port();
        let token = uuid::Uuid::new_v4().simple().to_string();

        self.replace_link(peer, Link::new(token.clone())).await;
        let task = tokio::spawn(accept_link(
            listener,
            peer.clone(),
            token.clone(),
            self.links.clone(),
            self.events.clone(),
        ));
        if let Some(link) = self.links.lock().await.get_mut(peer) {
            link.task = Some(task.abort_handle());
        }

        let candidate = format!("{}:{}", self.candidate_host(), port);
        debug!("Listening for {} on {}", peer, candidate);
        let _ = self.events.send(TransportEvent::LocalCandidate {
            peer: peer.clone(),
            candidate,
        });

        Ok(SessionDescription { token }.encode())
    }

    async fn accept_offer(&self, peer: &PeerId, sdp: &str) -> Result<String, TransportError> {
        let offer = SessionDescription::parse(sdp)?;
        self.replace_link(peer, Link::new(offer.token.clone())).await;
        Ok(offer.encode())
    }

    async fn accept_answer(&self, peer: &PeerId, sdp: &str) -> Result<(), TransportError> {
        let answer = SessionDescription::parse(sdp)?;
        let links = self.links.lock().await;
        match links.get(peer) {
            Some(link) if link.token == answer.token => Ok(()),
            Some(_) => Err(TransportError::BadDescription(
                "answer token does not match offer".to_string(),
            )),
            None => Err(TransportError::UnknownPeer(peer.clone())),
        }
    }

    async fn add_candidate(&self, peer: &PeerId, candidate: &str) -> Result<(), TransportError> {
        let mut links = self.links.lock().await;
        let link = links
            .get_mut(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        // 已经在拨号或已打开
        if link.task.is_some() {
            return Ok(());
        }

        let task = tokio::spawn(dial_link(
            candidate.to_string(),
            peer.clone(),
            link.token.clone(),
            self.links.clone(),
            self.events.clone(),
        ));
        link.task = Some(task.abort_handle());
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        let links = self.links.lock().await;
        let outgoing = links
            .get(peer)
            .and_then(|l| l.outgoing.as_ref())
            .ok_or_else(|| TransportError::NotOpen(peer.clone()))?;
        outgoing
            .send(frame)
            .map_err(|_| TransportError::NotOpen(peer.clone()))
    }

    async fn close(&self, peer: &PeerId) {
        if let Some(link) = self.links.lock().await.remove(peer) {
            debug!("Closing transport to {}", peer);
            if let Some(task) = link.task {
                task.abort();
            }
        }
    }
}

/// 发起方：等待携带正确令牌的连接
async fn accept_link(
    listener: TcpListener,
    peer: PeerId,
    token: String,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = events.send(TransportEvent::Closed {
                    peer,
                    reason: Some(format!("accept failed: {e}")),
                });
                return;
            }
        };

        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", addr, e);
                continue;
            }
        };

        match ws.next().await {
            Some(Ok(Message::Text(presented))) if presented == token => {
                drop(listener);
                run_link(ws, peer, token, links, events).await;
                return;
            }
            _ => warn!("Rejected connection from {}: bad token", addr),
        }
    }
}

/// 应答方：拨号并出示令牌
async fn dial_link(
    candidate: String,
    peer: PeerId,
    token: String,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let connected = async {
        let stream = TcpStream::connect(&candidate).await?;
        let url = format!("ws://{candidate}/");
        let (mut ws, _) = client_async(url, stream)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        ws.send(Message::Text(token.clone()))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok::<_, std::io::Error>(ws)
    };

    match connected.await {
        Ok(ws) => run_link(ws, peer, token, links, events).await,
        Err(e) => {
            warn!("Failed to reach {} at {}: {}", peer, candidate, e);
            let _ = events.send(TransportEvent::Closed {
                peer,
                reason: Some(e.to_string()),
            });
        }
    }
}

/// 已认证的连接：双向转发二进制消息直到任意一端关闭
async fn run_link(
    ws: WebSocketStream<TcpStream>,
    peer: PeerId,
    token: String,
    links: Links,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut links = links.lock().await;
        match links.get_mut(&peer) {
            Some(link) if link.token == token => link.outgoing = Some(tx),
            // 协商已被取消或替换
            _ => return,
        }
    }

    info!("Direct transport to {} is open", peer);
    let _ = events.send(TransportEvent::Opened { peer: peer.clone() });

    let (mut write, mut read) = ws.split();
    let reason = loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Frame { peer: peer.clone(), data });
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Some(e.to_string()),
            },
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = write.send(Message::Binary(frame)).await {
                        break Some(e.to_string());
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                }
            },
        }
    };

    {
        let mut links = links.lock().await;
        if links.get(&peer).is_some_and(|l| l.token == token) {
            links.remove(&peer);
        }
    }
    debug!("Direct transport to {} closed: {:?}", peer, reason);
    let _ = events.send(TransportEvent::Closed { peer, reason });
}
