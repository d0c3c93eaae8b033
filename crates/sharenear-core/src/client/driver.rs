//! 客户端驱动
//!
//! 单个任务串行处理所有输入：
//! - 用户命令
//! - 信令服务器消息
//! - 直连传输事件
//! - 后台任务结果（密钥派生、加密、解密）
//! - 定时器（请求重发、连接超时）
//!
//! 所有状态（对端链路、编码器、解码器）都只在这个任务内修改。

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{ClientCommand, ClientEvent, ClientHandle, ReceivedFile};
use crate::config::ClientSettings;
use crate::crypto::{Argon2Kdf, CryptoError, KeyCache, PasswordKdf, RoomKey};
use crate::peer::{Dispatch, Negotiator, PeerManager, PeerState, TransportEvent};
use crate::signaling::{ClientMessage, FileMeta, PeerId, RoomId, ServerMessage};
use crate::transfer::{
    ChunkOutcome, OutgoingFile, PlainFile, SessionFailure, SessionId, SessionStatus,
    TimeoutAction, TransferDecoder, TransferEncoder, TransferError, TransferSession,
};

/// 驱动参数
#[derive(Clone)]
pub struct ClientOptions {
    pub chunk_size: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_request_retries: u32,
    /// 检查超时的间隔
    pub tick: Duration,
    pub kdf: Arc<dyn PasswordKdf>,
}

impl From<&ClientSettings> for ClientOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            max_request_retries: settings.max_request_retries,
            tick: Duration::from_secs(1),
            kdf: Arc::new(Argon2Kdf::new()),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

/// 已发出、尚未得到服务器答复的建房或加房请求
///
/// 答复之前仍留在原房间，期间共享的文件归属新房间。
#[derive(Debug)]
struct PendingEntry {
    password: String,
    shares: Vec<PathBuf>,
}

/// 后台任务的结果
#[derive(Debug)]
enum Completion {
    KeyReady {
        room_id: RoomId,
        result: Result<RoomKey, CryptoError>,
    },
    Sealed {
        room_id: RoomId,
        path: PathBuf,
        result: anyhow::Result<OutgoingFile>,
    },
    Decrypted {
        id: SessionId,
        result: Result<Vec<u8>, CryptoError>,
    },
}

/// 信令通道两端
pub struct RelayChannel {
    pub outgoing: mpsc::UnboundedSender<ClientMessage>,
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

/// 正在运行的客户端
pub struct RunningClient {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub task: JoinHandle<anyhow::Result<()>>,
}

pub struct ShareClient {
    options: ClientOptions,
    relay: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<ClientEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    negotiator: Arc<dyn Negotiator>,
    keys: KeyCache,
    peers: PeerManager,
    encoder: TransferEncoder,
    decoder: TransferDecoder,
    room: Option<RoomId>,
    password: Option<String>,
    key: Option<RoomKey>,
    entering: Option<PendingEntry>,
    /// 当前房间中等待密钥的共享
    pending_shares: Vec<PathBuf>,
}

impl ShareClient {
    /// 启动驱动任务
    pub fn spawn(
        options: ClientOptions,
        relay: RelayChannel,
        negotiator: Arc<dyn Negotiator>,
        transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> RunningClient {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let client = Self {
            keys: KeyCache::new(options.kdf.clone()),
            peers: PeerManager::new(options.connect_timeout),
            encoder: TransferEncoder::new(),
            decoder: TransferDecoder::new(options.request_timeout, options.max_request_retries),
            options,
            relay: relay.outgoing,
            events: event_tx,
            completions: completion_tx,
            negotiator,
            room: None,
            password: None,
            key: None,
            entering: None,
            pending_shares: Vec::new(),
        };

        let task = tokio::spawn(client.run(command_rx, relay.incoming, transport, completion_rx));
        RunningClient {
            handle: ClientHandle::new(command_tx),
            events: event_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
        mut relay: mpsc::UnboundedReceiver<ServerMessage>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.options.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ClientCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                message = relay.recv() => match message {
                    Some(message) => self.on_server_message(message).await,
                    None => {
                        info!("Signaling connection closed");
                        self.emit(ClientEvent::Disconnected);
                        break;
                    }
                },
                Some(event) = transport.recv() => self.on_transport_event(event).await,
                Some(completion) = completions.recv() => self.on_completion(completion).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.teardown_room().await;
        Ok(())
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn signal(&self, message: ClientMessage) {
        debug!("Sending {}", message.kind());
        if self.relay.send(message).is_err() {
            warn!("Signaling connection is gone");
        }
    }

    async fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::CreateRoom { password } => {
                self.begin_entry(password.clone());
                self.signal(ClientMessage::CreateRoom { password });
            }
            ClientCommand::JoinRoom { room_id, password } => {
                self.begin_entry(password.clone());
                self.signal(ClientMessage::JoinRoom { room_id, password });
            }
            ClientCommand::ShareFile(path) => {
                if let Some(entry) = &mut self.entering {
                    debug!("Queued {:?} for the room being entered", path);
                    entry.shares.push(path);
                } else if let (Some(room_id), Some(key)) = (self.room.clone(), self.key.clone()) {
                    self.seal(room_id, key, path);
                } else if self.room.is_some() {
                    debug!("Queued {:?} until the room key is ready", path);
                    self.pending_shares.push(path);
                } else {
                    self.emit(ClientEvent::ShareFailed {
                        path,
                        reason: "not in a room".to_string(),
                    });
                }
            }
            ClientCommand::SendChat(message) => match &self.room {
                Some(room_id) => self.signal(ClientMessage::ChatMessage {
                    room_id: room_id.clone(),
                    message,
                }),
                None => warn!("Not in a room, chat message dropped"),
            },
            ClientCommand::LeaveRoom => {
                self.signal(ClientMessage::LeaveRoom);
                self.teardown_room().await;
            }
            ClientCommand::Shutdown => {}
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        let now = Instant::now();
        match message {
            ServerMessage::Welcome { peer_id } => {
                info!("Connected as {}", peer_id);
                self.peers.set_local(peer_id.clone());
                self.emit(ClientEvent::Connected { peer_id });
            }
            ServerMessage::RoomCreated { room_id } => {
                info!("Created room {}", room_id);
                self.switch_room(room_id.clone()).await;
                self.emit(ClientEvent::RoomCreated { room_id });
            }
            ServerMessage::JoinResult {
                success,
                message,
                room_id,
                members,
            } => match room_id {
                Some(room_id) if success => {
                    info!("Joined room {} ({} members)", room_id, members.len());
                    self.switch_room(room_id.clone()).await;
                    self.emit(ClientEvent::RoomJoined { room_id, members });
                }
                _ => {
                    warn!("Join rejected: {}", message);
                    if let Some(entry) = self.entering.take() {
                        for path in entry.shares {
                            self.emit(ClientEvent::ShareFailed {
                                path,
                                reason: format!("join rejected: {}", message),
                            });
                        }
                    }
                    self.emit(ClientEvent::JoinRejected { message });
                }
            },
            ServerMessage::UserJoined { peer_id, .. } if self.room.is_some() => {
                self.emit(ClientEvent::MemberJoined {
                    peer_id: peer_id.clone(),
                });
                if self.peers.on_member_joined(&peer_id, now) {
                    self.initiate(&peer_id).await;
                }
                self.reannounce_files();
            }
            ServerMessage::UserLeft { peer_id } => {
                self.drop_peer(&peer_id, "sender left the room").await;
                self.peers.remove(&peer_id);
                self.emit(ClientEvent::MemberLeft { peer_id });
            }
            ServerMessage::Offer { from, sdp } if self.room.is_some() => {
                self.on_offer(from, sdp, now).await;
            }
            ServerMessage::Answer { from, sdp } => {
                if let Err(e) = self.negotiator.accept_answer(&from, &sdp).await {
                    warn!("Bad answer from {}: {}", from, e);
                    self.fail_link(&from, e.to_string()).await;
                    return;
                }
                self.apply_buffered_candidates(&from).await;
            }
            ServerMessage::IceCandidate { from, candidate } => {
                if let Some(candidate) = self.peers.on_candidate(&from, candidate)
                    && let Err(e) = self.negotiator.add_candidate(&from, &candidate).await
                {
                    warn!("Failed to apply candidate from {}: {}", from, e);
                }
            }
            ServerMessage::RequestChunk {
                from,
                file_id,
                index,
            } if self.room.is_some() => match self.encoder.serve(&from, &file_id, index) {
                Ok(served) => {
                    self.transmit(&from, served.frame).await;
                    self.emit(ClientEvent::ChunkServed {
                        to: from,
                        file_id,
                        progress: served.progress,
                    });
                }
                Err(e) => warn!("Rejected chunk request from {}: {}", from, e),
            },
            ServerMessage::FileMeta { from, metadata } if self.room.is_some() => {
                self.on_file_meta(from, metadata, now);
            }
            ServerMessage::ChatMessage { from, message } => {
                self.emit(ClientEvent::Chat { from, message });
            }
            ServerMessage::Error { message } => {
                warn!("Server error: {}", message);
                self.emit(ClientEvent::ServerError { message });
            }
            other => debug!("Not in a room, ignoring {:?}", other),
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate { peer, candidate } => {
                self.signal(ClientMessage::IceCandidate {
                    to: peer,
                    candidate,
                });
            }
            TransportEvent::Opened { peer } => {
                let queued = self.peers.on_transport_open(&peer);
                debug!("Flushing {} queued frames to {}", queued.len(), peer);
                for frame in queued {
                    if let Err(e) = self.negotiator.send(&peer, frame).await {
                        warn!("Failed to send to {}: {}", peer, e);
                    }
                }
                self.emit(ClientEvent::PeerConnected { peer_id: peer });
            }
            TransportEvent::Frame { peer, data } => self.on_frame(peer, &data),
            TransportEvent::Closed { peer, reason } => {
                if matches!(self.peers.state(&peer), None | Some(PeerState::Closed)) {
                    return;
                }
                self.peers.on_transport_closed(&peer);
                self.drop_peer(&peer, "connection closed").await;
                self.emit(ClientEvent::PeerDisconnected {
                    peer_id: peer,
                    reason,
                });
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::KeyReady { room_id, result } => {
                if self.room.as_ref() != Some(&room_id) {
                    return;
                }
                match result {
                    Ok(key) => {
                        debug!("Room key for {} is ready", room_id);
                        self.key = Some(key.clone());
                        for path in std::mem::take(&mut self.pending_shares) {
                            self.seal(room_id.clone(), key.clone(), path);
                        }
                        self.start_decryption();
                    }
                    Err(e) => {
                        warn!("Key derivation failed: {}", e);
                        self.emit(ClientEvent::ServerError {
                            message: e.to_string(),
                        });
                    }
                }
            }
            Completion::Sealed {
                room_id,
                path,
                result,
            } => {
                if self.room.as_ref() != Some(&room_id) {
                    return;
                }
                match result {
                    Ok(file) => {
                        let meta = self.encoder.register(file);
                        info!("Sharing {} ({} bytes)", meta.name, meta.size);
                        self.signal(ClientMessage::FileMeta {
                            room_id,
                            metadata: meta.clone(),
                        });
                        self.emit(ClientEvent::FileShared { meta });
                    }
                    Err(e) => {
                        warn!("Failed to share {:?}: {}", path, e);
                        self.emit(ClientEvent::ShareFailed {
                            path,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Completion::Decrypted { id, result } => {
                let Some(session) = self.decoder.finish(&id, result) else {
                    return;
                };
                let outcome = match session.status().clone() {
                    SessionStatus::Complete => Ok(ReceivedFile {
                        name: session.meta().name.clone(),
                        mime_type: session.meta().mime_type.clone(),
                        data: session.take_payload().unwrap_or_default(),
                    }),
                    SessionStatus::Failed(failure) => Err((session.meta().name.clone(), failure)),
                    _ => return,
                };
                match outcome {
                    Ok(file) => {
                        info!("Received {} ({} bytes)", file.name, file.data.len());
                        self.emit(ClientEvent::FileReceived {
                            from: id.sender,
                            file,
                        });
                    }
                    Err((name, failure)) => self.report_failure(id.sender, name, &failure),
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        for action in self.decoder.poll_timeouts(now) {
            match action {
                TimeoutAction::Retry(request) => self.signal(request.into()),
                TimeoutAction::GaveUp(id, failure) => {
                    let name = self
                        .decoder
                        .session(&id)
                        .map(|s| s.meta().name.clone())
                        .unwrap_or_default();
                    self.report_failure(id.sender, name, &failure);
                }
            }
        }

        for peer in self.peers.expire(now) {
            warn!("Connection to {} timed out", peer);
            self.negotiator.close(&peer).await;
            self.drop_peer(&peer, "connection timed out").await;
            self.emit(ClientEvent::PeerDisconnected {
                peer_id: peer,
                reason: Some("connection timed out".to_string()),
            });
        }
    }

    /// 记录建房或加房请求，服务器答复前不离开当前房间
    fn begin_entry(&mut self, password: String) {
        let shares = self
            .entering
            .take()
            .map(|entry| entry.shares)
            .unwrap_or_default();
        self.entering = Some(PendingEntry { password, shares });
    }

    /// 服务器确认后切换到新房间，带上进入期间排队的共享
    async fn switch_room(&mut self, room_id: RoomId) {
        let entry = self.entering.take();
        if self.room.as_ref() != Some(&room_id) {
            self.teardown_room().await;
        }
        if let Some(entry) = entry {
            self.password = Some(entry.password);
            self.pending_shares.extend(entry.shares);
        }
        self.enter_room(room_id);
    }

    fn enter_room(&mut self, room_id: RoomId) {
        self.room = Some(room_id.clone());
        let Some(password) = self.password.clone() else {
            return;
        };
        let keys = self.keys.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = keys.get_or_derive(&room_id, &password).await;
            let _ = completions.send(Completion::KeyReady { room_id, result });
        });
    }

    /// 离开当前房间，关闭所有链路并丢弃传输状态
    async fn teardown_room(&mut self) {
        for peer in self.peers.reset() {
            self.negotiator.close(&peer).await;
        }
        self.encoder = TransferEncoder::new();
        self.decoder =
            TransferDecoder::new(self.options.request_timeout, self.options.max_request_retries);
        self.room = None;
        self.key = None;
        self.password = None;
        self.entering = None;
        self.pending_shares.clear();
    }

    /// 后台读取并加密文件
    fn seal(&self, room_id: RoomId, key: RoomKey, path: PathBuf) {
        let chunk_size = self.options.chunk_size;
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = async {
                let plain = PlainFile::read(&path).await?;
                let file = tokio::task::spawn_blocking(move || {
                    OutgoingFile::seal(&plain, &key, chunk_size)
                })
                .await??;
                Ok::<_, anyhow::Error>(file)
            }
            .await;
            let _ = completions.send(Completion::Sealed {
                room_id,
                path,
                result,
            });
        });
    }

    /// 新成员加入后重新广播已共享的文件，已知的接收方会忽略重复的元数据
    fn reannounce_files(&self) {
        let Some(room_id) = &self.room else {
            return;
        };
        for meta in self.encoder.files() {
            self.signal(ClientMessage::FileMeta {
                room_id: room_id.clone(),
                metadata: meta.clone(),
            });
        }
    }

    async fn initiate(&mut self, peer: &PeerId) {
        match self.negotiator.create_offer(peer).await {
            Ok(sdp) => {
                debug!("Offering a transport to {}", peer);
                self.signal(ClientMessage::Offer {
                    to: peer.clone(),
                    sdp,
                });
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", peer, e);
                self.fail_link(peer, e.to_string()).await;
            }
        }
    }

    async fn on_offer(&mut self, from: PeerId, sdp: String, now: Instant) {
        if self.peers.on_offer(&from, now) == PeerState::Connected {
            self.negotiator.close(&from).await;
        }
        match self.negotiator.accept_offer(&from, &sdp).await {
            Ok(answer) => {
                self.signal(ClientMessage::Answer {
                    to: from.clone(),
                    sdp: answer,
                });
                self.apply_buffered_candidates(&from).await;
            }
            Err(e) => {
                warn!("Bad offer from {}: {}", from, e);
                self.fail_link(&from, e.to_string()).await;
            }
        }
    }

    async fn apply_buffered_candidates(&mut self, peer: &PeerId) {
        for candidate in self.peers.remote_description_set(peer) {
            if let Err(e) = self.negotiator.add_candidate(peer, &candidate).await {
                warn!("Failed to apply candidate from {}: {}", peer, e);
            }
        }
    }

    async fn fail_link(&mut self, peer: &PeerId, reason: String) {
        self.negotiator.close(peer).await;
        self.peers.on_transport_closed(peer);
        self.emit(ClientEvent::PeerDisconnected {
            peer_id: peer.clone(),
            reason: Some(reason),
        });
    }

    /// 发送帧，传输未打开时排队
    async fn transmit(&mut self, peer: &PeerId, frame: Vec<u8>) {
        match self.peers.send_or_queue(peer, frame) {
            Dispatch::Send(frame) => {
                if let Err(e) = self.negotiator.send(peer, frame).await {
                    warn!("Failed to send to {}: {}", peer, e);
                }
            }
            Dispatch::Queued => debug!("Transport to {} not open yet, frame queued", peer),
            Dispatch::Dropped => debug!("Transport to {} is closed, frame dropped", peer),
        }
    }

    fn on_file_meta(&mut self, from: PeerId, meta: FileMeta, now: Instant) {
        match self.decoder.announce(&from, meta.clone(), now) {
            Ok(request) => {
                info!("{} is sharing {} ({} bytes)", from, meta.name, meta.size);
                self.signal(request.into());
                self.emit(ClientEvent::FileAnnounced { from, meta });
            }
            Err(TransferError::DuplicateFile(file_id)) => {
                debug!("Already know about {} from {}", file_id, from);
            }
            Err(e) => warn!("Ignoring file-meta from {}: {}", from, e),
        }
    }

    fn on_frame(&mut self, peer: PeerId, data: &[u8]) {
        match self.decoder.accept_chunk(&peer, data, Instant::now()) {
            Ok(ChunkOutcome::Request(request)) => {
                let id = SessionId::new(peer.clone(), request.file_id.clone());
                if let Some(session) = self.decoder.session(&id) {
                    self.emit(ClientEvent::Progress {
                        from: peer,
                        file_id: request.file_id.clone(),
                        received: session.received_bytes(),
                        total: session.total_bytes(),
                    });
                }
                self.signal(request.into());
            }
            Ok(ChunkOutcome::Ready(id)) => {
                if let Some(session) = self.decoder.session(&id) {
                    self.emit(ClientEvent::Progress {
                        from: peer,
                        file_id: id.file_id.clone(),
                        received: session.received_bytes(),
                        total: session.total_bytes(),
                    });
                }
                self.start_decryption();
            }
            Ok(ChunkOutcome::Failed(id, failure)) => {
                let name = self
                    .decoder
                    .session(&id)
                    .map(|s| s.meta().name.clone())
                    .unwrap_or_default();
                self.report_failure(id.sender, name, &failure);
            }
            Ok(ChunkOutcome::Stored) => {}
            Err(e) => warn!("Dropped chunk from {}: {}", peer, e),
        }
    }

    /// 解密所有已到齐的文件，密钥未就绪时等待 `KeyReady`
    fn start_decryption(&mut self) {
        let Some(key) = self.key.clone() else {
            return;
        };
        for id in self.decoder.awaiting_decryption() {
            let Some(job) = self.decoder.take_decrypt_job(&id) else {
                continue;
            };
            let key = key.clone();
            let completions = self.completions.clone();
            tokio::task::spawn_blocking(move || {
                let result = key.open(&job.nonce, &job.ciphertext);
                let _ = completions.send(Completion::Decrypted { id: job.id, result });
            });
        }
    }

    /// 丢弃与某个对端相关的传输状态
    async fn drop_peer(&mut self, peer: &PeerId, reason: &str) {
        self.negotiator.close(peer).await;
        self.encoder.forget_peer(peer);
        let abandoned: Vec<TransferSession> = self.decoder.abandon_peer(peer);
        for session in abandoned {
            if !session.status().is_finished() {
                self.emit(ClientEvent::FileFailed {
                    from: peer.clone(),
                    name: session.meta().name.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn report_failure(&self, from: PeerId, name: String, failure: &SessionFailure) {
        warn!("Transfer of {} from {} failed: {}", name, from, failure);
        self.emit(ClientEvent::FileFailed {
            from,
            name,
            reason: failure.to_string(),
        });
    }
}
