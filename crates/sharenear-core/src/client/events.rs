//! 客户端命令与事件

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::signaling::{FileId, FileMeta, PeerId, RoomId};
use crate::transfer::SendProgress;

/// 发给客户端驱动的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    CreateRoom { password: String },
    JoinRoom { room_id: RoomId, password: String },
    ShareFile(PathBuf),
    SendChat(String),
    LeaveRoom,
    Shutdown,
}

/// 接收完成的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ReceivedFile {
    /// 保存到目录中，同名文件存在时追加序号
    pub async fn save(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;

        let name = Path::new(&self.name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "download".to_string());

        let mut path = dir.join(&name);
        let mut counter = 1;
        while tokio::fs::try_exists(&path).await? {
            let candidate = match name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({counter}).{ext}"),
                _ => format!("{name} ({counter})"),
            };
            path = dir.join(candidate);
            counter += 1;
        }

        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// 客户端事件
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// 已连接信令服务器
    Connected { peer_id: PeerId },
    RoomCreated { room_id: RoomId },
    RoomJoined { room_id: RoomId, members: Vec<PeerId> },
    JoinRejected { message: String },
    MemberJoined { peer_id: PeerId },
    MemberLeft { peer_id: PeerId },
    /// 直连传输已打开
    PeerConnected { peer_id: PeerId },
    PeerDisconnected { peer_id: PeerId, reason: Option<String> },
    /// 本地文件已加密并在房间内广播
    FileShared { meta: FileMeta },
    ShareFailed { path: PathBuf, reason: String },
    /// 对端共享了一个文件，开始拉取
    FileAnnounced { from: PeerId, meta: FileMeta },
    Progress {
        from: PeerId,
        file_id: FileId,
        received: u64,
        total: u64,
    },
    ChunkServed {
        to: PeerId,
        file_id: FileId,
        progress: SendProgress,
    },
    FileReceived { from: PeerId, file: ReceivedFile },
    FileFailed {
        from: PeerId,
        name: String,
        reason: String,
    },
    Chat { from: PeerId, message: String },
    ServerError { message: String },
    /// 信令连接已断开
    Disconnected,
}

/// 客户端驱动的句柄
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<ClientCommand>) -> Self {
        Self { commands }
    }

    pub fn send(&self, command: ClientCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("client driver has stopped"))
    }

    pub fn create_room(&self, password: impl Into<String>) -> anyhow::Result<()> {
        self.send(ClientCommand::CreateRoom {
            password: password.into(),
        })
    }

    pub fn join_room(&self, room_id: RoomId, password: impl Into<String>) -> anyhow::Result<()> {
        self.send(ClientCommand::JoinRoom {
            room_id,
            password: password.into(),
        })
    }

    pub fn share_file(&self, path: impl Into<PathBuf>) -> anyhow::Result<()> {
        self.send(ClientCommand::ShareFile(path.into()))
    }

    pub fn send_chat(&self, message: impl Into<String>) -> anyhow::Result<()> {
        self.send(ClientCommand::SendChat(message.into()))
    }

    pub fn leave(&self) -> anyhow::Result<()> {
        self.send(ClientCommand::LeaveRoom)
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.send(ClientCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sharenear-{}-{}", tag, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_save_avoids_overwrite() {
        let dir = temp_dir("save");
        let file = ReceivedFile {
            name: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            data: b"%PDF".to_vec(),
        };

        let first = file.save(&dir).await.unwrap();
        let second = file.save(&dir).await.unwrap();
        assert_eq!(first.file_name().unwrap(), "report.pdf");
        assert_eq!(second.file_name().unwrap(), "report (1).pdf");
        assert_eq!(tokio::fs::read(&second).await.unwrap(), b"%PDF");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_save_strips_directories() {
        let dir = temp_dir("strip");
        let file = ReceivedFile {
            name: "../../etc/passwd".to_string(),
            mime_type: "text/plain".to_string(),
            data: b"x".to_vec(),
        };

        let path = file.save(&dir).await.unwrap();
        assert_eq!(path, dir.join("passwd"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_handle_reports_stopped_driver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle::new(tx);
        drop(rx);
        assert!(handle.create_room("pw").is_err());
    }
}
