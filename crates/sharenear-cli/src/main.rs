//! ShareNear CLI
//!
//! 命令行客户端：创建或加入房间，共享文件，保存收到的文件

use anyhow::Result;
use clap::{Parser, Subcommand};
use sharenear_core::{ClientEvent, ClientHandle, ClientSettings, RoomId, client};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharenear", version, about = "ShareNear - 基于房间的点对点文件共享")]
struct Cli {
    /// 信令服务器地址 (默认读取配置文件)
    #[arg(short, long, env = "SHARENEAR_SERVER")]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 创建房间
    Create {
        /// 房间密码
        #[arg(short, long)]
        password: String,
        /// 要共享的文件
        #[arg(long)]
        share: Vec<PathBuf>,
        /// 保存目录 (默认: 配置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 加入房间
    Join {
        /// 房间号
        room: String,
        /// 房间密码
        #[arg(short, long)]
        password: String,
        /// 要共享的文件
        #[arg(long)]
        share: Vec<PathBuf>,
        /// 保存目录 (默认: 配置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 显示当前配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();

    let cli = Cli::parse();
    let mut settings = ClientSettings::load();
    if let Some(server) = cli.server {
        settings.server_url = server;
    }

    match cli.command {
        Commands::Create {
            password,
            share,
            output,
        } => {
            let output = output.unwrap_or_else(|| settings.download_dir.clone());
            let mut running = client::connect(&settings).await?;
            running.handle.create_room(password)?;
            queue_shares(&running.handle, share)?;
            run_session(running.handle, &mut running.events, &output).await?;
        }
        Commands::Join {
            room,
            password,
            share,
            output,
        } => {
            let room_id = RoomId::new(room.trim().to_uppercase());
            if !room_id.is_well_formed() {
                anyhow::bail!("房间号应为 6 位数字或大写字母: {}", room_id);
            }
            let output = output.unwrap_or_else(|| settings.download_dir.clone());
            let mut running = client::connect(&settings).await?;
            running.handle.join_room(room_id, password)?;
            queue_shares(&running.handle, share)?;
            run_session(running.handle, &mut running.events, &output).await?;
        }
        Commands::Config => {
            println!("配置文件: {}", ClientSettings::config_path().display());
            println!("{:#?}", settings);
        }
    }

    Ok(())
}

fn queue_shares(handle: &ClientHandle, files: Vec<PathBuf>) -> Result<()> {
    for file in files {
        if !file.is_file() {
            anyhow::bail!("文件不存在: {}", file.display());
        }
        handle.share_file(file)?;
    }
    Ok(())
}

/// 打印事件直到连接断开或 Ctrl+C
async fn run_session(
    handle: ClientHandle,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    output: &std::path::Path,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n👋 离开房间");
                handle.leave()?;
                handle.shutdown()?;
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                if !print_event(event, output).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// 返回 `false` 表示会话结束
async fn print_event(event: ClientEvent, output: &std::path::Path) -> Result<bool> {
    match event {
        ClientEvent::Connected { peer_id } => println!("🔌 已连接服务器 (ID: {})", peer_id),
        ClientEvent::RoomCreated { room_id } => {
            println!("🏠 房间已创建: {}", room_id);
            println!("   其他人可以用 `sharenear join {} --password <密码>` 加入", room_id);
        }
        ClientEvent::RoomJoined { room_id, members } => {
            println!("🏠 已加入房间 {} ({} 人)", room_id, members.len());
        }
        ClientEvent::JoinRejected { message } => {
            println!("❌ 加入失败: {}", message);
            return Ok(false);
        }
        ClientEvent::MemberJoined { peer_id } => println!("👤 {} 加入了房间", peer_id),
        ClientEvent::MemberLeft { peer_id } => println!("👤 {} 离开了房间", peer_id),
        ClientEvent::PeerConnected { peer_id } => println!("🔗 已与 {} 建立直连", peer_id),
        ClientEvent::PeerDisconnected { peer_id, reason } => match reason {
            Some(reason) => println!("⚠️  与 {} 的连接断开: {}", peer_id, reason),
            None => println!("⚠️  与 {} 的连接断开", peer_id),
        },
        ClientEvent::FileShared { meta } => {
            println!("📤 正在共享 {} ({})", meta.name, format_size(meta.size));
        }
        ClientEvent::ShareFailed { path, reason } => {
            println!("❌ 无法共享 {}: {}", path.display(), reason);
        }
        ClientEvent::FileAnnounced { from, meta } => {
            println!(
                "📥 {} 共享了 {} ({})，开始接收",
                from,
                meta.name,
                format_size(meta.size)
            );
        }
        ClientEvent::Progress {
            received, total, ..
        } => {
            let percent = if total > 0 { received * 100 / total } else { 0 };
            print!("\r   {}% ({}/{})", percent, format_size(received), format_size(total));
            if received >= total {
                println!();
            }
            let _ = std::io::stdout().flush();
        }
        ClientEvent::ChunkServed {
            to,
            progress,
            ..
        } => {
            if progress.last_index.is_some_and(|i| i + 1 == progress.total_chunks) {
                println!("✅ {} 已接收完全部 {} 块", to, progress.total_chunks);
            }
        }
        ClientEvent::FileReceived { from, file } => {
            let path = file.save(output).await?;
            println!("✅ 收到来自 {} 的文件: {}", from, path.display());
        }
        ClientEvent::FileFailed { from, name, reason } => {
            println!("❌ 接收 {} (来自 {}) 失败: {}", name, from, reason);
        }
        ClientEvent::Chat { from, message } => println!("💬 {}: {}", from, message),
        ClientEvent::ServerError { message } => println!("⚠️  服务器错误: {}", message),
        ClientEvent::Disconnected => {
            println!("🔌 与服务器的连接已断开");
            return Ok(false);
        }
    }
    Ok(true)
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cli_parses_join() {
        let cli = Cli::parse_from([
            "sharenear", "join", "ab12cd", "--password", "hunter2", "--share", "a.txt",
        ]);
        let Commands::Join {
            room, share, password, ..
        } = cli.command
        else {
            panic!("expected join");
        };
        assert_eq!(room, "ab12cd");
        assert_eq!(password, "hunter2");
        assert_eq!(share, vec![PathBuf::from("a.txt")]);
    }
}
