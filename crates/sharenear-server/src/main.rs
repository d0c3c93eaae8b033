//! ShareNear Server
//!
//! 信令服务器，负责：
//! - 房间的创建、加入和离开
//! - 在房间成员之间转发连接协商消息和文件元数据
//!
//! 文件内容不经过服务器。

mod hub;
mod routes;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sharenear-server", version, about = "ShareNear 信令服务器")]
struct Args {
    /// 监听地址
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
    /// 监听端口
    #[arg(short, long, env = "PORT", default_value = "3001")]
    port: u16,
    /// 允许跨域访问的客户端地址，可重复指定，逗号分隔 (默认允许任意来源)
    #[arg(long, env = "CLIENT_URL", value_delimiter = ',')]
    client_url: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（sharenear-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sharenear_core=debug")),
        )
        .try_init();

    let args = Args::parse();

    let cors = routes::cors_layer(&args.client_url)?;
    let hub = hub::spawn_hub();
    let app = routes::router(routes::AppState { hub }, cors);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
