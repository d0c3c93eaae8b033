//! 信令服务器连接
//!
//! 把 WebSocket 文本消息桥接到驱动使用的通道上。

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::driver::{ClientOptions, RelayChannel, RunningClient, ShareClient};
use crate::config::ClientSettings;
use crate::peer::DirectNegotiator;
use crate::signaling::{ClientMessage, ServerMessage};

/// 连接信令服务器并启动客户端驱动
pub async fn connect(settings: &ClientSettings) -> anyhow::Result<RunningClient> {
    let relay = connect_relay(&settings.server_url).await?;

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let negotiator = DirectNegotiator::new(
        settings.bind_host.clone(),
        settings.advertise_host.clone(),
        transport_tx,
    );

    Ok(ShareClient::spawn(
        ClientOptions::from(settings),
        relay,
        Arc::new(negotiator),
        transport_rx,
    ))
}

/// 建立 WebSocket 连接，返回收发通道
pub async fn connect_relay(url: &str) -> anyhow::Result<RelayChannel> {
    info!("Connecting to signaling server: {}", url);
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerMessage>();

    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {}: {}", message.kind(), e);
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::decode(&text) {
                    Ok(message) => {
                        if incoming_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Invalid message from server: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Signaling connection error: {}", e);
                    break;
                }
            }
        }
    });

    Ok(RelayChannel {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
    })
}
