//! HTTP 路由和 WebSocket 连接处理

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sharenear_core::signaling::{ClientMessage, PeerId, ServerMessage};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::hub::{HubEvent, HubSender};

/// 单条信令消息的上限
const MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubSender,
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// 跨域策略
///
/// 指定了客户端地址时只允许这些来源，否则允许任意来源。
pub fn cors_layer(client_urls: &[String]) -> anyhow::Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if client_urls.is_empty() {
        return Ok(cors.allow_origin(Any));
    }
    let origins = client_urls
        .iter()
        .map(|url| HeaderValue::from_str(url.trim_end_matches('/')))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cors.allow_origin(AllowOrigin::list(origins)))
}

async fn info_handler() -> Json<Value> {
    Json(json!({
        "message": "ShareNear Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health_handler() -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Json(json!({ "status": "OK", "timestamp": timestamp }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// 单个信令连接
///
/// 读循环把消息交给中继任务，写任务把中继的出站消息写回连接。
/// 无法解析的消息只回复错误，不断开连接。
async fn handle_socket(socket: WebSocket, hub: HubSender) {
    let peer = PeerId::random();
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<ServerMessage>();
    let (mut sender, mut receiver) = socket.split();

    if hub
        .send(HubEvent::Connected {
            peer: peer.clone(),
            outbox: outbox.clone(),
        })
        .is_err()
    {
        tracing::error!("Relay hub is not running");
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientMessage::decode(&text) {
                Ok(message) => {
                    if hub
                        .send(HubEvent::Message {
                            peer: peer.clone(),
                            message,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Invalid message from {}: {}", peer, e);
                    let _ = outbox.send(ServerMessage::error(e.to_string()));
                }
            },
            Ok(Message::Binary(_)) => {
                let _ = outbox.send(ServerMessage::error("Binary messages are not supported"));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Connection error for {}: {}", peer, e);
                break;
            }
        }
    }

    let _ = hub.send(HubEvent::Disconnected { peer });
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_info_endpoint() {
        let Json(body) = info_handler().await;
        assert_eq!(body["message"], "ShareNear Server");
        assert_eq!(body["status"], "running");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    /// 发送一个带 Origin 的 GET，返回响应头部分
    async fn get_with_origin(cors: CorsLayer, origin: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let app = router(
            AppState {
                hub: crate::hub::spawn_hub(),
            },
            cors,
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /health HTTP/1.1\r\nHost: {addr}\r\nOrigin: {origin}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.to_lowercase()
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin_by_default() {
        let response = get_with_origin(cors_layer(&[]).unwrap(), "http://localhost:5173").await;
        assert!(response.starts_with("http/1.1 200"), "{response}");
        assert!(response.contains("access-control-allow-origin: *"), "{response}");
    }

    #[tokio::test]
    async fn test_cors_restricted_to_client_url() {
        let cors = cors_layer(&["https://share.example.app/".to_string()]).unwrap();
        let allowed = get_with_origin(cors.clone(), "https://share.example.app").await;
        assert!(
            allowed.contains("access-control-allow-origin: https://share.example.app"),
            "{allowed}"
        );

        let denied = get_with_origin(cors, "https://evil.test").await;
        assert!(!denied.contains("access-control-allow-origin"), "{denied}");
    }

    #[test]
    fn test_cors_rejects_invalid_origin() {
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "OK");
        assert!(body["timestamp"].as_u64().unwrap() > 0);
    }
}
