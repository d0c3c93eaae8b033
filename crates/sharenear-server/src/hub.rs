//! 中继任务
//!
//! 房间注册表和中继状态只由这个任务持有，各连接任务通过通道提交事件，
//! 因此创建、加入、离开都是原子的。

use sharenear_core::signaling::{ClientMessage, PeerId};
use sharenear_core::{Outbox, Relay};
use tokio::sync::mpsc;

/// 连接任务提交给中继任务的事件
#[derive(Debug)]
pub enum HubEvent {
    Connected { peer: PeerId, outbox: Outbox },
    Message { peer: PeerId, message: ClientMessage },
    Disconnected { peer: PeerId },
}

pub type HubSender = mpsc::UnboundedSender<HubEvent>;

/// 启动中继任务
pub fn spawn_hub() -> HubSender {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_hub(rx));
    tx
}

pub async fn run_hub(mut events: mpsc::UnboundedReceiver<HubEvent>) {
    let mut relay = Relay::new();

    while let Some(event) = events.recv().await {
        match event {
            HubEvent::Connected { peer, outbox } => {
                relay.connect(peer.clone(), outbox);
                tracing::info!("Peer {} connected ({} online)", peer, relay.connected());
            }
            HubEvent::Message { peer, message } => {
                tracing::debug!("{} from {}", message.kind(), peer);
                relay.handle(&peer, message);
            }
            HubEvent::Disconnected { peer } => {
                relay.disconnect(&peer);
                tracing::info!(
                    "Peer {} disconnected ({} online, {} rooms)",
                    peer,
                    relay.connected(),
                    relay.registry().len()
                );
            }
        }
    }

    tracing::info!("Relay hub stopped");
}
