// src/feed.rs
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use warp::Filter;

use crate::session::SessionEvent;
use crate::types::IdentificationOutcome;

// Messages pushed TO the UI clients
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedMessage {
    ReaderStatus {
        connected: bool,
    },
    CardIdentified {
        #[serde(rename = "cardNumber")]
        card_number: String,
        status: String,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<u64>,
    },
    LookupFailed {
        #[serde(rename = "cardNumber")]
        card_number: String,
        error: String,
    },
}

impl FeedMessage {
    pub fn from_event(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Identified(identification) => FeedMessage::CardIdentified {
                card_number: identification.uid.as_str().to_string(),
                status: identification.outcome.label().to_string(),
                user_id: match identification.outcome {
                    IdentificationOutcome::Assigned(id) => Some(id),
                    _ => None,
                },
            },
            SessionEvent::LookupFailed { raw, error } => FeedMessage::LookupFailed {
                card_number: raw.clone(),
                error: error.to_string(),
            },
            SessionEvent::ConnectionLost { .. } => FeedMessage::ReaderStatus { connected: false },
        }
    }
}

// Messages received FROM the UI clients
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum IncomingMessage {
    GetReaderStatus,
}

/// Fan-out of session events to every connected UI client.
#[derive(Clone)]
pub struct OutcomeFeed {
    tx: Arc<broadcast::Sender<FeedMessage>>,
    reader_connected: Arc<watch::Sender<bool>>,
}

impl Default for OutcomeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        let (reader_connected, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            reader_connected: Arc::new(reader_connected),
        }
    }

    pub fn publish(&self, event: &SessionEvent) {
        if let SessionEvent::ConnectionLost { .. } = event {
            self.reader_connected.send_replace(false);
        }
        // No subscribers is fine
        let _ = self.tx.send(FeedMessage::from_event(event));
    }

    pub fn set_reader_connected(&self, connected: bool) {
        self.reader_connected.send_replace(connected);
        let _ = self.tx.send(FeedMessage::ReaderStatus { connected });
    }

    pub fn reader_connected(&self) -> bool {
        *self.reader_connected.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedMessage> {
        self.tx.subscribe()
    }

    pub async fn serve(self, addr: SocketAddr) {
        info!("Outcome feed running on ws://{}", addr);
        warp::serve(routes(self)).run(addr).await;
    }
}

/// WebSocket route at "/" for UI clients.
pub fn routes(
    feed: OutcomeFeed,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path::end()
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let feed = feed.clone();
            ws.on_upgrade(move |socket| handle_connection(socket, feed))
        })
        .with(warp::cors().allow_any_origin())
}

async fn handle_connection(ws: warp::ws::WebSocket, feed: OutcomeFeed) {
    let (mut client_tx, mut client_rx) = ws.split();
    let mut broadcast_rx = feed.subscribe();

    // Replies to this client only, merged with the broadcast below
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<FeedMessage>();
    let _ = reply_tx.send(FeedMessage::ReaderStatus {
        connected: feed.reader_connected(),
    });

    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
                broadcast = broadcast_rx.recv() => match broadcast {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Feed client lagged, skipped {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    warn!("Could not encode feed message: {}", err);
                    continue;
                }
            };
            if client_tx.send(warp::ws::Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = client_rx.next().await {
        let Ok(text) = msg.to_str() else {
            continue;
        };
        match serde_json::from_str::<IncomingMessage>(text) {
            Ok(IncomingMessage::GetReaderStatus) => {
                let _ = reply_tx.send(FeedMessage::ReaderStatus {
                    connected: feed.reader_connected(),
                });
            }
            Err(err) => debug!("Ignoring feed client message {:?}: {}", text, err),
        }
    }

    writer.abort();
}
