// src/device.rs
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ReaderConfig;
use crate::error::{DeviceError, SessionError};
use crate::types::DeviceCommand;

type ReaderSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound half of the reader connection.
pub type ReaderStream = SplitStream<ReaderSocket>;

/// Outbound half of the reader connection: the commands we send to it.
#[async_trait]
pub trait CommandSink: Send {
    async fn send_command(&mut self, command: DeviceCommand) -> Result<(), DeviceError>;

    async fn close(&mut self) -> Result<(), DeviceError>;
}

pub struct WsCommandSink {
    inner: SplitSink<ReaderSocket, Message>,
}

#[async_trait]
impl CommandSink for WsCommandSink {
    async fn send_command(&mut self, command: DeviceCommand) -> Result<(), DeviceError> {
        debug!("-> reader {}", command.as_str());
        self.inner.send(Message::text(command.as_str())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.inner.close().await?;
        Ok(())
    }
}

/// What the reader sent us, reduced to what a session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderFrame {
    Scan(String),
    Lost(String),
}

pub async fn connect(config: &ReaderConfig) -> Result<(WsCommandSink, ReaderStream), SessionError> {
    let connecting = tokio_tungstenite::connect_async(config.url.as_str());

    let (socket, _response) = match tokio::time::timeout(config.connect_timeout, connecting).await
    {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => {
            return Err(SessionError::Connect {
                url: config.url.clone(),
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(SessionError::Connect {
                url: config.url.clone(),
                reason: format!("timed out after {:?}", config.connect_timeout),
            });
        }
    };

    info!("Connected to card reader at {}", config.url);
    let (sink, stream) = socket.split();
    Ok((WsCommandSink { inner: sink }, stream))
}

/// Waits for the next scan, skipping control frames.
pub async fn next_frame(stream: &mut ReaderStream) -> ReaderFrame {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return ReaderFrame::Scan(text.as_str().to_string()),
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by reader".to_string());
                return ReaderFrame::Lost(reason);
            }
            Some(Err(err)) => return ReaderFrame::Lost(err.to_string()),
            None => return ReaderFrame::Lost("reader stream ended".to_string()),
            _ => {} // Binary, Ping, Pong
        }
    }
}
