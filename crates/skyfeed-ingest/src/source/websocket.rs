//! Websocket transport with keep-alive.
//!
//! Sends a ping every `ping_interval` and fails the session when nothing at
//! all (data, ping or pong) arrives for `idle_timeout`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Frame, FrameStream, Transport};
use crate::{Error, Result};

/// Configuration for the websocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// How often to ping the server.
    pub ping_interval: Duration,

    /// Fail the session after this long without any inbound traffic.
    pub idle_timeout: Duration,

    /// Give up on the handshake after this long.
    pub connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// tokio-tungstenite websocket client.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

enum WsEvent {
    Inbound(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Ping,
    Idle,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, url: &str) -> Result<FrameStream> {
        let (ws, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "connect to {} timed out after {:?}",
                    url, self.config.connect_timeout
                ))
            })??;

        tracing::info!("Connected to {}", url);

        Ok(Box::pin(frames(
            ws,
            self.config.ping_interval,
            self.config.idle_timeout,
        )))
    }
}

fn frames(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ping_interval: Duration,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<Frame>> + Send {
    let (mut write, mut read) = ws.split();

    try_stream! {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            let event = tokio::select! {
                msg = read.next() => WsEvent::Inbound(msg),
                _ = ping.tick() => WsEvent::Ping,
                _ = tokio::time::sleep_until(last_seen + idle_timeout) => WsEvent::Idle,
            };

            let frame = match event {
                WsEvent::Inbound(None) => Err(Error::StreamClosed)?,
                WsEvent::Inbound(Some(msg)) => {
                    last_seen = Instant::now();
                    inbound_frame(msg?)?
                }
                WsEvent::Ping => {
                    write.send(Message::Ping(Vec::new())).await?;
                    None
                }
                WsEvent::Idle => Err(Error::Transport(format!(
                    "no traffic for {:?}",
                    idle_timeout
                )))?,
            };

            if let Some(frame) = frame {
                yield frame;
            }
        }
    }
}

fn inbound_frame(msg: Message) -> Result<Option<Frame>> {
    match msg {
        Message::Binary(bytes) => Ok(Some(Frame::Binary(bytes))),
        Message::Text(text) => Ok(Some(Frame::Text(text))),
        Message::Close(frame) => {
            tracing::debug!("Server closed websocket: {:?}", frame);
            Err(Error::StreamClosed)
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(None),
    }
}

impl Transport for WebSocketTransport {
    fn open<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FrameStream>> + Send + 'a>> {
        Box::pin(self.connect(url))
    }
}
