use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{BoxStream, SplitSink},
    SinkExt, StreamExt,
};
use log::{debug, info};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Outbound half of a detector connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one base64-encoded frame.
    async fn send_frame(&mut self, payload: String) -> Result<()>;

    async fn close(&mut self);
}

/// An open connection to the presence detector.
pub struct PresenceChannel {
    pub frames: Box<dyn FrameSink>,
    /// Classification strings; an `Err` means the connection is unusable.
    pub messages: BoxStream<'static, Result<String>>,
}

#[async_trait]
pub trait PresenceConnector: Send + Sync {
    async fn connect(&self) -> Result<PresenceChannel>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsPresenceConnector {
    url: String,
}

impl WsPresenceConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

struct WsFrameSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, payload: String) -> Result<()> {
        self.sink
            .send(Message::Text(payload))
            .await
            .context("failed to send frame to presence detector")
    }

    async fn close(&mut self) {
        if let Err(err) = self.sink.close().await {
            debug!("Presence socket close failed: {err}");
        }
    }
}

#[async_trait]
impl PresenceConnector for WsPresenceConnector {
    async fn connect(&self) -> Result<PresenceChannel> {
        info!("Connecting presence detector websocket: {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let (sink, stream) = ws_stream.split();

        let messages = stream
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes).map_err(|err| anyhow!("non-UTF-8 detector message: {err}")),
                    ),
                    Ok(Message::Close(frame)) => {
                        Some(Err(anyhow!("presence detector closed the socket: {frame:?}")))
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(anyhow!("presence socket error: {err}"))),
                }
            })
            .boxed();

        Ok(PresenceChannel {
            frames: Box::new(WsFrameSink { sink }),
            messages,
        })
    }
}
