use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::domain::ConversationId;
use tokio::{net::TcpStream, sync::broadcast, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// One live server-to-client notification stream, scoped to a single
/// conversation. Frames are the raw JSON text the server pushed; parsing is
/// the subscriber's concern.
#[async_trait]
pub trait PushSession: Send + Sync {
    fn subscribe_frames(&self) -> broadcast::Receiver<String>;
    async fn close(&self);
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, conversation_id: ConversationId) -> Result<Arc<dyn PushSession>>;
}

pub struct MissingPushConnector;

#[async_trait]
impl PushConnector for MissingPushConnector {
    async fn connect(&self, conversation_id: ConversationId) -> Result<Arc<dyn PushSession>> {
        Err(anyhow!(
            "push transport unavailable for conversation {conversation_id}"
        ))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connects the per-conversation WebSocket endpoint derived from the REST
/// base URL. Connection establishment carries no credential; the endpoint is
/// keyed by conversation id only.
pub struct WebSocketPushConnector {
    base_url: Url,
}

impl WebSocketPushConnector {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    fn push_url(&self, conversation_id: ConversationId) -> Result<Url> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(anyhow!(
                    "base url must use http or https, got {other}://"
                ))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to derive websocket scheme from {}", self.base_url))?;
        url.set_path(&format!("/api/chat/ws/{conversation_id}"));
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WebSocketPushConnector {
    async fn connect(&self, conversation_id: ConversationId) -> Result<Arc<dyn PushSession>> {
        let url = self.push_url(conversation_id)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect push channel: {url}"))?;
        let (writer, mut reader) = stream.split();

        let (frames, _) = broadcast::channel(256);
        let frames_tx = frames.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = frames_tx.send(text);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(conversation_id = %conversation_id, "push: receive failed: {err}");
                        break;
                    }
                }
            }
            debug!(conversation_id = %conversation_id, "push: stream ended");
        });

        debug!(conversation_id = %conversation_id, "push: channel connected");
        Ok(Arc::new(WebSocketPushSession {
            frames,
            writer: Mutex::new(Some(writer)),
            reader_task,
        }))
    }
}

struct WebSocketPushSession {
    frames: broadcast::Sender<String>,
    writer: Mutex<Option<WsSink>>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl PushSession for WebSocketPushSession {
    fn subscribe_frames(&self) -> broadcast::Receiver<String> {
        self.frames.subscribe()
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        self.reader_task.abort();
    }
}

impl Drop for WebSocketPushSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
