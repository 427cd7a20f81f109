//! WebSocket push transport

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{ChangeEvent, EventStream, RealtimeChannel, RealtimeError, RealtimeScope};

/// First frame sent after connecting
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame<'a> {
    Subscribe {
        congregation: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<&'a str>,
        admin: bool,
    },
}

/// Subscribes over a WebSocket and decodes one [`ChangeEvent`] per text frame
pub struct WebSocketChannel {
    url: String,
}

impl WebSocketChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Decode a text frame; frames that are not change events are skipped
fn decode_frame(text: &str) -> Option<ChangeEvent> {
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring realtime frame: {}", e);
            None
        }
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    async fn subscribe(&self, scope: &RealtimeScope) -> Result<EventStream, RealtimeError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        let (mut write, read) = ws_stream.split();

        let frame = ClientFrame::Subscribe {
            congregation: &scope.congregation,
            user: scope.user.as_deref(),
            admin: scope.admin,
        };
        let text =
            serde_json::to_string(&frame).map_err(|e| RealtimeError::Protocol(e.to_string()))?;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        debug!("Subscribed to {} for congregation {}", self.url, scope.congregation);

        // The write half stays alive inside the stream so the socket stays open
        let events = read
            .take_while(|msg| {
                let open = !matches!(msg, Ok(Message::Close(_)));
                async move { open }
            })
            .filter_map(move |msg| {
                let _keep = &write;
                let item = match msg {
                    Ok(Message::Text(text)) => decode_frame(&text).map(Ok),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Realtime connection error: {}", e);
                        Some(Err(RealtimeError::Protocol(e.to_string())))
                    }
                };
                async move { item }
            });

        Ok(Box::pin(events))
    }
}
