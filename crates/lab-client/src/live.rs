use futures::StreamExt;
use lab_schemas::PilotSnapshot;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connecting to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("reading pilot feed: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("malformed pilot snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The page's single push channel of full pilot-state snapshots.
pub struct PilotFeed {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PilotFeed {
    pub async fn connect(url: &str) -> Result<Self, FeedError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|source| FeedError::Connect {
                url: url.to_string(),
                source,
            })?;
        info!(url, "pilot feed connected");
        Ok(Self {
            url: url.to_string(),
            stream,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next snapshot in arrival order; `None` once the server closes the channel.
    pub async fn next_snapshot(&mut self) -> Option<Result<PilotSnapshot, FeedError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(FeedError::Read(e))),
            };
            match msg {
                Message::Text(text) => {
                    return Some(serde_json::from_str(&text).map_err(FeedError::from))
                }
                Message::Binary(bytes) => {
                    return Some(serde_json::from_slice(&bytes).map_err(FeedError::from))
                }
                Message::Close(frame) => {
                    debug!(url = %self.url, ?frame, "pilot feed closed");
                    return None;
                }
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use lab_core::{PilotMonitor, PilotScope};
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn redundant_snapshots_are_filtered_downstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
            let idle = json!({ "rig-a": { "connected": true, "state": "IDLE", "last_seen_sec": 0.1 } });
            let idle_later = json!({ "rig-a": { "connected": true, "state": "IDLE", "last_seen_sec": 0.8 } });
            let running = json!({ "rig-a": {
                "connected": true, "state": "RUNNING",
                "active_run": { "id": 9, "session_id": 4 }
            } });
            for payload in [idle, idle_later, running] {
                ws.send(Message::Text(payload.to_string())).await.expect("send");
            }
            ws.close(None).await.expect("close");
        });

        let mut feed = PilotFeed::connect(&format!("ws://{}/ws/pilots", addr))
            .await
            .expect("connect");
        let mut monitor = PilotMonitor::new(PilotScope::All);
        let mut applied = 0;
        let mut received = 0;
        while let Some(snapshot) = feed.next_snapshot().await {
            received += 1;
            if monitor.observe(snapshot.expect("snapshot")).is_some() {
                applied += 1;
            }
        }
        server.await.expect("server");
        assert_eq!(received, 3);
        assert_eq!(applied, 2);
        assert_eq!(monitor.pilot("rig-a").and_then(|p| p.active_session()), Some(4));
    }
}
