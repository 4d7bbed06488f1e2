//! Persistent stream transport over WebSocket

use crate::router::{Connection, ConnectionState, Connector, CorrelationRouter};
use crate::transport::{RelayTransport, SubmitResponse, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use scp_core::{FetchRequest, ProtocolEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Opens WebSocket connections and bridges them onto text channels
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("connect to {url} timed out")))?
            .map_err(|e| TransportError::ConnectionFailed(format!("WebSocket connect failed: {e}")))?;

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (incoming, inbound) = mpsc::unbounded_channel::<String>();
        let url = url.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outgoing.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!(url = %url, error = %e, "WebSocket send failed");
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if incoming.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => {
                                if incoming.send(text).is_err() {
                                    break;
                                }
                            }
                            Err(_) => debug!(url = %url, "dropping non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(url = %url, error = %e, "WebSocket receive failed");
                            break;
                        }
                    },
                }
            }
            debug!(url = %url, "WebSocket bridge stopped");
        });

        Ok(Connection { outbound, inbound })
    }
}

/// Relay transport over one multiplexed persistent connection
pub struct StreamTransport {
    router: CorrelationRouter,
}

impl StreamTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self::with_connector(url, Arc::new(WebSocketConnector::new(connect_timeout)), request_timeout)
    }

    pub fn with_connector(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            router: CorrelationRouter::new(url, connector, request_timeout),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.router.state()
    }

    pub async fn close(&self) {
        self.router.close().await;
    }
}

#[async_trait]
impl RelayTransport for StreamTransport {
    fn url(&self) -> &str {
        self.router.url()
    }

    async fn fetch_events(&self, requests: &[FetchRequest]) -> Result<Vec<ProtocolEvent>, TransportError> {
        self.router.fetch(requests).await
    }

    async fn submit_event(&self, event: &ProtocolEvent) -> Result<SubmitResponse, TransportError> {
        self.router.submit(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{parse_client_text, RelayMessage};
    use crate::router::tests::event;
    use scp_core::Filter;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn next_client_frame<S>(ws: &mut S) -> (String, Vec<serde_json::Value>)
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return parse_client_text(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_and_submit_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let (kind, args) = next_client_frame(&mut ws).await;
            assert_eq!(kind, "REQ");
            assert_eq!(args[1], json!({"cache": ["community-posts", {"communityUri": "34550:p:dev"}]}));
            let id = args[0].as_str().unwrap().to_string();
            for msg in [
                RelayMessage::Event { id: id.clone(), event: event("a", 1) },
                RelayMessage::Eose { id: id.clone() },
            ] {
                ws.send(Message::Text(msg.to_text())).await.unwrap();
            }

            let (kind, _) = next_client_frame(&mut ws).await;
            assert_eq!(kind, "CLOSE");

            let (kind, args) = next_client_frame(&mut ws).await;
            assert_eq!(kind, "EVENT");
            let ok = RelayMessage::Ok {
                id: args[0]["id"].as_str().unwrap().to_string(),
                accepted: true,
                message: "stored".into(),
            };
            ws.send(Message::Text(ok.to_text())).await.unwrap();
            ws
        });

        let transport = StreamTransport::new(
            format!("ws://{addr}"),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let events = transport
            .fetch_cached_events("community-posts", json!({"communityUri": "34550:p:dev"}))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(transport.state(), ConnectionState::Open);

        let response = transport.submit_event(&event("e1", 1)).await.unwrap();
        assert!(response.success);
        assert_eq!(response.message.as_deref(), Some("stored"));
        assert_eq!(response.relay, format!("ws://{addr}"));

        let _ws = server.await.unwrap();
        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_server_hangup_fails_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = next_client_frame(&mut ws).await;
            ws.close(None).await.unwrap();
        });

        let transport = StreamTransport::new(
            format!("ws://{addr}"),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let result = transport.fetch_events(&[Filter::new().kinds([1]).into()]).await;
        assert_eq!(result.unwrap_err(), TransportError::ConnectionClosed);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_relay() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let transport = StreamTransport::new(
            format!("ws://{addr}"),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let result = transport.fetch_events(&[Filter::new().into()]).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
