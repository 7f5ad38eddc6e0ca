//! WebSocket connector over tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use super::{ABNORMAL_CLOSURE, Connector, Link, NO_STATUS_RECEIVED, Outgoing, TransportError, TransportEvent};

/// Production connector: one tungstenite socket per link, bridged to the link
/// channels by a writer task and a reader task.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str, protocols: &[String]) -> Result<Link, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: link → socket. Ends on close request, write failure, or
        // when the owning connection drops its sender.
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outgoing::Text(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            debug!(error = %e, "ws: write failed");
                            break;
                        }
                    }
                    Outgoing::Close { code, reason } => {
                        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return;
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader: socket → link. Keeps polling after a close frame so the
        // closing handshake completes, then reports the closure once.
        tokio::spawn(async move {
            let mut close_info: Option<(u16, String)> = None;
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if ev_tx.send(TransportEvent::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if ev_tx.send(TransportEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!(len = bytes.len(), "ws: dropping non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        close_info = Some(frame.map_or((NO_STATUS_RECEIVED, String::new()), |f| {
                            (u16::from(f.code), f.reason.as_str().to_owned())
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if close_info.is_none() {
                            let _ = ev_tx.send(TransportEvent::Error(e.to_string()));
                        }
                        break;
                    }
                }
            }
            let (code, reason) = close_info.unwrap_or((ABNORMAL_CLOSURE, String::new()));
            let _ = ev_tx.send(TransportEvent::Closed { code, reason });
        });

        Ok(Link { outbound: out_tx, inbound: ev_rx })
    }
}
