//! Socket adapter beneath the connection manager.
//!
//! DESIGN
//! ======
//! A [`Connector`] opens one socket and hands back a [`Link`]: an outbound
//! channel of text/close frames and an inbound channel of text frames plus a
//! final `Closed` notice. The connection manager only ever talks to links,
//! so the websocket implementation and the in-memory test double are
//! interchangeable.
//!
//! The websocket link runs two pump tasks (writer and reader). A socket
//! error or a stream that ends without a close frame is reported as a close
//! with no code, which the manager treats as abnormal.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use crate::error::TransportError;

/// The only close code that counts as a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Frame written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(u16),
}

/// Frame read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Terminal. `code` is `None` when the socket died without a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// One open socket, as a pair of channels.
pub struct Link {
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub rx: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens sockets. Implemented over websockets and, in tests, in memory.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!(error = %e, "ws: send failed");
                            break;
                        }
                    }
                    Outbound::Close(code) => {
                        let close = CloseFrame { code: CloseCode::from(code), reason: "".into() };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let inbound = match msg {
                    Ok(Message::Text(text)) => Inbound::Text(text.to_string()),
                    Ok(Message::Binary(bytes)) => Inbound::Text(String::from_utf8_lossy(&bytes).into_owned()),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) =
                            frame.map_or((None, String::new()), |f| (Some(u16::from(f.code)), f.reason.to_string()));
                        let _ = in_tx.send(Inbound::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "ws: recv failed");
                        let _ = in_tx.send(Inbound::Closed { code: None, reason: e.to_string() });
                        return;
                    }
                };
                if in_tx.send(inbound).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(Inbound::Closed { code: None, reason: "stream ended".into() });
        });

        Ok(Link { tx: out_tx, rx: in_rx })
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
