//! WebSocket plumbing: one duplex connection, JSON text frames in and
//! out, nothing else.
//!
//! The channel spawns two tasks around the socket. The writer drains an
//! mpsc of [`Outbound`] envelopes into the sink and performs the close
//! handshake when the handle is dropped. The reader decodes incoming
//! text frames and forwards them as [`ChannelEvent`]s; malformed frames
//! are logged and dropped, never surfaced as failures, so one buggy
//! peer message cannot take the session down. The final event on any
//! channel is always [`ChannelEvent::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Inbound, Outbound};

/// Buffer for each direction; decouples the session task from socket
/// latency. `send` waits when the writer falls behind, so the size is
/// not a delivery bound.
const CHANNEL_BUFFER: usize = 256;

/// What the connection reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A decoded server envelope.
    Inbound(Inbound),
    /// Transport-level failure. Always followed by `Closed`.
    Error(String),
    /// The connection is gone, from either end.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect: {0}")]
    Connect(String),
}

/// Handle to one live connection.
pub struct MessageChannel {
    outgoing: mpsc::Sender<Outbound>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl MessageChannel {
    /// Open a connection and start its reader/writer tasks. The returned
    /// receiver yields every decoded envelope and, last, `Closed`.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        log::info!("WebSocket connected to {}", url);

        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(CHANNEL_BUFFER);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Skipping unencodable envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::debug!("WebSocket send failed: {}", e);
                    break;
                }
            }
            // handle dropped or sink dead, say goodbye if the peer is
            // still listening
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match Inbound::decode(text.as_str()) {
                        Ok(envelope) => {
                            let _ = event_tx.send(ChannelEvent::Inbound(envelope)).await;
                        }
                        Err(e) => log::warn!("Dropping malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {} // ping/pong/binary, nothing for us
                    Err(e) => {
                        log::warn!("WebSocket read error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(ChannelEvent::Closed).await;
        });

        Ok((
            Self {
                outgoing,
                open,
                reader,
            },
            event_rx,
        ))
    }

    /// Hand an envelope to the writer, waiting for buffer space when
    /// the writer is behind. A closed connection hands the envelope
    /// back, so the caller can route it through the outbound queue
    /// instead.
    pub async fn send(&self, envelope: Outbound) -> Result<(), Outbound> {
        if !self.is_open() {
            return Err(envelope);
        }
        self.outgoing.send(envelope).await.map_err(|e| {
            log::debug!("Channel gone, handing envelope back");
            e.0
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Tear the connection down. The writer performs the close
    /// handshake; the reader is stopped outright since nobody is
    /// listening for its events anymore.
    pub fn close(self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        // dropping `outgoing` lets the writer finish and close the sink
    }
}
