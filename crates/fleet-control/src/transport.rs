//! Frame transport between the hub and one agent
//!
//! The hub only needs to push and pull whole frames, so the upgraded WebSocket
//! is hidden behind [`FrameSink`] / [`FrameSource`]. [`channel_pair`] gives an
//! in-process implementation with a [`ChannelPeer`] standing in for the agent.

use async_trait::async_trait;
use fleet_proto::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// One WebSocket-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `None` once the peer has gone away
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

pub struct ChannelSource {
    rx: mpsc::Receiver<Frame>,
}

/// The agent side of an in-process connection
pub struct ChannelPeer {
    to_hub: Option<mpsc::Sender<Frame>>,
    from_hub: mpsc::Receiver<Frame>,
}

/// In-process transport with `capacity` frames of buffering per direction
pub fn channel_pair(capacity: usize) -> (ChannelSink, ChannelSource, ChannelPeer) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    (
        ChannelSink { tx: out_tx },
        ChannelSource { rx: in_rx },
        ChannelPeer {
            to_hub: Some(in_tx),
            from_hub: out_rx,
        },
    )
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // The peer may already be gone
        let _ = self.tx.try_send(Frame::Close);
        Ok(())
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

impl ChannelPeer {
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        match &self.to_hub {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = envelope
            .encode()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.send(Frame::Text(text)).await
    }

    /// Next frame written by the hub
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_hub.recv().await
    }

    /// Next envelope written by the hub, skipping pings
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(frame) = self.from_hub.recv().await {
            match frame {
                Frame::Text(text) => return Envelope::decode(&text).ok(),
                Frame::Close => return None,
                Frame::Ping(_) | Frame::Pong(_) => continue,
            }
        }
        None
    }

    /// Close the agent side; the hub sees end of stream
    pub fn disconnect(&mut self) {
        self.to_hub = None;
    }
}
