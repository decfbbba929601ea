//! Client side of the broker: subscriber connections, one-shot publishing and
//! a reusable [`Publisher`].

use crate::config::ClientConfig;
use crate::protocol::{AckKind, CodecError, Envelope, TelemetryPacket};
use crate::transport::{self, Connection, LinkOptions, TransportError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("timed out waiting for the broker")]
    Timeout,
    #[error("connection closed by the broker")]
    Closed,
    #[error("broker rejected the request for topic {topic}")]
    Rejected { topic: u16 },
}

/// Entry point for talking to a broker.
#[derive(Debug, Clone)]
pub struct TelemetryClient {
    config: ClientConfig,
}

impl TelemetryClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a subscriber connection. An empty filter matches every topic, so
    /// a fresh connection sees all traffic until its first subscribe.
    pub async fn connect(&self) -> Result<ClientConnection, ClientError> {
        let conn = open(&self.config, self.config.subscriber_addr()).await?;
        debug!(peer = %conn.peer_addr(), "subscriber connection open");

        Ok(ClientConnection {
            conn,
            pending: VecDeque::new(),
            ack_timeout: self.config.ack_timeout(),
            max_pending: self.config.max_pending_packets,
        })
    }

    /// Publishes one packet over a short-lived producer connection.
    ///
    /// `Ok` only means the broker's socket took the bytes; delivery to
    /// subscribers is not confirmed.
    pub async fn publish(&self, packet: &TelemetryPacket) -> Result<(), ClientError> {
        let payload = packet.encode()?;
        let disconnect = Envelope::Disconnect.encode()?;

        let mut conn = open(&self.config, self.config.producer_addr()).await?;
        let sent: Result<(), TransportError> = async {
            conn.send(&payload).await?;
            conn.send(&disconnect).await
        }
        .await;

        if let Err(e) = conn.close().await {
            debug!(error = %e, "closing producer connection failed");
        }
        sent?;
        Ok(())
    }

    /// A producer connection kept open across publishes.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            config: self.config.clone(),
            conn: None,
        }
    }
}

async fn open(config: &ClientConfig, addr: SocketAddr) -> Result<Connection, ClientError> {
    let options = LinkOptions {
        max_frame_size: config.max_frame_size,
        send_timeout: config.send_timeout(),
    };
    match transport::client_connect(addr, config.connect_timeout(), options).await {
        Ok(conn) => Ok(conn),
        Err(TransportError::Timeout) => Err(ClientError::Timeout),
        Err(e) => Err(e.into()),
    }
}

/// A connection on the subscriber port.
#[derive(Debug)]
pub struct ClientConnection {
    conn: Connection,
    pending: VecDeque<TelemetryPacket>,
    ack_timeout: Duration,
    max_pending: usize,
}

impl ClientConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Adds `topic_id` to this connection's filter and waits for the broker to
    /// confirm it.
    pub async fn subscribe(&mut self, topic_id: u16) -> Result<(), ClientError> {
        self.request(Envelope::Subscribe(topic_id), AckKind::Subscribe, topic_id)
            .await
    }

    /// Removing a topic that was never added still succeeds.
    pub async fn unsubscribe(&mut self, topic_id: u16) -> Result<(), ClientError> {
        self.request(Envelope::Unsubscribe(topic_id), AckKind::Unsubscribe, topic_id)
            .await
    }

    /// Publishes on this connection. The broker routes it like any other
    /// packet, including back to this connection if the filter matches.
    pub async fn publish(&mut self, packet: &TelemetryPacket) -> Result<(), ClientError> {
        self.conn.send(&packet.encode()?).await?;
        Ok(())
    }

    /// Next packet, waiting at most `timeout` in total. Other message kinds
    /// and undecodable frames are skipped.
    pub async fn read(&mut self, timeout: Duration) -> Result<TelemetryPacket, ClientError> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(packet);
        }

        let deadline = transport::deadline_after(timeout);
        loop {
            let frame = self.recv_until(deadline).await?;
            match Envelope::decode(&frame) {
                Ok(Envelope::Packet(packet)) => return Ok(packet),
                Ok(other) => debug!(kind = ?other.message_type(), "skipping non-packet message"),
                Err(e) => warn!(error = %e, "skipping undecodable frame"),
            }
        }
    }

    /// Packets received while waiting for an ack and not yet read.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Sends DISCONNECT and closes. Returns whether the DISCONNECT reached the
    /// socket; a broker that already hung up is not an error.
    pub async fn disconnect(mut self) -> bool {
        let delivered = match Envelope::Disconnect.encode() {
            Ok(payload) => self.conn.send(&payload).await.is_ok(),
            Err(_) => false,
        };
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "close after disconnect failed");
        }
        delivered
    }

    async fn request(&mut self, envelope: Envelope, kind: AckKind, topic_id: u16) -> Result<(), ClientError> {
        self.conn.send(&envelope.encode()?).await?;

        let deadline = transport::deadline_after(self.ack_timeout);
        loop {
            let frame = self.recv_until(deadline).await?;
            match Envelope::decode(&frame) {
                Ok(Envelope::Ack(ack)) if ack.request == kind && ack.topic_id == topic_id => {
                    return if ack.accepted {
                        Ok(())
                    } else {
                        Err(ClientError::Rejected { topic: topic_id })
                    };
                }
                Ok(Envelope::Ack(ack)) => debug!(?ack, "ignoring unrelated ack"),
                Ok(Envelope::Packet(packet)) => self.hold(packet),
                Ok(other) => debug!(kind = ?other.message_type(), "ignoring message while awaiting ack"),
                Err(e) => warn!(error = %e, "skipping undecodable frame"),
            }
        }
    }

    fn hold(&mut self, packet: TelemetryPacket) {
        if self.pending.len() >= self.max_pending {
            self.pending.pop_front();
            warn!(limit = self.max_pending, "pending packet buffer full, dropping oldest");
        }
        self.pending.push_back(packet);
    }

    async fn recv_until(&mut self, deadline: Instant) -> Result<Bytes, ClientError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.conn.recv(remaining).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) | Err(TransportError::Inactive) => Err(ClientError::Closed),
            Err(TransportError::Timeout) => Err(ClientError::Timeout),
            Err(e) => Err(e.into()),
        }
    }
}

/// Long-lived producer connection. Reconnects once when the previous
/// connection turns out to be dead.
#[derive(Debug)]
pub struct Publisher {
    config: ClientConfig,
    conn: Option<Connection>,
}

impl Publisher {
    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_active)
    }

    pub async fn publish(&mut self, packet: &TelemetryPacket) -> Result<(), ClientError> {
        let payload = packet.encode()?;

        if let Some(conn) = self.conn.as_mut() {
            if is_stale(conn).await {
                debug!("producer connection closed by broker, reconnecting");
            } else {
                match conn.send(&payload).await {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!(error = %e, "producer send failed, reconnecting"),
                }
            }
            self.conn = None;
        }

        let mut conn = open(&self.config, self.config.producer_addr()).await?;
        conn.send(&payload).await?;
        self.conn = Some(conn);
        Ok(())
    }

    /// Sends DISCONNECT and drops the connection, if any.
    pub async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Ok(payload) = Envelope::Disconnect.encode() {
            let _ = conn.send(&payload).await;
        }
        let _ = conn.close().await;
    }
}

/// A zero-length receive surfaces an EOF or reset the broker already sent.
/// Anything the broker sends a producer is unsolicited and dropped.
async fn is_stale(conn: &mut Connection) -> bool {
    !matches!(
        conn.recv(Duration::ZERO).await,
        Err(TransportError::Timeout) | Ok(Some(_))
    )
}
