//! The telemetry broker: two accept loops, one task per connection, and the
//! publish fan-out.
//!
//! Subscriber-facing connections are registered in the
//! [`SubscriberRegistry`] and may subscribe, unsubscribe, publish and
//! disconnect. Producer-facing connections are never registered; they only
//! publish. Every failure stays scoped to the connection that caused it.

use crate::config::{BrokerConfig, ClientConfig};
use crate::protocol::{Ack, AckKind, Envelope, TelemetryPacket};
use crate::registry::{Registration, SubscriberHandle, SubscriberRegistry};
use crate::transport::{self, Connection, FrameReader, LinkOptions, ListenHandle, TransportError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

const ACCEPT_RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },
    #[error("broker task failed: {0}")]
    Join(#[from] JoinError),
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub packets_routed: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub decode_errors: u64,
    pub active_subscribers: usize,
}

#[derive(Debug, Default)]
struct BrokerCounters {
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    packets_routed: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    decode_errors: AtomicU64,
}

impl BrokerCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct BrokerShared {
    config: BrokerConfig,
    registry: Arc<SubscriberRegistry>,
    counters: BrokerCounters,
    producer_slots: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl BrokerShared {
    fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            connections_accepted: c.connections_accepted.load(Ordering::Relaxed),
            connections_refused: c.connections_refused.load(Ordering::Relaxed),
            packets_routed: c.packets_routed.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            active_subscribers: self.registry.active_len(),
        }
    }

    fn client_config(&self, subscriber_addr: SocketAddr, producer_addr: SocketAddr) -> ClientConfig {
        let mut client = self.config.client_config();
        client.host = subscriber_addr.ip();
        client.subscriber_port = subscriber_addr.port();
        client.producer_port = producer_addr.port();
        client
    }
}

/// A broker with both listeners bound, not yet accepting.
#[derive(Debug)]
pub struct TelemetryBroker {
    shared: Arc<BrokerShared>,
    subscriber_listener: ListenHandle,
    producer_listener: ListenHandle,
}

impl TelemetryBroker {
    /// Binds the subscriber and producer listeners. Failing to bind either
    /// is fatal. Must be called from within a tokio runtime.
    pub fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        let options = LinkOptions {
            max_frame_size: config.max_frame_size,
            send_timeout: config.send_timeout(),
        };

        let subscriber_addr = SocketAddr::new(config.bind_addr, config.subscriber_port);
        let subscriber_listener =
            transport::server_setup(subscriber_addr, config.backlog, options).map_err(|source| BrokerError::Bind {
                role: "subscriber",
                addr: subscriber_addr,
                source,
            })?;

        let producer_addr = SocketAddr::new(config.bind_addr, config.producer_port);
        let producer_listener =
            transport::server_setup(producer_addr, config.backlog, options).map_err(|source| BrokerError::Bind {
                role: "producer",
                addr: producer_addr,
                source,
            })?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(BrokerShared {
            registry: Arc::new(SubscriberRegistry::new(config.max_subscribers)),
            producer_slots: Arc::new(Semaphore::new(config.max_producers)),
            counters: BrokerCounters::default(),
            shutdown,
            config,
        });

        Ok(Self {
            shared,
            subscriber_listener,
            producer_listener,
        })
    }

    pub fn subscriber_addr(&self) -> SocketAddr {
        self.subscriber_listener.local_addr()
    }

    pub fn producer_addr(&self) -> SocketAddr {
        self.producer_listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.stats()
    }

    /// Client settings pointing at the ports actually bound.
    pub fn client_config(&self) -> ClientConfig {
        self.shared.client_config(self.subscriber_addr(), self.producer_addr())
    }

    /// Serves until shutdown is requested through a [`BrokerHandle`], then
    /// closes and joins every connection task.
    pub async fn run(self) {
        let TelemetryBroker {
            shared,
            subscriber_listener,
            producer_listener,
        } = self;

        info!(
            subscriber_addr = %subscriber_listener.local_addr(),
            producer_addr = %producer_listener.local_addr(),
            max_subscribers = shared.config.max_subscribers,
            "telemetry broker listening"
        );

        tokio::join!(
            accept_subscribers(Arc::clone(&shared), subscriber_listener),
            accept_producers(Arc::clone(&shared), producer_listener),
        );

        shared.registry.shutdown().await;
        info!("telemetry broker stopped");
    }

    /// Runs the broker on the current runtime.
    pub fn spawn(self) -> BrokerHandle {
        let shared = Arc::clone(&self.shared);
        let subscriber_addr = self.subscriber_addr();
        let producer_addr = self.producer_addr();
        let task = tokio::spawn(self.run());

        BrokerHandle {
            shared,
            subscriber_addr,
            producer_addr,
            task,
        }
    }
}

/// Control surface of a running broker.
#[derive(Debug)]
pub struct BrokerHandle {
    shared: Arc<BrokerShared>,
    subscriber_addr: SocketAddr,
    producer_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    pub fn subscriber_addr(&self) -> SocketAddr {
        self.subscriber_addr
    }

    pub fn producer_addr(&self) -> SocketAddr {
        self.producer_addr
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.stats()
    }

    pub fn client_config(&self) -> ClientConfig {
        self.shared.client_config(self.subscriber_addr, self.producer_addr)
    }

    /// Routes a packet from inside the broker process. Returns how many
    /// subscribers it was written to.
    pub async fn publish(&self, packet: &TelemetryPacket) -> usize {
        publish_packet(&self.shared, packet).await
    }

    /// Stops accepting, closes every connection and waits for all tasks.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        self.shared.shutdown.send_replace(true);
        self.task.await?;
        Ok(())
    }
}

enum AcceptEvent {
    Shutdown,
    Accepted(Result<Connection, TransportError>),
    Reaped(Result<(), JoinError>),
}

async fn accept_subscribers(shared: Arc<BrokerShared>, listener: ListenHandle) {
    let mut shutdown = shared.shutdown.subscribe();
    let accept_timeout = shared.config.accept_timeout();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let event = tokio::select! {
            _ = shutdown.changed() => AcceptEvent::Shutdown,
            accepted = transport::server_accept(&listener, accept_timeout) => AcceptEvent::Accepted(accepted),
        };

        match event {
            AcceptEvent::Shutdown => break,
            AcceptEvent::Accepted(Ok(conn)) => {
                BrokerCounters::bump(&shared.counters.connections_accepted);
                admit_subscriber(&shared, conn);
            }
            AcceptEvent::Accepted(Err(TransportError::Timeout)) | AcceptEvent::Reaped(_) => {}
            AcceptEvent::Accepted(Err(e)) => {
                warn!(error = %e, "subscriber accept failed, retrying");
                time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
            }
        }
    }

    debug!("subscriber accept loop stopped");
}

fn admit_subscriber(shared: &Arc<BrokerShared>, conn: Connection) {
    let peer = conn.peer_addr();
    let (reader, writer) = conn.into_split();

    match shared.registry.register(writer) {
        Ok(registration) => {
            let id = registration.handle.id();
            info!(subscriber = id, %peer, "subscriber connected");
            let handler = tokio::spawn(subscriber_handler(Arc::clone(shared), reader, registration, peer));
            shared.registry.attach_handler(id, handler);
        }
        Err(e) => {
            // The registry dropped the writer; dropping the reader closes the socket.
            drop(reader);
            BrokerCounters::bump(&shared.counters.connections_refused);
            warn!(%peer, error = %e, "refusing subscriber connection");
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn subscriber_handler(
    shared: Arc<BrokerShared>,
    mut reader: FrameReader,
    registration: Registration,
    peer: SocketAddr,
) {
    let Registration { handle, mut shutdown } = registration;
    let id = handle.id();
    let recv_timeout = shared.config.recv_timeout();

    let reason = loop {
        if *shutdown.borrow() {
            break "shutdown";
        }

        let received = tokio::select! {
            _ = shutdown.changed() => None,
            received = reader.recv(recv_timeout) => Some(received),
        };
        let Some(received) = received else {
            break "shutdown";
        };

        match received {
            Ok(Some(frame)) => match Envelope::decode(&frame) {
                Ok(envelope) => {
                    if let Flow::Stop = dispatch_subscriber(&shared, &handle, envelope).await {
                        break "disconnect";
                    }
                }
                Err(e) => {
                    BrokerCounters::bump(&shared.counters.decode_errors);
                    warn!(subscriber = id, error = %e, "dropping undecodable message");
                }
            },
            Ok(None) => break "peer closed",
            Err(TransportError::Timeout) => {}
            Err(e) => {
                warn!(subscriber = id, error = %e, "receive failed");
                break "receive error";
            }
        }
    };

    shared.registry.deregister(id).await;
    info!(subscriber = id, %peer, reason, "subscriber disconnected");
}

async fn dispatch_subscriber(shared: &BrokerShared, handle: &SubscriberHandle, envelope: Envelope) -> Flow {
    let id = handle.id();
    match envelope {
        Envelope::Subscribe(topic_id) => {
            let accepted = match shared.registry.add_topic(id, topic_id) {
                Ok(()) => {
                    debug!(subscriber = id, topic = topic_id, "subscribed");
                    true
                }
                Err(e) => {
                    warn!(subscriber = id, topic = topic_id, error = %e, "subscribe rejected");
                    false
                }
            };
            reply_ack(handle, AckKind::Subscribe, topic_id, accepted).await
        }
        Envelope::Unsubscribe(topic_id) => {
            let accepted = match shared.registry.remove_topic(id, topic_id) {
                Ok(()) => {
                    debug!(subscriber = id, topic = topic_id, "unsubscribed");
                    true
                }
                Err(e) => {
                    warn!(subscriber = id, topic = topic_id, error = %e, "unsubscribe rejected");
                    false
                }
            };
            reply_ack(handle, AckKind::Unsubscribe, topic_id, accepted).await
        }
        Envelope::Packet(packet) => {
            publish_packet(shared, &packet).await;
            Flow::Continue
        }
        Envelope::Disconnect => Flow::Stop,
        Envelope::Ack(_) => {
            debug!(subscriber = id, "ignoring ack sent by client");
            Flow::Continue
        }
    }
}

async fn reply_ack(handle: &SubscriberHandle, request: AckKind, topic_id: u16, accepted: bool) -> Flow {
    let ack = Envelope::Ack(Ack {
        request,
        topic_id,
        accepted,
    });

    let payload = match ack.encode() {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to encode ack");
            return Flow::Continue;
        }
    };

    match handle.send(&payload).await {
        Ok(()) => Flow::Continue,
        Err(e) => {
            warn!(subscriber = handle.id(), error = %e, "failed to send ack");
            Flow::Stop
        }
    }
}

/// Sends one packet to every matching subscriber. Deliveries run
/// concurrently and independently; a failed target is dropped from fan-out
/// and does not affect the others.
async fn publish_packet(shared: &BrokerShared, packet: &TelemetryPacket) -> usize {
    BrokerCounters::bump(&shared.counters.packets_routed);

    let payload = match packet.encode() {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            error!(topic = packet.topic_id, error = %e, "failed to encode packet");
            return 0;
        }
    };

    let targets = shared.registry.by_topic(packet.topic_id);
    trace!(topic = packet.topic_id, targets = targets.len(), "fan-out");

    let mut sends = JoinSet::new();
    for target in targets {
        let payload = payload.clone();
        sends.spawn(async move {
            let result = target.send(&payload).await;
            (target.id(), result)
        });
    }

    let mut delivered = 0;
    while let Some(joined) = sends.join_next().await {
        match joined {
            Ok((_, Ok(()))) => delivered += 1,
            Ok((id, Err(e))) => {
                BrokerCounters::bump(&shared.counters.delivery_failures);
                warn!(subscriber = id, topic = packet.topic_id, error = %e, "delivery failed, dropping subscriber");
                shared.registry.mark_inactive(id);
            }
            Err(e) => error!(error = %e, "delivery task failed"),
        }
    }

    shared.counters.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
    delivered
}

async fn accept_producers(shared: Arc<BrokerShared>, listener: ListenHandle) {
    let mut shutdown = shared.shutdown.subscribe();
    let accept_timeout = shared.config.accept_timeout();
    let mut producers = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let event = tokio::select! {
            _ = shutdown.changed() => AcceptEvent::Shutdown,
            Some(joined) = producers.join_next(), if !producers.is_empty() => AcceptEvent::Reaped(joined),
            accepted = transport::server_accept(&listener, accept_timeout) => AcceptEvent::Accepted(accepted),
        };

        match event {
            AcceptEvent::Shutdown => break,
            AcceptEvent::Accepted(Ok(mut conn)) => {
                BrokerCounters::bump(&shared.counters.connections_accepted);
                match Arc::clone(&shared.producer_slots).try_acquire_owned() {
                    Ok(permit) => {
                        producers.spawn(producer_handler(Arc::clone(&shared), conn, permit, shutdown.clone()));
                    }
                    Err(_) => {
                        BrokerCounters::bump(&shared.counters.connections_refused);
                        warn!(peer = %conn.peer_addr(), "producer limit reached, refusing connection");
                        let _ = conn.close().await;
                    }
                }
            }
            AcceptEvent::Reaped(Err(e)) if e.is_panic() => error!(error = %e, "producer handler panicked"),
            AcceptEvent::Accepted(Err(TransportError::Timeout)) | AcceptEvent::Reaped(_) => {}
            AcceptEvent::Accepted(Err(e)) => {
                warn!(error = %e, "producer accept failed, retrying");
                time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
            }
        }
    }

    while let Some(joined) = producers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "producer handler panicked");
            }
        }
    }

    debug!("producer accept loop stopped");
}

async fn producer_handler(
    shared: Arc<BrokerShared>,
    mut conn: Connection,
    _permit: OwnedSemaphorePermit,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = conn.peer_addr();
    let recv_timeout = shared.config.recv_timeout();
    trace!(%peer, "producer connected");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown.changed() => None,
            received = conn.recv(recv_timeout) => Some(received),
        };
        let Some(received) = received else {
            break;
        };

        match received {
            Ok(Some(frame)) => match Envelope::decode(&frame) {
                Ok(Envelope::Packet(packet)) => {
                    publish_packet(&shared, &packet).await;
                }
                Ok(Envelope::Disconnect) => break,
                Ok(Envelope::Subscribe(topic_id)) => {
                    if !reject_subscription(&mut conn, AckKind::Subscribe, topic_id).await {
                        break;
                    }
                }
                Ok(Envelope::Unsubscribe(topic_id)) => {
                    if !reject_subscription(&mut conn, AckKind::Unsubscribe, topic_id).await {
                        break;
                    }
                }
                Ok(Envelope::Ack(_)) => debug!(%peer, "ignoring ack sent by producer"),
                Err(e) => {
                    BrokerCounters::bump(&shared.counters.decode_errors);
                    warn!(%peer, error = %e, "dropping undecodable message");
                }
            },
            Ok(None) => break,
            Err(TransportError::Timeout) => {}
            Err(e) => {
                warn!(%peer, error = %e, "producer receive failed");
                break;
            }
        }
    }

    let _ = conn.close().await;
    trace!(%peer, "producer disconnected");
}

/// Producer connections cannot hold subscriptions. Returns whether the
/// connection is still usable.
async fn reject_subscription(conn: &mut Connection, request: AckKind, topic_id: u16) -> bool {
    warn!(peer = %conn.peer_addr(), topic = topic_id, "subscription request on producer port");
    let nack = Envelope::Ack(Ack {
        request,
        topic_id,
        accepted: false,
    });

    match nack.encode() {
        Ok(payload) => conn.send(&payload).await.is_ok(),
        Err(e) => {
            error!(error = %e, "failed to encode ack");
            true
        }
    }
}
