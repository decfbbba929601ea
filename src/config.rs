use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// TCP port subscribers connect to.
pub const DEFAULT_SUBSCRIBER_PORT: u16 = 8199;
/// TCP port producers publish on.
pub const DEFAULT_PRODUCER_PORT: u16 = 8200;

const DEFAULT_BACKLOG: u32 = 16;
const DEFAULT_MAX_SUBSCRIBERS: usize = 16;
const DEFAULT_MAX_PRODUCERS: usize = 32;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

// Socket timeouts, milliseconds
const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 1000;
const DEFAULT_RECV_TIMEOUT_MS: u64 = 500;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;
/// Floor for the accept and receive poll intervals; a zero interval would
/// turn those loops into busy spins.
pub const MIN_POLL_TIMEOUT_MS: u64 = 10;
const DEFAULT_MAX_PENDING_PACKETS: usize = 64;

/// Broker-side tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bind_addr: IpAddr,
    pub subscriber_port: u16,
    pub producer_port: u16,
    pub backlog: u32,
    pub max_subscribers: usize,
    pub max_producers: usize,
    pub max_frame_size: usize,
    pub accept_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Upper bound on a single handler receive before it re-checks for shutdown.
    pub recv_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            subscriber_port: DEFAULT_SUBSCRIBER_PORT,
            producer_port: DEFAULT_PRODUCER_PORT,
            backlog: DEFAULT_BACKLOG,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            max_producers: DEFAULT_MAX_PRODUCERS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
        }
    }
}

impl BrokerConfig {
    /// Loopback config on OS-assigned ports, used by tests and embedded brokers.
    pub fn ephemeral() -> Self {
        Self {
            subscriber_port: 0,
            producer_port: 0,
            ..Self::default()
        }
    }

    /// Never shorter than [`MIN_POLL_TIMEOUT_MS`].
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms.max(MIN_POLL_TIMEOUT_MS))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Never shorter than [`MIN_POLL_TIMEOUT_MS`].
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.max(MIN_POLL_TIMEOUT_MS))
    }

    /// Client settings that talk to this broker.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.bind_addr,
            subscriber_port: self.subscriber_port,
            producer_port: self.producer_port,
            max_frame_size: self.max_frame_size,
            send_timeout_ms: self.send_timeout_ms,
            ..ClientConfig::default()
        }
    }
}

/// Client-side tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: IpAddr,
    pub subscriber_port: u16,
    pub producer_port: u16,
    pub max_frame_size: usize,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Packets held back while a subscribe/unsubscribe waits for its ack.
    pub max_pending_packets: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            subscriber_port: DEFAULT_SUBSCRIBER_PORT,
            producer_port: DEFAULT_PRODUCER_PORT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_pending_packets: DEFAULT_MAX_PENDING_PACKETS,
        }
    }
}

impl ClientConfig {
    pub fn subscriber_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.subscriber_port)
    }

    pub fn producer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.producer_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}
