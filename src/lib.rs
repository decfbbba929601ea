//! # Telemetry Broker
//!
//! A publish/subscribe broker for flight-software telemetry. Subsystems
//! publish small typed samples tagged with a topic id; the broker fans each
//! sample out to every connected subscriber whose topic filter matches.
//!
//! ## Features
//!
//! - **Two listeners**: a subscriber port for long-lived filtered connections
//!   and a producer port for publish-only traffic
//! - **Acknowledged subscriptions**: subscribe and unsubscribe return once the
//!   broker has applied them
//! - **Bounded resources**: fixed subscriber and producer limits, capped frame
//!   size, timeouts on every socket operation
//! - **Fault isolation**: a dead subscriber is dropped without disturbing
//!   delivery to the others
//!
//! ## Quick Start
//!
//! ```no_run
//! use kubos_telemetry::{BrokerConfig, TelemetryBroker, TelemetryClient, TelemetryData, TelemetryPacket};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = TelemetryBroker::bind(BrokerConfig::ephemeral())?.spawn();
//! let client = TelemetryClient::new(broker.client_config());
//!
//! let mut subscriber = client.connect().await?;
//! subscriber.subscribe(12).await?;
//!
//! client.publish(&TelemetryPacket::new(12, 1, TelemetryData::Int(99))).await?;
//! let packet = subscriber.read(Duration::from_secs(1)).await?;
//! assert_eq!(packet.data, TelemetryData::Int(99));
//!
//! subscriber.disconnect().await;
//! broker.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Length-prefixed frames over TCP
//! - [`protocol`] - Message types and the CBOR envelope codec
//! - [`registry`] - Connected subscribers and their topic filters
//! - [`broker`] - Accept loops, connection handlers and fan-out
//! - [`client`] - Subscriber connections and publishing
//! - [`config`] - Broker and client tunables

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export main public types for convenience
pub use broker::{BrokerError, BrokerHandle, BrokerStats, TelemetryBroker};
pub use client::{ClientConnection, ClientError, Publisher, TelemetryClient};
pub use config::{BrokerConfig, ClientConfig};
pub use protocol::{Ack, AckKind, CodecError, DataType, Envelope, MessageType, TelemetryData, TelemetryPacket};
pub use registry::{RegistryError, SubscriberId, SubscriberRegistry, TopicFilter};
pub use transport::TransportError;
