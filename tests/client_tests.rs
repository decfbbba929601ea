use kubos_telemetry::registry::MAX_TOPICS_PER_SUBSCRIBER;
use kubos_telemetry::transport::{server_accept, server_setup, LinkOptions};
use kubos_telemetry::*;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(1);

fn options() -> LinkOptions {
    LinkOptions {
        max_frame_size: config::DEFAULT_MAX_FRAME_SIZE,
        send_timeout: TIMEOUT,
    }
}

/// A listener standing in for the broker, plus a client pointed at it.
fn fake_broker(ack_timeout_ms: u64) -> (transport::ListenHandle, TelemetryClient) {
    let listener = server_setup("127.0.0.1:0".parse().unwrap(), 4, options()).unwrap();
    let config = ClientConfig {
        subscriber_port: listener.local_addr().port(),
        producer_port: listener.local_addr().port(),
        ack_timeout_ms,
        ..ClientConfig::default()
    };
    (listener, TelemetryClient::new(config))
}

#[tokio::test]
async fn test_connect_without_broker_fails() {
    let (listener, client) = fake_broker(100);
    drop(listener);

    assert!(client.connect().await.is_err());
    assert!(client
        .publish(&TelemetryPacket::new(1, 1, TelemetryData::Int(1)))
        .await
        .is_err());
}

#[tokio::test]
async fn test_subscribe_times_out_without_ack() {
    let (listener, client) = fake_broker(100);
    let (connection, accepted) = tokio::join!(client.connect(), server_accept(&listener, TIMEOUT));
    let mut connection = connection.unwrap();
    let _silent = accepted.unwrap();

    assert!(matches!(connection.subscribe(4).await, Err(ClientError::Timeout)));
}

#[tokio::test]
async fn test_read_skips_other_messages() {
    let (listener, client) = fake_broker(100);
    let (connection, accepted) = tokio::join!(client.connect(), server_accept(&listener, TIMEOUT));
    let mut connection = connection.unwrap();
    let mut broker_side = accepted.unwrap();

    let ack = Envelope::Ack(Ack {
        request: AckKind::Subscribe,
        topic_id: 1,
        accepted: true,
    });
    broker_side.send(&ack.encode().unwrap()).await.unwrap();
    broker_side.send(b"garbage").await.unwrap();
    let packet = TelemetryPacket::new(6, 2, TelemetryData::Float(-0.5));
    broker_side.send(&packet.encode().unwrap()).await.unwrap();

    assert_eq!(connection.read(TIMEOUT).await.unwrap(), packet);
}

#[tokio::test]
async fn test_read_reports_closed_broker() {
    let (listener, client) = fake_broker(100);
    let (connection, accepted) = tokio::join!(client.connect(), server_accept(&listener, TIMEOUT));
    let mut connection = connection.unwrap();
    let mut broker_side = accepted.unwrap();

    broker_side.close().await.unwrap();
    assert!(matches!(connection.read(TIMEOUT).await, Err(ClientError::Closed)));
    // Disconnecting from a broker that already left is tolerated.
    connection.disconnect().await;
}

#[tokio::test]
async fn test_packets_arriving_before_ack_are_kept() {
    let (listener, client) = fake_broker(500);
    let (connection, accepted) = tokio::join!(client.connect(), server_accept(&listener, TIMEOUT));
    let mut connection = connection.unwrap();
    let mut broker_side = accepted.unwrap();

    let early = TelemetryPacket::new(9, 1, TelemetryData::Int(1));
    let broker_task = tokio::spawn(async move {
        let request = broker_side.recv(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(Envelope::decode(&request).unwrap(), Envelope::Subscribe(9));

        broker_side.send(&early.encode().unwrap()).await.unwrap();
        let ack = Envelope::Ack(Ack {
            request: AckKind::Subscribe,
            topic_id: 9,
            accepted: true,
        });
        broker_side.send(&ack.encode().unwrap()).await.unwrap();
        broker_side
    });

    connection.subscribe(9).await.unwrap();
    assert_eq!(connection.pending(), 1);
    assert_eq!(connection.read(Duration::ZERO).await.unwrap(), early);
    assert_eq!(connection.pending(), 0);

    broker_task.await.unwrap();
}

#[tokio::test]
async fn test_full_filter_is_rejected() {
    let broker = TelemetryBroker::bind(BrokerConfig::ephemeral()).unwrap().spawn();
    let client = TelemetryClient::new(broker.client_config());
    let mut connection = client.connect().await.unwrap();

    for topic in 0..MAX_TOPICS_PER_SUBSCRIBER as u16 {
        connection.subscribe(topic).await.unwrap();
    }
    let overflow = MAX_TOPICS_PER_SUBSCRIBER as u16;
    assert!(matches!(
        connection.subscribe(overflow).await,
        Err(ClientError::Rejected { topic }) if topic == overflow
    ));

    // The connection stays usable after a rejection.
    connection.unsubscribe(0).await.unwrap();
    connection.subscribe(overflow).await.unwrap();

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publisher_reconnects_after_broker_restart() {
    let first = TelemetryBroker::bind(BrokerConfig::ephemeral()).unwrap().spawn();
    let client = TelemetryClient::new(first.client_config());
    let mut publisher = client.publisher();

    publisher
        .publish(&TelemetryPacket::new(1, 1, TelemetryData::Int(1)))
        .await
        .unwrap();
    let restart = BrokerConfig {
        subscriber_port: first.subscriber_addr().port(),
        producer_port: first.producer_addr().port(),
        ..BrokerConfig::ephemeral()
    };
    first.shutdown().await.unwrap();

    let second = TelemetryBroker::bind(restart).unwrap().spawn();
    let mut subscriber = client.connect().await.unwrap();
    subscriber.subscribe(1).await.unwrap();

    publisher
        .publish(&TelemetryPacket::new(1, 1, TelemetryData::Int(2)))
        .await
        .unwrap();
    assert_eq!(subscriber.read(TIMEOUT).await.unwrap().data, TelemetryData::Int(2));

    publisher.close().await;
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_read_accepts_unbounded_timeout() {
    let (listener, client) = fake_broker(100);
    let (connection, accepted) = tokio::join!(client.connect(), server_accept(&listener, TIMEOUT));
    let mut connection = connection.unwrap();
    let mut broker_side = accepted.unwrap();

    let packet = TelemetryPacket::new(3, 1, TelemetryData::Int(42));
    broker_side.send(&packet.encode().unwrap()).await.unwrap();

    let read = tokio::time::timeout(TIMEOUT, connection.read(Duration::MAX)).await;
    assert_eq!(read.unwrap().unwrap(), packet);
}

#[tokio::test]
async fn test_unbounded_ack_timeout_still_completes() {
    let (listener, client) = fake_broker(u64::MAX);
    let (connection, accepted) = tokio::join!(client.connect(), server_accept(&listener, TIMEOUT));
    let mut connection = connection.unwrap();
    let mut broker_side = accepted.unwrap();

    let broker_task = tokio::spawn(async move {
        broker_side.recv(TIMEOUT).await.unwrap().unwrap();
        let ack = Envelope::Ack(Ack {
            request: AckKind::Subscribe,
            topic_id: 5,
            accepted: true,
        });
        broker_side.send(&ack.encode().unwrap()).await.unwrap();
        broker_side
    });

    tokio::time::timeout(TIMEOUT, connection.subscribe(5)).await.unwrap().unwrap();
    broker_task.await.unwrap();
}
