use kubos_telemetry::registry::*;
use kubos_telemetry::transport::*;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(1);

fn options() -> LinkOptions {
    LinkOptions {
        max_frame_size: 1024,
        send_timeout: TIMEOUT,
    }
}

/// Registry-side writer plus the remote end it writes to.
async fn writer_and_peer() -> (FrameWriter, Connection) {
    let listener = server_setup("127.0.0.1:0".parse().unwrap(), 4, options()).unwrap();
    let (peer, accepted) = tokio::join!(
        client_connect(listener.local_addr(), TIMEOUT, options()),
        server_accept(&listener, TIMEOUT),
    );
    let (_reader, writer) = accepted.unwrap().into_split();
    (writer, peer.unwrap())
}

#[tokio::test]
async fn test_register_until_full() {
    let registry = SubscriberRegistry::new(2);
    let mut peers = Vec::new();

    for _ in 0..2 {
        let (writer, peer) = writer_and_peer().await;
        registry.register(writer).unwrap();
        peers.push(peer);
    }
    assert_eq!(registry.len(), 2);

    let (writer, _peer) = writer_and_peer().await;
    assert_eq!(registry.register(writer).unwrap_err(), RegistryError::Full { max: 2 });
    assert_eq!(registry.capacity(), 2);
}

#[tokio::test]
async fn test_ids_are_unique() {
    let registry = SubscriberRegistry::new(4);
    let (w1, _p1) = writer_and_peer().await;
    let (w2, _p2) = writer_and_peer().await;

    let a = registry.register(w1).unwrap().handle.id();
    let b = registry.register(w2).unwrap().handle.id();
    assert_ne!(a, b);
    assert!(registry.contains(a));
    assert!(registry.contains(b));
}

#[tokio::test]
async fn test_topic_routing() {
    let registry = SubscriberRegistry::new(4);
    let (w1, _p1) = writer_and_peer().await;
    let (w2, _p2) = writer_and_peer().await;
    let a = registry.register(w1).unwrap().handle.id();
    let b = registry.register(w2).unwrap().handle.id();

    // Fresh subscribers match every topic
    assert_eq!(registry.subscribers_for_topic(12), 2);

    registry.add_topic(a, 12).unwrap();
    registry.add_topic(b, 7).unwrap();

    let matched: Vec<SubscriberId> = registry.by_topic(12).iter().map(|h| h.id()).collect();
    assert_eq!(matched, vec![a]);
    assert_eq!(registry.subscribers_for_topic(7), 1);
    assert_eq!(registry.subscribers_for_topic(99), 0);
    assert!(registry.has_topic(a, 12));
    assert!(!registry.has_topic(a, 7));
}

#[tokio::test]
async fn test_remove_topic() {
    let registry = SubscriberRegistry::new(4);
    let (writer, _peer) = writer_and_peer().await;
    let id = registry.register(writer).unwrap().handle.id();

    registry.add_topic(id, 1).unwrap();
    registry.add_topic(id, 2).unwrap();
    assert_eq!(registry.topics(id), Some(vec![1, 2]));

    registry.remove_topic(id, 1).unwrap();
    registry.remove_topic(id, 40).unwrap();
    assert_eq!(registry.topics(id), Some(vec![2]));
    assert_eq!(registry.subscribers_for_topic(1), 0);
}

#[tokio::test]
async fn test_unknown_subscriber() {
    let registry = SubscriberRegistry::new(4);

    assert_eq!(registry.add_topic(77, 1), Err(RegistryError::UnknownSubscriber(77)));
    assert_eq!(registry.remove_topic(77, 1), Err(RegistryError::UnknownSubscriber(77)));
    assert_eq!(registry.topics(77), None);
    assert!(!registry.mark_inactive(77));
    assert!(!registry.deregister(77).await);
}

#[tokio::test]
async fn test_handle_sends_to_peer() {
    let registry = SubscriberRegistry::new(4);
    let (writer, mut peer) = writer_and_peer().await;
    let registration = registry.register(writer).unwrap();

    let targets = registry.by_topic(5);
    assert_eq!(targets.len(), 1);
    targets[0].send(b"payload").await.unwrap();

    let frame = peer.recv(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"payload");
    assert_eq!(targets[0].id(), registration.handle.id());
}

#[tokio::test]
async fn test_mark_inactive_hides_and_signals() {
    let registry = SubscriberRegistry::new(4);
    let (writer, _peer) = writer_and_peer().await;
    let registration = registry.register(writer).unwrap();
    let id = registration.handle.id();

    assert!(registry.mark_inactive(id));
    assert!(!registry.is_active(id));
    assert!(registry.contains(id));
    assert!(registry.by_topic(1).is_empty());
    assert_eq!(registry.subscribers_for_topic(1), 0);
    assert!(*registration.shutdown.borrow());
}

#[tokio::test]
async fn test_deregister_closes_transport() {
    let registry = SubscriberRegistry::new(4);
    let (writer, mut peer) = writer_and_peer().await;
    let registration = registry.register(writer).unwrap();
    let id = registration.handle.id();

    assert!(registry.deregister(id).await);
    assert!(!registry.deregister(id).await);
    assert!(registry.is_empty());
    assert!(*registration.shutdown.borrow());

    assert!(peer.recv(TIMEOUT).await.unwrap().is_none());
    assert!(registration.handle.send(b"late").await.is_err());
}

#[tokio::test]
async fn test_shutdown_joins_handlers() {
    let registry = SubscriberRegistry::new(4);
    let mut peers = Vec::new();

    for _ in 0..3 {
        let (writer, peer) = writer_and_peer().await;
        peers.push(peer);
        let registration = registry.register(writer).unwrap();
        let id = registration.handle.id();
        let mut shutdown = registration.shutdown;
        let handler = tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
        registry.attach_handler(id, handler);
    }

    tokio::time::timeout(TIMEOUT, registry.shutdown()).await.unwrap();
    assert!(registry.is_empty());

    for peer in &mut peers {
        assert!(peer.recv(TIMEOUT).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_handler_attached_after_deregister_is_joined() {
    let registry = SubscriberRegistry::new(4);
    let (writer, _peer) = writer_and_peer().await;
    let registration = registry.register(writer).unwrap();
    let id = registration.handle.id();

    registry.deregister(id).await;
    registry.attach_handler(id, tokio::spawn(async {}));

    tokio::time::timeout(TIMEOUT, registry.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_inactive_subscriber_frees_its_slot() {
    let registry = SubscriberRegistry::new(1);
    let (w1, _p1) = writer_and_peer().await;
    let (w2, _p2) = writer_and_peer().await;
    let (w3, _p3) = writer_and_peer().await;

    let first = registry.register(w1).unwrap().handle.id();
    registry.mark_inactive(first);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.active_len(), 0);

    let second = registry.register(w2).unwrap().handle.id();
    assert_eq!(registry.active_len(), 1);
    assert_eq!(registry.register(w3).unwrap_err(), RegistryError::Full { max: 1 });

    // The dropped entry lingers until its handler deregisters it.
    assert!(registry.deregister(first).await);
    assert_eq!(registry.len(), 1);
    assert!(registry.is_active(second));
}
