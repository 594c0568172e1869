use std::sync::Arc;
use std::time::Duration;

use peerwire_mailbox::MailboxStore;
use peerwire_mesh::{
    ConnectionSupervisor, HttpMailbox, MailboxApi, MeshConfig, MeshEvent, MockNetwork,
    SignalingError,
};
use tokio::net::TcpListener;

async fn spawn_relay() -> (String, MailboxStore) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = MailboxStore::default();
    tokio::spawn(peerwire_road::serve(listener, store.clone()));
    (format!("http://{addr}"), store)
}

fn fast_config() -> MeshConfig {
    MeshConfig {
        poll_interval: Duration::from_millis(100),
        ..MeshConfig::default()
    }
}

async fn start(
    network: &MockNetwork,
    base: &str,
    peer_id: &str,
    is_host: bool,
) -> ConnectionSupervisor {
    ConnectionSupervisor::start(
        fast_config(),
        Arc::new(network.factory(peer_id)),
        Arc::new(HttpMailbox::new(base)),
        "quiz",
        peer_id,
        is_host,
    )
    .await
    .unwrap()
}

#[test_timeout::tokio_timeout_test(30)]
async fn peers_negotiate_through_the_http_relay() {
    let (base, store) = spawn_relay().await;
    let network = MockNetwork::new();
    let host = start(&network, &base, "host", true).await;
    let guest = start(&network, &base, "guest", false).await;
    let mut guest_events = guest.subscribe();

    let mut sent = false;
    for _ in 0..200 {
        if host.send_to("guest", "hello over the relay").await.is_ok() {
            sent = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(sent, "host never got an open channel to guest");

    let payload = loop {
        match guest_events.recv().await.expect("guest events closed") {
            MeshEvent::Message { from, payload } => {
                assert_eq!(from, "host");
                break payload;
            }
            _ => continue,
        }
    };
    assert_eq!(payload.as_text(), Some("hello over the relay"));
    assert_eq!(host.connected_peer_count().await, 1);

    let snapshot = store.snapshot("quiz").unwrap();
    assert_eq!(snapshot.host_id.as_deref(), Some("host"));
    assert_eq!(snapshot.peers.len(), 2);

    guest.stop().await;
    host.stop().await;
    assert!(store.snapshot("quiz").is_none());
}

#[test_timeout::tokio_timeout_test(30)]
async fn http_mailbox_maps_relay_errors() {
    let (base, _store) = spawn_relay().await;
    let mailbox = HttpMailbox::new(format!("{base}/"));

    let err = mailbox.poll("missing", "p", 0).await.unwrap_err();
    assert!(matches!(err, SignalingError::RoomNotFound(room) if room == "missing"));

    let err = mailbox.join("quiz", " ", false).await.unwrap_err();
    match err {
        SignalingError::Rejected { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("peerId"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let joined = mailbox.join("quiz", "host", true).await.unwrap();
    assert!(joined.success);
    mailbox.leave("quiz", "host").await.unwrap();
}
