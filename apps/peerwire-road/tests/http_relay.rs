use peerwire_mailbox::MailboxStore;
use peerwire_proto::{JoinResponse, PollResponse};
use serde_json::json;
use tokio::net::TcpListener;

async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(peerwire_road::serve(listener, MailboxStore::default()));
    format!("http://{addr}")
}

#[test_timeout::tokio_timeout_test(30)]
async fn answer_and_candidates_reach_the_offerer_over_http() {
    let base = spawn_relay().await;
    let client = reqwest::Client::new();

    let host: JoinResponse = client
        .post(format!("{base}/signal/join"))
        .json(&json!({"roomId": "quiz", "peerId": "host", "isHost": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(host.success);

    client
        .post(format!("{base}/signal/join"))
        .json(&json!({"roomId": "quiz", "peerId": "guest"}))
        .send()
        .await
        .unwrap();

    for body in [
        json!({
            "roomId": "quiz",
            "peerId": "guest",
            "target": "host",
            "answer": {"type": "answer", "sdp": "v=0 answer"}
        }),
        json!({
            "roomId": "quiz",
            "peerId": "guest",
            "target": "host",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.2 50000 typ host", "sdpMid": "0"}
        }),
    ] {
        let path = if body.get("answer").is_some() {
            "answer"
        } else {
            "candidate"
        };
        let status = client
            .post(format!("{base}/signal/{path}"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .status();
        assert!(status.is_success());
    }

    let polled: PollResponse = client
        .post(format!("{base}/signal/poll"))
        .json(&json!({"roomId": "quiz", "peerId": "host", "lastPoll": host.timestamp}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(polled.answers.len(), 1);
    assert_eq!(polled.candidates.len(), 1);
    assert_eq!(polled.candidates[0].candidate.sdp_mid.as_deref(), Some("0"));
    assert_eq!(polled.new_peers.len(), 1);
    assert_eq!(polled.new_peers[0].peer_id, "guest");

    let again: PollResponse = client
        .post(format!("{base}/signal/poll"))
        .json(&json!({"roomId": "quiz", "peerId": "host", "lastPoll": polled.timestamp}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(again.is_empty());
}
