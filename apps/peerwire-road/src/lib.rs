//! HTTP signaling relay: exposes a [`MailboxStore`] to browser peers.

pub mod config;
pub mod handlers;
pub mod metrics;

use axum::{
    routing::{get, post},
    Router,
};
use peerwire_mailbox::MailboxStore;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::RoadConfig;
pub use handlers::{ApiError, RoadState};

pub fn build_router(state: RoadState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_export))
        .route("/signal/join", post(handlers::join))
        .route("/signal/offer", post(handlers::offer))
        .route("/signal/answer", post(handlers::answer))
        .route("/signal/candidate", post(handlers::candidate))
        .route("/signal/poll", post(handlers::poll))
        .route("/signal/leave", post(handlers::leave))
        .route("/rooms/:room_id", get(handlers::room_snapshot))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on an already bound listener until the future is dropped.
pub async fn serve(listener: TcpListener, store: MailboxStore) -> std::io::Result<()> {
    axum::serve(listener, build_router(RoadState::new(store))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use peerwire_proto::{AckResponse, JoinResponse, PollResponse, RoomSnapshot};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn app() -> Router {
        build_router(RoadState::new(MailboxStore::default()))
    }

    async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn get_path(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_offer_poll_flow() {
        let app = app();
        let (status, bytes) = post_json(
            &app,
            "/signal/join",
            json!({"roomId": "R1", "peerId": "host", "isHost": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let joined: JoinResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(joined.success);
        assert!(joined.peers.is_empty());

        let (status, bytes) = post_json(
            &app,
            "/signal/join",
            json!({"roomId": "R1", "peerId": "alice"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let joined: JoinResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(joined.peers.len(), 1);
        assert!(joined.peers[0].is_host);

        let (status, _) = post_json(
            &app,
            "/signal/offer",
            json!({
                "roomId": "R1",
                "peerId": "host",
                "target": "alice",
                "offer": {"type": "offer", "sdp": "v=0"}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, bytes) = post_json(
            &app,
            "/signal/poll",
            json!({"roomId": "R1", "peerId": "alice", "lastPoll": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let polled: PollResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(polled.offers.len(), 1);
        assert_eq!(polled.offers[0].from, "host");
        assert_eq!(polled.offers[0].offer.sdp, "v=0");
        assert_eq!(polled.new_peers.len(), 1);
        assert!(polled.timestamp > joined.timestamp);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_room_is_not_found() {
        let app = app();
        let (status, bytes) = post_json(
            &app,
            "/signal/poll",
            json!({"roomId": "missing", "peerId": "a", "lastPoll": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let ack: AckResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!ack.success);
        assert!(ack.error.unwrap().contains("missing"));

        let (status, _) = get_path(&app, "/rooms/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_and_blank_requests_are_rejected() {
        let app = app();
        let (status, bytes) = post_json(&app, "/signal/join", json!({"roomId": "R1"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let ack: AckResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!ack.success);

        let (status, _) = post_json(
            &app,
            "/signal/join",
            json!({"roomId": "  ", "peerId": "a"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        post_json(&app, "/signal/join", json!({"roomId": "R1", "peerId": "a"})).await;
        let (status, _) = post_json(
            &app,
            "/signal/answer",
            json!({
                "roomId": "R1",
                "peerId": "a",
                "target": "b",
                "answer": {"type": "offer", "sdp": "v=0"}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test_timeout::tokio_timeout_test]
    async fn leave_drops_room_and_health_reports_count() {
        let app = app();
        post_json(&app, "/signal/join", json!({"roomId": "R1", "peerId": "a", "isHost": true}))
            .await;

        let (status, bytes) = get_path(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["rooms"], 1);

        let (status, bytes) = get_path(&app, "/rooms/R1").await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: RoomSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(snapshot.host_id.as_deref(), Some("a"));

        let (status, _) =
            post_json(&app, "/signal/leave", json!({"roomId": "R1", "peerId": "a"})).await;
        assert_eq!(status, StatusCode::OK);
        let (_, bytes) = get_path(&app, "/health").await;
        let health: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health["rooms"], 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_endpoint_exports_request_counters() {
        let app = app();
        post_json(&app, "/signal/join", json!({"roomId": "M1", "peerId": "a"})).await;
        post_json(
            &app,
            "/signal/candidate",
            json!({
                "roomId": "M1",
                "peerId": "a",
                "target": "b",
                "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host"}
            }),
        )
        .await;

        let (status, bytes) = get_path(&app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("signal_requests_total"));
        assert!(text.contains("signals_deposited_total{kind=\"candidate\"}"));
        assert!(text.contains("signal_rooms_active"));
    }
}
