use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use peerwire_mailbox::{MailboxError, MailboxStore};
use peerwire_proto::{
    AckResponse, AnswerRequest, CandidateRequest, JoinRequest, JoinResponse, LeaveRequest,
    OfferRequest, PollRequest, PollResponse, RoomSnapshot, SdpKind, Signal,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics;

#[derive(Clone)]
pub struct RoadState {
    pub store: MailboxStore,
}

impl RoadState {
    pub fn new(store: MailboxStore) -> Self {
        Self { store }
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
}

impl From<MailboxError> for ApiError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::RoomNotFound(_) => ApiError::NotFound(err.to_string()),
            MailboxError::InvalidRequest(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(AckResponse::failed(self.to_string()))).into_response()
    }
}

fn record<T>(route: &'static str, result: ApiResult<T>) -> ApiResult<T> {
    let outcome = match &result {
        Ok(_) => "ok",
        Err(ApiError::BadRequest(_)) => "bad_request",
        Err(ApiError::NotFound(_)) => "not_found",
    };
    metrics::SIGNAL_REQUESTS
        .with_label_values(&[route, outcome])
        .inc();
    if let Err(err) = &result {
        debug!(target = "peerwire::road", route, error = %err, "signaling request rejected");
    }
    result
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    rooms: usize,
}

/// GET /health
pub async fn health_check(State(state): State<RoadState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        rooms: state.store.room_count(),
    })
}

/// GET /metrics
pub async fn metrics_export(State(state): State<RoadState>) -> Response {
    metrics::observe_store(&state.store);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_prometheus(),
    )
        .into_response()
}

/// POST /signal/join
pub async fn join(
    State(state): State<RoadState>,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> ApiResult<JoinResponse> {
    let result = payload.map_err(ApiError::from).and_then(|Json(request)| {
        let response = state
            .store
            .join(&request.room_id, &request.peer_id, request.is_host)?;
        Ok(Json(response))
    });
    record("join", result)
}

/// POST /signal/offer
pub async fn offer(
    State(state): State<RoadState>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let result = payload.map_err(ApiError::from).and_then(|Json(request)| {
        expect_kind(request.offer.kind, SdpKind::Offer)?;
        deposit(
            &state.store,
            &request.room_id,
            &request.peer_id,
            &request.target,
            Signal::Offer(request.offer),
        )
    });
    record("offer", result)
}

/// POST /signal/answer
pub async fn answer(
    State(state): State<RoadState>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let result = payload.map_err(ApiError::from).and_then(|Json(request)| {
        expect_kind(request.answer.kind, SdpKind::Answer)?;
        deposit(
            &state.store,
            &request.room_id,
            &request.peer_id,
            &request.target,
            Signal::Answer(request.answer),
        )
    });
    record("answer", result)
}

/// POST /signal/candidate
pub async fn candidate(
    State(state): State<RoadState>,
    payload: Result<Json<CandidateRequest>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let result = payload.map_err(ApiError::from).and_then(|Json(request)| {
        deposit(
            &state.store,
            &request.room_id,
            &request.peer_id,
            &request.target,
            Signal::Candidate(request.candidate),
        )
    });
    record("candidate", result)
}

fn expect_kind(actual: SdpKind, expected: SdpKind) -> Result<(), ApiError> {
    if actual == expected {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "expected an {expected} description, got {actual}"
        )))
    }
}

fn deposit(
    store: &MailboxStore,
    room_id: &str,
    from: &str,
    target: &str,
    signal: Signal,
) -> ApiResult<AckResponse> {
    let kind = signal.kind();
    store.deposit(room_id, from, target, signal)?;
    metrics::SIGNALS_DEPOSITED
        .with_label_values(&[kind.as_str()])
        .inc();
    Ok(Json(AckResponse::ok()))
}

/// POST /signal/poll
pub async fn poll(
    State(state): State<RoadState>,
    payload: Result<Json<PollRequest>, JsonRejection>,
) -> ApiResult<PollResponse> {
    let result = payload.map_err(ApiError::from).and_then(|Json(request)| {
        let response = state
            .store
            .poll(&request.room_id, &request.peer_id, request.last_poll)?;
        Ok(Json(response))
    });
    record("poll", result)
}

/// POST /signal/leave
pub async fn leave(
    State(state): State<RoadState>,
    payload: Result<Json<LeaveRequest>, JsonRejection>,
) -> ApiResult<AckResponse> {
    let result = payload.map_err(ApiError::from).and_then(|Json(request)| {
        state.store.leave(&request.room_id, &request.peer_id)?;
        Ok(Json(AckResponse::ok()))
    });
    record("leave", result)
}

/// GET /rooms/:room_id
pub async fn room_snapshot(
    State(state): State<RoadState>,
    Path(room_id): Path<String>,
) -> ApiResult<RoomSnapshot> {
    let result = state.store.snapshot(&room_id).map(Json).ok_or_else(|| {
        warn!(target = "peerwire::road", room = %room_id, "snapshot requested for unknown room");
        ApiError::from(MailboxError::RoomNotFound(room_id.clone()))
    });
    record("room", result)
}
