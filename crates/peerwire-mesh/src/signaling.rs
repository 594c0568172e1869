//! Polling client for the mailbox relay.
//!
//! [`SignalingClient`] owns the room identity, the poll cursor and the poll
//! task. Every inbound record is fanned out to subscribers as a
//! [`SignalingEvent`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peerwire_mailbox::{MailboxError, MailboxStore};
use peerwire_proto::{
    AckResponse, AnswerRequest, CandidateRequest, IceCandidate, JoinRequest, JoinResponse,
    LeaveRequest, OfferRequest, PeerSummary, PollRequest, PollResponse, SessionDescription,
    Signal, Stamp,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::error::SignalingError;

const TARGET: &str = "peerwire::signaling";

/// Request/response surface of the mailbox relay.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        is_host: bool,
    ) -> Result<JoinResponse, SignalingError>;

    async fn offer(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn answer(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn candidate(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    async fn poll(
        &self,
        room_id: &str,
        peer_id: &str,
        since: Stamp,
    ) -> Result<PollResponse, SignalingError>;

    async fn leave(&self, room_id: &str, peer_id: &str) -> Result<(), SignalingError>;
}

/// Talks to a relay over HTTP.
#[derive(Clone)]
pub struct HttpMailbox {
    client: Client,
    base_url: String,
}

impl HttpMailbox {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn post<B, R>(&self, route: &str, room_id: &str, body: &B) -> Result<R, SignalingError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/signal/{route}", self.base_url);
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        trace!(target = TARGET, route, room = %room_id, %status, "relay responded");
        if status.is_success() {
            return Ok(response.json::<R>().await?);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SignalingError::RoomNotFound(room_id.to_string()));
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<AckResponse>(&text)
            .ok()
            .and_then(|ack| ack.error)
            .unwrap_or(text);
        Err(SignalingError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl MailboxApi for HttpMailbox {
    async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        is_host: bool,
    ) -> Result<JoinResponse, SignalingError> {
        let request = JoinRequest {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            is_host,
        };
        self.post("join", room_id, &request).await
    }

    async fn offer(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let request = OfferRequest {
            room_id: room_id.to_string(),
            peer_id: from.to_string(),
            target: target.to_string(),
            offer,
        };
        self.post::<_, AckResponse>("offer", room_id, &request)
            .await
            .map(|_| ())
    }

    async fn answer(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let request = AnswerRequest {
            room_id: room_id.to_string(),
            peer_id: from.to_string(),
            target: target.to_string(),
            answer,
        };
        self.post::<_, AckResponse>("answer", room_id, &request)
            .await
            .map(|_| ())
    }

    async fn candidate(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let request = CandidateRequest {
            room_id: room_id.to_string(),
            peer_id: from.to_string(),
            target: target.to_string(),
            candidate,
        };
        self.post::<_, AckResponse>("candidate", room_id, &request)
            .await
            .map(|_| ())
    }

    async fn poll(
        &self,
        room_id: &str,
        peer_id: &str,
        since: Stamp,
    ) -> Result<PollResponse, SignalingError> {
        let request = PollRequest {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            last_poll: since,
        };
        self.post("poll", room_id, &request).await
    }

    async fn leave(&self, room_id: &str, peer_id: &str) -> Result<(), SignalingError> {
        let request = LeaveRequest {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
        };
        self.post::<_, AckResponse>("leave", room_id, &request)
            .await
            .map(|_| ())
    }
}

/// In-process mailbox, for embedding the relay next to its peers.
#[derive(Clone)]
pub struct LocalMailbox {
    store: MailboxStore,
}

impl LocalMailbox {
    pub fn new(store: MailboxStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MailboxStore {
        &self.store
    }
}

impl From<MailboxError> for SignalingError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::RoomNotFound(room) => SignalingError::RoomNotFound(room),
            MailboxError::InvalidRequest(message) => SignalingError::Rejected {
                status: 400,
                message: message.to_string(),
            },
        }
    }
}

#[async_trait]
impl MailboxApi for LocalMailbox {
    async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        is_host: bool,
    ) -> Result<JoinResponse, SignalingError> {
        Ok(self.store.join(room_id, peer_id, is_host)?)
    }

    async fn offer(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.store
            .deposit(room_id, from, target, Signal::Offer(offer))?;
        Ok(())
    }

    async fn answer(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.store
            .deposit(room_id, from, target, Signal::Answer(answer))?;
        Ok(())
    }

    async fn candidate(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.store
            .deposit(room_id, from, target, Signal::Candidate(candidate))?;
        Ok(())
    }

    async fn poll(
        &self,
        room_id: &str,
        peer_id: &str,
        since: Stamp,
    ) -> Result<PollResponse, SignalingError> {
        Ok(self.store.poll(room_id, peer_id, since)?)
    }

    async fn leave(&self, room_id: &str, peer_id: &str) -> Result<(), SignalingError> {
        Ok(self.store.leave(room_id, peer_id)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    PeerJoined(PeerSummary),
    Offer {
        from: String,
        offer: SessionDescription,
    },
    Answer {
        from: String,
        answer: SessionDescription,
    },
    Candidate {
        from: String,
        candidate: IceCandidate,
    },
    Error(String),
}

pub struct SignalingClient {
    api: Arc<dyn MailboxApi>,
    room_id: String,
    peer_id: String,
    is_host: bool,
    poll_interval: Duration,
    cursor: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalingEvent>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SignalingClient {
    pub fn new(
        api: Arc<dyn MailboxApi>,
        room_id: impl Into<String>,
        peer_id: impl Into<String>,
        is_host: bool,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            room_id: room_id.into(),
            peer_id: peer_id.into(),
            is_host,
            poll_interval,
            cursor: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            poll_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn cursor(&self) -> Stamp {
        self.cursor.load(Ordering::SeqCst)
    }

    /// New receiver for every event dispatched from now on. Dropping the
    /// receiver unsubscribes it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Joins the room and starts the poll loop. Returns the peers already
    /// present.
    pub async fn join(self: &Arc<Self>) -> Result<Vec<PeerSummary>, SignalingError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SignalingError::Stopped);
        }
        let response = self
            .api
            .join(&self.room_id, &self.peer_id, self.is_host)
            .await?;
        debug!(
            target = TARGET,
            room = %self.room_id,
            peer = %self.peer_id,
            is_host = self.is_host,
            peers = response.peers.len(),
            "joined room"
        );
        self.start_polling();
        Ok(response.peers)
    }

    fn start_polling(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock();
        if slot.is_some() || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.poll_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else {
                    break;
                };
                if client.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let _ = client.poll_once().await;
            }
        }));
    }

    pub async fn send_offer(
        &self,
        target: &str,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.ensure_running()?;
        self.api
            .offer(&self.room_id, &self.peer_id, target, offer)
            .await
    }

    pub async fn send_answer(
        &self,
        target: &str,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.ensure_running()?;
        self.api
            .answer(&self.room_id, &self.peer_id, target, answer)
            .await
    }

    pub async fn send_candidate(
        &self,
        target: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.ensure_running()?;
        self.api
            .candidate(&self.room_id, &self.peer_id, target, candidate)
            .await
    }

    /// Runs one poll cycle and returns how many events were dispatched.
    pub async fn poll_once(&self) -> Result<usize, SignalingError> {
        self.ensure_running()?;
        let since = self.cursor();
        let result = self.api.poll(&self.room_id, &self.peer_id, since).await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SignalingError::Stopped);
        }
        match result {
            Ok(response) => Ok(self.dispatch(response)),
            Err(SignalingError::RoomNotFound(_)) => self.rejoin().await,
            Err(err) => {
                warn!(target = TARGET, room = %self.room_id, peer = %self.peer_id, error = %err, "poll failed");
                self.emit(SignalingEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn rejoin(&self) -> Result<usize, SignalingError> {
        warn!(target = TARGET, room = %self.room_id, peer = %self.peer_id, "room vanished from relay, joining again");
        match self
            .api
            .join(&self.room_id, &self.peer_id, self.is_host)
            .await
        {
            Ok(response) => {
                let count = response.peers.len();
                for peer in response.peers {
                    self.emit(SignalingEvent::PeerJoined(peer));
                }
                Ok(count)
            }
            Err(err) => {
                self.emit(SignalingEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    fn dispatch(&self, response: PollResponse) -> usize {
        self.cursor.fetch_max(response.timestamp, Ordering::SeqCst);
        if response.is_empty() {
            return 0;
        }
        trace!(
            target = TARGET,
            room = %self.room_id,
            peer = %self.peer_id,
            offers = response.offers.len(),
            answers = response.answers.len(),
            candidates = response.candidates.len(),
            new_peers = response.new_peers.len(),
            cursor = response.timestamp,
            "dispatching poll results"
        );
        let mut count = 0;
        for peer in response.new_peers {
            if peer.peer_id != self.peer_id {
                self.emit(SignalingEvent::PeerJoined(peer));
                count += 1;
            }
        }
        for record in response.offers {
            self.emit(SignalingEvent::Offer {
                from: record.from,
                offer: record.offer,
            });
            count += 1;
        }
        for record in response.answers {
            self.emit(SignalingEvent::Answer {
                from: record.from,
                answer: record.answer,
            });
            count += 1;
        }
        for record in response.candidates {
            self.emit(SignalingEvent::Candidate {
                from: record.from,
                candidate: record.candidate,
            });
            count += 1;
        }
        count
    }

    fn emit(&self, event: SignalingEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn ensure_running(&self) -> Result<(), SignalingError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(SignalingError::Stopped)
        } else {
            Ok(())
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Cancels polling, drops every subscriber and leaves the room.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
        self.subscribers.lock().clear();
        if let Err(err) = self.api.leave(&self.room_id, &self.peer_id).await {
            debug!(target = TARGET, room = %self.room_id, peer = %self.peer_id, error = %err, "leave failed");
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerwire_mailbox::MailboxSettings;

    fn local() -> (MailboxStore, Arc<dyn MailboxApi>) {
        let store = MailboxStore::new(MailboxSettings::default());
        let api: Arc<dyn MailboxApi> = Arc::new(LocalMailbox::new(store.clone()));
        (store, api)
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn records_parked_before_join_are_dispatched_in_order() {
        let (store, api) = local();
        store.join("R1", "guest", false).unwrap();
        store
            .deposit(
                "R1",
                "guest",
                "host",
                Signal::Offer(SessionDescription::offer("v=0 guest")),
            )
            .unwrap();

        let client = SignalingClient::new(api, "R1", "host", true, Duration::from_secs(2));
        let mut events = client.subscribe();
        let peers = client.join().await.unwrap();
        assert_eq!(peers.len(), 1);

        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::PeerJoined(PeerSummary {
                peer_id: "guest".into(),
                is_host: false,
            }))
        );
        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::Offer {
                from: "guest".into(),
                offer: SessionDescription::offer("v=0 guest"),
            })
        );
        assert!(client.cursor() > 0);
        client.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stop_leaves_room_and_closes_subscriptions() {
        let (store, api) = local();
        store.join("R1", "host", true).unwrap();
        let client = SignalingClient::new(api, "R1", "guest", false, Duration::from_secs(2));
        let mut events = client.subscribe();
        client.join().await.unwrap();

        client.stop().await;
        assert!(client.is_stopped());
        assert!(events.recv().await.is_none());
        let snapshot = store.snapshot("R1").unwrap();
        assert!(snapshot.peers.iter().all(|peer| peer.peer_id != "guest"));
        assert!(matches!(
            client.send_offer("host", SessionDescription::offer("x")).await,
            Err(SignalingError::Stopped)
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn vanished_room_is_joined_again() {
        let (store, api) = local();
        let client = SignalingClient::new(api, "R1", "host", true, Duration::from_secs(2));
        client.join().await.unwrap();

        store.leave("R1", "host").unwrap();
        assert!(store.snapshot("R1").is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = store.snapshot("R1").expect("room recreated");
        assert_eq!(snapshot.host_id.as_deref(), Some("host"));
        client.stop().await;
    }
}
