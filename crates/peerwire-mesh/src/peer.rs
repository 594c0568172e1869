use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use peerwire_proto::IceCandidate;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::retry::TaskSet;
use crate::transport::{DataChannel, TransportSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    New,
    Connecting,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Disconnected,
    Failed,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::OfferSent => "offer_sent",
            PeerState::OfferReceived => "offer_received",
            PeerState::AnswerSent => "answer_sent",
            PeerState::AnswerReceived => "answer_received",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
        }
    }

    /// Terminal records are replaced, never resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }

    pub(crate) fn blocks_local_offer(&self) -> bool {
        matches!(
            self,
            PeerState::OfferSent
                | PeerState::OfferReceived
                | PeerState::AnswerSent
                | PeerState::AnswerReceived
                | PeerState::Connected
        )
    }

    pub(crate) fn rejects_remote_offer(&self) -> bool {
        matches!(
            self,
            PeerState::OfferSent | PeerState::AnswerReceived | PeerState::Connected
        )
    }

    pub(crate) fn rejects_answer(&self) -> bool {
        matches!(self, PeerState::AnswerReceived | PeerState::Connected)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One negotiation attempt with one remote peer.
///
/// The record owns its transport session, channel, event pump and timers;
/// [`PeerRecord::teardown`] releases all of them.
pub(crate) struct PeerRecord {
    pub peer_id: String,
    pub generation: u64,
    pub remote_is_host: bool,
    pub initiator: bool,
    pub session: Arc<dyn TransportSession>,
    pub timers: TaskSet,
    state: Mutex<PeerState>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    connected: AtomicBool,
    negotiation: Arc<tokio::sync::Mutex<()>>,
    glare: AtomicBool,
    remote_applied: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    applied_offer: Mutex<Option<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl PeerRecord {
    pub fn new(
        peer_id: String,
        generation: u64,
        remote_is_host: bool,
        initiator: bool,
        session: Arc<dyn TransportSession>,
    ) -> Self {
        Self {
            peer_id,
            generation,
            remote_is_host,
            initiator,
            session,
            timers: TaskSet::new(),
            state: Mutex::new(PeerState::New),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
            negotiation: Arc::new(tokio::sync::Mutex::new(())),
            glare: AtomicBool::new(false),
            remote_applied: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            applied_offer: Mutex::new(None),
            pump: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: PeerState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(
                target = "peerwire::negotiation",
                peer = %self.peer_id,
                generation = self.generation,
                from = %previous,
                to = %next,
                "peer state changed"
            );
        }
    }

    /// The negotiation slot. `None` while another step holds it; dropping
    /// the guard releases it.
    pub fn try_negotiate(&self) -> Option<OwnedMutexGuard<()>> {
        self.negotiation.clone().try_lock_owned().ok()
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().clone()
    }

    pub fn set_channel(&self, channel: Arc<dyn DataChannel>) {
        *self.channel.lock() = Some(channel);
    }

    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel().filter(|channel| channel.is_open())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that flips the flag.
    pub fn mark_connected(&self) -> bool {
        !self.connected.swap(true, Ordering::SeqCst)
    }

    /// Returns whether the record was connected.
    pub fn clear_connected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub fn mark_glare(&self) {
        self.glare.store(true, Ordering::SeqCst);
    }

    pub fn saw_glare(&self) -> bool {
        self.glare.load(Ordering::SeqCst)
    }

    pub fn applied_offer_matches(&self, sdp: &str) -> bool {
        self.applied_offer.lock().as_deref() == Some(sdp)
    }

    pub fn has_applied_offer(&self) -> bool {
        self.applied_offer.lock().is_some()
    }

    pub fn set_applied_offer(&self, sdp: &str) {
        *self.applied_offer.lock() = Some(sdp.to_string());
    }

    /// Parks `candidate` until a remote description exists. Hands it back
    /// when it can be applied right away.
    pub fn buffer_candidate(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let mut pending = self.pending_candidates.lock();
        if self.remote_applied.load(Ordering::SeqCst) {
            Some(candidate)
        } else {
            pending.push(candidate);
            None
        }
    }

    /// Records that a remote description is in place and drains the buffer.
    pub fn remote_description_applied(&self) -> Vec<IceCandidate> {
        let mut pending = self.pending_candidates.lock();
        self.remote_applied.store(true, Ordering::SeqCst);
        std::mem::take(&mut *pending)
    }

    pub fn set_pump(&self, handle: JoinHandle<()>) {
        if self.is_torn_down() {
            handle.abort();
            return;
        }
        *self.pump.lock() = Some(handle);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Cancels the timers and the event pump without closing the session.
    pub fn abort_tasks(&self) {
        self.timers.abort_all();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_tasks();
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.session.close().await;
        self.connected.store(false, Ordering::SeqCst);
        debug!(
            target = "peerwire::negotiation",
            peer = %self.peer_id,
            generation = self.generation,
            state = %self.state(),
            "peer record torn down"
        );
    }
}
