//! Owns the peer table for one room.
//!
//! The supervisor joins the room through a [`SignalingClient`], creates a
//! [`PeerRecord`] for every peer it should talk to, and routes signaling
//! events into the negotiation steps in `negotiation.rs`. Each remote peer
//! gets its own lane task, so its signals run in arrival order while other
//! peers negotiate alongside it. Delayed work (connect timeouts, reconnects,
//! busy retries) runs as record timers that hand their action back to the
//! supervisor's own task set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerwire_proto::{IceCandidate, PeerSummary, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::{MeshError, SignalingError};
use crate::peer::{PeerRecord, PeerState};
use crate::retry::TaskSet;
use crate::signaling::{HttpMailbox, MailboxApi, SignalingClient, SignalingEvent};
use crate::transport::webrtc::WebRtcSessionFactory;
use crate::transport::{Payload, SessionFactory};

pub(crate) const TARGET: &str = "peerwire::mesh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerConnected(String),
    PeerDisconnected(String),
    Message { from: String, payload: Payload },
    SignalingError(String),
}

/// Work a timer hands back to the supervisor once it fires.
#[derive(Debug)]
pub(crate) enum Deferred {
    Offer {
        from: String,
        offer: SessionDescription,
        attempt: u32,
    },
    Answer {
        from: String,
        answer: SessionDescription,
        attempt: u32,
    },
    Reconnect {
        peer_id: String,
        generation: u64,
    },
    ConnectTimeout {
        peer_id: String,
        generation: u64,
    },
}

/// How a new record may displace the current one.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Install {
    /// Only when no live record exists.
    IfVacant,
    /// Only while the current record is still `generation`.
    Replace { generation: u64 },
}

pub(crate) struct MeshInner {
    pub config: MeshConfig,
    pub factory: Arc<dyn SessionFactory>,
    pub signaling: Arc<SignalingClient>,
    pub local_id: String,
    pub is_host: bool,
    pub peers: tokio::sync::Mutex<HashMap<String, Arc<PeerRecord>>>,
    pub tasks: TaskSet,
    lanes: parking_lot::Mutex<HashMap<String, mpsc::UnboundedSender<SignalingEvent>>>,
    reconnects: parking_lot::Mutex<HashMap<String, u32>>,
    generation: AtomicU64,
    subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<MeshEvent>>>,
    stopped: AtomicBool,
}

pub struct ConnectionSupervisor {
    inner: Arc<MeshInner>,
}

impl ConnectionSupervisor {
    /// Checks the transport capability, joins `room_id` and starts
    /// negotiating with the peers already there.
    pub async fn start(
        config: MeshConfig,
        factory: Arc<dyn SessionFactory>,
        api: Arc<dyn MailboxApi>,
        room_id: &str,
        local_id: &str,
        is_host: bool,
    ) -> Result<Self, MeshError> {
        factory.check_available().await?;

        let signaling = SignalingClient::new(
            api,
            room_id,
            local_id,
            is_host,
            config.poll_interval,
        );
        let mut events = signaling.subscribe();
        let inner = Arc::new(MeshInner {
            config,
            factory,
            signaling: signaling.clone(),
            local_id: local_id.to_string(),
            is_host,
            peers: tokio::sync::Mutex::new(HashMap::new()),
            tasks: TaskSet::new(),
            lanes: parking_lot::Mutex::new(HashMap::new()),
            reconnects: parking_lot::Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            subscribers: parking_lot::Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let peers = match signaling.join().await {
            Ok(peers) => peers,
            Err(err) => {
                signaling.stop().await;
                return Err(err.into());
            }
        };
        info!(
            target = TARGET,
            room = %room_id,
            peer = %local_id,
            is_host,
            known_peers = peers.len(),
            "mesh started"
        );

        for peer in peers {
            inner.route(SignalingEvent::PeerJoined(peer));
        }
        let dispatcher = inner.clone();
        inner.tasks.spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.route(event);
            }
        });

        Ok(Self { inner })
    }

    /// [`ConnectionSupervisor::start`] with WebRTC sessions and an HTTP relay.
    pub async fn connect(
        config: MeshConfig,
        relay_url: &str,
        room_id: &str,
        local_id: &str,
        is_host: bool,
    ) -> Result<Self, MeshError> {
        let factory = Arc::new(WebRtcSessionFactory::new(config.ice_servers.clone()));
        let api = Arc::new(HttpMailbox::new(relay_url));
        Self::start(config, factory, api, room_id, local_id, is_host).await
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn room_id(&self) -> &str {
        self.inner.signaling.room_id()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MeshEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Sends to one peer; fails rather than queueing when its channel is not open.
    pub async fn send_to(
        &self,
        peer_id: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), MeshError> {
        if self.inner.is_stopped() {
            return Err(MeshError::Stopped);
        }
        let channel = self
            .inner
            .record(peer_id)
            .await
            .and_then(|record| record.open_channel())
            .ok_or_else(|| MeshError::ChannelNotOpen(peer_id.to_string()))?;
        channel.send(payload.into()).await?;
        Ok(())
    }

    /// Best-effort send to every open channel. Returns how many sends succeeded.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> usize {
        if self.inner.is_stopped() {
            return 0;
        }
        let payload = payload.into();
        let records: Vec<Arc<PeerRecord>> =
            self.inner.peers.lock().await.values().cloned().collect();
        let mut delivered = 0;
        for record in records {
            let Some(channel) = record.open_channel() else {
                continue;
            };
            match channel.send(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(target = TARGET, peer = %record.peer_id, error = %err, "broadcast send failed");
                }
            }
        }
        delivered
    }

    pub async fn connected_peer_count(&self) -> usize {
        self.inner
            .peers
            .lock()
            .await
            .values()
            .filter(|record| record.is_connected())
            .count()
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .inner
            .peers
            .lock()
            .await
            .values()
            .filter(|record| record.is_connected())
            .map(|record| record.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub async fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.record(peer_id).await.map(|record| record.state())
    }

    /// Stops signaling, cancels every timer and closes every session.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if self.inner.is_stopped() {
            return;
        }
        self.inner.tasks.abort_all();
        if let Ok(peers) = self.inner.peers.try_lock() {
            for record in peers.values() {
                record.abort_tasks();
            }
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move { inner.stop().await });
            }
            Err(_) => {
                self.inner.stopped.store(true, Ordering::SeqCst);
                self.inner.lanes.lock().clear();
                self.inner.subscribers.lock().clear();
            }
        }
    }
}

impl MeshInner {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: MeshEvent) {
        if self.is_stopped() {
            return;
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub async fn record(&self, peer_id: &str) -> Option<Arc<PeerRecord>> {
        self.peers.lock().await.get(peer_id).cloned()
    }

    /// Queues `event` on the lane of the peer it concerns.
    fn route(self: &Arc<Self>, event: SignalingEvent) {
        if self.is_stopped() {
            return;
        }
        let peer_id = match &event {
            SignalingEvent::PeerJoined(peer) => peer.peer_id.clone(),
            SignalingEvent::Offer { from, .. }
            | SignalingEvent::Answer { from, .. }
            | SignalingEvent::Candidate { from, .. } => from.clone(),
            SignalingEvent::Error(message) => {
                self.emit(MeshEvent::SignalingError(message.clone()));
                return;
            }
        };
        let mut lanes = self.lanes.lock();
        let event = match lanes.get(&peer_id) {
            Some(lane) => match lane.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        lanes.insert(peer_id, tx);
        drop(lanes);

        let inner = self.clone();
        self.tasks.spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.handle_signal(event).await;
            }
        });
    }

    async fn handle_signal(self: &Arc<Self>, event: SignalingEvent) {
        if self.is_stopped() {
            return;
        }
        let result = match event {
            SignalingEvent::PeerJoined(peer) => {
                self.on_peer_discovered(peer).await;
                Ok(())
            }
            SignalingEvent::Offer { from, offer } => self.handle_offer(from, offer, 0).await,
            SignalingEvent::Answer { from, answer } => self.handle_answer(from, answer, 0).await,
            SignalingEvent::Candidate { from, candidate } => {
                self.handle_candidate(&from, candidate).await;
                Ok(())
            }
            SignalingEvent::Error(message) => {
                self.emit(MeshEvent::SignalingError(message));
                Ok(())
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    pub fn report(&self, err: MeshError) {
        if matches!(err, MeshError::Stopped) || self.is_stopped() {
            return;
        }
        warn!(target = TARGET, peer = %self.local_id, error = %err, "negotiation step failed");
        if let MeshError::Signaling(err) = &err {
            if !matches!(err, SignalingError::Stopped) {
                self.emit(MeshEvent::SignalingError(err.to_string()));
            }
        }
    }

    async fn on_peer_discovered(self: &Arc<Self>, peer: PeerSummary) {
        if peer.peer_id == self.local_id || self.is_stopped() {
            return;
        }
        let initiator = if self.is_host {
            true
        } else if peer.is_host {
            false
        } else {
            debug!(target = TARGET, peer = %peer.peer_id, "ignoring non-host peer");
            return;
        };
        let installed = self
            .install_record(&peer.peer_id, peer.is_host, initiator, Install::IfVacant)
            .await;
        match installed {
            Ok(Some(record)) if record.initiator => {
                if let Err(err) = self.create_and_send_offer(&record).await {
                    self.report(err);
                }
            }
            Ok(_) => {}
            Err(err) => self.report(err),
        }
    }

    /// Creates a fresh record for `peer_id`, tearing down whatever it
    /// replaces first. Returns `None` when `mode` forbids the swap.
    pub async fn install_record(
        self: &Arc<Self>,
        peer_id: &str,
        remote_is_host: bool,
        initiator: bool,
        mode: Install,
    ) -> Result<Option<Arc<PeerRecord>>, MeshError> {
        if self.is_stopped() {
            return Err(MeshError::Stopped);
        }
        let mut peers = self.peers.lock().await;
        if let Some(current) = peers.get(peer_id) {
            let allowed = match mode {
                Install::IfVacant => current.state().is_terminal(),
                Install::Replace { generation } => current.generation == generation,
            };
            if !allowed {
                return Ok(None);
            }
        } else if matches!(mode, Install::Replace { .. }) {
            return Ok(None);
        }
        if let Some(previous) = peers.remove(peer_id) {
            previous.teardown().await;
        }

        let session = self.factory.create_session(peer_id).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = session.take_events();
        let record = Arc::new(PeerRecord::new(
            peer_id.to_string(),
            generation,
            remote_is_host,
            initiator,
            session,
        ));
        if let Some(events) = events {
            let pump = tokio::spawn(self.clone().pump(record.clone(), events));
            record.set_pump(pump);
        }
        self.schedule(
            &record,
            self.config.connect_timeout,
            Deferred::ConnectTimeout {
                peer_id: peer_id.to_string(),
                generation,
            },
        );
        peers.insert(peer_id.to_string(), record.clone());
        debug!(
            target = TARGET,
            peer = %peer_id,
            generation,
            initiator,
            "peer record created"
        );
        Ok(Some(record))
    }

    /// Runs `action` on the supervisor after `delay`, unless `record` is torn
    /// down first.
    pub fn schedule(self: &Arc<Self>, record: &PeerRecord, delay: Duration, action: Deferred) {
        let inner = self.clone();
        record.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            let runner = inner.clone();
            inner.tasks.spawn(async move {
                runner.run_deferred(action).await;
            });
        });
    }

    async fn run_deferred(self: Arc<Self>, action: Deferred) {
        if self.is_stopped() {
            return;
        }
        let result = match action {
            Deferred::Offer {
                from,
                offer,
                attempt,
            } => self.handle_offer(from, offer, attempt).await,
            Deferred::Answer {
                from,
                answer,
                attempt,
            } => self.handle_answer(from, answer, attempt).await,
            Deferred::Reconnect {
                peer_id,
                generation,
            } => self.reconnect(&peer_id, generation).await,
            Deferred::ConnectTimeout {
                peer_id,
                generation,
            } => self.connect_timed_out(&peer_id, generation).await,
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    async fn connect_timed_out(
        self: &Arc<Self>,
        peer_id: &str,
        generation: u64,
    ) -> Result<(), MeshError> {
        let Some(record) = self.record(peer_id).await else {
            return Ok(());
        };
        if record.generation != generation
            || record.is_connected()
            || record.state() == PeerState::Connected
        {
            return Ok(());
        }
        warn!(
            target = TARGET,
            peer = %peer_id,
            generation,
            state = %record.state(),
            "connection not established in time"
        );
        record.set_state(PeerState::Failed);
        self.reconnect(peer_id, generation).await
    }

    /// Replaces record `generation` of `peer_id` with a fresh one.
    async fn reconnect(self: &Arc<Self>, peer_id: &str, generation: u64) -> Result<(), MeshError> {
        let Some(current) = self.record(peer_id).await else {
            return Ok(());
        };
        if current.generation != generation {
            return Ok(());
        }
        let attempt = {
            let mut reconnects = self.reconnects.lock();
            let attempt = reconnects.entry(peer_id.to_string()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if !self.config.reconnect.allows(attempt) {
            warn!(target = TARGET, peer = %peer_id, attempt, "giving up on peer");
            self.reconnects.lock().remove(peer_id);
            let removed = {
                let mut peers = self.peers.lock().await;
                match peers.get(peer_id) {
                    Some(record) if record.generation == generation => peers.remove(peer_id),
                    _ => None,
                }
            };
            if let Some(record) = removed {
                record.teardown().await;
            }
            return Ok(());
        }

        let initiator = if current.saw_glare() {
            self.local_id.as_str() < peer_id
        } else {
            current.initiator
        };
        info!(
            target = TARGET,
            peer = %peer_id,
            attempt,
            initiator,
            "reconnecting to peer"
        );
        let installed = self
            .install_record(
                peer_id,
                current.remote_is_host,
                initiator,
                Install::Replace { generation },
            )
            .await?;
        if let Some(record) = installed {
            if record.initiator {
                self.create_and_send_offer(&record).await?;
            }
        }
        Ok(())
    }

    pub fn mark_connected(&self, record: &PeerRecord) {
        if record.is_torn_down() || !record.mark_connected() {
            return;
        }
        record.set_state(PeerState::Connected);
        self.reconnects.lock().remove(&record.peer_id);
        info!(target = TARGET, peer = %record.peer_id, generation = record.generation, "peer connected");
        self.emit(MeshEvent::PeerConnected(record.peer_id.clone()));
    }

    /// Marks `record` failed and schedules its replacement after the backoff.
    pub fn transport_failed(self: &Arc<Self>, record: &PeerRecord) {
        if record.is_torn_down() || record.state().is_terminal() {
            return;
        }
        record.set_state(PeerState::Failed);
        if record.clear_connected() {
            self.emit(MeshEvent::PeerDisconnected(record.peer_id.clone()));
        }
        warn!(
            target = TARGET,
            peer = %record.peer_id,
            generation = record.generation,
            backoff_ms = self.config.reconnect.delay.as_millis() as u64,
            "transport failed, scheduling reconnect"
        );
        self.schedule(
            record,
            self.config.reconnect.delay,
            Deferred::Reconnect {
                peer_id: record.peer_id.clone(),
                generation: record.generation,
            },
        );
    }

    pub async fn handle_candidate(&self, from: &str, candidate: IceCandidate) {
        let Some(record) = self.record(from).await else {
            debug!(target = TARGET, peer = %from, "candidate for unknown peer dropped");
            return;
        };
        if let Some(candidate) = record.buffer_candidate(candidate) {
            if let Err(err) = record.session.add_ice_candidate(candidate).await {
                debug!(target = TARGET, peer = %from, error = %err, "remote candidate rejected");
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.abort_all();
        self.lanes.lock().clear();
        self.signaling.stop().await;
        let records: Vec<Arc<PeerRecord>> = {
            let mut peers = self.peers.lock().await;
            peers.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            record.teardown().await;
        }
        self.reconnects.lock().clear();
        self.subscribers.lock().clear();
        info!(target = TARGET, peer = %self.local_id, "mesh stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::signaling::LocalMailbox;
    use crate::transport::mock::{MockNetwork, MockOpKind};
    use crate::transport::TransportSession;
    use peerwire_mailbox::{MailboxSettings, MailboxStore};
    use peerwire_proto::Signal;

    async fn start_peer(
        network: &MockNetwork,
        store: &MailboxStore,
        peer_id: &str,
        is_host: bool,
    ) -> ConnectionSupervisor {
        start_with(MeshConfig::default(), network, store, peer_id, is_host).await
    }

    async fn start_with(
        config: MeshConfig,
        network: &MockNetwork,
        store: &MailboxStore,
        peer_id: &str,
        is_host: bool,
    ) -> ConnectionSupervisor {
        ConnectionSupervisor::start(
            config,
            Arc::new(network.factory(peer_id)),
            Arc::new(LocalMailbox::new(store.clone())),
            "R1",
            peer_id,
            is_host,
        )
        .await
        .unwrap()
    }

    async fn ghost_offer(network: &MockNetwork, to: &str) -> (Arc<dyn TransportSession>, SessionDescription) {
        let session = network.factory("ghost").create_session(to).await.unwrap();
        session.create_data_channel("peerwire").await.unwrap();
        let offer = session.create_offer().await.unwrap();
        session.set_local_description(offer.clone()).await.unwrap();
        (session, offer)
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn busy_offer_is_retried_after_the_lock_frees() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        let guest = start_peer(&network, &store, "guest", false).await;
        let (_ghost, offer) = ghost_offer(&network, "guest").await;

        let record = guest
            .inner
            .install_record("ghost", false, false, Install::IfVacant)
            .await
            .unwrap()
            .unwrap();
        let guard = record.try_negotiate().unwrap();

        guest
            .inner
            .handle_offer("ghost".into(), offer, 0)
            .await
            .unwrap();
        assert_eq!(network.count_ops("guest", "ghost", MockOpKind::SetRemoteOffer), 0);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(network.count_ops("guest", "ghost", MockOpKind::SetRemoteOffer), 1);
        assert_eq!(guest.peer_state("ghost").await, Some(PeerState::AnswerSent));
        guest.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn repeated_offer_is_applied_once() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        let guest = start_peer(&network, &store, "guest", false).await;
        store.join("R1", "ghost", false).unwrap();
        let (_ghost, offer) = ghost_offer(&network, "guest").await;

        store
            .deposit("R1", "ghost", "guest", Signal::Offer(offer.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        store
            .deposit("R1", "ghost", "guest", Signal::Offer(offer))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(network.count_ops("guest", "ghost", MockOpKind::SetRemoteOffer), 1);
        assert_eq!(network.count_ops("guest", "ghost", MockOpKind::CreateAnswer), 1);
        assert_eq!(guest.peer_state("ghost").await, Some(PeerState::AnswerSent));
        guest.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn answer_for_unknown_peer_starts_an_offer() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        let guest = start_peer(&network, &store, "guest", false).await;

        guest
            .inner
            .handle_answer(
                "stray".into(),
                SessionDescription::answer("mock-answer sid=99 for=[nothing]"),
                0,
            )
            .await
            .unwrap();
        assert_eq!(guest.peer_state("stray").await, Some(PeerState::OfferSent));
        assert_eq!(network.count_ops("guest", "stray", MockOpKind::SetLocalOffer), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(guest.peer_state("stray").await, Some(PeerState::OfferSent));
        assert_eq!(network.count_ops("guest", "stray", MockOpKind::SetRemoteAnswer), 0);
        guest.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn send_to_without_channel_fails() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        let host = start_peer(&network, &store, "host", true).await;
        assert!(matches!(
            host.send_to("nobody", "hi").await,
            Err(MeshError::ChannelNotOpen(peer)) if peer == "nobody"
        ));
        assert_eq!(host.broadcast("hi").await, 0);
        host.stop().await;
        assert!(matches!(host.send_to("nobody", "hi").await, Err(MeshError::Stopped)));
    }
    #[test_timeout::tokio_timeout_test(paused)]
    async fn repeated_answer_is_applied_once() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        store.join("R1", "ghost", false).unwrap();
        let host = start_peer(&network, &store, "host", true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(host.peer_state("ghost").await, Some(PeerState::OfferSent));

        let polled = store.poll("R1", "ghost", 0).unwrap();
        let offer = polled.offers.last().expect("offer parked for ghost").offer.clone();
        let ghost = network.factory("ghost").create_session("host").await.unwrap();
        ghost.set_remote_description(offer).await.unwrap();
        let answer = ghost.create_answer().await.unwrap();
        ghost.set_local_description(answer.clone()).await.unwrap();

        for _ in 0..2 {
            host.inner
                .handle_answer("ghost".into(), answer.clone(), 0)
                .await
                .unwrap();
        }
        assert_eq!(network.count_ops("host", "ghost", MockOpKind::SetRemoteAnswer), 1);
        assert!(matches!(
            host.peer_state("ghost").await,
            Some(PeerState::AnswerReceived | PeerState::Connected)
        ));

        store
            .deposit("R1", "ghost", "host", Signal::Answer(answer))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(network.count_ops("host", "ghost", MockOpKind::SetRemoteAnswer), 1);
        assert_eq!(host.peer_state("ghost").await, Some(PeerState::Connected));
        host.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn unanswered_offer_times_out_into_a_fresh_record() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        store.join("R1", "ghost", false).unwrap();
        let host = start_peer(&network, &store, "host", true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = host.inner.record("ghost").await.unwrap();
        assert_eq!(first.state(), PeerState::OfferSent);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(first.state(), PeerState::Failed);
        assert!(first.is_torn_down());

        let second = host.inner.record("ghost").await.unwrap();
        assert_ne!(second.generation, first.generation);
        assert_eq!(second.state(), PeerState::OfferSent);
        assert_eq!(host.inner.peers.lock().await.len(), 1);
        assert_eq!(network.count_ops("host", "ghost", MockOpKind::CreateSession), 2);
        assert_eq!(network.count_ops("host", "ghost", MockOpKind::SetLocalOffer), 2);
        assert_eq!(network.open_sessions("host", "ghost"), 1);
        host.stop().await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn reconnects_stop_at_the_attempt_cap() {
        let network = MockNetwork::new();
        let store = MailboxStore::new(MailboxSettings::default());
        store.join("R1", "ghost", false).unwrap();
        let config = MeshConfig {
            connect_timeout: Duration::from_secs(1),
            reconnect: RetryPolicy::new(Duration::from_secs(1), 2),
            ..MeshConfig::default()
        };
        let host = start_with(config, &network, &store, "host", true).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(host.peer_state("ghost").await, None);
        assert!(host.inner.peers.lock().await.is_empty());
        assert_eq!(network.count_ops("host", "ghost", MockOpKind::CreateSession), 3);
        assert_eq!(network.open_sessions("host", "ghost"), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(network.count_ops("host", "ghost", MockOpKind::CreateSession), 3);
        host.stop().await;
    }
}
