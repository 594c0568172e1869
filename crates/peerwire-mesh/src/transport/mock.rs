//! In-memory transport backend.
//!
//! Sessions created from one [`MockNetwork`] link up once an offerer applies
//! the answer produced for its current offer. The network records every
//! operation and can inject ICE failures or pretend the capability is
//! missing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use peerwire_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    ConnectionState, DataChannel, Payload, SessionFactory, TransportEvent, TransportSession,
};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOpKind {
    CreateSession,
    CreateOffer,
    CreateAnswer,
    SetLocalOffer,
    SetLocalAnswer,
    SetRemoteOffer,
    SetRemoteAnswer,
    AddCandidate,
    CreateChannel,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOp {
    pub session: u64,
    pub local: String,
    pub remote: String,
    pub kind: MockOpKind,
}

#[derive(Default)]
struct NetworkInner {
    next_id: AtomicU64,
    unavailable: AtomicBool,
    sessions: Mutex<HashMap<u64, Arc<SessionState>>>,
    log: Mutex<Vec<MockOp>>,
}

impl NetworkInner {
    fn record(&self, session: &SessionState, kind: MockOpKind) {
        trace!(
            target = "peerwire::mock",
            session = session.id,
            local = %session.local,
            remote = %session.remote,
            ?kind
        );
        self.log.lock().push(MockOp {
            session: session.id,
            local: session.local.clone(),
            remote: session.remote.clone(),
            kind,
        });
    }

    fn session(&self, id: u64) -> Option<Arc<SessionState>> {
        self.sessions.lock().get(&id).cloned()
    }
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for sessions owned by `local_peer`.
    pub fn factory(&self, local_peer: &str) -> MockSessionFactory {
        MockSessionFactory {
            network: self.inner.clone(),
            local: local_peer.to_string(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Breaks the live link between `local` and `remote`; both ends report
    /// `Failed`. Returns false when no such link exists.
    pub fn fail_ice(&self, local: &str, remote: &str) -> bool {
        let session = self
            .inner
            .sessions
            .lock()
            .values()
            .find(|s| {
                s.local == local
                    && s.remote == remote
                    && !s.closed.load(Ordering::SeqCst)
                    && s.link.lock().is_some()
            })
            .cloned();
        let Some(session) = session else {
            return false;
        };
        let linked = session.link.lock().take();
        let counterpart = linked.and_then(|id| self.inner.session(id));
        for end in std::iter::once(session).chain(counterpart) {
            end.link.lock().take();
            for channel in end.channels.lock().iter() {
                channel.open.store(false, Ordering::SeqCst);
            }
            end.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
        }
        true
    }

    pub fn operations(&self) -> Vec<MockOp> {
        self.inner.log.lock().clone()
    }

    pub fn count_ops(&self, local: &str, remote: &str, kind: MockOpKind) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|op| op.local == local && op.remote == remote && op.kind == kind)
            .count()
    }

    /// Sessions from `local` toward `remote` that have not been closed.
    pub fn open_sessions(&self, local: &str, remote: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|s| s.local == local && s.remote == remote && !s.closed.load(Ordering::SeqCst))
            .count()
    }
}

pub struct MockSessionFactory {
    network: Arc<NetworkInner>,
    local: String,
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn check_available(&self) -> Result<(), TransportError> {
        if self.network.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("mock network disabled".into()));
        }
        Ok(())
    }

    async fn create_session(
        &self,
        remote_peer: &str,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.check_available().await?;
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState {
            id,
            local: self.local.clone(),
            remote: remote_peer.to_string(),
            events,
            receiver: Mutex::new(Some(receiver)),
            sdp: Mutex::new(SdpState::default()),
            channels: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
            offer_seq: AtomicU64::new(0),
        });
        self.network.sessions.lock().insert(id, state.clone());
        self.network.record(&state, MockOpKind::CreateSession);
        Ok(Arc::new(MockSession {
            state,
            network: self.network.clone(),
        }))
    }
}

#[derive(Default)]
struct SdpState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
}

struct SessionState {
    id: u64,
    local: String,
    remote: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    sdp: Mutex<SdpState>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    link: Mutex<Option<u64>>,
    closed: AtomicBool,
    offer_seq: AtomicU64,
}

impl SessionState {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn offer_prefix(&self) -> String {
        format!("mock-offer sid={} ", self.id)
    }
}

/// Answers carry the offer they reply to: `mock-answer sid=<id> for=[<offer>]`.
fn parse_answer(sdp: &str) -> Option<(u64, &str)> {
    let rest = sdp.strip_prefix("mock-answer sid=")?;
    let (id, offer) = rest.split_once(" for=[")?;
    Some((id.parse().ok()?, offer.strip_suffix(']')?))
}

pub struct MockSession {
    state: Arc<SessionState>,
    network: Arc<NetworkInner>,
}

impl MockSession {
    fn link_with(&self, answerer: &Arc<SessionState>) {
        let offerer = &self.state;
        *offerer.link.lock() = Some(answerer.id);
        *answerer.link.lock() = Some(offerer.id);

        let mut opened = Vec::new();
        for (from, to) in [(offerer, answerer), (answerer, offerer)] {
            let created: Vec<Arc<MockChannel>> = from.channels.lock().clone();
            for near in created.into_iter().filter(|c| c.peer.lock().upgrade().is_none()) {
                let far = Arc::new(MockChannel {
                    label: near.label.clone(),
                    open: AtomicBool::new(true),
                    events: to.events.clone(),
                    peer: Mutex::new(Arc::downgrade(&near)),
                });
                *near.peer.lock() = Arc::downgrade(&far);
                near.open.store(true, Ordering::SeqCst);
                to.channels.lock().push(far.clone());
                to.emit(TransportEvent::DataChannel(far));
                opened.push((near.label.clone(), from.clone(), to.clone()));
            }
        }

        for end in [offerer, answerer] {
            end.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
            end.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
        for (label, from, to) in opened {
            from.emit(TransportEvent::ChannelOpen {
                label: label.clone(),
            });
            to.emit(TransportEvent::ChannelOpen { label });
        }
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.state.ensure_open()?;
        let seq = self.state.offer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.network.record(&self.state, MockOpKind::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "{}seq={seq}",
            self.state.offer_prefix()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.state.ensure_open()?;
        let remote = self.state.sdp.lock().remote.clone();
        match remote {
            Some(offer) if offer.kind == SdpKind::Offer => {
                self.network.record(&self.state, MockOpKind::CreateAnswer);
                Ok(SessionDescription::answer(format!(
                    "mock-answer sid={} for=[{}]",
                    self.state.id, offer.sdp
                )))
            }
            _ => Err(TransportError::Negotiation(
                "no remote offer to answer".into(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        let kind = {
            let mut sdp = self.state.sdp.lock();
            match desc.kind {
                SdpKind::Offer => {
                    if !desc.sdp.starts_with(&self.state.offer_prefix()) {
                        return Err(TransportError::Negotiation(
                            "offer was not created by this session".into(),
                        ));
                    }
                    if sdp.remote.as_ref().map(|r| r.kind) == Some(SdpKind::Offer) {
                        return Err(TransportError::Negotiation(
                            "remote offer pending".into(),
                        ));
                    }
                    sdp.local = Some(desc);
                    MockOpKind::SetLocalOffer
                }
                SdpKind::Answer => {
                    if sdp.remote.as_ref().map(|r| r.kind) != Some(SdpKind::Offer) {
                        return Err(TransportError::Negotiation(
                            "answer without a remote offer".into(),
                        ));
                    }
                    sdp.local = Some(desc);
                    MockOpKind::SetLocalAnswer
                }
            }
        };
        self.network.record(&self.state, kind);
        self.state.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:mock {} 1 udp 2122260223 127.0.0.1 9 typ host", self.state.id),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        match desc.kind {
            SdpKind::Offer => {
                {
                    let mut sdp = self.state.sdp.lock();
                    if sdp.local.as_ref().map(|l| l.kind) == Some(SdpKind::Offer) {
                        return Err(TransportError::Negotiation("local offer pending".into()));
                    }
                    sdp.remote = Some(desc);
                }
                self.network.record(&self.state, MockOpKind::SetRemoteOffer);
                Ok(())
            }
            SdpKind::Answer => {
                let local_offer = self
                    .state
                    .sdp
                    .lock()
                    .local
                    .clone()
                    .filter(|l| l.kind == SdpKind::Offer)
                    .ok_or_else(|| TransportError::Negotiation("no local offer".into()))?;
                let (answerer_id, answered) = parse_answer(&desc.sdp)
                    .ok_or_else(|| TransportError::Negotiation("malformed answer".into()))?;
                if answered != local_offer.sdp {
                    return Err(TransportError::Negotiation(
                        "answer does not match the current offer".into(),
                    ));
                }
                let answerer = self
                    .network
                    .session(answerer_id)
                    .filter(|s| !s.closed.load(Ordering::SeqCst))
                    .ok_or_else(|| TransportError::Negotiation("answering session is gone".into()))?;
                let answer_applied = {
                    let sdp = answerer.sdp.lock();
                    sdp.local.as_ref().map(|l| l.kind) == Some(SdpKind::Answer)
                };
                if !answer_applied {
                    return Err(TransportError::Negotiation(
                        "answering session has not applied its answer".into(),
                    ));
                }
                self.state.sdp.lock().remote = Some(desc);
                self.network
                    .record(&self.state, MockOpKind::SetRemoteAnswer);
                self.link_with(&answerer);
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        self.state.ensure_open()?;
        if self.state.sdp.lock().remote.is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".into(),
            ));
        }
        self.network.record(&self.state, MockOpKind::AddCandidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.state.ensure_open()?;
        let channel = Arc::new(MockChannel {
            label: label.to_string(),
            open: AtomicBool::new(false),
            events: self.state.events.clone(),
            peer: Mutex::new(Weak::new()),
        });
        self.state.channels.lock().push(channel.clone());
        self.network.record(&self.state, MockOpKind::CreateChannel);
        Ok(channel)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.state.receiver.lock().take()
    }

    async fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.record(&self.state, MockOpKind::Close);
        let channels: Vec<Arc<MockChannel>> = self.state.channels.lock().clone();
        for channel in channels {
            channel.shutdown();
        }
        let linked = self.state.link.lock().take();
        let counterpart = linked.and_then(|id| self.network.session(id));
        if let Some(counterpart) = counterpart {
            counterpart.link.lock().take();
            counterpart.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
        }
    }
}

pub struct MockChannel {
    label: String,
    open: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
    peer: Mutex<Weak<MockChannel>>,
}

impl MockChannel {
    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::ChannelClosed {
                label: self.label.clone(),
            });
        }
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            if peer.open.swap(false, Ordering::SeqCst) {
                let _ = peer.events.send(TransportEvent::ChannelClosed {
                    label: peer.label.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Channel("channel not open".into()));
        }
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| TransportError::Channel("remote end dropped".into()))?;
        peer.events
            .send(TransportEvent::ChannelMessage {
                label: peer.label.clone(),
                payload,
            })
            .map_err(|_| TransportError::Channel("remote end closed".into()))
    }

    async fn close(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_links_sessions_and_carries_frames() {
        let network = MockNetwork::new();
        let a = network.factory("a").create_session("b").await.unwrap();
        let b = network.factory("b").create_session("a").await.unwrap();
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        let a_channel = a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert!(a_channel.is_open());
        let b_side = drain(&mut b_events).await;
        let b_channel = b_side
            .iter()
            .find_map(|event| match event {
                TransportEvent::DataChannel(channel) => Some(channel.clone()),
                _ => None,
            })
            .expect("inbound channel");
        assert!(b_side.iter().any(|event| matches!(
            event,
            TransportEvent::ConnectionState(ConnectionState::Connected)
        )));

        b_channel.send(Payload::from("hi")).await.unwrap();
        let a_side = drain(&mut a_events).await;
        assert!(a_side.iter().any(|event| matches!(
            event,
            TransportEvent::ChannelMessage { payload, .. } if payload.as_text() == Some("hi")
        )));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_answer_is_rejected() {
        let network = MockNetwork::new();
        let a = network.factory("a").create_session("b").await.unwrap();
        let b = network.factory("b").create_session("a").await.unwrap();

        let first = a.create_offer().await.unwrap();
        a.set_local_description(first.clone()).await.unwrap();
        b.set_remote_description(first).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();

        let second = a.create_offer().await.unwrap();
        a.set_local_description(second).await.unwrap();
        let err = a.set_remote_description(answer).await.unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));
        assert_eq!(network.count_ops("a", "b", MockOpKind::SetRemoteAnswer), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unavailable_network_refuses_sessions() {
        let network = MockNetwork::new();
        network.set_available(false);
        let factory = network.factory("a");
        assert!(matches!(
            factory.check_available().await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(factory.create_session("b").await.is_err());
    }
}
