use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use peerwire_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ConnectionState, DataChannel, Payload, SessionFactory, TransportEvent, TransportSession,
};
use crate::error::TransportError;

const TARGET: &str = "peerwire::transport::webrtc";

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(to_negotiation_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(to_negotiation_error),
    }
}

/// Sessions backed by `webrtc` peer connections.
pub struct WebRtcSessionFactory {
    ice_servers: Vec<String>,
}

impl WebRtcSessionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        if self.ice_servers.is_empty() {
            return RTCConfiguration::default();
        }
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn check_available(&self) -> Result<(), TransportError> {
        build_api(SettingEngine::default())
            .map(|_| ())
            .map_err(|err| TransportError::Unavailable(err.to_string()))
    }

    async fn create_session(
        &self,
        remote_peer: &str,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let api = build_api(SettingEngine::default())?;
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );
        let (events, receiver) = mpsc::unbounded_channel();

        let candidate_tx = events.clone();
        let remote = remote_peer.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            let remote = remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = TARGET, peer = %remote, error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let state_tx = events.clone();
        let remote = remote_peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = state_tx.clone();
            let remote = remote.clone();
            Box::pin(async move {
                tracing::debug!(target = TARGET, peer = %remote, ?state, "peer connection state changed");
                let _ = tx.send(TransportEvent::ConnectionState(map_state(state)));
            })
        }));

        let channel_tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = TARGET, label = dc.label(), "remote data channel announced");
                let channel = WebRtcChannel::attach(dc, tx.clone());
                let _ = tx.send(TransportEvent::DataChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcSession {
            pc,
            events,
            receiver: Mutex::new(Some(receiver)),
        }))
    }
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(dc_init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcChannel::attach(dc, self.events.clone()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.receiver.lock().take()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = TARGET, error = %err, "peer connection close failed");
        }
    }
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    fn attach(
        dc: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();

        let open_tx = events.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(target = TARGET, label = %open_label, "data channel opened");
                let _ = open_tx.send(TransportEvent::ChannelOpen { label: open_label });
            })
        }));

        let message_tx = events.clone();
        let message_label = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_tx.clone();
            let label = message_label.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    Payload::Binary(msg.data)
                };
                tracing::trace!(target = TARGET, label = %label, frame_len = payload.len(), "received frame");
                let _ = tx.send(TransportEvent::ChannelMessage { label, payload });
            })
        }));

        let close_tx = events;
        let close_label = label;
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            let label = close_label.clone();
            Box::pin(async move {
                tracing::trace!(target = TARGET, label = %label, "data channel closed");
                let _ = tx.send(TransportEvent::ChannelClosed { label });
            })
        }));

        Arc::new(WebRtcChannel { dc })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        let result = match payload {
            Payload::Text(text) => self.dc.send_text(text).await,
            Payload::Binary(bytes) => self.dc.send(&bytes).await,
        };
        result
            .map(|_| ())
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = TARGET, error = %err, "data channel close failed");
        }
    }
}
