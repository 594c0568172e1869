//! Offer/answer steps for a single peer record.
//!
//! Every step takes the record's negotiation slot without waiting. A step
//! that finds the slot busy is re-run later by a record timer; a step that
//! finds the record in a state it must not touch is dropped.

use std::sync::Arc;

use peerwire_proto::SessionDescription;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{MeshError, TransportError};
use crate::peer::{PeerRecord, PeerState};
use crate::supervisor::{Deferred, Install, MeshEvent, MeshInner, TARGET};
use crate::transport::{ConnectionState, TransportEvent};

impl MeshInner {
    /// Starts an offer toward `record`'s peer unless a negotiation is
    /// already under way or finished.
    pub(crate) async fn create_and_send_offer(
        self: &Arc<Self>,
        record: &Arc<PeerRecord>,
    ) -> Result<(), MeshError> {
        if record.is_connected() || record.state().blocks_local_offer() {
            debug!(target = TARGET, peer = %record.peer_id, state = %record.state(), "offer skipped");
            return Ok(());
        }
        let Some(_slot) = record.try_negotiate() else {
            debug!(target = TARGET, peer = %record.peer_id, "offer skipped, negotiation in progress");
            return Ok(());
        };
        if record.state().blocks_local_offer() || record.is_torn_down() {
            return Ok(());
        }

        record.set_state(PeerState::Connecting);
        let offer = match self.prepare_offer(record).await {
            Ok(offer) => offer,
            Err(err) => {
                record.set_state(PeerState::Failed);
                return Err(err.into());
            }
        };
        record.set_state(PeerState::OfferSent);
        self.signaling.send_offer(&record.peer_id, offer).await?;
        trace!(target = TARGET, peer = %record.peer_id, generation = record.generation, "offer sent");
        Ok(())
    }

    async fn prepare_offer(
        &self,
        record: &PeerRecord,
    ) -> Result<SessionDescription, TransportError> {
        if record.channel().is_none() {
            let channel = record
                .session
                .create_data_channel(&self.config.channel_label)
                .await?;
            record.set_channel(channel);
        }
        let offer = record.session.create_offer().await?;
        record.session.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    pub(crate) async fn handle_offer(
        self: &Arc<Self>,
        from: String,
        offer: SessionDescription,
        attempt: u32,
    ) -> Result<(), MeshError> {
        if from == self.local_id || self.is_stopped() {
            return Ok(());
        }

        let record = match self.record(&from).await {
            Some(record) if !record.state().is_terminal() => {
                let restarted = matches!(
                    record.state(),
                    PeerState::OfferReceived | PeerState::AnswerSent
                ) && record.has_applied_offer()
                    && !record.applied_offer_matches(&offer.sdp);
                if restarted {
                    debug!(target = TARGET, peer = %from, "peer restarted negotiation, replacing record");
                    match self
                        .install_record(
                            &from,
                            record.remote_is_host,
                            false,
                            Install::Replace {
                                generation: record.generation,
                            },
                        )
                        .await?
                    {
                        Some(fresh) => fresh,
                        None => return Ok(()),
                    }
                } else {
                    record
                }
            }
            _ => match self
                .install_record(&from, false, false, Install::IfVacant)
                .await?
            {
                Some(fresh) => fresh,
                None => match self.record(&from).await {
                    Some(existing) => existing,
                    None => return Ok(()),
                },
            },
        };

        if record.is_connected() || record.state() == PeerState::Connected {
            debug!(target = TARGET, peer = %from, "offer ignored, already connected");
            return Ok(());
        }
        if record.applied_offer_matches(&offer.sdp) {
            trace!(target = TARGET, peer = %from, "duplicate offer ignored");
            return Ok(());
        }

        let Some(_slot) = record.try_negotiate() else {
            self.retry_busy(
                &record,
                attempt,
                Deferred::Offer {
                    from: from.clone(),
                    offer,
                    attempt: attempt + 1,
                },
            );
            return Ok(());
        };

        let state = record.state();
        if state.rejects_remote_offer() {
            if state == PeerState::OfferSent {
                record.mark_glare();
                debug!(target = TARGET, peer = %from, "offer collided with our own, rejecting");
            } else {
                debug!(target = TARGET, peer = %from, %state, "offer rejected");
            }
            return Ok(());
        }
        if record.applied_offer_matches(&offer.sdp) || record.is_torn_down() {
            return Ok(());
        }

        record.set_state(PeerState::Connecting);
        let answer = match self.accept_offer(&record, &offer).await {
            Ok(answer) => answer,
            Err(err) => {
                record.set_state(PeerState::Failed);
                return Err(err.into());
            }
        };
        record.set_state(PeerState::AnswerSent);
        self.signaling.send_answer(&from, answer).await?;
        trace!(target = TARGET, peer = %from, generation = record.generation, "answer sent");
        Ok(())
    }

    async fn accept_offer(
        &self,
        record: &PeerRecord,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        record
            .session
            .set_remote_description(offer.clone())
            .await?;
        record.set_applied_offer(&offer.sdp);
        record.set_state(PeerState::OfferReceived);
        self.flush_candidates(record).await;
        let answer = record.session.create_answer().await?;
        record
            .session
            .set_local_description(answer.clone())
            .await?;
        Ok(answer)
    }

    pub(crate) async fn handle_answer(
        self: &Arc<Self>,
        from: String,
        answer: SessionDescription,
        attempt: u32,
    ) -> Result<(), MeshError> {
        if from == self.local_id || self.is_stopped() {
            return Ok(());
        }

        let record = match self.record(&from).await {
            Some(record) if !record.state().is_terminal() => record,
            _ => {
                // Our own record is not there yet; start one and look at
                // this answer again shortly.
                let installed = self
                    .install_record(&from, false, true, Install::IfVacant)
                    .await?;
                let Some(record) = installed.or(self.record(&from).await) else {
                    return Ok(());
                };
                if record.initiator {
                    self.create_and_send_offer(&record).await?;
                }
                self.retry_busy(
                    &record,
                    attempt,
                    Deferred::Answer {
                        from,
                        answer,
                        attempt: attempt + 1,
                    },
                );
                return Ok(());
            }
        };

        if record.state().rejects_answer() {
            trace!(target = TARGET, peer = %from, state = %record.state(), "answer ignored");
            return Ok(());
        }
        let Some(_slot) = record.try_negotiate() else {
            self.retry_busy(
                &record,
                attempt,
                Deferred::Answer {
                    from: from.clone(),
                    answer,
                    attempt: attempt + 1,
                },
            );
            return Ok(());
        };
        if record.state().rejects_answer() || record.is_torn_down() {
            return Ok(());
        }

        if let Err(err) = record.session.set_remote_description(answer).await {
            debug!(target = TARGET, peer = %from, error = %err, "stale answer dropped");
            return Ok(());
        }
        record.set_state(PeerState::AnswerReceived);
        self.flush_candidates(&record).await;
        Ok(())
    }

    fn retry_busy(self: &Arc<Self>, record: &PeerRecord, attempt: u32, action: Deferred) {
        let policy = self.config.busy_retry;
        if !policy.allows(attempt + 1) {
            warn!(target = TARGET, peer = %record.peer_id, attempt, "dropping signal after repeated busy retries");
            return;
        }
        trace!(target = TARGET, peer = %record.peer_id, attempt, "peer busy, retrying signal");
        self.schedule(record, policy.delay, action);
    }

    async fn flush_candidates(&self, record: &PeerRecord) {
        for candidate in record.remote_description_applied() {
            if let Err(err) = record.session.add_ice_candidate(candidate).await {
                debug!(target = TARGET, peer = %record.peer_id, error = %err, "buffered candidate rejected");
            }
        }
    }

    /// Drains one record's transport events until the record is torn down.
    pub(crate) async fn pump(
        self: Arc<Self>,
        record: Arc<PeerRecord>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if record.is_torn_down() || self.is_stopped() {
                break;
            }
            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    if let Err(err) = self
                        .signaling
                        .send_candidate(&record.peer_id, candidate)
                        .await
                    {
                        debug!(target = TARGET, peer = %record.peer_id, error = %err, "candidate not delivered");
                    }
                }
                TransportEvent::ConnectionState(state) => match state {
                    ConnectionState::Connected => self.mark_connected(&record),
                    ConnectionState::Failed | ConnectionState::Closed => {
                        self.transport_failed(&record)
                    }
                    ConnectionState::Disconnected => {
                        debug!(target = TARGET, peer = %record.peer_id, "transport disconnected, waiting for recovery");
                    }
                    ConnectionState::New | ConnectionState::Connecting => {
                        trace!(target = TARGET, peer = %record.peer_id, ?state, "transport state");
                    }
                },
                TransportEvent::DataChannel(channel) => {
                    let open = channel.is_open();
                    record.set_channel(channel);
                    if open {
                        self.mark_connected(&record);
                    }
                }
                TransportEvent::ChannelOpen { .. } => self.mark_connected(&record),
                TransportEvent::ChannelMessage { payload, .. } => {
                    self.emit(MeshEvent::Message {
                        from: record.peer_id.clone(),
                        payload,
                    });
                }
                TransportEvent::ChannelClosed { label } => {
                    if record.is_connected() {
                        debug!(target = TARGET, peer = %record.peer_id, %label, "data channel closed");
                        self.transport_failed(&record);
                    }
                }
            }
        }
    }
}
