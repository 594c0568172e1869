use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use peerwire_proto::{
    AnswerRecord, CandidateRecord, IceCandidate, JoinResponse, OfferRecord, PeerSummary,
    PollResponse, RoomSnapshot, SessionDescription, Signal, Stamp,
};
use tracing::{debug, trace};

use crate::clock::{Clock, StampClock, SystemClock};
use crate::error::MailboxError;
use crate::sweep::SweepReport;

#[derive(Debug, Clone)]
pub struct MailboxSettings {
    /// Records older than this are dropped whether or not anyone read them.
    pub retention: Duration,
    /// Mailboxes not touched for this long are evicted by the sweep.
    pub peer_timeout: Duration,
    /// Rooms idle for this long are evicted by the sweep.
    pub room_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(120),
            room_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records_deposited: u64,
    pub records_pruned: u64,
    pub mailboxes_evicted: u64,
    pub rooms_evicted: u64,
}

#[derive(Debug, Clone)]
struct Parked<T> {
    from: String,
    payload: T,
    enqueued_at: Stamp,
}

#[derive(Debug)]
struct Mailbox {
    /// False while the mailbox only exists as a delivery target.
    joined: bool,
    joined_at: Stamp,
    last_seen: Stamp,
    offers: VecDeque<Parked<SessionDescription>>,
    answers: VecDeque<Parked<SessionDescription>>,
    candidates: VecDeque<Parked<IceCandidate>>,
}

impl Mailbox {
    fn new(now: Stamp, joined: bool) -> Self {
        Self {
            joined,
            joined_at: now,
            last_seen: now,
            offers: VecDeque::new(),
            answers: VecDeque::new(),
            candidates: VecDeque::new(),
        }
    }

    fn mark_joined(&mut self, stamp: Stamp) {
        self.joined = true;
        self.joined_at = stamp;
        self.last_seen = stamp;
    }

    fn prune_before(&mut self, cutoff: Stamp) -> usize {
        fn prune<T>(queue: &mut VecDeque<Parked<T>>, cutoff: Stamp) -> usize {
            let before = queue.len();
            queue.retain(|record| record.enqueued_at >= cutoff);
            before - queue.len()
        }
        prune(&mut self.offers, cutoff)
            + prune(&mut self.answers, cutoff)
            + prune(&mut self.candidates, cutoff)
    }
}

#[derive(Debug)]
struct Room {
    host_id: Option<String>,
    mailboxes: HashMap<String, Mailbox>,
    created_at: Stamp,
    last_activity: Stamp,
    /// Set by the sweep or the last leave once the room is unlinked from the
    /// table; holders of a stale handle must look the room up again.
    retired: bool,
}

impl Room {
    fn new(now: Stamp) -> Self {
        Self {
            host_id: None,
            mailboxes: HashMap::new(),
            created_at: now,
            last_activity: now,
            retired: false,
        }
    }

    fn is_host(&self, peer_id: &str) -> bool {
        self.host_id.as_deref() == Some(peer_id)
    }

    fn summary(&self, peer_id: &str) -> PeerSummary {
        PeerSummary {
            peer_id: peer_id.to_string(),
            is_host: self.is_host(peer_id),
        }
    }

    fn joined_peers_except(&self, peer_id: &str) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .mailboxes
            .iter()
            .filter(|(id, mailbox)| mailbox.joined && id.as_str() != peer_id)
            .map(|(id, _)| self.summary(id))
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

struct StoreInner {
    rooms: DashMap<String, Arc<Mutex<Room>>>,
    clock: StampClock,
    settings: MailboxSettings,
    deposited: AtomicU64,
    pruned: AtomicU64,
    mailboxes_evicted: AtomicU64,
    rooms_evicted: AtomicU64,
}

/// Process-wide table of rooms. Cloning is cheap; clones share the table.
///
/// Rooms are locked individually so traffic in one room never waits on
/// another.
#[derive(Clone)]
pub struct MailboxStore {
    inner: Arc<StoreInner>,
}

impl Default for MailboxStore {
    fn default() -> Self {
        Self::new(MailboxSettings::default())
    }
}

impl MailboxStore {
    pub fn new(settings: MailboxSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: MailboxSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                rooms: DashMap::new(),
                clock: StampClock::new(clock),
                settings,
                deposited: AtomicU64::new(0),
                pruned: AtomicU64::new(0),
                mailboxes_evicted: AtomicU64::new(0),
                rooms_evicted: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &MailboxSettings {
        &self.inner.settings
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            records_deposited: self.inner.deposited.load(Ordering::Relaxed),
            records_pruned: self.inner.pruned.load(Ordering::Relaxed),
            mailboxes_evicted: self.inner.mailboxes_evicted.load(Ordering::Relaxed),
            rooms_evicted: self.inner.rooms_evicted.load(Ordering::Relaxed),
        }
    }

    /// Registers `peer_id` in `room_id`, creating the room on first contact.
    pub fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        is_host: bool,
    ) -> Result<JoinResponse, MailboxError> {
        require_id(room_id, "roomId must not be empty")?;
        require_id(peer_id, "peerId must not be empty")?;

        self.with_room(room_id, true, |room| {
            let stamp = self.inner.clock.next();
            room.last_activity = stamp;
            room.mailboxes
                .entry(peer_id.to_string())
                .or_insert_with(|| Mailbox::new(stamp, true))
                .mark_joined(stamp);
            if is_host {
                room.host_id = Some(peer_id.to_string());
            }
            let peers = room.joined_peers_except(peer_id);
            debug!(
                target = "peerwire::mailbox",
                room = %room_id,
                peer = %peer_id,
                is_host,
                known_peers = peers.len(),
                "peer joined room"
            );
            JoinResponse {
                success: true,
                peers,
                timestamp: stamp,
            }
        })
    }

    /// Parks `signal` in the mailbox of `target`, creating that mailbox if
    /// the target has not joined yet.
    pub fn deposit(
        &self,
        room_id: &str,
        from: &str,
        target: &str,
        signal: Signal,
    ) -> Result<Stamp, MailboxError> {
        require_id(room_id, "roomId must not be empty")?;
        require_id(from, "peerId must not be empty")?;
        require_id(target, "target must not be empty")?;

        let kind = signal.kind();
        let stamp = self.with_room(room_id, false, |room| {
            let stamp = self.inner.clock.next();
            room.last_activity = stamp;
            if let Some(sender) = room.mailboxes.get_mut(from) {
                sender.last_seen = stamp;
            }
            let mailbox = room
                .mailboxes
                .entry(target.to_string())
                .or_insert_with(|| Mailbox::new(stamp, false));
            let from = from.to_string();
            match signal {
                Signal::Offer(payload) => mailbox.offers.push_back(Parked {
                    from,
                    payload,
                    enqueued_at: stamp,
                }),
                Signal::Answer(payload) => mailbox.answers.push_back(Parked {
                    from,
                    payload,
                    enqueued_at: stamp,
                }),
                Signal::Candidate(payload) => mailbox.candidates.push_back(Parked {
                    from,
                    payload,
                    enqueued_at: stamp,
                }),
            }
            stamp
        })?;
        self.inner.deposited.fetch_add(1, Ordering::Relaxed);
        trace!(
            target = "peerwire::mailbox",
            room = %room_id,
            %from,
            %target,
            kind = kind.as_str(),
            stamp,
            "deposited signal"
        );
        Ok(stamp)
    }

    /// Returns everything addressed to `peer_id` newer than `since`, plus
    /// peers that joined after `since`, then prunes expired records.
    pub fn poll(
        &self,
        room_id: &str,
        peer_id: &str,
        since: Stamp,
    ) -> Result<PollResponse, MailboxError> {
        require_id(room_id, "roomId must not be empty")?;
        require_id(peer_id, "peerId must not be empty")?;

        let retention = self.inner.settings.retention.as_millis() as Stamp;
        let (response, pruned) = self.with_room(room_id, false, |room| {
            let stamp = self.inner.clock.next();
            let cutoff = stamp.saturating_sub(retention);
            room.last_activity = stamp;

            let mailbox = room
                .mailboxes
                .entry(peer_id.to_string())
                .or_insert_with(|| Mailbox::new(stamp, true));
            mailbox.last_seen = stamp;
            if !mailbox.joined {
                mailbox.mark_joined(stamp);
            }

            let fresh = |from: &str, enqueued_at: Stamp| {
                from != peer_id && enqueued_at > since && enqueued_at >= cutoff
            };
            let offers = mailbox
                .offers
                .iter()
                .filter(|r| fresh(&r.from, r.enqueued_at))
                .map(|r| OfferRecord {
                    from: r.from.clone(),
                    offer: r.payload.clone(),
                    timestamp: r.enqueued_at,
                })
                .collect();
            let answers = mailbox
                .answers
                .iter()
                .filter(|r| fresh(&r.from, r.enqueued_at))
                .map(|r| AnswerRecord {
                    from: r.from.clone(),
                    answer: r.payload.clone(),
                    timestamp: r.enqueued_at,
                })
                .collect();
            let candidates = mailbox
                .candidates
                .iter()
                .filter(|r| fresh(&r.from, r.enqueued_at))
                .map(|r| CandidateRecord {
                    from: r.from.clone(),
                    candidate: r.payload.clone(),
                    timestamp: r.enqueued_at,
                })
                .collect();

            let mut new_peers: Vec<PeerSummary> = room
                .mailboxes
                .iter()
                .filter(|(id, m)| m.joined && m.joined_at > since && id.as_str() != peer_id)
                .map(|(id, _)| room.summary(id))
                .collect();
            new_peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

            let pruned: usize = room
                .mailboxes
                .values_mut()
                .map(|m| m.prune_before(cutoff))
                .sum();

            let response = PollResponse {
                success: true,
                offers,
                answers,
                candidates,
                new_peers,
                timestamp: stamp,
            };
            (response, pruned)
        })?;

        if pruned > 0 {
            self.inner.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
            trace!(target = "peerwire::mailbox", room = %room_id, pruned, "pruned expired records");
        }
        Ok(response)
    }

    /// Drops the mailbox of `peer_id`; the room goes away with its last peer.
    pub fn leave(&self, room_id: &str, peer_id: &str) -> Result<(), MailboxError> {
        require_id(room_id, "roomId must not be empty")?;
        require_id(peer_id, "peerId must not be empty")?;

        self.with_room(room_id, false, |room| {
            room.mailboxes.remove(peer_id);
            if room.is_host(peer_id) {
                room.host_id = None;
            }
            room.last_activity = self.inner.clock.next();
            if room.mailboxes.is_empty() {
                room.retired = true;
                self.inner.rooms.remove(room_id);
            }
        })?;
        debug!(target = "peerwire::mailbox", room = %room_id, peer = %peer_id, "peer left room");
        Ok(())
    }

    pub fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let handle = self.inner.rooms.get(room_id).map(|entry| entry.clone())?;
        let room = handle.lock();
        if room.retired {
            return None;
        }
        Some(RoomSnapshot {
            room_id: room_id.to_string(),
            host_id: room.host_id.clone(),
            peers: room.joined_peers_except(""),
            created_at: room.created_at,
            last_activity: room.last_activity,
        })
    }

    /// Evicts stale mailboxes, then empty or idle rooms.
    pub fn sweep(&self) -> SweepReport {
        let now = self.inner.clock.now();
        let settings = &self.inner.settings;
        let peer_cutoff = now.saturating_sub(settings.peer_timeout.as_millis() as Stamp);
        let room_cutoff = now.saturating_sub(settings.room_timeout.as_millis() as Stamp);

        let handles: Vec<(String, Arc<Mutex<Room>>)> = self
            .inner
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut report = SweepReport::default();
        for (room_id, handle) in handles {
            let mut room = handle.lock();
            if room.retired {
                continue;
            }
            let before = room.mailboxes.len();
            room.mailboxes
                .retain(|_, mailbox| mailbox.last_seen >= peer_cutoff);
            let evicted = before - room.mailboxes.len();
            report.mailboxes_evicted += evicted;

            if room.mailboxes.is_empty() || room.last_activity < room_cutoff {
                room.retired = true;
                report.mailboxes_evicted += room.mailboxes.len();
                room.mailboxes.clear();
                self.inner.rooms.remove(&room_id);
                report.rooms_evicted += 1;
                debug!(target = "peerwire::mailbox", room = %room_id, "evicted room");
            }
        }

        self.inner
            .mailboxes_evicted
            .fetch_add(report.mailboxes_evicted as u64, Ordering::Relaxed);
        self.inner
            .rooms_evicted
            .fetch_add(report.rooms_evicted as u64, Ordering::Relaxed);
        report
    }

    fn with_room<T>(
        &self,
        room_id: &str,
        create: bool,
        apply: impl FnOnce(&mut Room) -> T,
    ) -> Result<T, MailboxError> {
        loop {
            let handle = if create {
                self.inner
                    .rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Room::new(self.inner.clock.now()))))
                    .clone()
            } else {
                match self.inner.rooms.get(room_id) {
                    Some(entry) => entry.clone(),
                    None => return Err(MailboxError::RoomNotFound(room_id.to_string())),
                }
            };
            let mut room = handle.lock();
            if room.retired {
                // Unlinked between lookup and lock; the table no longer holds
                // this handle, so the next lookup sees the replacement.
                continue;
            }
            return Ok(apply(&mut room));
        }
    }
}

fn require_id(value: &str, message: &'static str) -> Result<(), MailboxError> {
    if value.trim().is_empty() {
        Err(MailboxError::InvalidRequest(message))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(start: Stamp) -> (MailboxStore, Arc<ManualClock>) {
        let clock = ManualClock::new(start);
        let store = MailboxStore::with_clock(MailboxSettings::default(), clock.clone());
        (store, clock)
    }

    #[test_timeout::timeout]
    fn join_reports_other_peers_and_host_flag() {
        let (store, _) = store_at(10_000);
        let host = store.join("R1", "host", true).unwrap();
        assert!(host.peers.is_empty());

        let joined = store.join("R1", "alice", false).unwrap();
        assert_eq!(
            joined.peers,
            vec![PeerSummary {
                peer_id: "host".into(),
                is_host: true
            }]
        );
        assert!(joined.timestamp > host.timestamp);
    }

    #[test_timeout::timeout]
    fn deposit_to_unjoined_target_is_kept_until_join() {
        let (store, _) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store
            .deposit("R1", "host", "late", Signal::Offer(SessionDescription::offer("o")))
            .unwrap();

        // Target-only mailboxes are not announced as peers.
        let host_view = store.join("R1", "host", true).unwrap();
        assert!(host_view.peers.is_empty());

        store.join("R1", "late", false).unwrap();
        let polled = store.poll("R1", "late", 0).unwrap();
        assert_eq!(polled.offers.len(), 1);
        assert_eq!(polled.offers[0].from, "host");
    }

    #[test_timeout::timeout]
    fn poll_only_returns_records_addressed_to_requester() {
        let (store, _) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store.join("R1", "a", false).unwrap();
        store.join("R1", "b", false).unwrap();
        store
            .deposit("R1", "host", "a", Signal::Offer(SessionDescription::offer("for-a")))
            .unwrap();
        store
            .deposit("R1", "host", "b", Signal::Offer(SessionDescription::offer("for-b")))
            .unwrap();

        let polled = store.poll("R1", "a", 0).unwrap();
        assert_eq!(polled.offers.len(), 1);
        assert_eq!(polled.offers[0].offer.sdp, "for-a");
    }

    #[test_timeout::timeout]
    fn sequential_polls_never_repeat_records() {
        let (store, _) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store.join("R1", "a", false).unwrap();
        store
            .deposit("R1", "a", "host", Signal::Answer(SessionDescription::answer("x")))
            .unwrap();

        let first = store.poll("R1", "host", 0).unwrap();
        assert_eq!(first.answers.len(), 1);
        store
            .deposit("R1", "a", "host", Signal::Answer(SessionDescription::answer("y")))
            .unwrap();
        let second = store.poll("R1", "host", first.timestamp).unwrap();
        assert_eq!(second.answers.len(), 1);
        assert_eq!(second.answers[0].answer.sdp, "y");
        assert!(second
            .answers
            .iter()
            .all(|record| record.timestamp > first.timestamp));
        assert!(second.new_peers.is_empty());
    }

    #[test_timeout::timeout]
    fn records_expire_after_retention_even_if_unread() {
        let (store, clock) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store
            .deposit("R1", "a", "host", Signal::Offer(SessionDescription::offer("stale")))
            .unwrap();

        clock.advance(Duration::from_secs(31));
        let polled = store.poll("R1", "host", 0).unwrap();
        assert!(polled.offers.is_empty());
        assert_eq!(store.stats().records_pruned, 1);
    }

    #[test_timeout::timeout]
    fn rejoin_reannounces_peer() {
        let (store, _) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store.join("R1", "a", false).unwrap();
        let cursor = store.poll("R1", "host", 0).unwrap().timestamp;

        store.join("R1", "a", false).unwrap();
        let polled = store.poll("R1", "host", cursor).unwrap();
        assert_eq!(polled.new_peers.len(), 1);
        assert_eq!(polled.new_peers[0].peer_id, "a");
    }

    #[test_timeout::timeout]
    fn deposit_and_poll_require_existing_room() {
        let (store, _) = store_at(10_000);
        let err = store
            .deposit("nope", "a", "b", Signal::Offer(SessionDescription::offer("o")))
            .unwrap_err();
        assert_eq!(err, MailboxError::RoomNotFound("nope".into()));
        assert!(matches!(
            store.poll("nope", "a", 0),
            Err(MailboxError::RoomNotFound(_))
        ));
        assert!(matches!(
            store.join(" ", "a", false),
            Err(MailboxError::InvalidRequest(_))
        ));
    }

    #[test_timeout::timeout]
    fn leave_clears_host_and_drops_empty_room() {
        let (store, _) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store.join("R1", "a", false).unwrap();
        store.leave("R1", "host").unwrap();
        assert_eq!(store.snapshot("R1").unwrap().host_id, None);

        store.leave("R1", "a").unwrap();
        assert!(store.snapshot("R1").is_none());
        assert_eq!(store.room_count(), 0);
        // A fresh join recreates the room.
        store.join("R1", "a", false).unwrap();
        assert_eq!(store.room_count(), 1);
    }

    #[test_timeout::timeout]
    fn sweep_evicts_stale_mailboxes_then_idle_rooms() {
        let (store, clock) = store_at(10_000);
        store.join("R1", "host", true).unwrap();
        store.join("R1", "a", false).unwrap();
        store.join("R2", "solo", true).unwrap();

        clock.advance(Duration::from_secs(90));
        store.poll("R1", "host", 0).unwrap();
        clock.advance(Duration::from_secs(60));

        let report = store.sweep();
        // "a" and "solo" went quiet; R2 is empty afterwards.
        assert_eq!(report.mailboxes_evicted, 2);
        assert_eq!(report.rooms_evicted, 1);
        let snapshot = store.snapshot("R1").unwrap();
        assert_eq!(snapshot.peers.len(), 1);
        assert!(store.snapshot("R2").is_none());
    }
}
