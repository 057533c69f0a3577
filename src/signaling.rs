//! Signaling channel: a shared document per room plus an append-only
//! candidate sub-collection, exchanged between exactly two roles.
//!
//! The store itself is an external collaborator; the [`SignalingStore`]
//! trait is the whole contract the connection layer depends on.
//! [`MemorySignalingStore`] implements it in-process for tests and the
//! loopback demo binary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::Error;

/// The two fixed roles in a session. Decided once, immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Initiator,
    Responder,
}

impl PeerRole {
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Initiator => PeerRole::Responder,
            PeerRole::Responder => PeerRole::Initiator,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Initiator => write!(f, "initiator"),
            PeerRole::Responder => write!(f, "responder"),
        }
    }
}

/// The shared document for one room. The initiator writes `offer` once,
/// the responder writes `answer` once; no field is ever written by both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingRecord {
    pub offer: Option<String>,
    pub answer: Option<String>,
}

/// One entry in the room's append-only candidate sub-collection.
/// `from` tags the publisher so the consumer only applies candidates
/// written by the opposite role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate: String,
    pub from: PeerRole,
}

/// Contract of the signaling document store.
///
/// Subscriptions are push-based and long-lived: they deliver the current
/// state first (the room snapshot, or a replay of all existing
/// candidates) and then stream changes until the subscription is dropped
/// or the room is deleted. No ordering is guaranteed between record
/// changes and candidate additions; consumers re-check preconditions on
/// every event.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Create or replace the room document with the given offer.
    async fn publish_offer(&self, room_id: &str, offer: String) -> Result<(), Error>;

    /// Merge the answer into an existing room document.
    async fn publish_answer(&self, room_id: &str, answer: String) -> Result<(), Error>;

    /// Append a connectivity candidate tagged with the publisher's role.
    async fn publish_candidate(
        &self,
        room_id: &str,
        candidate: String,
        from: PeerRole,
    ) -> Result<(), Error>;

    /// Stream of room document snapshots, starting with the current one
    /// if the room exists.
    async fn watch_room(&self, room_id: &str) -> mpsc::UnboundedReceiver<SignalingRecord>;

    /// Stream of candidate records: replays all existing candidates,
    /// then streams additions.
    async fn watch_candidates(&self, room_id: &str) -> mpsc::UnboundedReceiver<CandidateRecord>;

    /// Delete the room document and its candidate sub-collection. Ends
    /// all subscriptions on the room.
    async fn delete_room(&self, room_id: &str) -> Result<(), Error>;
}

/// In-memory [`SignalingStore`] with snapshot-then-push subscription
/// semantics. Both peers must share the same instance.
#[derive(Default, Clone)]
pub struct MemorySignalingStore {
    rooms: Arc<Mutex<HashMap<String, RoomState>>>,
}

#[derive(Default)]
struct RoomState {
    record: SignalingRecord,
    candidates: Vec<CandidateRecord>,
    record_watchers: Vec<mpsc::UnboundedSender<SignalingRecord>>,
    candidate_watchers: Vec<mpsc::UnboundedSender<CandidateRecord>>,
}

impl RoomState {
    fn notify_record(&mut self) {
        let record = self.record.clone();
        self.record_watchers
            .retain(|tx| tx.send(record.clone()).is_ok());
    }

    fn notify_candidate(&mut self, candidate: &CandidateRecord) {
        self.candidate_watchers
            .retain(|tx| tx.send(candidate.clone()).is_ok());
    }
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the room record, if the room exists. Test hook.
    pub async fn record(&self, room_id: &str) -> Option<SignalingRecord> {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).map(|room| room.record.clone())
    }

    /// Number of candidates appended so far. Test hook.
    pub async fn candidate_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).map_or(0, |room| room.candidates.len())
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn publish_offer(&self, room_id: &str, offer: String) -> Result<(), Error> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        // Set semantics: a fresh offer replaces the whole record, so a
        // stale answer from an abandoned session cannot survive into
        // the new negotiation.
        room.record = SignalingRecord {
            offer: Some(offer),
            answer: None,
        };
        room.notify_record();
        debug!("signaling: offer published to room {}", room_id);
        Ok(())
    }

    async fn publish_answer(&self, room_id: &str, answer: String) -> Result<(), Error> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::Signaling(format!("room {} does not exist", room_id)))?;
        room.record.answer = Some(answer);
        room.notify_record();
        debug!("signaling: answer published to room {}", room_id);
        Ok(())
    }

    async fn publish_candidate(
        &self,
        room_id: &str,
        candidate: String,
        from: PeerRole,
    ) -> Result<(), Error> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        let record = CandidateRecord { candidate, from };
        room.candidates.push(record.clone());
        room.notify_candidate(&record);
        debug!("signaling: {} candidate appended to room {}", from, room_id);
        Ok(())
    }

    async fn watch_room(&self, room_id: &str) -> mpsc::UnboundedReceiver<SignalingRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock().await;
        // The room may not have been written yet; registering on an empty
        // room keeps the subscription alive for when it is.
        let room = rooms.entry(room_id.to_string()).or_default();
        if room.record.offer.is_some() || room.record.answer.is_some() {
            let _ = tx.send(room.record.clone());
        }
        room.record_watchers.push(tx);
        rx
    }

    async fn watch_candidates(&self, room_id: &str) -> mpsc::UnboundedReceiver<CandidateRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        for candidate in &room.candidates {
            let _ = tx.send(candidate.clone());
        }
        room.candidate_watchers.push(tx);
        rx
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), Error> {
        let mut rooms = self.rooms.lock().await;
        // Dropping the room drops every watcher sender, which ends the
        // subscription streams on the other side.
        rooms.remove(room_id);
        debug!("signaling: room {} deleted", room_id);
        Ok(())
    }
}
