//! Session manager: room identity, role assignment, validation, and
//! teardown policy.
//!
//! A session starts with a locally generated identifier. Arriving with an
//! externally supplied identifier (a shared link) fixes the role to
//! Responder; initiating a connection to a peer identifier fixes it to
//! Initiator. The role never changes afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::connection::{ConnectionCoordinator, ConnectionEvent};
use crate::error::Error;
use crate::signaling::{PeerRole, SignalingStore};
use crate::transfer::{self, ChunkSource, FileSource, FrameSink, TransferEvent, MAX_FILE_SIZE};

pub const ROOM_ID_LEN: usize = 13;

/// Random base-36 room identifier, 13 lowercase alphanumeric characters.
pub fn generate_room_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub struct Session {
    local_id: String,
    role: Mutex<Option<PeerRole>>,
    /// Room actually used for signaling: the peer's identifier when
    /// initiating, the supplied identifier when joining.
    room_id: Mutex<Option<String>>,
    store: Arc<dyn SignalingStore>,
    coordinator: Mutex<Option<ConnectionCoordinator>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl Session {
    /// Create a session. A supplied room identifier (e.g. from a shared
    /// link's query parameter) selects the Responder role and skips
    /// local identifier generation for the room.
    pub fn new(
        store: Arc<dyn SignalingStore>,
        joined_room: Option<String>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let local_id = generate_room_id();
        let (role, room_id) = match joined_room {
            Some(room) => (Some(PeerRole::Responder), Some(room)),
            None => (None, None),
        };
        info!("session created with local id {}", local_id);
        let session = Self {
            local_id,
            role: Mutex::new(role),
            room_id: Mutex::new(room_id),
            store,
            coordinator: Mutex::new(None),
            event_tx,
        };
        (session, event_rx)
    }

    /// Identifier shown to the user for sharing.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub async fn role(&self) -> Option<PeerRole> {
        *self.role.lock().await
    }

    /// Begin the Responder path. No-op for a session that did not join
    /// an existing room.
    pub async fn start(&self) -> Result<(), Error> {
        if *self.role.lock().await != Some(PeerRole::Responder) {
            return Ok(());
        }
        let room = match self.room_id.lock().await.clone() {
            Some(room) => room,
            None => return Ok(()),
        };
        let coordinator = ConnectionCoordinator::connect(
            PeerRole::Responder,
            &room,
            self.store.clone(),
            self.event_tx.clone(),
        )
        .await?;
        *self.coordinator.lock().await = Some(coordinator);
        Ok(())
    }

    /// Initiate a connection into the peer's room. Fixes the role to
    /// Initiator. Validation failures leave the session untouched.
    pub async fn connect_to(&self, peer_room_id: &str) -> Result<(), Error> {
        let peer_room_id = peer_room_id.trim();
        if peer_room_id.is_empty() {
            return Err(Error::EmptyPeerId);
        }
        if peer_room_id == self.local_id {
            return Err(Error::SelfConnection);
        }

        {
            let mut role = self.role.lock().await;
            if role.is_some() {
                return Err(Error::RoleAssigned);
            }
            *role = Some(PeerRole::Initiator);
        }
        *self.room_id.lock().await = Some(peer_room_id.to_string());

        let coordinator = ConnectionCoordinator::connect(
            PeerRole::Initiator,
            peer_room_id,
            self.store.clone(),
            self.event_tx.clone(),
        )
        .await?;
        *self.coordinator.lock().await = Some(coordinator);
        Ok(())
    }

    /// Send a file over the established channel. Validation (file
    /// selected, size ceiling, channel open) is synchronous; the
    /// transfer itself streams in the background and reports through
    /// the event stream.
    pub async fn send_file(&self, path: Option<PathBuf>) -> Result<(), Error> {
        let path = path.ok_or(Error::NoFileSelected)?;
        let source = FileSource::open(&path).await?;
        if source.len() > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge {
                size: source.len(),
                limit: MAX_FILE_SIZE,
            });
        }

        let sink = {
            let coordinator = self.coordinator.lock().await;
            coordinator
                .as_ref()
                .ok_or_else(|| Error::Channel("no active connection".to_string()))?
                .frame_sink()
                .await
                .ok_or_else(|| Error::Channel("data channel not ready".to_string()))?
        };
        if !sink.is_open() {
            return Err(Error::Channel("data channel is not open".to_string()));
        }

        let events = self.transfer_events();
        tokio::spawn(async move {
            // Failures are reported through the event stream.
            let _ = transfer::send_file(&sink, &source, &events).await;
        });
        Ok(())
    }

    /// Tear down the session: close the peer connection and, for the
    /// Initiator only, delete the room's signaling state. The Responder
    /// never deletes shared signaling state.
    pub async fn close(&self) {
        if let Some(coordinator) = self.coordinator.lock().await.take() {
            coordinator.close().await;
        }
        let role = *self.role.lock().await;
        if role == Some(PeerRole::Initiator) {
            let room = self.room_id.lock().await.clone();
            if let Some(room) = room {
                if let Err(e) = self.store.delete_room(&room).await {
                    warn!("failed to delete signaling state for room {}: {}", room, e);
                } else {
                    info!("signaling state for room {} deleted", room);
                }
            }
        }
        info!("session {} closed", self.local_id);
    }

    /// Sender that forwards transfer events into the session stream.
    fn transfer_events(&self) -> mpsc::Sender<TransferEvent> {
        let (tx, mut rx) = mpsc::channel::<TransferEvent>(64);
        let forward = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if forward.send(ConnectionEvent::Transfer(event)).await.is_err() {
                    break;
                }
            }
        });
        tx
    }
}
