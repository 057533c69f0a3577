//! Peer-to-peer file drop over WebRTC with room-based signaling.
//!
//! Two peers find each other through a shared room document (offer,
//! answer, and an append-only candidate collection), negotiate a direct
//! peer connection, and move files over the resulting ordered, reliable
//! data channel in 16 KiB chunks.

pub mod connection;
pub mod error;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use connection::{
    ConnectionCoordinator, ConnectionEvent, ConnectionState, DataChannelSink, DATA_CHANNEL_LABEL,
};
pub use error::Error;
pub use session::{generate_room_id, Session, ROOM_ID_LEN};
pub use signaling::{
    CandidateRecord, MemorySignalingStore, PeerRole, SignalingRecord, SignalingStore,
};
pub use transfer::{
    ChunkSource, FrameSink, ReceivedFile, TransferEvent, TransferProgress, CHUNK_SIZE,
    MAX_FILE_SIZE,
};
