use thiserror::Error;

/// Crate-wide error type.
///
/// Validation errors are returned synchronously from the call that raised
/// them and perform no state mutation. Negotiation, channel and protocol
/// failures that happen asynchronously are surfaced as events instead; the
/// variants here are what those events carry internally.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no file selected")]
    NoFileSelected,

    #[error("file size {size} exceeds the {limit} byte transfer limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("cannot connect to your own room id")]
    SelfConnection,

    #[error("peer room id is empty")]
    EmptyPeerId,

    #[error("session role is already assigned")]
    RoleAssigned,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("data channel error: {0}")]
    Channel(String),

    #[error("signaling store error: {0}")]
    Signaling(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl Error {
    /// True for errors the caller gets back synchronously before any
    /// state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NoFileSelected
                | Error::FileTooLarge { .. }
                | Error::SelfConnection
                | Error::EmptyPeerId
                | Error::RoleAssigned
        )
    }
}
