use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not a decodable envelope (bad JSON, unknown
    /// `message_type`, or a missing field).
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
