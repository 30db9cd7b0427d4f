use std::io;

/// Errors raised by the multipath session controller.
#[derive(Debug, thiserror::Error)]
pub enum MultipathError {
    /// Malformed or missing caller input. No state was changed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Session configuration rejected when the session was built.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The buffer exceeds the chosen subflow's maximum segment size.
    #[error("Message of {len} bytes exceeds MSS of {mss} bytes")]
    MessageTooLarge { len: usize, mss: usize },

    /// Send queue full, or the subflow is not connected and the caller cannot wait.
    #[error("Operation would block")]
    WouldBlock,

    /// The delivery queue is at its limit; the packet was dropped.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Duplicate promotion or close. Absorbed by event handlers.
    #[error("Operation already in progress")]
    AlreadyInProgress,

    /// The underlying connect/bind/listen failed.
    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Unexpected packet or handshake option on a subflow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A joining subflow presented a token that matches no session.
    #[error("Subflow not authorized: {0}")]
    NotAuthorized(String),

    #[error("Timed out waiting for connection")]
    Timeout,

    #[error("Session closed")]
    SessionClosed,
}

impl MultipathError {
    /// Non-fatal conditions the caller is expected to retry or tolerate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MultipathError::WouldBlock
                | MultipathError::ResourceExhausted(_)
                | MultipathError::AlreadyInProgress
        )
    }
}

pub type Result<T> = std::result::Result<T, MultipathError>;
