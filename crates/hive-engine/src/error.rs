//! Error taxonomy for the dispatch core.
//!
//! `Redirect` is deliberately not an error: a driver asks for redirection via
//! [`crate::driver::StreamEnd::Redirect`] and the pipeline dispatches on that
//! variant instead of catching a raised signal.

/// Everything that can go wrong while admitting or running a generation.
#[derive(Debug, thiserror::Error)]
pub enum GenError {
    /// A hook listener or user-visible bad input refused the request.
    #[error("{0}")]
    User(String),

    /// A post-generate listener refused a produced image outright.
    #[error("{0}")]
    UserData(String),

    /// The acquire deadline elapsed before a matching worker freed up.
    #[error("timed out waiting for a worker")]
    Timeout,

    /// The claim's cancel token fired, or the owning session was torn down.
    #[error("generation cancelled")]
    Cancelled,

    /// The peer rejected our session token. Internal: the federation driver's
    /// session-recovery wrapper consumes this once before it surfaces.
    #[error("peer session invalidated")]
    SessionInvalid,

    /// A worker held a claim without emitting progress past the inactivity
    /// threshold.
    #[error("worker stalled without progress")]
    Stalled,

    /// The peer answered with our own server id at init. Never retried.
    #[error("federation peer is this instance itself")]
    LoopDetected,

    /// Talking to a remote worker or peer failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Anything else. Logged with its full chain; callers only see a generic
    /// message.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GenError {
    /// The message shown to the caller, per error kind.
    pub fn user_message(&self) -> String {
        match self {
            GenError::User(msg) | GenError::UserData(msg) => msg.clone(),
            GenError::Timeout => "All backends are occupied".to_string(),
            GenError::Cancelled => String::new(),
            GenError::SessionInvalid | GenError::Connection(_) | GenError::LoopDetected => {
                "Something went wrong while generating images.".to_string()
            }
            GenError::Stalled => "Something went wrong while generating images.".to_string(),
            GenError::Internal(_) => "Something went wrong while generating images.".to_string(),
        }
    }

    /// Cancellations are swallowed silently; everything else is reported.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, GenError::Cancelled)
    }

    /// Init failures that must not be retried by the init loop.
    pub(crate) fn is_fatal_for_init(&self) -> bool {
        matches!(self, GenError::LoopDetected)
    }
}
