/// Errors returned across the reactor's public API boundary.
///
/// Retryable conditions (would-block, interrupted) never reach this type: they're
/// matched on `io::ErrorKind` internally and handled as reactor control flow.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O error occurred while binding, listening, opening or polling.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A lookup by tag or handle failed to find a live endpoint.
    #[error("no such endpoint: {0}")]
    NotFound(String),
    /// `read` or `write` was attempted outside of a handler callback, or a `read`
    /// was attempted from a timer callback (see the timer/read interaction rule).
    #[error("invalid i/o context: {0}")]
    InvalidContext(&'static str),
}
