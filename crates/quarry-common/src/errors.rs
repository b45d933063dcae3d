// The error taxonomy shared between the server client and the listener loops.
// Each variant names a semantic failure kind; how a kind is handled (retry,
// budget, surface) is decided per operation by the listener.

use thiserror::Error;

/// Literal phrase the token endpoint embeds when it rejects a request
/// because the client clock disagrees with the server clock.
pub const CLOCK_SKEW_PHRASE: &str = "Current server time is";

/// Errors surfaced by `AgentServer` operations and the credential exchange.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The operation observed the caller's cancellation.
    #[error("the operation was canceled")]
    Cancelled,

    /// The agent's OAuth authorization has been revoked server-side.
    #[error("the agent access token has been revoked: {0}")]
    AccessTokenRevoked(String),

    /// Connection-level failure (DNS, connect, TLS, reset).
    #[error("socket failure reaching the server: {0}")]
    SocketFailure(String),

    /// The agent registration no longer exists on the server.
    #[error("the agent no longer exists on the server: {0}")]
    AgentNotFound(String),

    /// The agent pool no longer exists on the server.
    #[error("the agent pool no longer exists on the server: {0}")]
    PoolNotFound(String),

    /// The credentials are valid but not authorized for the pool.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Another live agent instance already owns a session for this agent.
    #[error("a session already exists for this agent: {0}")]
    SessionConflict(String),

    /// The server discarded the session (idle timeout, server roll, ...).
    #[error("the session is no longer valid: {0}")]
    SessionExpired(String),

    /// The OAuth token endpoint rejected the token request. Carries the raw
    /// server message; see [`ServerError::is_clock_skew`].
    #[error("failed to acquire an access token: {0}")]
    OAuthTokenRequest(String),

    /// Any other non-success HTTP reply.
    #[error("server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Everything else (serialization, protocol violations, ...).
    #[error("{0}")]
    Other(String),
}

impl ServerError {
    /// Whether this is the cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ServerError::Cancelled)
    }

    /// Whether this error indicates a client/server clock disagreement.
    ///
    /// The token endpoint does not expose a structured code for this today,
    /// so detection keys off the literal phrase in the server message. Kept
    /// behind this single predicate so a structured code can replace it.
    pub fn is_clock_skew(&self) -> bool {
        matches!(self, ServerError::OAuthTokenRequest(message) if message.contains(CLOCK_SKEW_PHRASE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_skew_requires_oauth_kind_and_phrase() {
        let skew = ServerError::OAuthTokenRequest(
            "Current server time is 2026-08-01T10:00:00Z, token not yet valid".to_string(),
        );
        assert!(skew.is_clock_skew());

        let plain_oauth = ServerError::OAuthTokenRequest("invalid_client".to_string());
        assert!(!plain_oauth.is_clock_skew());

        // The phrase alone is not enough on another kind.
        let other = ServerError::Other("Current server time is 10:00".to_string());
        assert!(!other.is_clock_skew());
    }

    #[test]
    fn cancelled_marker() {
        assert!(ServerError::Cancelled.is_cancelled());
        assert!(!ServerError::Other("x".into()).is_cancelled());
    }
}
