// The session lifecycle and message loop.
// Creates and recovers sessions, long-polls for messages, classifies errors,
// drives the backoff budgets, and decrypts message bodies.

use crate::agent_server::{
    AgentServer, ConnectionChannel, TaskAgentMessage, TaskAgentReference, TaskAgentSession,
};
use crate::backoff::{self, BackoffPolicy, RetryCall};
use crate::capabilities::CapabilitiesManager;
use crate::message_decryption::{decrypt_message, RsaKeyStore};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use quarry_common::credential_data::CredentialData;
use quarry_common::errors::ServerError;
use quarry_common::host_context::HostContext;
use quarry_common::knobs::{knob_names, ConfigurationManager};
use quarry_common::settings::AgentSettings;
use quarry_common::terminal::Terminal;
use quarry_common::tracing::Tracing;
use quarry_sdk::TraceWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Independent deadline for message/session deletion; these must still run
/// during shutdown, so they never observe the caller's cancellation.
const MESSAGE_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Quiet period after which a single informational heartbeat line is traced.
const HEARTBEAT_TRACE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Elapsed-time budget for retrying session conflicts.
pub const SESSION_CONFLICT_RETRY_LIMIT: Duration = Duration::from_secs(4 * 60);

/// Elapsed-time budget for retrying clock-skew token failures.
pub const CLOCK_SKEW_RETRY_LIMIT: Duration = Duration::from_secs(30 * 60);

// ---------------------------------------------------------------------------
// Retry budgets
// ---------------------------------------------------------------------------

/// Elapsed-time budgets for the two slow-burning session-create failures.
/// The two budgets are independent; both reset on any successful session
/// creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryBudgets {
    session_conflict: Duration,
    clock_skew: Duration,
}

impl RetryBudgets {
    fn reset(&mut self) {
        *self = RetryBudgets::default();
    }

    /// Charge a conflict retry. Returns whether retrying may continue.
    fn charge_session_conflict(&mut self, interval: Duration) -> bool {
        self.session_conflict += interval;
        self.session_conflict < SESSION_CONFLICT_RETRY_LIMIT
    }

    /// Charge a clock-skew retry. Returns whether retrying may continue.
    fn charge_clock_skew(&mut self, interval: Duration) -> bool {
        self.clock_skew += interval;
        self.clock_skew < CLOCK_SKEW_RETRY_LIMIT
    }

    /// Time spent retrying session conflicts since the last success.
    pub fn session_conflict_elapsed(&self) -> Duration {
        self.session_conflict
    }

    /// Time spent retrying clock-skew failures since the last success.
    pub fn clock_skew_elapsed(&self) -> Duration {
        self.clock_skew
    }
}

// ---------------------------------------------------------------------------
// Error dispositions
// ---------------------------------------------------------------------------

/// What a loop does with a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Raise to the caller unchanged.
    Propagate,
    /// Give up: the condition will not heal by retrying.
    Fatal,
    /// Absorb, count, back off, retry.
    Retry,
    /// Recreate the session, then continue.
    Recover,
}

fn classify_session_create(error: &ServerError) -> Disposition {
    match error {
        ServerError::Cancelled
        | ServerError::AccessTokenRevoked(_)
        | ServerError::SocketFailure(_) => Disposition::Propagate,
        ServerError::AgentNotFound(_)
        | ServerError::PoolNotFound(_)
        | ServerError::AccessDenied(_) => Disposition::Fatal,
        // Conflicts and clock skew retry under their elapsed-time budgets;
        // everything else retries unbudgeted.
        ServerError::SessionConflict(_)
        | ServerError::SessionExpired(_)
        | ServerError::OAuthTokenRequest(_)
        | ServerError::Http { .. }
        | ServerError::Other(_) => Disposition::Retry,
    }
}

fn classify_get_next_message(error: &ServerError) -> Disposition {
    match error {
        ServerError::Cancelled | ServerError::AccessTokenRevoked(_) => Disposition::Propagate,
        ServerError::AgentNotFound(_)
        | ServerError::PoolNotFound(_)
        | ServerError::AccessDenied(_) => Disposition::Fatal,
        ServerError::SessionExpired(_) => Disposition::Recover,
        ServerError::SocketFailure(_)
        | ServerError::SessionConflict(_)
        | ServerError::OAuthTokenRequest(_)
        | ServerError::Http { .. }
        | ServerError::Other(_) => Disposition::Retry,
    }
}

// ---------------------------------------------------------------------------
// MessageListener
// ---------------------------------------------------------------------------

/// Owns the server session and the long-poll loop.
///
/// The poll path (`create_session` / `get_next_message`) is the single
/// writer of `session` and `last_message_id`; the keepalive task only reads
/// the session id.
pub struct MessageListener {
    trace: Tracing,
    terminal: Arc<Terminal>,
    settings: AgentSettings,
    credentials: CredentialData,
    agent_server: Arc<dyn AgentServer>,
    capabilities: Arc<dyn CapabilitiesManager>,
    rsa_keys: Arc<dyn RsaKeyStore>,
    config: Arc<dyn ConfigurationManager>,

    session: RwLock<Option<TaskAgentSession>>,
    last_message_id: Mutex<Option<u64>>,
    budgets: Mutex<RetryBudgets>,
    last_message_at: Mutex<Instant>,
}

impl MessageListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<HostContext>,
        settings: AgentSettings,
        credentials: CredentialData,
        agent_server: Arc<dyn AgentServer>,
        terminal: Arc<Terminal>,
        capabilities: Arc<dyn CapabilitiesManager>,
        rsa_keys: Arc<dyn RsaKeyStore>,
        config: Arc<dyn ConfigurationManager>,
    ) -> Self {
        let trace = context.get_trace("MessageListener");
        Self {
            trace,
            terminal,
            settings,
            credentials,
            agent_server,
            capabilities,
            rsa_keys,
            config,
            session: RwLock::new(None),
            last_message_id: Mutex::new(None),
            budgets: Mutex::new(RetryBudgets::default()),
            last_message_at: Mutex::new(Instant::now()),
        }
    }

    /// The current session id, if a session is established.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.read().as_ref().map(|s| s.session_id)
    }

    /// The id of the last message returned within the current session.
    pub fn last_message_id(&self) -> Option<u64> {
        *self.last_message_id.lock()
    }

    /// Snapshot of the retry budgets.
    pub fn retry_budgets(&self) -> RetryBudgets {
        *self.budgets.lock()
    }

    /// The backoff policy in effect, read fresh from the knob.
    fn backoff_policy(&self) -> BackoffPolicy {
        if self
            .config
            .get_bool(knob_names::ENABLE_PROGRESSIVE_RETRY_BACKOFF)
            .unwrap_or(false)
        {
            BackoffPolicy::Progressive
        } else {
            BackoffPolicy::Legacy
        }
    }

    /// Sleep, waking immediately when `cancel` fires.
    async fn sleep_or_cancel(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ServerError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(ServerError::Cancelled),
        }
    }

    // -----------------------------------------------------------------------
    // CreateSession
    // -----------------------------------------------------------------------

    /// Connect and create a session for this agent.
    ///
    /// Returns `Ok(true)` on success (budgets cleared), `Ok(false)` when the
    /// failure is non-retriable or a retry budget ran out. Cancellation,
    /// revoked tokens, and socket failures propagate as `Err`.
    pub async fn create_session(&self, cancel: &CancellationToken) -> Result<bool, ServerError> {
        self.trace.entering("create_session");

        let server_url = Url::parse(&self.settings.server_url)
            .map_err(|e| ServerError::Other(format!("Invalid server URL: {e}")))?;

        let owner_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| self.settings.agent_name.clone());

        let descriptor = TaskAgentSession::descriptor(
            owner_name,
            TaskAgentReference {
                id: self.settings.agent_id,
                name: self.settings.agent_name.clone(),
                version: quarry_sdk::build_constants::AgentPackage::VERSION.to_string(),
                os_description: format!(
                    "{} {}",
                    quarry_common::constants::CURRENT_PLATFORM,
                    quarry_common::constants::CURRENT_ARCHITECTURE
                ),
            },
            self.capabilities.discover(),
        );
        self.trace.verbose_object(&descriptor);

        let mut consecutive_errors = 0u32;
        let mut previous_interval: Option<Duration> = None;
        let mut encountered_error = false;

        loop {
            if cancel.is_cancelled() {
                return Err(ServerError::Cancelled);
            }

            let attempt = async {
                self.agent_server
                    .connect(server_url.clone(), self.credentials.clone())
                    .await?;
                self.agent_server
                    .create_agent_session(self.settings.pool_id, &descriptor, cancel.child_token())
                    .await
            }
            .await;

            match attempt {
                Ok(session) => {
                    self.trace
                        .info(&format!("Session created: {}", session.session_id));
                    if encountered_error {
                        self.terminal
                            .write_success_message("Agent reconnected to the server.");
                    }
                    *self.session.write() = Some(session);
                    *self.last_message_id.lock() = None;
                    *self.last_message_at.lock() = Instant::now();
                    self.budgets.lock().reset();
                    self.trace.leaving("create_session");
                    return Ok(true);
                }

                Err(error) => match classify_session_create(&error) {
                    Disposition::Propagate => {
                        if matches!(error, ServerError::SocketFailure(_)) {
                            self.trace.error(&format!(
                                "The agent could not reach the server. Check network and firewall configuration. {}",
                                error
                            ));
                            self.terminal.write_error(&error.to_string());
                        }
                        return Err(error);
                    }

                    Disposition::Fatal => {
                        if matches!(error, ServerError::AgentNotFound(_)) {
                            self.trace.error("MissingAgent");
                        }
                        self.trace.error_err(&error);
                        self.terminal.write_error(&error.to_string());
                        return Ok(false);
                    }

                    Disposition::Retry | Disposition::Recover => {
                        consecutive_errors += 1;
                        let interval = {
                            let mut rng = rand::thread_rng();
                            backoff::retry_interval(
                                RetryCall::SessionCreate,
                                self.backoff_policy(),
                                consecutive_errors,
                                previous_interval,
                                &mut rng,
                            )
                        };
                        previous_interval = Some(interval);

                        // Conflict and clock-skew retries burn their
                        // elapsed-time budgets; exhaustion is terminal for
                        // that cause only.
                        if matches!(error, ServerError::SessionConflict(_)) {
                            if !self.budgets.lock().charge_session_conflict(interval) {
                                self.trace.error(&format!(
                                    "The session conflict did not clear within {} minutes; stop retrying. {}",
                                    SESSION_CONFLICT_RETRY_LIMIT.as_secs() / 60,
                                    error
                                ));
                                self.terminal.write_error(&error.to_string());
                                return Ok(false);
                            }
                        } else if error.is_clock_skew() {
                            if !self.budgets.lock().charge_clock_skew(interval) {
                                self.trace.error(&format!(
                                    "The local clock still disagrees with the server after {} minutes; stop retrying. {}",
                                    CLOCK_SKEW_RETRY_LIMIT.as_secs() / 60,
                                    error
                                ));
                                self.terminal.write_error(&error.to_string());
                                return Ok(false);
                            }
                        }

                        if !encountered_error {
                            encountered_error = true;
                            self.terminal.write_error(&format!(
                                "{} Failed to create a session. Retrying in {}s. {}",
                                Utc::now().format("%Y-%m-%d %H:%M:%SZ"),
                                interval.as_secs(),
                                error
                            ));
                        } else {
                            self.trace.info(&format!(
                                "Session creation still failing ({} consecutive errors): {}",
                                consecutive_errors, error
                            ));
                        }

                        self.sleep_or_cancel(interval, cancel).await?;
                    }
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // GetNextMessage
    // -----------------------------------------------------------------------

    /// Long-poll until the server hands over a message.
    ///
    /// Null replies sleep the idle interval and poll again; retriable
    /// transport errors back off, refresh the message-queue channel, and
    /// poll again; session expiry recreates the session in place unless
    /// `SkipSessionRecover` is set.
    pub async fn get_next_message(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TaskAgentMessage, ServerError> {
        let mut consecutive_errors = 0u32;
        let mut previous_interval: Option<Duration> = None;
        let mut encountered_error = false;

        loop {
            if cancel.is_cancelled() {
                return Err(ServerError::Cancelled);
            }

            let session_id = self.session_id().ok_or_else(|| {
                ServerError::Other("No session established; create a session first".into())
            })?;

            {
                let mut last_at = self.last_message_at.lock();
                if last_at.elapsed() >= HEARTBEAT_TRACE_INTERVAL {
                    self.trace.info(&format!(
                        "The agent has not received a message for {} minutes; still listening.",
                        HEARTBEAT_TRACE_INTERVAL.as_secs() / 60
                    ));
                    *last_at = Instant::now();
                }
            }

            let result = self
                .agent_server
                .get_agent_message(
                    self.settings.pool_id,
                    session_id,
                    self.last_message_id(),
                    cancel.child_token(),
                )
                .await;

            match result {
                Ok(reply) => {
                    consecutive_errors = 0;
                    previous_interval = None;
                    if encountered_error {
                        encountered_error = false;
                        self.terminal
                            .write_success_message("Agent reconnected to the server.");
                    }

                    match reply {
                        Some(raw) => {
                            let session = self.session.read().clone().ok_or_else(|| {
                                ServerError::Other("Session vanished while polling".into())
                            })?;
                            let message = decrypt_message(&session, raw, self.rsa_keys.as_ref())
                                .map_err(|e| {
                                    ServerError::Other(format!("Failed to decrypt message: {e}"))
                                })?;

                            *self.last_message_id.lock() = Some(message.message_id);
                            *self.last_message_at.lock() = Instant::now();
                            self.trace.info(&format!(
                                "Received message {} of type '{}'.",
                                message.message_id, message.message_type
                            ));
                            return Ok(message);
                        }
                        None => {
                            let interval = {
                                let mut rng = rand::thread_rng();
                                backoff::idle_interval(&mut rng)
                            };
                            self.trace.verbose(&format!(
                                "No message available; next poll in {}s.",
                                interval.as_secs()
                            ));
                            self.sleep_or_cancel(interval, cancel).await?;
                        }
                    }
                }

                Err(error) => match classify_get_next_message(&error) {
                    Disposition::Propagate | Disposition::Fatal => {
                        self.trace.error_err(&error);
                        return Err(error);
                    }

                    Disposition::Recover => {
                        if self.settings.skip_session_recover {
                            self.trace
                                .error("The session expired and session recovery is disabled.");
                            return Err(error);
                        }
                        self.trace.info("The session expired; creating a new one.");
                        if self.create_session(cancel).await? {
                            continue;
                        }
                        return Err(error);
                    }

                    Disposition::Retry => {
                        consecutive_errors += 1;
                        let interval = {
                            let mut rng = rand::thread_rng();
                            backoff::retry_interval(
                                RetryCall::GetNextMessage,
                                self.backoff_policy(),
                                consecutive_errors,
                                previous_interval,
                                &mut rng,
                            )
                        };
                        previous_interval = Some(interval);

                        if !encountered_error {
                            encountered_error = true;
                            self.terminal.write_error(&format!(
                                "{} Lost connection to the server. Retrying until reconnected. Next attempt in {}s. {}",
                                Utc::now().format("%Y-%m-%d %H:%M:%SZ"),
                                interval.as_secs(),
                                error
                            ));
                        } else {
                            self.trace.info(&format!(
                                "Still unable to poll for messages ({} consecutive errors): {}",
                                consecutive_errors, error
                            ));
                        }

                        if let Err(refresh_error) = self
                            .agent_server
                            .refresh_connection(ConnectionChannel::MessageQueue)
                            .await
                        {
                            self.trace.warning(&format!(
                                "Failed to refresh the message queue connection: {}",
                                refresh_error
                            ));
                        }

                        self.sleep_or_cancel(interval, cancel).await?;
                    }
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // DeleteMessage / DeleteSession
    // -----------------------------------------------------------------------

    /// Acknowledge a message by id. No retries; errors propagate.
    ///
    /// A missing session is a no-op. Runs on its own 30-second deadline so
    /// it completes during shutdown regardless of the caller's token.
    pub async fn delete_message(&self, message: &TaskAgentMessage) -> Result<(), ServerError> {
        let Some(session_id) = self.session_id() else {
            self.trace.verbose("No session; nothing to acknowledge.");
            return Ok(());
        };

        match tokio::time::timeout(
            MESSAGE_OPERATION_TIMEOUT,
            self.agent_server.delete_agent_message(
                self.settings.pool_id,
                message.message_id,
                session_id,
                CancellationToken::new(),
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServerError::Other(format!(
                "Timed out acknowledging message {} after {}s",
                message.message_id,
                MESSAGE_OPERATION_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Best-effort session teardown on its own 30-second deadline.
    ///
    /// Safe to call when no session exists; transport failures are traced
    /// and swallowed.
    pub async fn delete_session(&self) -> Result<(), ServerError> {
        let Some(session) = self.session.write().take() else {
            return Ok(());
        };

        self.trace
            .info(&format!("Deleting session {}", session.session_id));

        match tokio::time::timeout(
            MESSAGE_OPERATION_TIMEOUT,
            self.agent_server.delete_agent_session(
                self.settings.pool_id,
                session.session_id,
                CancellationToken::new(),
            ),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                self.trace
                    .warning(&format!("Best-effort session delete failed: {}", error));
                Ok(())
            }
            Err(_) => {
                self.trace.warning("Timed out deleting the session.");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // KeepAlive
    // -----------------------------------------------------------------------

    /// Liveness probe loop, run in parallel with the poll task.
    ///
    /// Probes `get_agent_message` with no message offset every 30 seconds.
    /// Errors never raise: they advance the error count and stretch the next
    /// delay by the oracle's interval. The loop exits only on cancellation.
    pub async fn keep_alive(&self, cancel: &CancellationToken) {
        let mut consecutive_errors = 0u32;
        let mut previous_interval: Option<Duration> = None;
        let mut delay = KEEPALIVE_INTERVAL;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }

            let Some(session_id) = self.session_id() else {
                delay = KEEPALIVE_INTERVAL;
                continue;
            };

            // A nil message offset marks this poll as a liveness probe.
            match self
                .agent_server
                .get_agent_message(self.settings.pool_id, session_id, None, cancel.child_token())
                .await
            {
                Ok(_) => {
                    consecutive_errors = 0;
                    previous_interval = None;
                    delay = KEEPALIVE_INTERVAL;
                }
                Err(error) if error.is_cancelled() => return,
                Err(error) => {
                    consecutive_errors += 1;
                    let extension = {
                        let mut rng = rand::thread_rng();
                        backoff::retry_interval(
                            RetryCall::KeepAlive,
                            self.backoff_policy(),
                            consecutive_errors,
                            previous_interval,
                            &mut rng,
                        )
                    };
                    previous_interval = Some(extension);
                    delay = KEEPALIVE_INTERVAL + extension;
                    self.trace.verbose(&format!(
                        "Keepalive probe failed ({} consecutive errors): {}. Next probe in {}s.",
                        consecutive_errors,
                        error,
                        delay.as_secs()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
