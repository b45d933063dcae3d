// The top-level run loop of the listener process.
// Loads configuration, wires the listener against the HTTP server client,
// runs the poll task with the keepalive task alongside, and hands received
// messages to the dispatcher.

use crate::agent_server::{HttpAgentServer, TaskAgentMessage};
use crate::capabilities::EnvCapabilitiesManager;
use crate::configuration::credential_manager::CredentialManager;
use crate::configuration::rsa_key_manager::RsaKeyManager;
use crate::message_listener::MessageListener;
use anyhow::{Context, Result};
use async_trait::async_trait;
use quarry_common::constants::{self, message_type};
use quarry_common::errors::ServerError;
use quarry_common::host_context::{HostContext, ShutdownReason};
use quarry_common::knobs::EnvConfigurationManager;
use quarry_common::settings::ConfigurationStore;
use quarry_common::terminal::Terminal;
use quarry_common::tracing::Tracing;
use quarry_sdk::TraceWriter;
use std::sync::Arc;

/// Consumer of delivered messages. The job executor implements this; the
/// listener only guarantees in-order delivery and acknowledgement.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, message: &TaskAgentMessage) -> Result<()>;
}

/// Dispatcher used when no worker host is attached: records each message in
/// the diagnostic log and drops it.
pub struct TraceMessageDispatcher {
    trace: Tracing,
}

impl TraceMessageDispatcher {
    pub fn new(context: &Arc<HostContext>) -> Self {
        Self {
            trace: context.get_trace("MessageDispatcher"),
        }
    }
}

#[async_trait]
impl MessageDispatcher for TraceMessageDispatcher {
    async fn dispatch(&self, message: &TaskAgentMessage) -> Result<()> {
        match message.message_type.as_str() {
            message_type::JOB_REQUEST => self.trace.info(&format!(
                "Job request {} received ({} bytes).",
                message.message_id,
                message.body.len()
            )),
            message_type::JOB_CANCELLATION => self
                .trace
                .info(&format!("Job cancellation {} received.", message.message_id)),
            other => self.trace.warning(&format!(
                "Dropping message {} of unknown type '{}'.",
                message.message_id, other
            )),
        }
        Ok(())
    }
}

/// The agent orchestrator: session up, poll, dispatch, session down.
pub struct Agent {
    context: Arc<HostContext>,
    trace: Tracing,
}

impl Agent {
    /// Create a new `Agent`.
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("Agent");
        Self { context, trace }
    }

    /// Run the message loop until shutdown or a terminal error.
    ///
    /// Returns the process exit code.
    pub async fn run(&self, dispatcher: Arc<dyn MessageDispatcher>) -> Result<i32> {
        let config_store = ConfigurationStore::new(&self.context);
        if !config_store.is_configured() {
            self.trace
                .error("The agent is not configured; no settings file found.");
            println!("The agent is not configured. Configure it before running.");
            return Ok(constants::return_code::TERMINATED_ERROR);
        }

        let settings = config_store
            .get_settings()
            .context("Failed to load agent settings")?;
        let credentials = config_store
            .get_credentials()
            .context("Failed to load agent credentials")?;

        if !settings.work_folder.is_empty() {
            self.context.set_work_folder(&settings.work_folder);
        }

        self.trace.info(&format!(
            "Agent settings: name={}, pool={}, skip_session_recover={}",
            settings.agent_name, settings.pool_name, settings.skip_session_recover,
        ));

        let mut terminal = Terminal::new();
        terminal.initialize(&self.context);
        let terminal = Arc::new(terminal);

        // Ctrl+C / SIGTERM initiate graceful shutdown.
        let shutdown_token = self.context.agent_shutdown_token();
        let context_for_signal = self.context.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received; initiating graceful shutdown");
                context_for_signal.shutdown_agent(ShutdownReason::UserCancelled);
            }
        });

        #[cfg(unix)]
        {
            let context_for_sigterm = self.context.clone();
            tokio::spawn(async move {
                let Ok(mut sigterm) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                else {
                    return;
                };
                sigterm.recv().await;
                tracing::info!("SIGTERM received; initiating graceful shutdown");
                context_for_sigterm.shutdown_agent(ShutdownReason::OperatingSystemShutdown);
            });
        }

        // Wire the listener against the HTTP server client.
        let credential_manager = CredentialManager::new(self.context.clone());
        let credential_provider = credential_manager
            .create_provider(&credentials)
            .context("Failed to create a credential provider")?;
        let agent_server = Arc::new(HttpAgentServer::new(
            self.context.clone(),
            credential_provider,
        ));
        let rsa_keys = Arc::new(RsaKeyManager::new(self.context.clone()));

        let listener = Arc::new(MessageListener::new(
            self.context.clone(),
            settings,
            credentials,
            agent_server,
            terminal.clone(),
            Arc::new(EnvCapabilitiesManager),
            rsa_keys,
            Arc::new(EnvConfigurationManager),
        ));

        match listener.create_session(&shutdown_token).await {
            Ok(true) => {}
            Ok(false) => return Ok(constants::return_code::TERMINATED_ERROR),
            Err(ServerError::Cancelled) => return Ok(constants::return_code::SUCCESS),
            Err(error) => {
                terminal.write_error(&error.to_string());
                return Err(anyhow::Error::new(error).context("Failed to create a session"));
            }
        }

        terminal.write_success_message("Connected to the server.");
        terminal.write_line(
            &format!(
                "{} Listening for jobs",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
            None,
        );

        // The keepalive task runs alongside the poll loop for the entire
        // session; the two do not coordinate beyond the shutdown token.
        let keepalive_token = shutdown_token.child_token();
        let keepalive_task = {
            let listener = listener.clone();
            let token = keepalive_token.clone();
            tokio::spawn(async move { listener.keep_alive(&token).await })
        };

        let exit_code = loop {
            if shutdown_token.is_cancelled() {
                self.trace.info("Shutdown requested; leaving the message loop");
                break constants::return_code::SUCCESS;
            }

            match listener.get_next_message(&shutdown_token).await {
                Ok(message) => {
                    if let Err(error) = dispatcher.dispatch(&message).await {
                        self.trace.error(&format!(
                            "Failed to dispatch message {}: {:?}",
                            message.message_id, error
                        ));
                    }
                    if let Err(error) = listener.delete_message(&message).await {
                        self.trace.warning(&format!(
                            "Failed to acknowledge message {}: {}",
                            message.message_id, error
                        ));
                    }
                }
                Err(ServerError::Cancelled) => break constants::return_code::SUCCESS,
                Err(error) => {
                    self.trace.error_err(&error);
                    terminal.write_error(&error.to_string());
                    break constants::return_code::TERMINATED_ERROR;
                }
            }
        };

        keepalive_token.cancel();
        let _ = keepalive_task.await;

        let _ = listener.delete_session().await;

        Ok(exit_code)
    }
}
