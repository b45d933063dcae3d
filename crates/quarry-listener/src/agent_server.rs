// The client surface of the orchestrator service.
// `AgentServer` is the seam the listener is written against; the HTTP
// implementation below is the production binding.

use crate::configuration::credential_manager::CredentialProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use quarry_common::credential_data::CredentialData;
use quarry_common::errors::ServerError;
use quarry_common::host_context::HostContext;
use quarry_common::tracing::Tracing;
use quarry_common::HttpClientFactory;
use quarry_sdk::TraceWriter;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// API version negotiated with the server.
const API_VERSION_ACCEPT: &str = "application/json;api-version=6.0-preview";

/// Long-poll timeout for the message endpoint. The server replies before
/// this; a client-side timeout is treated as "nothing yet".
const GET_MESSAGE_TIMEOUT: Duration = Duration::from_secs(50);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Reference to the agent inside a session descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAgentReference {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "osDescription")]
    pub os_description: String,
}

/// Encryption key material attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEncryptionKey {
    /// Whether `value` is RSA-wrapped with the agent's public key.
    #[serde(default)]
    pub encrypted: bool,
    /// The AES key, or the RSA-wrapped AES key when `encrypted` is set.
    #[serde(default, with = "base64_bytes")]
    pub value: Vec<u8>,
}

/// A session created on the server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAgentSession {
    #[serde(default, rename = "sessionId")]
    pub session_id: Uuid,
    #[serde(rename = "ownerName")]
    pub owner_name: String,
    pub agent: TaskAgentReference,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    #[serde(
        default,
        rename = "encryptionKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub encryption_key: Option<SessionEncryptionKey>,
}

impl TaskAgentSession {
    /// Build the client-side session descriptor sent to `create_agent_session`.
    pub fn descriptor(
        owner_name: String,
        agent: TaskAgentReference,
        capabilities: HashMap<String, String>,
    ) -> Self {
        Self {
            session_id: Uuid::nil(),
            owner_name,
            agent,
            capabilities,
            encryption_key: None,
        }
    }
}

/// A message received from the server via long-poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAgentMessage {
    #[serde(default, rename = "messageId")]
    pub message_id: u64,
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(default)]
    pub body: String,
    /// AES-CBC initialization vector; present iff `body` is base64
    /// ciphertext under the session key.
    #[serde(
        default,
        rename = "iv",
        with = "base64_bytes_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub iv: Option<Vec<u8>>,
}

/// Logical transport channels of the server connection. Refreshing a channel
/// drops and re-establishes its underlying transport only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionChannel {
    Generic,
    MessageQueue,
    JobRequest,
}

// ---------------------------------------------------------------------------
// AgentServer
// ---------------------------------------------------------------------------

/// Operations the listener invokes against the orchestrator.
#[async_trait]
pub trait AgentServer: Send + Sync {
    /// Idempotent bind to the server. Acquires credentials as needed.
    async fn connect(&self, server_url: Url, credentials: CredentialData)
        -> Result<(), ServerError>;

    /// Create a session for the agent in the pool.
    async fn create_agent_session(
        &self,
        pool_id: u64,
        session: &TaskAgentSession,
        cancel: CancellationToken,
    ) -> Result<TaskAgentSession, ServerError>;

    /// Delete the session. Safe to call for an already-deleted session.
    async fn delete_agent_session(
        &self,
        pool_id: u64,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), ServerError>;

    /// Long-poll for the next message. `Ok(None)` means "nothing yet".
    async fn get_agent_message(
        &self,
        pool_id: u64,
        session_id: Uuid,
        last_message_id: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<Option<TaskAgentMessage>, ServerError>;

    /// Acknowledge a message by id.
    async fn delete_agent_message(
        &self,
        pool_id: u64,
        message_id: u64,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), ServerError>;

    /// Drop and re-establish the underlying transport for `channel`.
    async fn refresh_connection(&self, channel: ConnectionChannel) -> Result<(), ServerError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Error body shape returned by the server for non-success replies.
#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(default, rename = "typeKey")]
    type_key: String,
    #[serde(default)]
    message: String,
}

/// reqwest-backed `AgentServer` with one HTTP client per logical channel.
pub struct HttpAgentServer {
    context: Arc<HostContext>,
    trace: Tracing,
    credential_provider: Arc<dyn CredentialProvider>,
    server_url: RwLock<Option<Url>>,
    access_token: RwLock<Option<String>>,
    clients: DashMap<ConnectionChannel, Client>,
}

impl HttpAgentServer {
    pub fn new(context: Arc<HostContext>, credential_provider: Arc<dyn CredentialProvider>) -> Self {
        let trace = context.get_trace("HttpAgentServer");
        Self {
            context,
            trace,
            credential_provider,
            server_url: RwLock::new(None),
            access_token: RwLock::new(None),
            clients: DashMap::new(),
        }
    }

    /// The base URL with any trailing slash removed.
    fn base_url(&self) -> Result<String, ServerError> {
        self.server_url
            .read()
            .as_ref()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .ok_or_else(|| ServerError::Other("Not connected; call connect first".into()))
    }

    /// Get (or lazily build) the client for a channel.
    fn client(&self, channel: ConnectionChannel) -> Result<Client, ServerError> {
        if let Some(client) = self.clients.get(&channel) {
            return Ok(client.clone());
        }
        let client = HttpClientFactory::create_client(&self.context.web_proxy)
            .map_err(|e| ServerError::Other(format!("Failed to build HTTP client: {e}")))?;
        self.clients.insert(channel, client.clone());
        Ok(client)
    }

    /// The current bearer token, acquiring one when none is cached.
    async fn bearer(&self) -> Result<String, ServerError> {
        if let Some(token) = self.access_token.read().clone() {
            return Ok(token);
        }
        let token = self.credential_provider.get_access_token().await?;
        self.context.secret_masker.add_value(&token);
        *self.access_token.write() = Some(token.clone());
        Ok(token)
    }

    /// Map a non-success reply to the error taxonomy, preferring the
    /// server's `typeKey` over the bare status code.
    async fn error_from_response(&self, response: Response) -> ServerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let wire: WireError = serde_json::from_str(&body).unwrap_or_default();
        let message = if wire.message.is_empty() { body } else { wire.message };

        match wire.type_key.as_str() {
            "AgentSessionConflictException" => ServerError::SessionConflict(message),
            "AgentSessionExpiredException" => ServerError::SessionExpired(message),
            "AgentNotFoundException" => ServerError::AgentNotFound(message),
            "AgentPoolNotFoundException" => ServerError::PoolNotFound(message),
            "AccessDeniedException" => ServerError::AccessDenied(message),
            _ => match status {
                StatusCode::CONFLICT => ServerError::SessionConflict(message),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    // The cached token may be stale; force re-acquisition on
                    // the next call and let the provider decide whether the
                    // authorization itself is gone.
                    *self.access_token.write() = None;
                    match self.credential_provider.get_access_token().await {
                        Ok(_) => ServerError::AccessDenied(message),
                        Err(provider_error) => provider_error,
                    }
                }
                StatusCode::NOT_FOUND => ServerError::PoolNotFound(message),
                _ => ServerError::Http {
                    status: status.as_u16(),
                    message,
                },
            },
        }
    }

    /// Map a reqwest transport failure to the taxonomy.
    fn transport_error(error: reqwest::Error) -> ServerError {
        if error.is_decode() || error.is_body() {
            ServerError::Other(error.to_string())
        } else {
            ServerError::SocketFailure(error.to_string())
        }
    }
}

#[async_trait]
impl AgentServer for HttpAgentServer {
    async fn connect(
        &self,
        server_url: Url,
        _credentials: CredentialData,
    ) -> Result<(), ServerError> {
        *self.server_url.write() = Some(server_url);

        // Acquire a token up front so authentication problems (including
        // clock skew) surface here rather than on the first poll.
        *self.access_token.write() = None;
        let _ = self.bearer().await?;

        for channel in [
            ConnectionChannel::Generic,
            ConnectionChannel::MessageQueue,
            ConnectionChannel::JobRequest,
        ] {
            self.client(channel)?;
        }

        self.trace.verbose("Connected to the server");
        Ok(())
    }

    async fn create_agent_session(
        &self,
        pool_id: u64,
        session: &TaskAgentSession,
        cancel: CancellationToken,
    ) -> Result<TaskAgentSession, ServerError> {
        let url = format!(
            "{}/_apis/distributedtask/pools/{}/sessions",
            self.base_url()?,
            pool_id
        );
        let client = self.client(ConnectionChannel::Generic)?;
        let token = self.bearer().await?;

        let response = tokio::select! {
            result = client
                .post(&url)
                .bearer_auth(&token)
                .header("Accept", API_VERSION_ACCEPT)
                .json(session)
                .send() => result.map_err(Self::transport_error)?,
            _ = cancel.cancelled() => return Err(ServerError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        response
            .json::<TaskAgentSession>()
            .await
            .map_err(|e| ServerError::Other(format!("Failed to deserialize session: {e}")))
    }

    async fn delete_agent_session(
        &self,
        pool_id: u64,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let url = format!(
            "{}/_apis/distributedtask/pools/{}/sessions/{}",
            self.base_url()?,
            pool_id,
            session_id
        );
        let client = self.client(ConnectionChannel::Generic)?;
        let token = self.bearer().await?;

        let response = tokio::select! {
            result = client
                .delete(&url)
                .bearer_auth(&token)
                .header("Accept", API_VERSION_ACCEPT)
                .send() => result.map_err(Self::transport_error)?,
            _ = cancel.cancelled() => return Err(ServerError::Cancelled),
        };

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(self.error_from_response(response).await);
        }
        Ok(())
    }

    async fn get_agent_message(
        &self,
        pool_id: u64,
        session_id: Uuid,
        last_message_id: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<Option<TaskAgentMessage>, ServerError> {
        let mut url = format!(
            "{}/_apis/distributedtask/pools/{}/messages?sessionId={}",
            self.base_url()?,
            pool_id,
            session_id
        );
        if let Some(last) = last_message_id {
            url.push_str(&format!("&lastMessageId={last}"));
        }
        let client = self.client(ConnectionChannel::MessageQueue)?;
        let token = self.bearer().await?;

        let response = tokio::select! {
            result = client
                .get(&url)
                .bearer_auth(&token)
                .header("Accept", API_VERSION_ACCEPT)
                .timeout(GET_MESSAGE_TIMEOUT)
                .send() => {
                match result {
                    Ok(response) => response,
                    // A long-poll timeout is a normal "nothing yet" reply.
                    Err(e) if e.is_timeout() => return Ok(None),
                    Err(e) => return Err(Self::transport_error(e)),
                }
            }
            _ = cancel.cancelled() => return Err(ServerError::Cancelled),
        };

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => return Ok(None),
            status if !status.is_success() => {
                return Err(self.error_from_response(response).await)
            }
            _ => {}
        }

        let message = response
            .json::<TaskAgentMessage>()
            .await
            .map_err(|e| ServerError::Other(format!("Failed to deserialize message: {e}")))?;
        Ok(Some(message))
    }

    async fn delete_agent_message(
        &self,
        pool_id: u64,
        message_id: u64,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let url = format!(
            "{}/_apis/distributedtask/pools/{}/messages/{}?sessionId={}",
            self.base_url()?,
            pool_id,
            message_id,
            session_id
        );
        let client = self.client(ConnectionChannel::MessageQueue)?;
        let token = self.bearer().await?;

        let response = tokio::select! {
            result = client
                .delete(&url)
                .bearer_auth(&token)
                .header("Accept", API_VERSION_ACCEPT)
                .send() => result.map_err(Self::transport_error)?,
            _ = cancel.cancelled() => return Err(ServerError::Cancelled),
        };

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(self.error_from_response(response).await);
        }
        Ok(())
    }

    async fn refresh_connection(&self, channel: ConnectionChannel) -> Result<(), ServerError> {
        self.trace
            .info(&format!("Refreshing the {:?} connection", channel));
        self.clients.remove(&channel);
        *self.access_token.write() = None;
        self.client(channel)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for byte fields carried as base64 strings
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&BASE64_STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) if !encoded.is_empty() => BASE64_STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_shape_roundtrip() {
        let json = r#"{
            "messageId": 42,
            "messageType": "JobRequest",
            "body": "aGVsbG8=",
            "iv": "AAECAwQFBgcICQoLDA0ODw=="
        }"#;
        let message: TaskAgentMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.message_id, 42);
        assert_eq!(message.message_type, "JobRequest");
        assert_eq!(message.iv.as_deref().unwrap().len(), 16);

        let back = serde_json::to_string(&message).unwrap();
        assert!(back.contains("\"iv\":\"AAECAwQFBgcICQoLDA0ODw==\""));
    }

    #[test]
    fn message_without_iv() {
        let json = r#"{"messageId": 7, "messageType": "JobCancellation", "body": "{}"}"#;
        let message: TaskAgentMessage = serde_json::from_str(json).unwrap();
        assert!(message.iv.is_none());

        let back = serde_json::to_string(&message).unwrap();
        assert!(!back.contains("\"iv\""));
    }

    #[test]
    fn session_wire_shape() {
        let json = r#"{
            "sessionId": "6c0b2b89-7c2f-4a38-9c39-2b62e25a1ed2",
            "ownerName": "build-07",
            "agent": {"id": 12, "name": "agent-12"},
            "encryptionKey": {"encrypted": true, "value": "c2VjcmV0"}
        }"#;
        let session: TaskAgentSession = serde_json::from_str(json).unwrap();
        assert_eq!(
            session.session_id,
            Uuid::parse_str("6c0b2b89-7c2f-4a38-9c39-2b62e25a1ed2").unwrap()
        );
        let key = session.encryption_key.unwrap();
        assert!(key.encrypted);
        assert_eq!(key.value, b"secret");
    }

    #[test]
    fn descriptor_serializes_without_key() {
        let descriptor = TaskAgentSession::descriptor(
            "host-1".into(),
            TaskAgentReference {
                id: 3,
                name: "agent-3".into(),
                version: "1.0.0".into(),
                os_description: "Linux X64".into(),
            },
            HashMap::new(),
        );
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"ownerName\":\"host-1\""));
        assert!(!json.contains("encryptionKey"));
    }
}
