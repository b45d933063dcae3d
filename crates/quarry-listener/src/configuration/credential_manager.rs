// Credential providers for authenticating with the orchestrator.
// The stored credential scheme selects the provider; OAuth exchanges a
// JWT-bearer assertion signed with the agent's RSA key for an access token.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use quarry_common::credential_data::CredentialData;
use quarry_common::errors::ServerError;
use quarry_common::host_context::HostContext;
use quarry_common::tracing::Tracing;
use quarry_common::HttpClientFactory;
use quarry_sdk::TraceWriter;
use serde::Deserialize;
use std::sync::Arc;

use super::rsa_key_manager::RsaKeyManager;

/// Source of bearer tokens for server calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_access_token(&self) -> Result<String, ServerError>;
}

/// Provider for pre-issued access tokens (`OAuthAccessToken` / PAT schemes).
pub struct AccessTokenCredentialProvider {
    token: String,
}

impl AccessTokenCredentialProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for AccessTokenCredentialProvider {
    async fn get_access_token(&self) -> Result<String, ServerError> {
        Ok(self.token.clone())
    }
}

/// Provider that performs the OAuth client-credentials exchange with a
/// JWT-bearer client assertion:
/// - `grant_type = client_credentials`
/// - `client_assertion_type = urn:ietf:params:oauth:client-assertion-type:jwt-bearer`
/// - `client_assertion = <RS256 JWT with iss/sub = clientId, aud = authUrl>`
pub struct OAuthCredentialProvider {
    context: Arc<HostContext>,
    trace: Tracing,
    client_id: String,
    authorization_url: String,
}

impl OAuthCredentialProvider {
    pub fn new(context: Arc<HostContext>, client_id: String, authorization_url: String) -> Self {
        let trace = context.get_trace("OAuthCredentialProvider");
        Self {
            context,
            trace,
            client_id,
            authorization_url,
        }
    }

    /// Build the signed client assertion.
    fn build_client_assertion(&self) -> Result<String, ServerError> {
        let rsa_manager = RsaKeyManager::new(self.context.clone());
        let rsa_pem = rsa_manager
            .load_private_key_pem()
            .map_err(|e| ServerError::OAuthTokenRequest(e.to_string()))?;

        let now = Utc::now();
        let claims = serde_json::json!({
            "sub": self.client_id,
            "iss": self.client_id,
            "aud": self.authorization_url,
            "jti": uuid::Uuid::new_v4().to_string(),
            "nbf": now.timestamp(),
            "exp": (now + chrono::Duration::minutes(5)).timestamp(),
        });

        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(rsa_pem.as_bytes())
            .map_err(|e| ServerError::OAuthTokenRequest(format!("Failed to parse RSA key: {e}")))?;

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| ServerError::OAuthTokenRequest(format!("Failed to encode JWT: {e}")))
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentialProvider {
    async fn get_access_token(&self) -> Result<String, ServerError> {
        let jwt = self.build_client_assertion()?;

        let client = HttpClientFactory::create_client(&self.context.web_proxy)
            .map_err(|e| ServerError::OAuthTokenRequest(e.to_string()))?;

        self.trace.verbose("Requesting an access token");

        let response = client
            .post(&self.authorization_url)
            .form(&[
                ("grant_type", "client_credentials"),
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", &jwt),
            ])
            .send()
            .await
            .map_err(|e| ServerError::SocketFailure(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // A revoked authorization never recovers; everything else is a
            // token-request failure (clock skew included, detected from the
            // server message by the caller).
            if body.contains("TokenRevoked") || body.contains("authorization was revoked") {
                return Err(ServerError::AccessTokenRevoked(body));
            }
            return Err(ServerError::OAuthTokenRequest(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            ServerError::OAuthTokenRequest(format!("Failed to deserialize token response: {e}"))
        })?;

        Ok(token_response.access_token)
    }
}

/// Factory for credential providers based on the stored credential data.
pub struct CredentialManager {
    context: Arc<HostContext>,
}

impl CredentialManager {
    /// Create a new `CredentialManager`.
    pub fn new(context: Arc<HostContext>) -> Self {
        Self { context }
    }

    /// Create a credential provider from stored credential data.
    ///
    /// Inspects the `scheme` field to determine which provider to use:
    /// - `"OAuth"` → `OAuthCredentialProvider`
    /// - `"OAuthAccessToken"` / `"PersonalAccessToken"` → `AccessTokenCredentialProvider`
    pub fn create_provider(
        &self,
        credential: &CredentialData,
    ) -> Result<Arc<dyn CredentialProvider>> {
        let trace = self.context.get_trace("CredentialManager");

        match credential.scheme.as_str() {
            "OAuth" => {
                trace.info("Creating OAuth credential provider");
                let client_id = credential
                    .client_id
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("OAuth credential is missing ClientId"))?;
                let authorization_url = credential.authorization_url.clone().ok_or_else(|| {
                    anyhow::anyhow!("OAuth credential is missing AuthorizationUrl")
                })?;
                Ok(Arc::new(OAuthCredentialProvider::new(
                    self.context.clone(),
                    client_id,
                    authorization_url,
                )))
            }
            "OAuthAccessToken" | "PersonalAccessToken" | "PAT" => {
                trace.info("Creating access token credential provider");
                let token = credential
                    .get_data("accessToken")
                    .or_else(|| credential.get_data("token"))
                    .ok_or_else(|| anyhow::anyhow!("Credential data contains no access token"))?;
                Ok(Arc::new(AccessTokenCredentialProvider::new(token.clone())))
            }
            scheme => Err(anyhow::anyhow!(
                "Unknown credential scheme: '{}'. Expected 'OAuth' or 'OAuthAccessToken'.",
                scheme
            )),
        }
    }
}
