// Loading and saving agent settings and credentials from disk.

use crate::constants::WellKnownConfigFile;
use crate::credential_data::CredentialData;
use crate::host_context::HostContext;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// AgentSettings
// ---------------------------------------------------------------------------

/// Persisted agent configuration, written by the configuration flow and
/// loaded once at startup. Immutable for the lifetime of the listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSettings {
    /// The agent's unique id assigned by the server at registration.
    #[serde(default, rename = "AgentId")]
    pub agent_id: u64,

    /// The agent's display name.
    #[serde(default, rename = "AgentName")]
    pub agent_name: String,

    /// Whether the listener should surface session expiry instead of
    /// recreating the session in place.
    #[serde(default, rename = "SkipSessionRecover")]
    pub skip_session_recover: bool,

    /// The pool this agent is registered in.
    #[serde(default, rename = "PoolId")]
    pub pool_id: u64,

    /// The pool's display name.
    #[serde(default, rename = "PoolName")]
    pub pool_name: String,

    /// The orchestrator service URL.
    #[serde(default, rename = "ServerUrl")]
    pub server_url: String,

    /// The work directory name / path (relative to root).
    #[serde(default, rename = "WorkFolder")]
    pub work_folder: String,
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Handles loading and saving agent settings and credentials.
pub struct ConfigurationStore {
    config_file_path: PathBuf,
    cred_file_path: PathBuf,
    root_folder: PathBuf,

    settings: Mutex<Option<AgentSettings>>,
    creds: Mutex<Option<CredentialData>>,
}

impl ConfigurationStore {
    /// Create a new `ConfigurationStore` initialized from the host context.
    pub fn new(context: &Arc<HostContext>) -> Self {
        let root = context.get_directory(crate::constants::WellKnownDirectory::Root);

        Self {
            config_file_path: context.get_config_file(WellKnownConfigFile::Agent),
            cred_file_path: context.get_config_file(WellKnownConfigFile::Credentials),
            root_folder: root,
            settings: Mutex::new(None),
            creds: Mutex::new(None),
        }
    }

    /// Returns the root folder of the agent installation.
    pub fn root_folder(&self) -> &PathBuf {
        &self.root_folder
    }

    /// Check whether the agent has been configured (settings file exists).
    pub fn is_configured(&self) -> bool {
        self.config_file_path.exists()
    }

    /// Check whether credentials are stored on disk.
    pub fn has_credentials(&self) -> bool {
        self.cred_file_path.exists()
    }

    /// Load and return agent settings. Cached after first load.
    pub fn get_settings(&self) -> Result<AgentSettings> {
        let mut guard = self.settings.lock().unwrap();
        if let Some(ref settings) = *guard {
            return Ok(settings.clone());
        }

        let json = fs::read_to_string(&self.config_file_path)
            .with_context(|| format!("Failed to read settings from {:?}", self.config_file_path))?;

        let settings: AgentSettings =
            serde_json::from_str(&json).context("Failed to deserialize agent settings")?;

        *guard = Some(settings.clone());
        Ok(settings)
    }

    /// Load and return credentials. Cached after first load.
    pub fn get_credentials(&self) -> Result<CredentialData> {
        let mut guard = self.creds.lock().unwrap();
        if let Some(ref creds) = *guard {
            return Ok(creds.clone());
        }

        let json = fs::read_to_string(&self.cred_file_path)
            .with_context(|| format!("Failed to read credentials from {:?}", self.cred_file_path))?;

        let creds: CredentialData =
            serde_json::from_str(&json).context("Failed to deserialize credential data")?;

        *guard = Some(creds.clone());
        Ok(creds)
    }

    /// Save agent settings to disk.
    pub fn save_settings(&self, settings: &AgentSettings) -> Result<()> {
        if self.config_file_path.exists() {
            fs::remove_file(&self.config_file_path)?;
        }

        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.config_file_path, &json)
            .with_context(|| format!("Failed to write settings to {:?}", self.config_file_path))?;

        *self.settings.lock().unwrap() = Some(settings.clone());
        Ok(())
    }

    /// Save credentials to disk.
    pub fn save_credential(&self, credential: &CredentialData) -> Result<()> {
        if self.cred_file_path.exists() {
            fs::remove_file(&self.cred_file_path)?;
        }

        let json = serde_json::to_string_pretty(credential)?;
        fs::write(&self.cred_file_path, &json)
            .with_context(|| format!("Failed to write credentials to {:?}", self.cred_file_path))?;

        *self.creds.lock().unwrap() = Some(credential.clone());
        Ok(())
    }

    /// Delete stored credentials.
    pub fn delete_credential(&self) {
        let _ = fs::remove_file(&self.cred_file_path);
        *self.creds.lock().unwrap() = None;
    }

    /// Delete stored settings.
    pub fn delete_settings(&self) {
        let _ = fs::remove_file(&self.config_file_path);
        *self.settings.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ConfigurationStore {
        let context = HostContext::new("Agent");
        context.set_root_override(dir.path().to_path_buf());
        ConfigurationStore::new(&context)
    }

    #[test]
    fn settings_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(!store.is_configured());

        let settings = AgentSettings {
            agent_id: 42,
            agent_name: "agent-01".into(),
            pool_id: 7,
            pool_name: "default".into(),
            server_url: "https://quarry.example.com".into(),
            work_folder: "_work".into(),
            skip_session_recover: false,
        };
        store.save_settings(&settings).unwrap();
        assert!(store.is_configured());

        let loaded = store.get_settings().unwrap();
        assert_eq!(loaded.agent_id, 42);
        assert_eq!(loaded.pool_id, 7);
        assert_eq!(loaded.server_url, "https://quarry.example.com");
    }

    #[test]
    fn settings_use_pascal_case_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .save_settings(&AgentSettings {
                agent_name: "agent-01".into(),
                ..Default::default()
            })
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join(".agent")).unwrap();
        assert!(raw.contains("\"AgentName\": \"agent-01\""));
        assert!(raw.contains("\"SkipSessionRecover\": false"));
    }

    #[test]
    fn missing_settings_error() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.get_settings().is_err());
    }
}
