// Manages the agent's RSA key pair.
// The private key signs the OAuth JWT-bearer assertion and unwraps
// RSA-wrapped session encryption keys.

use crate::message_decryption::RsaKeyStore;
use anyhow::{Context, Result};
use quarry_common::constants::WellKnownConfigFile;
use quarry_common::host_context::HostContext;
use quarry_common::tracing::Tracing;
use quarry_sdk::TraceWriter;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use std::sync::Arc;

/// RSA key size in bits.
const RSA_KEY_SIZE: usize = 2048;

/// Manages the RSA key pair stored under the agent root.
pub struct RsaKeyManager {
    context: Arc<HostContext>,
    trace: Tracing,
}

impl RsaKeyManager {
    /// Create a new `RsaKeyManager`.
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("RsaKeyManager");
        Self { context, trace }
    }

    /// Generate a new RSA key pair and save the private key to disk.
    ///
    /// Returns the public key in PEM format (for sending to the server
    /// during registration).
    pub fn generate_and_save_key(&self) -> Result<String> {
        self.trace.info("Generating RSA key pair...");

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_SIZE)
            .context("Failed to generate RSA private key")?;

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("Failed to serialize RSA private key to PEM")?;

        let public_key = private_key.to_public_key();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .context("Failed to serialize RSA public key to PEM")?;

        let key_path = self
            .context
            .get_config_file(WellKnownConfigFile::RsaCredentials);

        if key_path.exists() {
            std::fs::remove_file(&key_path).context("Failed to delete existing RSA key file")?;
        }

        std::fs::write(&key_path, private_pem.as_bytes())
            .context("Failed to write RSA private key to disk")?;

        // Restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&key_path, perms)
                .context("Failed to set permissions on RSA key file")?;
        }

        self.trace
            .info(&format!("RSA key pair generated and saved to {:?}", key_path));

        Ok(public_pem)
    }

    /// Load the existing RSA private key from disk.
    pub fn load_private_key(&self) -> Result<RsaPrivateKey> {
        let pem = self.load_private_key_pem()?;
        RsaPrivateKey::from_pkcs8_pem(&pem).context("Failed to parse RSA private key PEM")
    }

    /// Load the raw PEM text of the private key.
    pub fn load_private_key_pem(&self) -> Result<String> {
        let key_path = self
            .context
            .get_config_file(WellKnownConfigFile::RsaCredentials);

        std::fs::read_to_string(&key_path).context("Failed to read RSA private key from disk")
    }

    /// Check whether an RSA key exists on disk.
    pub fn has_key(&self) -> bool {
        self.context
            .get_config_file(WellKnownConfigFile::RsaCredentials)
            .exists()
    }

    /// Delete the RSA key from disk.
    pub fn delete_key(&self) -> Result<()> {
        let key_path = self
            .context
            .get_config_file(WellKnownConfigFile::RsaCredentials);

        if key_path.exists() {
            std::fs::remove_file(&key_path).context("Failed to delete RSA key file")?;
            self.trace.info("RSA key deleted");
        }

        Ok(())
    }
}

impl RsaKeyStore for RsaKeyManager {
    fn private_key(&self) -> Result<RsaPrivateKey> {
        self.load_private_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use tempfile::TempDir;

    fn manager_in(dir: &TempDir) -> RsaKeyManager {
        let context = HostContext::new("Agent");
        context.set_root_override(dir.path().to_path_buf());
        RsaKeyManager::new(context)
    }

    #[test]
    fn generate_load_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        assert!(!manager.has_key());

        let public_pem = manager.generate_and_save_key().unwrap();
        assert!(public_pem.contains("BEGIN PUBLIC KEY"));
        assert!(manager.has_key());

        let key = manager.load_private_key().unwrap();
        assert_eq!(key.size() * 8, RSA_KEY_SIZE);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.path().join(".credentials_rsaparams");
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        manager.delete_key().unwrap();
        assert!(!manager.has_key());
    }
}
