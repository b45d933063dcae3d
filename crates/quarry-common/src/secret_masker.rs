// Thread-safe store of secret values, replaced with `***` in trace output.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// A thread-safe secret masker that replaces registered secret values
/// in arbitrary strings with `***`.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<SecretMaskerInner>>,
}

#[derive(Debug, Default)]
struct SecretMaskerInner {
    /// All registered secret values, longest first.
    secrets: Vec<String>,
    /// Minimum length of a registered secret.
    min_secret_length: usize,
}

impl SecretMasker {
    /// Create a new empty `SecretMasker`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new secret value that should be masked in output.
    /// Empty or whitespace-only values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut inner = self.inner.write();
        if !inner.secrets.iter().any(|s| s == trimmed) {
            inner.secrets.push(trimmed.to_string());
            // Longer secrets replace first so a secret that is a substring
            // of another does not leave fragments behind.
            inner.secrets.sort_by(|a, b| b.len().cmp(&a.len()));
            inner.min_secret_length = inner.secrets.iter().map(|s| s.len()).min().unwrap_or(0);
        }
    }

    /// Replace all registered secret values in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        let inner = self.inner.read();

        if inner.secrets.is_empty() || input.len() < inner.min_secret_length {
            return input.to_string();
        }

        let mut result = input.to_string();
        for secret in &inner.secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }

        result
    }

    /// Returns the number of registered secrets.
    pub fn secret_count(&self) -> usize {
        self.inner.read().secrets.len()
    }
}
