// Discovery of the capability map advertised in the session descriptor.
// The server routes jobs by matching demands against these entries.

use quarry_common::constants;
use std::collections::HashMap;

/// Maximum length of a capability value; longer values are truncated.
const MAX_CAPABILITY_VALUE_LENGTH: usize = 1024;

/// Environment variable name fragments that must never be advertised.
const EXCLUDED_NAME_FRAGMENTS: &[&str] = &["SECRET", "TOKEN", "PASSWORD", "CREDENTIAL"];

/// Produces the capability map sent with the session descriptor.
pub trait CapabilitiesManager: Send + Sync {
    fn discover(&self) -> HashMap<String, String>;
}

/// Discovers capabilities from the process environment plus a small set of
/// computed entries (OS, architecture, agent version).
#[derive(Debug, Default)]
pub struct EnvCapabilitiesManager;

impl CapabilitiesManager for EnvCapabilitiesManager {
    fn discover(&self) -> HashMap<String, String> {
        let mut capabilities = HashMap::new();

        for (name, value) in std::env::vars() {
            if value.is_empty() || is_excluded(&name) {
                continue;
            }
            let mut value = value;
            if value.len() > MAX_CAPABILITY_VALUE_LENGTH {
                let mut end = MAX_CAPABILITY_VALUE_LENGTH;
                while !value.is_char_boundary(end) {
                    end -= 1;
                }
                value.truncate(end);
            }
            capabilities.insert(name, value);
        }

        capabilities.insert(
            "Agent.OS".to_string(),
            constants::CURRENT_PLATFORM.to_string(),
        );
        capabilities.insert(
            "Agent.OSArchitecture".to_string(),
            constants::CURRENT_ARCHITECTURE.to_string(),
        );
        capabilities.insert(
            "Agent.Version".to_string(),
            quarry_sdk::build_constants::AgentPackage::VERSION.to_string(),
        );

        capabilities
    }
}

/// Whether an environment variable name looks secret-bearing.
fn is_excluded(name: &str) -> bool {
    let upper = name.to_uppercase();
    EXCLUDED_NAME_FRAGMENTS
        .iter()
        .any(|fragment| upper.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_entries_present() {
        let capabilities = EnvCapabilitiesManager.discover();
        assert!(capabilities.contains_key("Agent.OS"));
        assert!(capabilities.contains_key("Agent.OSArchitecture"));
        assert_eq!(
            capabilities.get("Agent.Version").map(String::as_str),
            Some(quarry_sdk::build_constants::AgentPackage::VERSION)
        );
    }

    #[test]
    fn secret_looking_variables_excluded() {
        std::env::set_var("QUARRY_TEST_API_TOKEN", "supersecret");
        std::env::set_var("QUARRY_TEST_PLAIN", "visible");
        let capabilities = EnvCapabilitiesManager.discover();
        assert!(!capabilities.contains_key("QUARRY_TEST_API_TOKEN"));
        assert_eq!(
            capabilities.get("QUARRY_TEST_PLAIN").map(String::as_str),
            Some("visible")
        );
        std::env::remove_var("QUARRY_TEST_API_TOKEN");
        std::env::remove_var("QUARRY_TEST_PLAIN");
    }

    #[test]
    fn long_values_truncated() {
        std::env::set_var("QUARRY_TEST_LONG", "v".repeat(5000));
        let capabilities = EnvCapabilitiesManager.discover();
        assert_eq!(
            capabilities.get("QUARRY_TEST_LONG").map(String::len),
            Some(MAX_CAPABILITY_VALUE_LENGTH)
        );
        std::env::remove_var("QUARRY_TEST_LONG");
    }

    #[test]
    fn exclusion_is_case_insensitive() {
        assert!(is_excluded("my_password"));
        assert!(is_excluded("CI_ACCESS_TOKEN"));
        assert!(!is_excluded("PATH"));
    }
}
