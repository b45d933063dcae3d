// Dynamically-queried configuration values ("knobs").
// Knobs are read fresh on every query so a flag flip takes effect at the
// next loop iteration without restarting the agent.

use quarry_sdk::StringUtil;
use std::collections::HashMap;

/// Knob names understood by the agent.
pub mod knob_names {
    /// Switch the retry loops from the legacy randomized backoff to the
    /// progressive (exponential) backoff.
    pub const ENABLE_PROGRESSIVE_RETRY_BACKOFF: &str =
        "QUARRY_AGENT_ENABLE_PROGRESSIVE_RETRY_BACKOFF";
}

/// Source of dynamic configuration values.
///
/// Implementations must not cache: every call re-reads the backing store.
pub trait ConfigurationManager: Send + Sync {
    /// Read a boolean knob. `None` when the knob is unset or unparsable.
    fn get_bool(&self, name: &str) -> Option<bool>;
}

/// Production knob source backed by process environment variables.
#[derive(Debug, Default)]
pub struct EnvConfigurationManager;

impl ConfigurationManager for EnvConfigurationManager {
    fn get_bool(&self, name: &str) -> Option<bool> {
        std::env::var(name)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
    }
}

/// In-memory knob source for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct StaticConfigurationManager {
    values: parking_lot::RwLock<HashMap<String, bool>>,
}

impl StaticConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a knob value. Readers observe it on their next query.
    pub fn set_bool(&self, name: &str, value: bool) {
        self.values.write().insert(name.to_string(), value);
    }

    /// Remove a knob value.
    pub fn unset(&self, name: &str) {
        self.values.write().remove(name);
    }
}

impl ConfigurationManager for StaticConfigurationManager {
    fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.read().get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_manager_reads_latest_value() {
        let knobs = StaticConfigurationManager::new();
        assert_eq!(knobs.get_bool(knob_names::ENABLE_PROGRESSIVE_RETRY_BACKOFF), None);

        knobs.set_bool(knob_names::ENABLE_PROGRESSIVE_RETRY_BACKOFF, true);
        assert_eq!(
            knobs.get_bool(knob_names::ENABLE_PROGRESSIVE_RETRY_BACKOFF),
            Some(true)
        );

        knobs.set_bool(knob_names::ENABLE_PROGRESSIVE_RETRY_BACKOFF, false);
        assert_eq!(
            knobs.get_bool(knob_names::ENABLE_PROGRESSIVE_RETRY_BACKOFF),
            Some(false)
        );
    }

    #[test]
    fn env_manager_parses_bool_shapes() {
        let knobs = EnvConfigurationManager;
        std::env::set_var("QUARRY_TEST_KNOB", "1");
        assert_eq!(knobs.get_bool("QUARRY_TEST_KNOB"), Some(true));
        std::env::set_var("QUARRY_TEST_KNOB", "garbage");
        assert_eq!(knobs.get_bool("QUARRY_TEST_KNOB"), None);
        std::env::remove_var("QUARRY_TEST_KNOB");
        assert_eq!(knobs.get_bool("QUARRY_TEST_KNOB"), None);
    }
}
