use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// String helpers shared across the agent.
pub struct StringUtil;

impl StringUtil {
    /// Serialize a value to a pretty-printed JSON string.
    pub fn convert_to_json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| {
            panic!("Failed to serialize value to JSON: {e}");
        })
    }

    /// Deserialize a JSON string into a value of type `T`.
    pub fn convert_from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
        let value = serde_json::from_str(json)?;
        Ok(value)
    }

    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"$true"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"$false"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        if value.is_empty() {
            return None;
        }
        match value.to_lowercase().as_str() {
            "1" | "true" | "$true" => Some(true),
            "0" | "false" | "$false" => Some(false),
            _ => None,
        }
    }

    /// Sanitize a user-agent header string by replacing parentheses with brackets.
    pub fn sanitize_user_agent_header(header: &str) -> String {
        header.replace('(', "[").replace(')', "]").trim().to_string()
    }
}
