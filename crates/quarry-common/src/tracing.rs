// Per-component trace sources.
// Every line is secret-masked before it leaves the process. When the host
// runs with enhanced logging, the current correlation frame is stitched
// into the line so job-step output can be grouped after the fact; hosts
// that bind the no-op manager get plain lines.

use crate::secret_masker::SecretMasker;
use chrono::Utc;
use quarry_sdk::correlation::{CorrelationManager, NoopCorrelationManager};
use quarry_sdk::TraceWriter;
use std::sync::Arc;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl TraceEventType {
    /// Fixed-width label used in the line format.
    fn label(&self) -> &'static str {
        match self {
            TraceEventType::Verbose => "VERB",
            TraceEventType::Information => "INFO",
            TraceEventType::Warning => "WARN",
            TraceEventType::Error => "ERR ",
        }
    }
}

/// Configuration for trace output.
#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity level to emit.
    pub level: TraceEventType,
    /// Whether to also print to stdout.
    pub print_to_stdout: bool,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
            print_to_stdout: false,
        }
    }
}

/// A trace source bound to one component.
///
/// All sources created by the same [`TraceManager`] share one
/// `SecretMasker` and one `CorrelationManager`.
#[derive(Clone)]
pub struct Tracing {
    name: String,
    secret_masker: Arc<SecretMasker>,
    correlation: Arc<dyn CorrelationManager>,
    setting: TraceSetting,
}

impl Tracing {
    /// Create a new `Tracing` instance.
    pub fn new(
        name: impl Into<String>,
        secret_masker: Arc<SecretMasker>,
        correlation: Arc<dyn CorrelationManager>,
        setting: TraceSetting,
    ) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            correlation,
            setting,
        }
    }

    /// Render one output line: timestamp, component, correlation frame
    /// (when one is set on the current task), level, masked message.
    fn format_line(&self, event_type: TraceEventType, message: &str) -> String {
        let masked = self.secret_masker.mask_secrets(message);
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        match self.correlation.build_correlation_id().as_str() {
            "" => format!(
                "[{}][{}] {}: {}",
                timestamp,
                self.name,
                event_type.label(),
                masked
            ),
            correlation_id => format!(
                "[{}][{}][{}] {}: {}",
                timestamp,
                self.name,
                correlation_id,
                event_type.label(),
                masked
            ),
        }
    }

    /// Log a message at the given severity level.
    fn trace(&self, event_type: TraceEventType, message: &str) {
        if (event_type as u8) < (self.setting.level as u8) {
            return;
        }

        let formatted = self.format_line(event_type, message);

        match event_type {
            TraceEventType::Error => {
                tracing::error!("{}", formatted);
            }
            TraceEventType::Warning => {
                tracing::warn!("{}", formatted);
            }
            TraceEventType::Information => {
                tracing::info!("{}", formatted);
            }
            TraceEventType::Verbose => {
                tracing::debug!("{}", formatted);
            }
        }

        if self.setting.print_to_stdout {
            println!("{}", formatted);
        }
    }

    /// Get the name of this trace source.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log an entering-function trace message.
    pub fn entering(&self, name: &str) {
        self.verbose(&format!("Entering {}", name));
    }

    /// Log a leaving-function trace message.
    pub fn leaving(&self, name: &str) {
        self.verbose(&format!("Leaving {}", name));
    }

    /// Log a serialized object as verbose JSON.
    pub fn verbose_object<T: serde::Serialize>(&self, item: &T) {
        match serde_json::to_string_pretty(item) {
            Ok(json) => self.verbose(&json),
            Err(e) => self.verbose(&format!("<serialization error: {}>", e)),
        }
    }

    /// Log an error with its full source chain.
    pub fn error_err(&self, err: &dyn std::error::Error) {
        self.error(&format!("{}", err));
        let mut source = err.source();
        while let Some(cause) = source {
            self.error(&format!("caused by: {}", cause));
            source = cause.source();
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out per-component trace sources sharing one masker and one
/// correlation manager.
pub struct TraceManager {
    secret_masker: Arc<SecretMasker>,
    correlation: Arc<dyn CorrelationManager>,
    default_setting: TraceSetting,
}

impl TraceManager {
    /// Create a `TraceManager` with default settings and no correlation
    /// support.
    pub fn new(secret_masker: Arc<SecretMasker>) -> Self {
        Self {
            secret_masker,
            correlation: Arc::new(NoopCorrelationManager),
            default_setting: TraceSetting::default(),
        }
    }

    /// Create a `TraceManager` with a specific setting and correlation
    /// manager (the host bootstrap picks the task-local manager under
    /// enhanced logging, the no-op manager otherwise).
    pub fn with_setting(
        secret_masker: Arc<SecretMasker>,
        correlation: Arc<dyn CorrelationManager>,
        setting: TraceSetting,
    ) -> Self {
        Self {
            secret_masker,
            correlation,
            default_setting: setting,
        }
    }

    /// Get (create) a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(
            name,
            self.secret_masker.clone(),
            self.correlation.clone(),
            self.default_setting.clone(),
        )
    }

    /// Access the underlying secret masker.
    pub fn secret_masker(&self) -> &Arc<SecretMasker> {
        &self.secret_masker
    }

    /// Access the correlation manager bound to this process.
    pub fn correlation(&self) -> &Arc<dyn CorrelationManager> {
        &self.correlation
    }
}
