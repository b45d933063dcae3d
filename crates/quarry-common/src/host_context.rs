// The central application context: service container, directory and config
// file resolution, trace creation, and shutdown coordination.

use crate::constants::{self, WellKnownConfigFile, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use dashmap::DashMap;
use quarry_sdk::correlation::{
    CorrelationManager, NoopCorrelationManager, TaskLocalCorrelationManager,
};
use quarry_sdk::{AgentWebProxy, StringUtil, TraceWriter};
use std::any::{Any, TypeId};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The reason the agent is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
    OperatingSystemShutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

/// The central application context shared by every component of a process.
///
/// All long-lived services are registered and cached here. Provides
/// directory resolution, config file path lookup, trace creation, and
/// graceful shutdown coordination.
pub struct HostContext {
    /// The host type string (e.g. "Agent", "Worker").
    host_type: String,

    /// Cached service instances, keyed by `TypeId` of the interface type.
    service_instances: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,

    /// Cancellation token for coordinated agent shutdown.
    agent_shutdown_token: CancellationToken,

    /// The reason the agent is shutting down, set once `shutdown_agent` runs.
    agent_shutdown_reason: Mutex<Option<ShutdownReason>>,

    /// Secret masker shared across the entire process.
    pub secret_masker: Arc<SecretMasker>,

    /// Web proxy configuration read from environment variables.
    pub web_proxy: AgentWebProxy,

    /// Trace manager for creating per-component trace sources.
    trace_manager: TraceManager,

    /// Override for the agent root directory (used in tests).
    root_override: Mutex<Option<PathBuf>>,
}

impl HostContext {
    /// Create a new `HostContext`.
    ///
    /// `host_type` should be `"Agent"` for the listener process.
    pub fn new(host_type: impl Into<String>) -> Arc<Self> {
        let host_type = host_type.into();
        assert!(!host_type.is_empty(), "host_type must not be empty");

        let secret_masker = Arc::new(SecretMasker::new());
        let web_proxy = AgentWebProxy::new();

        // Register proxy passwords as secrets
        if let Some(ref password) = web_proxy.http_proxy_password {
            if !password.is_empty() {
                secret_masker.add_value(password);
            }
        }
        if let Some(ref password) = web_proxy.https_proxy_password {
            if !password.is_empty() {
                secret_masker.add_value(password);
            }
        }

        let print_to_stdout = env::var(constants::variables::agent::PRINT_LOG_TO_STDOUT)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        // Under enhanced logging every trace line carries the current
        // correlation frame; otherwise the no-op manager keeps lines plain.
        let enhanced_logging = env::var(constants::variables::agent::ENHANCED_LOGGING)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false);
        let correlation: Arc<dyn CorrelationManager> = if enhanced_logging {
            Arc::new(TaskLocalCorrelationManager)
        } else {
            Arc::new(NoopCorrelationManager)
        };

        let trace_setting = TraceSetting {
            print_to_stdout,
            ..TraceSetting::default()
        };
        let trace_manager =
            TraceManager::with_setting(secret_masker.clone(), correlation, trace_setting);

        Arc::new(Self {
            host_type,
            service_instances: DashMap::new(),
            agent_shutdown_token: CancellationToken::new(),
            agent_shutdown_reason: Mutex::new(None),
            secret_masker,
            web_proxy,
            trace_manager,
            root_override: Mutex::new(None),
        })
    }

    // -----------------------------------------------------------------------
    // Service container
    // -----------------------------------------------------------------------

    /// Register a pre-built service instance in the container.
    ///
    /// `T` should be the trait / interface type used for lookup.
    pub fn register_service<T: Any + Send + Sync + 'static>(&self, service: Arc<T>) {
        self.service_instances
            .insert(TypeId::of::<T>(), service as Arc<dyn Any + Send + Sync>);
    }

    /// Get a cached service instance, or `None` if not yet registered.
    pub fn get_service<T: Any + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.service_instances
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Get or create a service. If a cached instance exists it is returned;
    /// otherwise a new `Default` instance is created, registered, and returned.
    pub fn get_or_create_service<T: Default + Any + Send + Sync + 'static>(
        self: &Arc<Self>,
    ) -> Arc<T> {
        if let Some(existing) = self.get_service::<T>() {
            return existing;
        }

        let service = Arc::new(T::default());
        self.register_service(service.clone());
        service
    }

    // -----------------------------------------------------------------------
    // Directory resolution
    // -----------------------------------------------------------------------

    /// Override the root directory (used primarily for testing).
    pub fn set_root_override(&self, path: PathBuf) {
        *self.root_override.lock().unwrap() = Some(path);
    }

    /// Resolve the path for a well-known directory.
    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Bin => {
                // The directory containing the agent binary.
                env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                    .unwrap_or_else(|| PathBuf::from("."))
            }

            WellKnownDirectory::Root => {
                if let Some(ref root) = *self.root_override.lock().unwrap() {
                    return root.clone();
                }
                // Root is the parent of the Bin directory.
                let bin = self.get_directory(WellKnownDirectory::Bin);
                bin.parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| bin.clone())
            }

            WellKnownDirectory::Diag => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::DIAG_DIRECTORY),

            WellKnownDirectory::Temp => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TEMP_DIRECTORY),

            WellKnownDirectory::Work => {
                if let Some(work) = self.get_work_folder_override() {
                    return work;
                }
                self.get_directory(WellKnownDirectory::Root)
                    .join(constants::path::WORK_DIRECTORY)
            }
        }
    }

    /// Set the work folder path explicitly (used after loading settings).
    pub fn set_work_folder(&self, work_folder: &str) {
        let root = self.get_directory(WellKnownDirectory::Root);
        let full_path = if Path::new(work_folder).is_absolute() {
            PathBuf::from(work_folder)
        } else {
            root.join(work_folder)
        };
        self.service_instances.insert(
            TypeId::of::<WorkFolderOverride>(),
            Arc::new(WorkFolderOverride(full_path)) as Arc<dyn Any + Send + Sync>,
        );
    }

    /// Get the work folder if explicitly set.
    pub fn get_work_folder_override(&self) -> Option<PathBuf> {
        self.service_instances
            .get(&TypeId::of::<WorkFolderOverride>())
            .and_then(|entry| entry.value().clone().downcast::<WorkFolderOverride>().ok())
            .map(|wf| wf.0.clone())
    }

    // -----------------------------------------------------------------------
    // Config file resolution
    // -----------------------------------------------------------------------

    /// Resolve the path for a well-known configuration file.
    pub fn get_config_file(&self, config_file: WellKnownConfigFile) -> PathBuf {
        let root = self.get_directory(WellKnownDirectory::Root);
        match config_file {
            WellKnownConfigFile::Agent => root.join(".agent"),
            WellKnownConfigFile::Credentials => root.join(".credentials"),
            WellKnownConfigFile::RsaCredentials => root.join(".credentials_rsaparams"),
        }
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// The correlation manager bound at startup. Executors push a frame
    /// here for the duration of a step; the trace formatter reads it back.
    pub fn correlation_manager(&self) -> &Arc<dyn CorrelationManager> {
        self.trace_manager.correlation()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Get the cancellation token that is triggered on agent shutdown.
    pub fn agent_shutdown_token(&self) -> CancellationToken {
        self.agent_shutdown_token.clone()
    }

    /// Get the reason the agent is shutting down, if shutdown has started.
    pub fn agent_shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.agent_shutdown_reason.lock().unwrap()
    }

    /// Initiate agent shutdown with the given reason.
    pub fn shutdown_agent(&self, reason: ShutdownReason) {
        let trace = self.get_trace("HostContext");
        trace.info(&format!("Agent will be shutdown for {}", reason));
        *self.agent_shutdown_reason.lock().unwrap() = Some(reason);
        self.agent_shutdown_token.cancel();
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    /// Get the host type string.
    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    /// Sleep for `duration`, returning early when `cancellation_token` fires.
    pub async fn delay(
        &self,
        duration: std::time::Duration,
        cancellation_token: CancellationToken,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancellation_token.cancelled() => {}
        }
    }
}

/// Internal marker type for storing the work folder override.
struct WorkFolderOverride(PathBuf);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_folder_override_resolves_under_root() {
        let context = HostContext::new("Agent");
        let root = std::env::temp_dir().join("quarry-hc-test");
        context.set_root_override(root.clone());
        context.set_work_folder("_work");
        assert_eq!(
            context.get_directory(WellKnownDirectory::Work),
            root.join("_work")
        );
    }

    #[test]
    fn config_files_live_under_root() {
        let context = HostContext::new("Agent");
        let root = std::env::temp_dir().join("quarry-hc-test2");
        context.set_root_override(root.clone());
        assert_eq!(
            context.get_config_file(WellKnownConfigFile::Agent),
            root.join(".agent")
        );
        assert_eq!(
            context.get_config_file(WellKnownConfigFile::RsaCredentials),
            root.join(".credentials_rsaparams")
        );
    }

    #[test]
    fn shutdown_cancels_token() {
        let context = HostContext::new("Agent");
        let token = context.agent_shutdown_token();
        assert!(!token.is_cancelled());
        context.shutdown_agent(ShutdownReason::UserCancelled);
        assert!(token.is_cancelled());
        assert_eq!(
            context.agent_shutdown_reason(),
            Some(ShutdownReason::UserCancelled)
        );
    }
}
