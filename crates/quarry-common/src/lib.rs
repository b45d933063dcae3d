// quarry-common: Shared services and infrastructure for the Quarry agent.
// Provides the host context (service container), tracing with secret masking
// and correlation tagging, terminal I/O, configuration storage, the error
// taxonomy shared with the server client, and the paging logger.

pub mod constants;
pub mod credential_data;
pub mod errors;
pub mod host_context;
pub mod http_client_factory;
pub mod job_server_queue;
pub mod knobs;
pub mod paging_logger;
pub mod secret_masker;
pub mod settings;
pub mod terminal;
pub mod tracing;

pub use errors::ServerError;
pub use host_context::HostContext;
pub use http_client_factory::HttpClientFactory;
