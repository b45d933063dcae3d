// Entry point for the Quarry agent listener process.
//
// The listener is the long-lived agent process: it creates a HostContext,
// then delegates to the Agent orchestrator which owns the session and the
// message loop.

use quarry_common::constants;
use quarry_common::host_context::HostContext;
use std::sync::Arc;

use quarry_listener::agent::{Agent, TraceMessageDispatcher};

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run().await });

    std::process::exit(exit_code);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Agent listener process starting.");
    tracing::info!(
        "  Version = {}",
        quarry_sdk::build_constants::AgentPackage::VERSION
    );
    tracing::info!(
        "  Commit  = {}",
        quarry_sdk::build_constants::Source::COMMIT_HASH
    );
    tracing::info!(
        "  Platform = {} / {}",
        constants::CURRENT_PLATFORM,
        constants::CURRENT_ARCHITECTURE
    );

    let host_context = HostContext::new("Agent");
    let dispatcher = Arc::new(TraceMessageDispatcher::new(&host_context));

    let agent = Agent::new(Arc::clone(&host_context));

    match agent.run(dispatcher).await {
        Ok(exit_code) => {
            tracing::info!("Agent exiting with code {}", exit_code);
            exit_code
        }
        Err(e) => {
            tracing::error!("Agent failed with error: {:?}", e);
            constants::return_code::TERMINATED_ERROR
        }
    }
}
