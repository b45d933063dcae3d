// quarry-listener: Session lifecycle and message loop for the Quarry agent.
// This crate depends on `quarry-sdk` and `quarry-common`.
//
// Architecture:
//   main → Agent::run → MessageListener (session + poll + keepalive)
//        → MessageDispatcher (executor seam) → delete_message
//   Message bodies pass through message_decryption on receipt; retry
//   intervals come from the backoff oracle.

pub mod agent;
pub mod agent_server;
pub mod backoff;
pub mod capabilities;
pub mod configuration;
pub mod message_decryption;
pub mod message_listener;
