pub mod credential_manager;
pub mod rsa_key_manager;
