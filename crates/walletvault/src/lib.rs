#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

//! Encrypted private-key vault behind a transport-agnostic command bus.
//!
//! [`vault::Vault`] owns the commands; [`rpc`] carries them in-process, over stdio or
//! over the daemon socket.

pub mod audit;
pub mod config;
pub mod errors;
pub mod fsutil;
pub mod keystore;
pub mod paths;
pub mod policy;
pub mod rpc;
pub mod signer;
pub mod vault;
