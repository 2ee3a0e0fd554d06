//! Gasless ERC-3009 transfer relay.
//!
//! Users sign `transferWithAuthorization` messages under the token's EIP-712 domain; the
//! relay records each authorization, submits it on-chain from its own account and pays the
//! gas. [`relay_local::RelayLocal`] ties the pieces together and [`handlers`] exposes them
//! over HTTP.

pub mod authorization;
pub mod chain;
pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod from_env;
pub mod gas;
pub mod handlers;
pub mod nonce;
pub mod relay;
pub mod relay_local;
pub mod sig_down;
pub mod store;
pub mod submitter;
pub mod telemetry;
pub mod timestamp;
pub mod types;

#[cfg(test)]
mod test_support;
