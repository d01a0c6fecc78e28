//! haven - offline-first request cache and encrypted local vault.
//!
//! Two resilience layers for a client application:
//! - [`router`] intercepts outbound requests and serves them network-first or
//!   cache-first from versioned cache generations ([`cache`], [`worker`]), so
//!   pages and assets keep working without a network
//! - [`vault`] encrypts records with a key derived from a user secret before
//!   they are written to local storage

pub mod cache;
pub mod config;
pub mod db;
pub mod http;
pub mod logging;
pub mod network;
pub mod router;
pub mod vault;
pub mod worker;
