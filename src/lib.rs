//! Mirrors a rate-limited GraphQL issue tracker into a local cache that keeps
//! answering reads when the upstream does not.

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod server;
pub mod sync;
pub mod upstream;
