//! prbar library: re-exports modules for the binary and integration tests.

pub mod avatar;
pub mod config;
pub mod detect;
pub mod enrich;
pub mod fetch;
pub mod github;
pub mod ledger;
pub mod notify;
pub mod plugin;
pub mod pool;
pub mod render;
pub mod snapshot;
pub mod state;
