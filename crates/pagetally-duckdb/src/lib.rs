pub mod backend;
pub mod content;
pub mod durable_impl;
pub mod flow;
pub mod realtime;
pub mod schema;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `pagetally_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
