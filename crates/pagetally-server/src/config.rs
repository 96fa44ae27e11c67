/// Re-export `Config` from `pagetally-core` for use within this crate.
///
/// All environment-variable parsing lives in `pagetally-core` so it can be
/// shared with integration tests without depending on the full server.
pub use pagetally_core::config::Config;
