pub mod clock;
pub mod config;
pub mod durable;
pub mod error;
pub mod event;
pub mod keys;
pub mod model;
pub mod store;
pub mod visitor;
