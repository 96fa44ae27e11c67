pub mod collect;
pub mod content;
pub mod health;
pub mod realtime;
pub mod stats;
