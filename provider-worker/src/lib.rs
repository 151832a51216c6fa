pub mod admission;
pub mod cache;
pub mod clients;
pub mod config;
pub mod correlator;
pub mod error;
pub mod loader;
pub mod pipeline;
pub mod sinks;
pub mod source;
