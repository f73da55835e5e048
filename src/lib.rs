pub mod access_log;
pub mod cache;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod logging;
pub mod range;
pub mod server;
pub mod stats;
pub mod upstream;
