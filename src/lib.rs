pub mod api;
pub mod clients;
pub mod collector;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod scheduler;
pub mod server;
pub mod store;
