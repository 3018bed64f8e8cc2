pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod feed;
pub mod log;
pub mod orchestrator;
pub mod ports;
pub mod resolver;
pub mod session;
pub mod settings;
