// src/lib.rs
pub mod config;
pub mod connection;
pub mod metrics;
pub mod server;
