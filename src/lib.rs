pub mod bench;
pub mod cli;
pub mod client;
pub mod codec;
pub mod common;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod workerpool;
