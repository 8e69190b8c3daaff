//! Runtime configuration of the server and of the benchmark client.

use std::{path::PathBuf, time::Duration};

use crate::common::{
    TimeoutOptions, DEFAULT_BUFFER_SIZE, DEFAULT_REPORT_INTERVAL, DEFAULT_TIMEOUT,
    DEFAULT_WORKERS,
};

/// Execution strategy of the dispatch pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PoolKind {
    /// Worker threads inside the server process.
    #[default]
    Thread,
    /// Separate worker processes.
    Process,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub workers: usize,
    pub pool: PoolKind,
    pub timeout: Duration,
    pub chunk_size: usize,
    pub report_interval: Duration,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout_options(&self) -> TimeoutOptions {
        TimeoutOptions::uniform(self.timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            storage_dir: PathBuf::from("server_files"),
            workers: DEFAULT_WORKERS,
            pool: PoolKind::Thread,
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_BUFFER_SIZE,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

/// Client settings shared by every benchmark session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server: String,
    pub timeout: Duration,
    pub chunk_size: usize,
    /// Where uploads are read from.
    pub source_dir: PathBuf,
    /// Where downloads are written to.
    pub save_dir: PathBuf,
}

impl ClientConfig {
    pub fn timeout_options(&self) -> TimeoutOptions {
        TimeoutOptions::uniform(self.timeout)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:1234".to_string(),
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_BUFFER_SIZE,
            source_dir: PathBuf::from("client_files"),
            save_dir: PathBuf::from("client_downloads"),
        }
    }
}
