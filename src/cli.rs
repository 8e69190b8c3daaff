//! Command line options of the two binaries.
//!
//! Every option can also come from a `FILE_BENCH_*` environment variable.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    bench::{BenchmarkPlan, Operation, SessionMode},
    common::DEFAULT_WORKERS,
    config::{ClientConfig, PoolKind, ServerConfig},
};

/// Parse a number of seconds, fractions allowed.
pub fn parse_seconds(arg: &str) -> Result<Duration, String> {
    let secs: f64 = arg
        .parse()
        .map_err(|_| format!("`{arg}` is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|err| format!("`{arg}`: {err}"))
}

fn parse_positive(arg: &str) -> Result<usize, String> {
    match arg.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(err) => Err(err.to_string()),
    }
}

/// File transfer server.
#[derive(Clone, Debug, Parser)]
#[command(name = "tcp_server", version)]
pub struct ServerArgs {
    /// Address to bind
    #[arg(long, env = "FILE_BENCH_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, short, env = "FILE_BENCH_PORT", default_value_t = 1234)]
    pub port: u16,

    /// Directory holding the stored files
    #[arg(long, env = "FILE_BENCH_STORAGE_DIR", default_value = "server_files")]
    pub storage_dir: PathBuf,

    /// Size of the dispatch pool
    #[arg(long, short, env = "FILE_BENCH_WORKERS", default_value_t = DEFAULT_WORKERS, value_parser = parse_positive)]
    pub workers: usize,

    /// Execution strategy of the dispatch pool
    #[arg(long, value_enum, env = "FILE_BENCH_POOL", default_value_t = PoolKind::Thread)]
    pub pool: PoolKind,

    /// Per-connection socket timeout in seconds
    #[arg(long, env = "FILE_BENCH_TIMEOUT", default_value = "60", value_parser = parse_seconds)]
    pub timeout: Duration,

    /// Raw bytes per encoded chunk
    #[arg(long, env = "FILE_BENCH_CHUNK_SIZE", default_value = "1058576", value_parser = parse_positive)]
    pub chunk_size: usize,

    /// Seconds between two status reports
    #[arg(long, env = "FILE_BENCH_REPORT_INTERVAL", default_value = "10", value_parser = parse_seconds)]
    pub report_interval: Duration,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "FILE_BENCH_LOG", default_value = "info")]
    pub log_level: String,

    /// Serve storage requests on stdin/stdout (process pool child)
    #[arg(long, hide = true)]
    pub worker: bool,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            storage_dir: self.storage_dir.clone(),
            workers: self.workers,
            pool: self.pool,
            timeout: self.timeout,
            chunk_size: self.chunk_size,
            report_interval: self.report_interval,
        }
    }
}

/// Concurrent transfer benchmark.
#[derive(Clone, Debug, Parser)]
#[command(name = "tcp_client", version)]
pub struct ClientArgs {
    /// Transfer to benchmark
    #[arg(value_enum)]
    pub operation: Operation,

    /// File to transfer
    pub file: String,

    /// Number of concurrent sessions
    #[arg(long, short, env = "FILE_BENCH_CLIENT_WORKERS", default_value_t = 1, value_parser = parse_positive)]
    pub workers: usize,

    /// Where sessions run
    #[arg(long, short, value_enum, env = "FILE_BENCH_MODE", default_value_t = SessionMode::Thread)]
    pub mode: SessionMode,

    /// Server address (host:port)
    #[arg(long, env = "FILE_BENCH_SERVER", default_value = "127.0.0.1:1234")]
    pub server: String,

    /// Socket timeout in seconds
    #[arg(long, env = "FILE_BENCH_TIMEOUT", default_value = "60", value_parser = parse_seconds)]
    pub timeout: Duration,

    /// Raw bytes per encoded chunk
    #[arg(long, env = "FILE_BENCH_CHUNK_SIZE", default_value = "1058576", value_parser = parse_positive)]
    pub chunk_size: usize,

    /// Directory uploads are read from
    #[arg(long, env = "FILE_BENCH_SOURCE_DIR", default_value = "client_files")]
    pub source_dir: PathBuf,

    /// Directory downloads are written to
    #[arg(long, env = "FILE_BENCH_SAVE_DIR", default_value = "client_downloads")]
    pub save_dir: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "FILE_BENCH_LOG", default_value = "info")]
    pub log_level: String,

    /// Run a single session and write its result to stdout
    #[arg(long, hide = true)]
    pub session: bool,
}

impl ClientArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server: self.server.clone(),
            timeout: self.timeout,
            chunk_size: self.chunk_size,
            source_dir: self.source_dir.clone(),
            save_dir: self.save_dir.clone(),
        }
    }

    pub fn plan(&self) -> BenchmarkPlan {
        BenchmarkPlan {
            op: self.operation,
            filename: self.file.clone(),
            workers: self.workers,
            mode: self.mode,
            client: self.client_config(),
            session_command: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_server_defaults() {
        let args = ServerArgs::try_parse_from(["tcp_server"]).unwrap();
        let config = args.config();
        assert_eq!(config.bind_addr(), "0.0.0.0:1234");
        assert_eq!(config.workers, 5);
        assert_eq!(config.pool, PoolKind::Thread);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.chunk_size, 1_058_576);
        assert!(!args.worker);
    }

    #[test]
    fn test_server_options() {
        let args = ServerArgs::try_parse_from([
            "tcp_server",
            "--port",
            "4000",
            "--pool",
            "process",
            "-w",
            "8",
            "--timeout",
            "0.5",
        ])
        .unwrap();
        assert_eq!(args.port, 4000);
        assert_eq!(args.pool, PoolKind::Process);
        assert_eq!(args.workers, 8);
        assert_eq!(args.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ServerArgs::try_parse_from(["tcp_server", "--workers", "0"]).is_err());
        assert!(ServerArgs::try_parse_from(["tcp_server", "--timeout", "soon"]).is_err());
        assert!(ServerArgs::try_parse_from(["tcp_server", "--timeout", "-1"]).is_err());
        assert!(ClientArgs::try_parse_from(["tcp_client", "delete", "a.txt"]).is_err());
        assert!(ClientArgs::try_parse_from(["tcp_client", "upload"]).is_err());
    }

    #[test]
    fn test_client_plan() {
        let args = ClientArgs::try_parse_from([
            "tcp_client",
            "download",
            "10MB.txt",
            "--workers",
            "10",
            "--mode",
            "process",
            "--server",
            "10.0.0.2:1234",
        ])
        .unwrap();
        let plan = args.plan();
        assert_eq!(plan.op, Operation::Download);
        assert_eq!(plan.filename, "10MB.txt");
        assert_eq!(plan.workers, 10);
        assert_eq!(plan.mode, SessionMode::Process);
        assert_eq!(plan.client.server, "10.0.0.2:1234");
        assert_eq!(plan.client.save_dir, PathBuf::from("client_downloads"));
        assert!(!args.session);
    }
}
