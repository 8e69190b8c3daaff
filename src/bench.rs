//! The benchmark driver: many concurrent sessions, one report.
//!
//! A session is one connection performing one upload or download. Sessions run
//! either as tasks of this process or as separate processes of the client binary
//! that hand their [`SessionResult`] back over stdout.

use std::{
    ffi::OsString,
    fmt,
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    client::FileClient,
    common::reply,
    config::ClientConfig,
    error::TransferError,
    message::{read_u64, Decode, Encode},
};

/// The transfer every session of a benchmark performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Operation {
    Upload,
    Download,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

/// Where sessions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SessionMode {
    /// Concurrent tasks inside the driver process.
    #[default]
    Thread,
    /// One child process per session.
    Process,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Bytes per second, or zero when no time elapsed.
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Outcome of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub ok: bool,
    pub elapsed: Duration,
    pub bytes: u64,
    /// Bytes per second.
    pub throughput: f64,
    pub message: String,
}

impl SessionResult {
    pub fn success<M: Into<String>>(elapsed: Duration, bytes: u64, message: M) -> Self {
        Self {
            ok: true,
            elapsed,
            bytes,
            throughput: throughput(bytes, elapsed),
            message: message.into(),
        }
    }

    pub fn failure<M: Into<String>>(elapsed: Duration, message: M) -> Self {
        Self {
            ok: false,
            elapsed,
            bytes: 0,
            throughput: 0.0,
            message: message.into(),
        }
    }
}

impl fmt::Display for SessionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Time: {:.2}s | Throughput: {:.2}B/s | {}",
            if self.ok { "OK" } else { "FAIL" },
            self.elapsed.as_secs_f64(),
            self.throughput,
            self.message
        )
    }
}

/// Layout: ok (u8), elapsed in nanoseconds, bytes, throughput bits, then the message.
impl Encode for SessionResult {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(25 + self.message.len());
        bytes.push(u8::from(self.ok));
        bytes.extend((self.elapsed.as_nanos() as u64).to_be_bytes());
        bytes.extend(self.bytes.to_be_bytes());
        bytes.extend(self.throughput.to_bits().to_be_bytes());
        bytes.extend(self.message.as_bytes());
        bytes
    }
}

impl Decode for SessionResult {
    fn decode(buf: &[u8]) -> Result<Self, TransferError> {
        if buf.len() < 25 {
            return Err(TransferError::Protocol("Insufficient bytes".to_string()));
        }
        Ok(Self {
            ok: buf[0] != 0,
            elapsed: Duration::from_nanos(read_u64(buf, 1)?),
            bytes: read_u64(buf, 9)?,
            throughput: f64::from_bits(read_u64(buf, 17)?),
            message: String::from_utf8_lossy(&buf[25..]).into_owned(),
        })
    }
}

/// Perform one session against the server described by `config`.
///
/// Uploads read `source_dir/filename`; downloads write `save_dir/filename`.
pub async fn run_session(op: Operation, filename: &str, config: &ClientConfig) -> SessionResult {
    let client = FileClient::from_config(config);
    let start = Instant::now();
    let result = match op {
        Operation::Upload => client
            .upload_file(filename, &config.source_dir.join(filename))
            .await
            .map(|bytes| (bytes, reply::UPLOAD_OK)),
        Operation::Download => match tokio::fs::create_dir_all(&config.save_dir).await {
            Ok(()) => client
                .download_to(filename, &config.save_dir.join(filename))
                .await
                .map(|bytes| (bytes, "Download completed")),
            Err(err) => Err(err.into()),
        },
    };
    let elapsed = start.elapsed();
    match result {
        Ok((bytes, message)) => SessionResult::success(elapsed, bytes, message),
        Err(err) => SessionResult::failure(elapsed, err.to_string()),
    }
}

/// How to start one isolated session process.
#[derive(Debug, Clone)]
pub struct SessionCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SessionCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<A: Into<OsString>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run `program` (the client binary) in session mode for `plan`.
    pub fn for_plan<P: Into<PathBuf>>(program: P, plan: &BenchmarkPlan) -> Self {
        let config = &plan.client;
        Self::new(program)
            .arg(plan.op.to_string())
            .arg(&plan.filename)
            .arg("--session")
            .arg("--server")
            .arg(&config.server)
            .arg("--timeout")
            .arg(config.timeout.as_secs_f64().to_string())
            .arg("--chunk-size")
            .arg(config.chunk_size.to_string())
            .arg("--source-dir")
            .arg(&config.source_dir)
            .arg("--save-dir")
            .arg(&config.save_dir)
    }

    async fn run(&self) -> SessionResult {
        let start = Instant::now();
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Err(err) => SessionResult::failure(
                start.elapsed(),
                format!("could not start session process: {err}"),
            ),
            Ok(output) if !output.status.success() => SessionResult::failure(
                start.elapsed(),
                format!("session process exited with {}", output.status),
            ),
            Ok(output) => SessionResult::decode(&output.stdout).unwrap_or_else(|err| {
                SessionResult::failure(start.elapsed(), format!("unreadable session result: {err}"))
            }),
        }
    }
}

/// What to benchmark.
#[derive(Debug, Clone)]
pub struct BenchmarkPlan {
    pub op: Operation,
    pub filename: String,
    /// Number of concurrent sessions.
    pub workers: usize,
    pub mode: SessionMode,
    pub client: ClientConfig,
    /// Used by [`SessionMode::Process`]; defaults to the running executable.
    pub session_command: Option<SessionCommand>,
}

/// Aggregated outcome of a benchmark.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub op: Operation,
    pub filename: String,
    pub workers: usize,
    pub mode: SessionMode,
    /// In completion order.
    pub sessions: Vec<SessionResult>,
}

impl BenchmarkReport {
    pub fn successes(&self) -> usize {
        self.sessions.iter().filter(|s| s.ok).count()
    }

    pub fn failures(&self) -> usize {
        self.sessions.len() - self.successes()
    }

    /// Mean elapsed time of the successful sessions.
    pub fn average_elapsed(&self) -> Duration {
        let ok = self.successes();
        if ok == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.sessions.iter().filter(|s| s.ok).map(|s| s.elapsed).sum();
        total / ok as u32
    }

    /// Mean throughput of the successful sessions, in bytes per second.
    pub fn average_throughput(&self) -> f64 {
        let ok = self.successes();
        if ok == 0 {
            return 0.0;
        }
        let total: f64 = self
            .sessions
            .iter()
            .filter(|s| s.ok)
            .map(|s| s.throughput)
            .sum();
        total / ok as f64
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Report ---")?;
        writeln!(f, "Operation      : {}", self.op.to_string().to_uppercase())?;
        writeln!(f, "File           : {}", self.filename)?;
        writeln!(f, "Workers        : {}", self.workers)?;
        writeln!(f, "Mode           : {}", self.mode)?;
        writeln!(f, "Avg Time       : {:.2}s", self.average_elapsed().as_secs_f64())?;
        writeln!(f, "Avg Throughput : {:.2} B/s", self.average_throughput())?;
        writeln!(f, "Success        : {}", self.successes())?;
        write!(f, "Failures       : {}", self.failures())
    }
}

/// Launch `plan.workers` concurrent sessions and wait for all of them.
///
/// Session failures are recorded in the report; only a missing executable for
/// process mode fails the whole run.
pub async fn run_benchmark(plan: &BenchmarkPlan) -> Result<BenchmarkReport, TransferError> {
    let session_command = match (plan.mode, &plan.session_command) {
        (SessionMode::Process, Some(command)) => Some(command.clone()),
        (SessionMode::Process, None) => Some(SessionCommand::for_plan(
            std::env::current_exe()?,
            plan,
        )),
        (SessionMode::Thread, _) => None,
    };

    let mut set = JoinSet::new();
    for _ in 0..plan.workers {
        match &session_command {
            Some(command) => {
                let command = command.clone();
                let _ = set.spawn(async move { command.run().await });
            }
            None => {
                let (op, filename, config) = (plan.op, plan.filename.clone(), plan.client.clone());
                let _ = set.spawn(async move { run_session(op, &filename, &config).await });
            }
        }
    }
    info!(
        "Started {} {} sessions for {} {}",
        plan.workers, plan.mode, plan.op, plan.filename
    );

    let mut sessions = Vec::with_capacity(plan.workers);
    while let Some(joined) = set.join_next().await {
        let result = joined.unwrap_or_else(|err| {
            warn!("Session task failed: {}", err);
            SessionResult::failure(Duration::ZERO, format!("session task failed: {err}"))
        });
        info!("{}", result);
        sessions.push(result);
    }

    Ok(BenchmarkReport {
        op: plan.op,
        filename: plan.filename.clone(),
        workers: plan.workers,
        mode: plan.mode,
        sessions,
    })
}
