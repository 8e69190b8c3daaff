use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net, task, time};
use tracing::{debug, info, warn};

use crate::{
    codec::{Command, Connection},
    common::{reply, TimeoutOptions},
    config::ServerConfig,
    error::TransferError,
    metrics::Metrics,
    storage::{validate_filename, WorkerOp, WorkerReply},
    workerpool::DispatchPool,
};

/// How a connection ended, for the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// Everything a connection handler shares with the rest of the server.
#[derive(Clone)]
pub struct ServerContext {
    /// The pool running every storage operation.
    pool: Arc<dyn DispatchPool>,
    /// Counters updated once per connection.
    metrics: Arc<Metrics>,
    /// Options for the timeout of the connection
    timeout_options: TimeoutOptions,
    /// Raw bytes per encoded chunk on downloads.
    chunk_size: usize,
}

/// Serves the single command of one accepted connection.
pub struct ConnectionHandler {
    conn: Connection<net::TcpStream>,
    peer: SocketAddr,
    ctx: ServerContext,
}

impl ConnectionHandler {
    pub fn new(stream: net::TcpStream, peer: SocketAddr, ctx: ServerContext) -> Self {
        let conn = Connection::new(stream, ctx.chunk_size, ctx.timeout_options.clone());
        Self { conn, peer, ctx }
    }

    /// Serve the connection, count its outcome and close it. Never fails.
    pub async fn run(mut self) {
        info!("Connected: {}", self.peer);
        match self.serve().await {
            Ok(Outcome::Success) => self.ctx.metrics.record_success(),
            Ok(Outcome::Failure) => self.ctx.metrics.record_failure(),
            Err(err) => {
                warn!("Error handling {}: {}", self.peer, err);
                if let Err(send_err) = self.conn.send_text(&format!("Error: {err}")).await {
                    debug!("Could not report error to {}: {}", self.peer, send_err);
                }
                self.ctx.metrics.record_failure();
            }
        }
        if let Err(err) = self.conn.shutdown().await {
            debug!("Could not shut down connection to {}: {}", self.peer, err);
        }
        debug!("Closed connection from {}", self.peer);
    }

    async fn serve(&mut self) -> Result<Outcome, TransferError> {
        let command = match self.conn.read_command_line().await {
            Ok(command) => command,
            Err(TransferError::NoCommand) => {
                debug!("{} closed without sending a command", self.peer);
                return Ok(Outcome::Failure);
            }
            Err(err) => return Err(err),
        };
        debug!("Received command from {}: {:?}", self.peer, command);

        match command {
            Command::List => self.list().await,
            Command::Upload { filename } => self.upload(filename).await,
            Command::Download { filename } => self.download(filename).await,
            Command::Unknown(keyword) => {
                let text = if keyword.is_empty() {
                    reply::INVALID_COMMAND
                } else {
                    reply::UNKNOWN_COMMAND
                };
                self.conn.send_text(text).await?;
                Ok(Outcome::Failure)
            }
        }
    }

    /// Reply with the reason when `filename` is missing or unusable.
    async fn require_filename(
        &mut self,
        filename: Option<String>,
    ) -> Result<Option<String>, TransferError> {
        let filename = match filename {
            Some(filename) => filename,
            None => {
                self.conn.send_text(reply::NO_FILENAME).await?;
                return Ok(None);
            }
        };
        if let Err(err) = validate_filename(&filename) {
            debug!("Rejected filename from {}: {}", self.peer, err);
            self.conn.send_text(reply::INVALID_FILENAME).await?;
            return Ok(None);
        }
        Ok(Some(filename))
    }

    async fn list(&mut self) -> Result<Outcome, TransferError> {
        match self.ctx.pool.submit(WorkerOp::List).await? {
            WorkerReply::Listing(text) => {
                self.conn.send_text(&text).await?;
                Ok(Outcome::Success)
            }
            WorkerReply::Failed(message) => {
                self.conn.send_text(&format!("Error: {message}")).await?;
                Ok(Outcome::Failure)
            }
            other => Err(unexpected_reply("list", &other)),
        }
    }

    async fn upload(&mut self, filename: Option<String>) -> Result<Outcome, TransferError> {
        let filename = match self.require_filename(filename).await? {
            Some(filename) => filename,
            None => return Ok(Outcome::Failure),
        };
        self.conn.send_text(reply::READY).await?;
        let data = self.conn.stream_decode().await?;
        let size = data.len();

        let op = WorkerOp::Store {
            filename: filename.clone(),
            data,
        };
        match self.ctx.pool.submit(op).await? {
            WorkerReply::Stored => {
                info!("Stored {} ({} bytes) from {}", filename, size, self.peer);
                self.conn.send_text(reply::UPLOAD_OK).await?;
                Ok(Outcome::Success)
            }
            WorkerReply::Failed(message) => {
                self.conn
                    .send_text(&format!("Upload error: {message}"))
                    .await?;
                Ok(Outcome::Failure)
            }
            other => Err(unexpected_reply("store", &other)),
        }
    }

    async fn download(&mut self, filename: Option<String>) -> Result<Outcome, TransferError> {
        let filename = match self.require_filename(filename).await? {
            Some(filename) => filename,
            None => return Ok(Outcome::Failure),
        };
        let op = WorkerOp::Retrieve {
            filename: filename.clone(),
        };
        match self.ctx.pool.submit(op).await? {
            WorkerReply::Content(data) => {
                let sent = self.conn.stream_encode(&data[..]).await?;
                info!("Sent {} ({} bytes) to {}", filename, sent, self.peer);
                Ok(Outcome::Success)
            }
            WorkerReply::NotFound => {
                self.conn.send_text(reply::FILE_NOT_FOUND).await?;
                Ok(Outcome::Failure)
            }
            WorkerReply::Failed(message) => {
                self.conn
                    .send_text(&format!("Download error: {message}"))
                    .await?;
                Ok(Outcome::Failure)
            }
            other => Err(unexpected_reply("retrieve", &other)),
        }
    }
}

fn unexpected_reply(op: &str, reply: &WorkerReply) -> TransferError {
    let kind = match reply {
        WorkerReply::Listing(_) => "listing",
        WorkerReply::Stored => "stored",
        WorkerReply::Content(_) => "content",
        WorkerReply::NotFound => "not found",
        WorkerReply::Failed(_) => "failed",
    };
    TransferError::Pool(format!("unexpected {kind} reply to {op}"))
}

/// The file server: an unbounded acceptor feeding one task per connection.
pub struct FileServer {
    ctx: ServerContext,
    /// Main worker for the server
    main_worker: Option<task::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl FileServer {
    /// Create a new file server running storage operations on `pool`.
    pub fn new(
        pool: Arc<dyn DispatchPool>,
        timeout_options: TimeoutOptions,
        chunk_size: usize,
    ) -> Self {
        Self {
            ctx: ServerContext {
                pool,
                metrics: Arc::new(Metrics::new()),
                timeout_options,
                chunk_size,
            },
            main_worker: None,
            local_addr: None,
        }
    }

    pub fn from_config(config: &ServerConfig, pool: Arc<dyn DispatchPool>) -> Self {
        Self::new(pool, config.timeout_options(), config.chunk_size)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    /// The bound address once [`FileServer::listen`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind `addr` and start accepting connections in the background.
    pub async fn listen(&mut self, addr: &str) -> Result<SocketAddr, TransferError> {
        let listener = net::TcpListener::bind(addr)
            .await
            .map_err(TransferError::transport)?;
        let local_addr = listener.local_addr().map_err(TransferError::transport)?;
        info!(
            "Listening on {} with {} {} workers",
            local_addr,
            self.ctx.pool.size(),
            self.ctx.pool.kind()
        );

        let ctx = self.ctx.clone();
        let handle = task::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {:?}", peer);
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {}: {}", peer, err);
                        }
                        let handler = ConnectionHandler::new(stream, peer, ctx.clone());
                        let _ = tokio::spawn(handler.run());
                    }
                    Err(err) => {
                        warn!("Failed to accept connection: {:?}", err);
                        // Usually out of descriptors; give in-flight connections a moment.
                        time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        self.main_worker = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting connections. Connections already accepted run to completion.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.main_worker.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}
