use std::path::Path;

use tokio::{
    io::AsyncRead,
    net,
    time::timeout,
};
use tracing::debug;

use crate::{
    codec::{Command, Connection, Received},
    common::{reply, TimeoutOptions},
    config::ClientConfig,
    error::TransferError,
};

/// Client side of the protocol. Every call opens its own connection.
#[derive(Debug, Clone)]
pub struct FileClient {
    /// `host:port` of the server.
    addr: String,
    /// Options for the timeout of the connection
    timeout_options: TimeoutOptions,
    /// Raw bytes per encoded chunk on uploads.
    chunk_size: usize,
}

impl FileClient {
    pub fn new<A: Into<String>>(addr: A, timeout_options: TimeoutOptions, chunk_size: usize) -> Self {
        Self {
            addr: addr.into(),
            timeout_options,
            chunk_size,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.server.clone(),
            config.timeout_options(),
            config.chunk_size,
        )
    }

    /// Open a connection and send `line` as the command line.
    async fn open(&self, line: &str) -> Result<Connection<net::TcpStream>, TransferError> {
        let stream = match timeout(
            self.timeout_options.write_timeout,
            net::TcpStream::connect(&self.addr),
        )
        .await
        {
            Ok(result) => result.map_err(TransferError::transport)?,
            Err(_) => {
                return Err(TransferError::Timeout(format!(
                    "could not connect to {} within {:?}",
                    self.addr, self.timeout_options.write_timeout
                )))
            }
        };
        stream.set_nodelay(true).map_err(TransferError::transport)?;
        let mut conn = Connection::new(stream, self.chunk_size, self.timeout_options.clone());
        conn.send_text(line).await?;
        debug!("Sent command {:?} to {}", line.trim_end(), self.addr);
        Ok(conn)
    }

    /// Send an arbitrary command line and return the server's whole reply.
    pub async fn request(&self, line: &str) -> Result<String, TransferError> {
        let mut conn = self.open(line).await?;
        conn.read_reply().await
    }

    /// The server's listing: one file name per line, or the empty-store message.
    pub async fn list(&self) -> Result<String, TransferError> {
        self.request(&Command::List.to_line()).await
    }

    /// Upload everything `reader` yields as `filename`. Returns the raw byte count.
    pub async fn upload<R>(&self, filename: &str, reader: R) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let command = Command::Upload {
            filename: Some(filename.to_string()),
        };
        let mut conn = self.open(&command.to_line()).await?;
        conn.expect_token(reply::READY).await?;
        let sent = conn.stream_encode(reader).await?;
        let answer = conn.read_reply().await?;
        if answer != reply::UPLOAD_OK {
            return Err(TransferError::Remote(answer));
        }
        Ok(sent)
    }

    pub async fn upload_bytes(&self, filename: &str, data: &[u8]) -> Result<u64, TransferError> {
        self.upload(filename, data).await
    }

    pub async fn upload_file(&self, filename: &str, path: &Path) -> Result<u64, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        self.upload(filename, file).await
    }

    /// Download the whole content of `filename`.
    pub async fn download(&self, filename: &str) -> Result<Vec<u8>, TransferError> {
        let command = Command::Download {
            filename: Some(filename.to_string()),
        };
        let mut conn = self.open(&command.to_line()).await?;
        match conn.stream_decode_or_reply().await? {
            Received::Payload(data) => Ok(data),
            Received::Reply(text) if text == reply::FILE_NOT_FOUND => {
                Err(TransferError::NotFound(filename.to_string()))
            }
            Received::Reply(text) => Err(TransferError::Remote(text)),
        }
    }

    /// Download `filename` into `dest`. Returns the number of bytes written.
    pub async fn download_to(&self, filename: &str, dest: &Path) -> Result<u64, TransferError> {
        let data = self.download(filename).await?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }
}
