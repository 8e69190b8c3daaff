//! Wire framing: the command line, the base64 payload stream and its end-of-stream marker.
//!
//! A connection starts with one command line (`LIST`, `UPLOAD <name>` or
//! `DOWNLOAD <name>`). Payloads are pushed as base64 text in chunks and
//! terminated by [`SENTINEL`], which can never occur inside standard base64
//! because `_` is outside its alphabet.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::debug;

use crate::{common::TimeoutOptions, error::TransferError};

/// End-of-stream marker appended after the last encoded chunk.
pub const SENTINEL: &[u8] = b"__END__";

/// How long a command line without newline may wait for the rest of its bytes.
pub const COMMAND_LINE_GRACE: Duration = Duration::from_millis(100);

/// Longest unterminated text still read as a reply instead of a cut-off payload.
pub const MAX_REPLY_LEN: usize = 4096;

/// Raw bytes read per encoded chunk.
///
/// Rounded down to a multiple of 3 so no chunk but the last carries `=` padding,
/// which keeps the concatenated stream a single valid base64 text.
pub fn raw_chunk_len(chunk_size: usize) -> usize {
    (chunk_size / 3).max(1) * 3
}

/// The command carried by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Upload { filename: Option<String> },
    Download { filename: Option<String> },
    /// Unrecognised keyword. An empty keyword means the line was blank.
    Unknown(String),
}

impl Command {
    /// Parse the first whitespace-delimited token as keyword and the second as filename.
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let keyword = match parts.next() {
            Some(keyword) => keyword,
            None => return Self::Unknown(String::new()),
        };
        let filename = parts.next().map(str::to_string);
        match keyword.to_ascii_uppercase().as_str() {
            "LIST" => Self::List,
            "UPLOAD" => Self::Upload { filename },
            "DOWNLOAD" => Self::Download { filename },
            _ => Self::Unknown(keyword.to_string()),
        }
    }

    /// Render the command line as sent by a client, newline included.
    pub fn to_line(&self) -> String {
        match self {
            Self::List => "LIST\n".to_string(),
            Self::Upload { filename } => format!("UPLOAD {}\n", filename.as_deref().unwrap_or("")),
            Self::Download { filename } => {
                format!("DOWNLOAD {}\n", filename.as_deref().unwrap_or(""))
            }
            Self::Unknown(keyword) => format!("{keyword}\n"),
        }
    }
}

/// What the server sent for a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A sentinel-terminated payload, decoded.
    Payload(Vec<u8>),
    /// A textual reply that ended without a sentinel.
    Reply(String),
}

/// One side of a framed connection.
///
/// Bytes read past the command line stay in the buffer and are consumed by
/// [`Connection::stream_decode`], so nothing received is ever discarded between reads.
pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
    chunk_size: usize,
    timeout_options: TimeoutOptions,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, chunk_size: usize, timeout_options: TimeoutOptions) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(chunk_size.min(64 * 1024)),
            chunk_size,
            timeout_options,
        }
    }

    /// Read more bytes into the buffer, returning how many arrived (0 at end of stream),
    /// or `None` when nothing came within `limit`.
    async fn try_fill(&mut self, limit: Duration) -> Result<Option<usize>, TransferError> {
        self.buffer.reserve(self.chunk_size.min(1024 * 1024).max(1024));
        match timeout(limit, self.stream.read_buf(&mut self.buffer)).await {
            Ok(result) => result.map(Some).map_err(TransferError::transport),
            Err(_) => Ok(None),
        }
    }

    async fn fill_buffer(&mut self, limit: Duration) -> Result<usize, TransferError> {
        match self.try_fill(limit).await? {
            Some(n) => Ok(n),
            None => {
                debug!("Timeout waiting for data from peer");
                Err(TransferError::Timeout(format!(
                    "no data from peer within {:?}",
                    limit
                )))
            }
        }
    }

    /// Read the command line.
    ///
    /// A line ends at the first newline. Bytes without a newline are taken whole once
    /// the peer pauses for [`COMMAND_LINE_GRACE`] or closes, since older clients send
    /// the command without a terminator.
    pub async fn read_command_line(&mut self) -> Result<Command, TransferError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                return Ok(Command::parse(&String::from_utf8_lossy(&line)));
            }
            if self.buffer.is_empty() {
                if self.fill_buffer(self.timeout_options.idle_timeout).await? == 0 {
                    return Err(TransferError::NoCommand);
                }
                continue;
            }
            match self.try_fill(COMMAND_LINE_GRACE).await? {
                Some(n) if n > 0 => continue,
                _ => {
                    let line = self.buffer.split();
                    return Ok(Command::parse(&String::from_utf8_lossy(&line)));
                }
            }
        }
    }

    /// Write a raw message.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransferError> {
        match timeout(self.timeout_options.write_timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(TransferError::transport),
            Err(_) => {
                debug!("Timeout to send {} bytes", data.len());
                Err(TransferError::Timeout(format!(
                    "could not send {} bytes within {:?}",
                    data.len(),
                    self.timeout_options.write_timeout
                )))
            }
        }
    }

    /// Write a textual reply.
    pub async fn send_text(&mut self, text: &str) -> Result<(), TransferError> {
        self.send(text.as_bytes()).await
    }

    /// Encode `reader` chunk by chunk onto the connection, then write the sentinel.
    ///
    /// Returns the number of raw bytes read from the source.
    pub async fn stream_encode<R>(&mut self, mut reader: R) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; raw_chunk_len(self.chunk_size)];
        let mut total = 0u64;
        loop {
            // Fill the chunk completely so that only the final one can be short.
            let mut filled = 0;
            while filled < chunk.len() {
                let n = reader.read(&mut chunk[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            total += filled as u64;
            let encoded = STANDARD.encode(&chunk[..filled]);
            self.send(encoded.as_bytes()).await?;
            debug!("Sent chunk of {} raw bytes", filled);
            if filled < chunk.len() {
                break;
            }
        }
        self.send(SENTINEL).await?;
        Ok(total)
    }

    /// Accumulate bytes until the sentinel is found and decode everything before it.
    ///
    /// The search restarts `SENTINEL.len() - 1` bytes before the previous end of the
    /// buffer, so a sentinel split across two reads is still found. Returns `None` when
    /// the peer closes first; the received bytes then stay in the buffer.
    async fn decode_until_sentinel(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        let mut searched = 0usize;
        loop {
            if let Some(pos) = find_subslice(&self.buffer[searched..], SENTINEL) {
                let encoded = self.buffer.split_to(searched + pos);
                self.buffer.advance(SENTINEL.len());
                debug!("Found end of stream after {} encoded bytes", encoded.len());
                return STANDARD.decode(&encoded).map(Some).map_err(|err| {
                    TransferError::Protocol(format!("invalid payload encoding: {err}"))
                });
            }
            searched = self.buffer.len().saturating_sub(SENTINEL.len() - 1);

            if self.fill_buffer(self.timeout_options.read_timeout).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Receive a sentinel-terminated payload.
    pub async fn stream_decode(&mut self) -> Result<Vec<u8>, TransferError> {
        match self.decode_until_sentinel().await? {
            Some(data) => Ok(data),
            None => {
                let received = self.buffer.len();
                self.buffer.clear();
                Err(TransferError::Transport(format!(
                    "connection closed before end of stream after {received} bytes"
                )))
            }
        }
    }

    /// Receive a download: either a payload or the short reply sent in its place.
    pub async fn stream_decode_or_reply(&mut self) -> Result<Received, TransferError> {
        match self.decode_until_sentinel().await? {
            Some(data) => Ok(Received::Payload(data)),
            None if !self.buffer.is_empty() && self.buffer.len() <= MAX_REPLY_LEN => {
                let text = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                Ok(Received::Reply(text))
            }
            None => {
                let received = self.buffer.len();
                self.buffer.clear();
                Err(TransferError::Transport(format!(
                    "connection closed before end of stream after {received} bytes"
                )))
            }
        }
    }

    /// Read until the peer closes and return everything as text.
    pub async fn read_reply(&mut self) -> Result<String, TransferError> {
        while self.fill_buffer(self.timeout_options.read_timeout).await? > 0 {}
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Ok(text)
    }

    /// Wait for the handshake `token`.
    ///
    /// Anything else is drained to the end and returned as [`TransferError::Remote`].
    pub async fn expect_token(&mut self, token: &str) -> Result<(), TransferError> {
        let token = token.as_bytes();
        while self.buffer.len() < token.len() && token.starts_with(&self.buffer) {
            if self.fill_buffer(self.timeout_options.read_timeout).await? == 0 {
                break;
            }
        }
        if self.buffer.starts_with(token) {
            self.buffer.advance(token.len());
            return Ok(());
        }
        let reply = self.read_reply().await?;
        Err(TransferError::Remote(reply))
    }

    /// Close the write half so the peer sees end of stream.
    pub async fn shutdown(&mut self) -> Result<(), TransferError> {
        self.stream
            .shutdown()
            .await
            .map_err(TransferError::transport)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::duplex;

    use super::*;

    fn options() -> TimeoutOptions {
        TimeoutOptions::uniform(Duration::from_secs(5))
    }

    #[test]
    fn test_sentinel_outside_base64_alphabet() {
        let alphabet = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/=";
        assert!(SENTINEL.iter().any(|b| !alphabet.contains(b)));
    }

    #[test]
    fn test_raw_chunk_len_is_multiple_of_three() {
        assert_eq!(raw_chunk_len(1_058_576), 1_058_574);
        assert_eq!(raw_chunk_len(9), 9);
        assert_eq!(raw_chunk_len(1), 3);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("LIST\n"), Command::List);
        assert_eq!(Command::parse("list"), Command::List);
        assert_eq!(
            Command::parse("UPLOAD test.txt\n"),
            Command::Upload {
                filename: Some("test.txt".to_string())
            }
        );
        assert_eq!(Command::parse("download"), Command::Download { filename: None });
        assert_eq!(
            Command::parse("DELETE x"),
            Command::Unknown("DELETE".to_string())
        );
        assert_eq!(Command::parse("  \r\n"), Command::Unknown(String::new()));
    }

    #[tokio::test]
    async fn test_read_command_line_keeps_trailing_bytes() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"UPLOAD a.bin\naGVsbG8=__END__").await.unwrap();
        let mut conn = Connection::new(server, 1024, options());
        assert_eq!(
            conn.read_command_line().await.unwrap(),
            Command::Upload {
                filename: Some("a.bin".to_string())
            }
        );
        assert_eq!(conn.stream_decode().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_read_command_line_without_newline() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"DOWNLOAD b.bin").await.unwrap();
        let mut conn = Connection::new(server, 1024, options());
        assert_eq!(
            conn.read_command_line().await.unwrap(),
            Command::Download {
                filename: Some("b.bin".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_read_command_line_on_closed_connection() {
        let (client, server) = duplex(64);
        drop(client);
        let mut conn = Connection::new(server, 1024, options());
        assert!(matches!(
            conn.read_command_line().await,
            Err(TransferError::NoCommand)
        ));
    }

    #[tokio::test]
    async fn test_read_command_line_times_out() {
        let (_client, server) = duplex(64);
        let mut conn = Connection::new(
            server,
            1024,
            TimeoutOptions::uniform(Duration::from_millis(50)),
        );
        assert!(matches!(
            conn.read_command_line().await,
            Err(TransferError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_round_trip_with_split_reads() {
        // A 3 byte pipe forces the sentinel to arrive across several reads.
        let (client, server) = duplex(3);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let expected = payload.clone();
        let sender = tokio::spawn(async move {
            let mut conn = Connection::new(client, 7, options());
            conn.stream_encode(&payload[..]).await.unwrap()
        });

        let mut receiver = Connection::new(server, 7, options());
        let received = receiver.stream_decode().await.unwrap();
        assert_eq!(sender.await.unwrap(), 1000);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_payload_equal_to_sentinel_text() {
        let (client, server) = duplex(16);
        let sender = tokio::spawn(async move {
            let mut conn = Connection::new(client, 4, options());
            conn.stream_encode(SENTINEL).await.unwrap();
        });
        let mut receiver = Connection::new(server, 4, options());
        assert_eq!(receiver.stream_decode().await.unwrap(), SENTINEL);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (client, server) = duplex(64);
        let sender = tokio::spawn(async move {
            let mut conn = Connection::new(client, 64, options());
            conn.stream_encode(&b""[..]).await.unwrap()
        });
        let mut receiver = Connection::new(server, 64, options());
        assert!(receiver.stream_decode().await.unwrap().is_empty());
        assert_eq!(sender.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_decode_or_reply_reports_plain_reply() {
        let (mut client, server) = duplex(64);
        client.write_all(b"File not found").await.unwrap();
        drop(client);
        let mut receiver = Connection::new(server, 64, options());
        assert_eq!(
            receiver.stream_decode_or_reply().await.unwrap(),
            Received::Reply("File not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_decode_or_reply_rejects_long_unterminated_stream() {
        let (mut client, server) = duplex(64 * 1024);
        let body = vec![b'A'; MAX_REPLY_LEN + 4];
        let writer = tokio::spawn(async move {
            client.write_all(&body).await.unwrap();
        });
        let mut receiver = Connection::new(server, 1024, options());
        let result = receiver.stream_decode_or_reply().await;
        writer.await.unwrap();
        assert!(matches!(result, Err(TransferError::Transport(_))));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_not_echoed() {
        let (mut client, server) = duplex(64);
        client.write_all(b"U0VDUkVUUEFZTE9BRA==").await.unwrap();
        drop(client);
        let mut receiver = Connection::new(server, 64, options());
        match receiver.stream_decode().await {
            Err(TransferError::Transport(text)) => {
                assert_eq!(text, "connection closed before end of stream after 20 bytes");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_command_line_split_across_reads() {
        // Only 3 bytes fit in the pipe, so the line arrives in pieces.
        let (mut client, server) = duplex(3);
        let writer = tokio::spawn(async move {
            client.write_all(b"UPLOAD split-name.bin\n").await.unwrap();
            client
        });
        let mut conn = Connection::new(server, 1024, options());
        assert_eq!(
            conn.read_command_line().await.unwrap(),
            Command::Upload {
                filename: Some("split-name.bin".to_string())
            }
        );
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_command_line_split_without_newline_until_close() {
        let (mut client, server) = duplex(3);
        let writer = tokio::spawn(async move {
            client.write_all(b"LIST").await.unwrap();
        });
        let mut conn = Connection::new(server, 1024, options());
        assert_eq!(conn.read_command_line().await.unwrap(), Command::List);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_token_mismatch_drains_reply() {
        let (mut client, server) = duplex(64);
        client.write_all(b"Invalid filename").await.unwrap();
        drop(client);
        let mut conn = Connection::new(server, 64, options());
        match conn.expect_token("READY").await {
            Err(TransferError::Remote(text)) => assert_eq!(text, "Invalid filename"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
