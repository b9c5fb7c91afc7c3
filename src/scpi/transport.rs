//! SCPI over TCP transport.
//!
//! Every exchange opens a fresh connection, writes one CRLF-terminated command,
//! reads at most one reply line, and drops the socket. Nothing is pooled, so a
//! hung instrument can only ever stall the exchange that is talking to it.
//!
//! A read deadline that passes before any byte arrives is reported as an empty
//! reply rather than an error. `FUNC:RUN`, `FUNC:STOP` and `HAND:ERROR` never
//! answer, and this is how they succeed.

use crate::error::{DaqError, DaqResult};
use crate::instrument::InstrumentAddress;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

/// Default per-exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Line terminator appended to every outgoing command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Largest reply accepted from one exchange.
const REPLY_BUFFER_SIZE: usize = 4096;

/// Abstraction over how a command reaches an instrument.
///
/// The TCP implementation is [`TcpTransport`]; tests substitute
/// [`MockTransport`](crate::hardware::mock::MockTransport).
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send `command` to `address` and return the trimmed reply.
    ///
    /// An empty string means the instrument stayed silent until the deadline.
    async fn exchange(&self, address: &InstrumentAddress, command: &str) -> DaqResult<String>;
}

/// Connection-per-exchange TCP transport.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    /// Create a transport with the given connect/read deadline.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Deadline applied to each exchange.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn exchange(&self, address: &InstrumentAddress, command: &str) -> DaqResult<String> {
        exchange(address, command, self.timeout).await
    }
}

/// Perform one command exchange with an instrument.
///
/// The connect is bounded by `timeout`; the write and the reply read share a
/// second deadline of `timeout` starting once the connection is up. The socket
/// is closed on every return path.
pub async fn exchange(
    address: &InstrumentAddress,
    command: &str,
    timeout: Duration,
) -> DaqResult<String> {
    let mut stream = match time::timeout(
        timeout,
        TcpStream::connect((address.host.as_str(), address.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(DaqError::connectivity(address, e)),
        Err(_) => {
            return Err(DaqError::connectivity(
                address,
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", timeout),
                ),
            ))
        }
    };

    // Disable Nagle's algorithm, commands are tiny
    stream
        .set_nodelay(true)
        .map_err(|e| DaqError::connectivity(address, e))?;

    let deadline = Instant::now() + timeout;
    let frame = format!("{}{}", command, LINE_TERMINATOR);
    tracing::debug!(%address, command, "SCPI write");

    match time::timeout_at(deadline, stream.write_all(frame.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(DaqError::connectivity(address, e)),
        Err(_) => {
            return Err(DaqError::connectivity(
                address,
                io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
            ))
        }
    }

    let reply = read_reply(&mut stream, deadline)
        .await
        .map_err(|e| DaqError::connectivity(address, e))?;

    if reply.is_empty() {
        tracing::debug!(%address, command, "SCPI no reply before deadline");
    } else {
        tracing::debug!(%address, command, reply = %reply, "SCPI reply");
    }

    Ok(reply)
}

/// Read until a line feed, peer close, a full buffer, or the deadline.
///
/// Whatever arrived before the deadline is returned; zero bytes yield `""`.
async fn read_reply(stream: &mut TcpStream, deadline: Instant) -> io::Result<String> {
    let mut buf = vec![0u8; REPLY_BUFFER_SIZE];
    let mut filled = 0;

    while filled < buf.len() {
        match time::timeout_at(deadline, stream.read(&mut buf[filled..])).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let fresh = &buf[filled..filled + n];
                filled += n;
                if fresh.contains(&b'\n') {
                    break;
                }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => return Err(e),
        }
    }

    Ok(String::from_utf8_lossy(&buf[..filled]).trim().to_string())
}
