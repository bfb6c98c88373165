//! Serialized access to the half-duplex bus.
//!
//! The physical bus cannot carry two exchanges at once, so every frame goes
//! through [`BusScheduler::execute`], which holds a FIFO-fair async mutex for
//! the whole request/response exchange including retries.

use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{self, EXCEPTION_LEN, Frame};
use crate::config::{BusConfig, ConnectionConfig};
use crate::error::{BusError, DecodeError};
use crate::transport::{self, BoxedTransport, Transport, TransportError};

/// Retry and timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    /// Response timeout per attempt.
    pub timeout: Duration,
    /// Extra attempts after the first one fails.
    pub max_retries: u32,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_retries: 3,
        }
    }
}

impl From<&BusConfig> for BusSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
        }
    }
}

/// Counters describing bus activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Transactions submitted.
    pub transactions: u64,
    /// Frames written, retries included.
    pub attempts: u64,
    /// Attempts that got no complete response in time.
    pub timeouts: u64,
    /// Responses rejected as corrupt or mismatched.
    pub bad_frames: u64,
    /// Transactions that failed after all attempts, or were rejected.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    transactions: AtomicU64,
    attempts: AtomicU64,
    timeouts: AtomicU64,
    bad_frames: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            transactions: self.transactions.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bad_frames: self.bad_frames.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one failed attempt.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Open(#[from] TransportError),
    #[error("transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// The transport slot guarded by the scheduler's mutex.
struct Link {
    transport: Option<BoxedTransport>,
    /// How to reopen the transport; `None` for an injected one.
    connection: Option<ConnectionConfig>,
}

impl Link {
    async fn ensure_open(&mut self, timeout: Duration) -> Result<&mut BoxedTransport, AttemptError> {
        if self.transport.is_none() {
            let connection = self.connection.as_ref().ok_or(AttemptError::Closed)?;
            self.transport = Some(transport::open(connection, timeout).await?);
        }
        self.transport.as_mut().ok_or(AttemptError::Closed)
    }

    fn reset(&mut self) {
        self.transport = None;
    }
}

/// Executes frames on the bus one at a time.
pub struct BusScheduler {
    link: Mutex<Link>,
    settings: BusSettings,
    counters: Counters,
}

impl BusScheduler {
    /// Scheduler that opens `connection` on first use and reopens it after
    /// I/O errors.
    pub fn new(connection: ConnectionConfig, settings: BusSettings) -> Self {
        Self::from_link(
            Link {
                transport: None,
                connection: Some(connection),
            },
            settings,
        )
    }

    /// Scheduler over an already open transport. The transport is not
    /// reopened once it fails.
    pub fn with_transport(transport: impl Transport + 'static, settings: BusSettings) -> Self {
        Self::from_link(
            Link {
                transport: Some(Box::new(transport)),
                connection: None,
            },
            settings,
        )
    }

    fn from_link(link: Link, settings: BusSettings) -> Self {
        Self {
            link: Mutex::new(link),
            settings,
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> BusSettings {
        self.settings
    }

    pub fn stats(&self) -> BusStats {
        self.counters.snapshot()
    }

    /// Run one transaction: send `request` and return the decoded response.
    ///
    /// Callers queue on the bus in submission order. Timeouts, I/O errors and
    /// corrupt or mismatched responses are retried `max_retries` times; a
    /// slave exception fails at once.
    pub async fn execute(&self, request: &Frame) -> Result<Frame, BusError> {
        request.validate().map_err(BusError::InvalidRequest)?;
        let bytes = codec::encode_request(request);

        let mut link = self.link.lock().await;
        Counters::bump(&self.counters.transactions);

        let attempts = self.settings.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            Counters::bump(&self.counters.attempts);
            trace!(
                slave = request.slave,
                function = request.function.code(),
                start = request.start,
                count = request.count,
                attempt,
                "SysBus request"
            );

            match self.attempt(&mut link, request, &bytes).await {
                Ok(response) => {
                    debug!(
                        slave = request.slave,
                        function = request.function.code(),
                        start = request.start,
                        count = request.count,
                        attempt,
                        "SysBus transaction complete"
                    );
                    return Ok(response);
                }
                Err(AttemptError::Decode(e)) if !e.is_retryable() => {
                    Counters::bump(&self.counters.failures);
                    warn!(
                        slave = request.slave,
                        error = %e,
                        "SysBus request rejected by slave"
                    );
                    return Err(match e {
                        DecodeError::Exception { function, code } => BusError::Rejected {
                            slave: request.slave,
                            function,
                            code,
                        },
                        other => BusError::InvalidRequest(other.to_string()),
                    });
                }
                Err(e) => {
                    match &e {
                        AttemptError::Timeout(_) => Counters::bump(&self.counters.timeouts),
                        AttemptError::Decode(_) => Counters::bump(&self.counters.bad_frames),
                        AttemptError::Io(_) | AttemptError::Open(_) | AttemptError::Closed => {
                            link.reset()
                        }
                    }
                    debug!(
                        slave = request.slave,
                        attempt,
                        of = attempts,
                        error = %e,
                        "SysBus attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Counters::bump(&self.counters.failures);
        warn!(
            slave = request.slave,
            function = request.function.code(),
            start = request.start,
            attempts,
            error = %last_error,
            "SysBus slave unreachable"
        );

        Err(BusError::Unreachable {
            slave: request.slave,
            attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        link: &mut Link,
        request: &Frame,
        bytes: &[u8],
    ) -> Result<Frame, AttemptError> {
        let timeout = self.settings.timeout;
        let transport = link.ensure_open(timeout).await?;

        let discarded = discard_stale(transport).await?;
        if discarded > 0 {
            debug!(bytes = discarded, "Discarded stale bytes before request");
        }

        let exchange = async {
            transport.write_all(bytes).await?;
            transport.flush().await?;
            read_response(transport, request).await
        };

        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| AttemptError::Timeout(timeout))??;

        Ok(codec::decode_response(&response, request)?)
    }
}

/// Drop bytes already waiting on the transport, e.g. a late answer to a
/// timed-out attempt.
async fn discard_stale<T: AsyncRead + Unpin + ?Sized>(transport: &mut T) -> io::Result<usize> {
    let mut buf = [0u8; 256];
    let mut total = 0;

    loop {
        match tokio::time::timeout(Duration::ZERO, transport.read(&mut buf)).await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transport closed",
                ));
            }
            Ok(Ok(n)) => total += n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(total),
        }
    }
}

/// Read one response frame, sized from the request it answers.
async fn read_response<T: AsyncRead + Unpin + ?Sized>(
    transport: &mut T,
    request: &Frame,
) -> io::Result<Vec<u8>> {
    let mut frame = vec![0u8; 2];
    transport.read_exact(&mut frame).await?;

    let len = if frame[1] & 0x80 != 0 {
        EXCEPTION_LEN
    } else {
        request.response_len()
    };
    frame.resize(len, 0);
    transport.read_exact(&mut frame[2..]).await?;

    Ok(frame)
}
