use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;

use crate::context::Context;
use crate::envelope::{Envelope, EnvelopeError};

/// Errors raised while moving envelopes across a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(String),
    #[error("transport closed")]
    Closed,
    #[error("recv timeout")]
    Timeout,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Bidirectional envelope stream bound to a single remote party.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError>;

    /// Receives the next envelope. Must be cancel safe: dropping the future before it
    /// resolves must not lose an envelope.
    async fn recv(&mut self) -> Result<Envelope, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens new transports to the remote party.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Transport: Transport + 'static;

    async fn dial(&self, ctx: &Context) -> Result<Self::Transport, TransportError>;
}

/// In-process transport: envelopes are JSON-encoded into a bounded queue read by the
/// other end of the pair.
#[derive(Debug)]
pub struct PipeTransport {
    sender: Option<mpsc::Sender<Vec<u8>>>,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl PipeTransport {
    pub fn pair() -> (PipeTransport, PipeTransport) {
        Self::pair_with_capacity(16)
    }

    pub fn pair_with_capacity(capacity: usize) -> (PipeTransport, PipeTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            PipeTransport {
                sender: Some(a_tx),
                receiver: b_rx,
            },
            PipeTransport {
                sender: Some(b_tx),
                receiver: a_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let sender = self.sender.as_ref().ok_or(TransportError::Closed)?;
        let bytes = envelope.to_vec()?;
        sender.send(bytes).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Envelope, TransportError> {
        let bytes = self.receiver.recv().await.ok_or(TransportError::Closed)?;
        Ok(Envelope::from_slice(&bytes)?)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sender.take();
        self.receiver.close();
        Ok(())
    }
}

/// Wrapper that enforces a timeout on every recv.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    recv_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, recv_timeout: Duration) -> Self {
        Self {
            inner,
            recv_timeout,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T> Transport for TimeoutTransport<T>
where
    T: Transport,
{
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.inner.send(envelope).await
    }

    async fn recv(&mut self) -> Result<Envelope, TransportError> {
        match time::timeout(self.recv_timeout, self.inner.recv()).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
