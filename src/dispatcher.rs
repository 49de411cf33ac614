/// Outbound event dispatcher
///
/// Every connection has exactly one writer task that owns the write half of
/// the transport. Producers (the session, the keep-alive timer) hold an
/// [`Outbox`] and hand over whole events through a bounded, ordered queue,
/// so payloads never interleave and a slow client applies backpressure.
/// A client that stops reading altogether is detected by the send deadline
/// and by the bounded flush in [`Dispatcher::close`].

use crate::protocol::{CodecError, Event, Message, Ping, WyomingCodec};
use futures::SinkExt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace, warn};

/// Default depth of the outbound queue
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Outbound channel closed")]
    Closed,

    #[error("Writer failed: {0}")]
    Writer(#[from] CodecError),

    #[error("Writer task aborted: {0}")]
    Aborted(String),

    #[error("Client stopped reading for {0:?}")]
    Stalled(Duration),
}

/// Cloneable handle for queueing outbound events
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Event>,
    send_timeout: Option<Duration>,
}

impl Outbox {
    /// Create an outbox and the receiving end of its queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Self {
            tx,
            send_timeout: None,
        };
        (outbox, rx)
    }

    /// Give up on a full queue after `timeout`
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Queue an event, waiting while the queue is full
    ///
    /// Fails with [`DispatchError::Stalled`] once the send deadline passes.
    pub async fn send(&self, event: Event) -> Result<(), DispatchError> {
        match self.send_timeout {
            Some(timeout) => self
                .tx
                .send_timeout(event, timeout)
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => DispatchError::Stalled(timeout),
                    SendTimeoutError::Closed(_) => DispatchError::Closed,
                }),
            None => self.tx.send(event).await.map_err(|_| DispatchError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Writer task plus optional keep-alive producer for one connection
pub struct Dispatcher {
    outbox: Outbox,
    writer: JoinHandle<Result<u64, CodecError>>,
    keepalive: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the writer task on `writer`
    ///
    /// Producers wait at most `send_timeout` for room in the queue.
    pub fn spawn<W>(
        writer: W,
        capacity: usize,
        send_timeout: Option<Duration>,
        keepalive: Option<Duration>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, rx) = Outbox::channel(capacity);
        let outbox = match send_timeout {
            Some(timeout) => outbox.with_send_timeout(timeout),
            None => outbox,
        };
        let sink = FramedWrite::new(writer, WyomingCodec::new());
        let writer = tokio::spawn(drain(sink, rx));

        let keepalive = keepalive
            .filter(|period| !period.is_zero())
            .map(|period| tokio::spawn(keep_alive(outbox.clone(), period)));

        Self {
            outbox,
            writer,
            keepalive,
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Stop producers, flush queued events and shut down the write half
    ///
    /// Every other [`Outbox`] clone must be dropped first, otherwise this
    /// waits for them. A writer still stuck after `grace` is aborted and its
    /// unsent events are lost.
    pub async fn close(mut self, grace: Duration) -> Result<u64, DispatchError> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
            let _ = keepalive.await;
        }
        drop(self.outbox);

        match tokio::time::timeout(grace, &mut self.writer).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(DispatchError::Aborted(e.to_string())),
            Err(_) => {
                self.writer.abort();
                let _ = (&mut self.writer).await;
                Err(DispatchError::Stalled(grace))
            }
        }
    }
}

/// Single writer: drains the queue in order, flushing when it runs dry
async fn drain<W>(
    mut sink: FramedWrite<W, WyomingCodec>,
    mut rx: mpsc::Receiver<Event>,
) -> Result<u64, CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    while let Some(event) = rx.recv().await {
        trace!("Writing '{}' event", event.event_type);
        sink.feed(event).await?;
        written += 1;

        while let Ok(event) = rx.try_recv() {
            trace!("Writing '{}' event", event.event_type);
            sink.feed(event).await?;
            written += 1;
        }

        sink.flush().await?;
    }

    if let Err(e) = sink.close().await {
        debug!("Closing write half failed: {}", e);
    }

    debug!("Writer finished after {} events", written);
    Ok(written)
}

async fn keep_alive(outbox: Outbox, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = outbox.send(Ping::default().to_event()).await {
            warn!("Keep-alive stopped: {}", e);
            break;
        }
    }
}
