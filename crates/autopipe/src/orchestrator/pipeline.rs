//! Per-pipeline state owned by the orchestrator, and the stream handed to the
//! caller.

use crate::{error::Error, slot::OwnedSlot};
use core::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Weak},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::tcp::OwnedReadHalf,
    task::{JoinError, JoinHandle},
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;

/// Open pipelines by id.
pub(crate) type Registry = Mutex<HashMap<PipelineId, Pipeline>>;

/// Opaque identifier of an open pipeline, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub(crate) u64);

impl PipelineId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Keeps the first error reported by any stage of a pipeline.
#[derive(Default)]
pub(crate) struct FirstError(Mutex<Option<Error>>);

impl FirstError {
    pub(crate) fn record(&self, error: Error) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            #[cfg(feature = "tracing")]
            tracing::debug!("pipeline stage failed: {error}");
            *slot = Some(error);
        }
    }

    fn record_joined(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            self.record(Error::Io(io::Error::other(format!(
                "pipeline stage panicked: {e}"
            ))));
        }
    }

    pub(crate) fn take(&self) -> Option<Error> {
        self.0.lock().take()
    }
}

/// One half of a hop socket.
///
/// Failures of the socket itself are recorded against the hop's address
/// until the pipeline is cancelled, so they surface as that hop being
/// unavailable whichever stage tripped over them.
pub(crate) struct HopIo<S> {
    inner: S,
    addr: String,
    errors: Arc<FirstError>,
    cancel: CancellationToken,
}

impl<S> HopIo<S> {
    pub(crate) const fn new(
        inner: S,
        addr: String,
        errors: Arc<FirstError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            addr,
            errors,
            cancel,
        }
    }

    fn fail(&self, e: &io::Error) {
        if e.kind() != io::ErrorKind::Interrupted && !self.cancel.is_cancelled() {
            self.errors.record(Error::unavailable(
                self.addr.clone(),
                io::Error::new(e.kind(), e.to_string()),
            ));
        }
    }

    fn observe<T>(&self, polled: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(e)) = &polled {
            self.fail(e);
        }
        polled
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HopIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.observe(polled)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HopIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.observe(polled)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_flush(cx);
        this.observe(polled)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.observe(polled)
    }
}

/// A pump task and the address of the hop it writes into.
pub(crate) struct Stage {
    pub(crate) addr: String,
    pub(crate) handle: JoinHandle<()>,
}

/// Everything a live pipeline holds until it is closed.
pub(crate) struct Pipeline {
    pub(crate) cancel: CancellationToken,
    pub(crate) stages: Vec<Stage>,
    pub(crate) slots: Vec<OwnedSlot>,
    pub(crate) errors: Arc<FirstError>,
    pub(crate) last_addr: String,
}

impl Pipeline {
    /// Stops every stage, waits for it, returns the held slots and reports
    /// the first recorded failure.
    ///
    /// With `settle`, stages first get that long to finish on their own and
    /// only the rest are cancelled. A stage that was still running never
    /// delivered all of its input, which is reported against the hop it
    /// writes into.
    pub(crate) async fn teardown(self, settle: Option<Duration>) -> Option<Error> {
        let mut stalled = None;
        let mut running = Vec::with_capacity(self.stages.len());
        match settle {
            Some(wait) => {
                let deadline = Instant::now() + wait;
                for Stage { addr, mut handle } in self.stages {
                    match timeout_at(deadline, &mut handle).await {
                        Ok(joined) => self.errors.record_joined(joined),
                        Err(_) => {
                            if stalled.is_none() {
                                stalled = Some(addr);
                            }
                            running.push(handle);
                        }
                    }
                }
            }
            None => running.extend(self.stages.into_iter().map(|stage| stage.handle)),
        }

        self.cancel.cancel();
        for joined in join_all(running).await {
            self.errors.record_joined(joined);
        }
        drop(self.slots);

        self.errors.take().or_else(|| {
            stalled.map(|addr| {
                Error::unavailable(
                    addr,
                    io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "hop stopped reading before its input was delivered",
                    ),
                )
            })
        })
    }
}

/// The readable end of an open pipeline.
///
/// Reads come straight from the last hop's socket. The stream must be handed
/// back to [`Orchestrator::close`](super::Orchestrator::close) exactly once.
/// Dropping it unclosed cancels the pipeline and frees its slots, but any
/// failure it recorded is lost.
pub struct PipelineStream {
    id: PipelineId,
    reader: Option<HopIo<OwnedReadHalf>>,
    eof: bool,
    cancel: CancellationToken,
    registry: Weak<Registry>,
}

impl PipelineStream {
    pub(crate) const fn new(
        id: PipelineId,
        reader: HopIo<OwnedReadHalf>,
        cancel: CancellationToken,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id,
            reader: Some(reader),
            eof: false,
            cancel,
            registry,
        }
    }

    pub const fn id(&self) -> PipelineId {
        self.id
    }

    /// Whether a read has reached the end of the pipeline output.
    pub const fn is_consumed(&self) -> bool {
        self.eof
    }

    pub const fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Whether the output ends here, waiting at most `wait` for the last hop
    /// to say so.
    ///
    /// Covers callers that read exactly the bytes they expected and never
    /// issued the final zero-length read.
    pub(crate) async fn reaches_end(&mut self, wait: Duration) -> bool {
        if self.eof {
            return true;
        }
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let mut peeked = [0_u8; 1];
        match timeout(wait, reader.inner.peek(&mut peeked)).await {
            Ok(Ok(0)) => {
                self.eof = true;
                true
            }
            Ok(Err(e)) => {
                reader.fail(&e);
                false
            }
            Ok(Ok(_)) | Err(_) => false,
        }
    }

    /// Drops the socket; later reads fail with `NotConnected`.
    pub(crate) fn release(&mut self) {
        self.reader = None;
    }
}

impl fmt::Debug for PipelineStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStream")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("eof", &self.eof)
            .finish()
    }
}

impl AsyncRead for PipelineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("pipeline {} is closed", this.id),
            )));
        };

        let before = buf.filled().len();
        let polled = Pin::new(reader).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() == before && buf.remaining() > 0
        {
            this.eof = true;
        }
        polled
    }
}

impl Drop for PipelineStream {
    fn drop(&mut self) {
        if self.reader.is_none() {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(id = %self.id, "pipeline stream dropped without close");

        self.cancel.cancel();
        if let Some(registry) = self.registry.upgrade() {
            // Dropping the entry detaches the cancelled stages and frees the slots.
            let abandoned = registry.lock().remove(&self.id);
            drop(abandoned);
        }
    }
}
