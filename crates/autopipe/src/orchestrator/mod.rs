//! Client-side pipeline orchestration.
//!
//! [`Orchestrator::open`] connects to every hop of a pipeline, sends each hop
//! its header block and chains the hops together with pumps:
//!
//! ```text
//! feeder -> [hop 0] -> pump -> [hop 1] -> pump -> ... -> [hop n-1] -> caller
//! ```
//!
//! The caller reads the last hop's socket directly through the returned
//! [`PipelineStream`] and must hand it back to [`Orchestrator::close`], which
//! stops the pumps, releases their slots and reports the first failure any
//! stage recorded.
//!
//! Every pumping stage occupies one slot of a shared [`SlotAllocator`], so the
//! number of stages running across all open pipelines never exceeds
//! `max_pumps`.

mod pipeline;

pub use pipeline::{PipelineId, PipelineStream};

use crate::{
    error::{Error, Result},
    header,
    pump::{CopyTransfer, FeedTransfer, Feeder, Pump, Transfer},
    request::PipelineRequest,
    slot::{OwnedSlot, SlotAllocator},
};
use core::time::Duration;
use parking_lot::Mutex;
use pipeline::{FirstError, HopIo, Pipeline, Registry, Stage};
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::HashMap, sync::Arc};
use tokio::{io::AsyncWrite, net::TcpStream};
use tokio_util::sync::CancellationToken;

/// Pipeline ids are unique across orchestrators so a stream from one is never
/// mistaken for a pipeline of another.
static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing for an [`Orchestrator`].
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    /// Number of pipelines the registry is sized for up front.
    pub min_pumps: usize,
    /// Upper bound on pump stages running across all open pipelines.
    pub max_pumps: usize,
    /// How long `close` lets stages finish on their own once the output
    /// has ended, and how long it waits for a missing end-of-output.
    pub settle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_pumps: 4,
            max_pumps: 64,
            settle_timeout: Duration::from_millis(500),
        }
    }
}

enum State {
    Created,
    Started(Arc<SlotAllocator>),
    ShutDown,
}

/// Opens, tracks and closes pipelines of remote filter services.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: Mutex<State>,
    pipelines: Arc<Registry>,
    // Serializes multi-slot acquisition so two openers never each hold part
    // of what the other needs.
    acquire_gate: tokio::sync::Mutex<()>,
    shutdown_token: CancellationToken,
}

impl Orchestrator {
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `max_pumps` is zero or below `min_pumps`.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        if config.max_pumps == 0 {
            return Err(Error::InvalidConfig {
                reason: "max_pumps must be greater than 0".into(),
            });
        }
        if config.min_pumps > config.max_pumps {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "min_pumps ({}) exceeds max_pumps ({})",
                    config.min_pumps, config.max_pumps
                ),
            });
        }
        Ok(Self {
            config,
            state: Mutex::new(State::Created),
            pipelines: Arc::new(Mutex::new(HashMap::new())),
            acquire_gate: tokio::sync::Mutex::new(()),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Allocates the pump slots. Calling it again while started is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::ShutDown`] once [`shutdown`](Self::shutdown) was called.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            State::Created => {
                self.pipelines.lock().reserve(self.config.min_pumps);
                *state = State::Started(Arc::new(SlotAllocator::new(self.config.max_pumps)));
                #[cfg(feature = "tracing")]
                tracing::debug!(max_pumps = self.config.max_pumps, "orchestrator started");
                Ok(())
            }
            State::Started(_) => Ok(()),
            State::ShutDown => Err(Error::ShutDown),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Started(_))
    }

    /// Number of pipelines opened and not yet closed.
    pub fn open_count(&self) -> usize {
        self.pipelines.lock().len()
    }

    fn allocator(&self) -> Result<Arc<SlotAllocator>> {
        match &*self.state.lock() {
            State::Created => Err(Error::NotRunning),
            State::Started(slots) => Ok(Arc::clone(slots)),
            State::ShutDown => Err(Error::ShutDown),
        }
    }

    /// Builds a pipeline through `requests` and starts feeding it.
    ///
    /// Blocks while fewer than `requests.len()` pump slots are free. The
    /// returned stream must be passed to [`close`](Self::close); dropping it
    /// instead stops the pipeline without reporting its failures.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRunning`] / [`Error::ShutDown`] outside the started state.
    /// - [`Error::EmptyPipeline`] or [`Error::TooManyStages`] for a request
    ///   list that can never run.
    /// - [`Error::ServiceUnavailable`] naming the first hop that could not be
    ///   reached. Hops already connected are closed.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(stages = requests.len())))]
    pub async fn open<F: Feeder>(
        &self,
        requests: &[PipelineRequest],
        feeder: F,
    ) -> Result<PipelineStream> {
        let allocator = self.allocator()?;
        let stages = requests.len();
        if stages == 0 {
            return Err(Error::EmptyPipeline);
        }
        if stages > allocator.capacity() {
            return Err(Error::TooManyStages {
                stages,
                capacity: allocator.capacity(),
            });
        }

        let mut sockets = Vec::with_capacity(stages);
        for request in requests {
            // An early return drops `sockets`, closing the hops opened so far.
            sockets.push(connect(request).await?);
        }

        let slots = self.acquire_slots(&allocator, stages).await?;

        let cancel = CancellationToken::new();
        let errors = Arc::new(FirstError::default());
        let mut stages = Vec::with_capacity(stages);
        let mut hops = sockets.into_iter().zip(requests);

        let Some((head, head_request)) = hops.next() else {
            return Err(Error::EmptyPipeline);
        };
        let (reader, writer) = head.into_split();
        let sink = HopIo::new(
            writer,
            head_request.addr(),
            Arc::clone(&errors),
            cancel.clone(),
        );
        stages.push(spawn_stage(
            Pump::new(tokio::io::empty(), sink, FeedTransfer::new(feeder))
            .close_input(true)
            .close_output(true),
            StageKind::Feeder,
            head_request.addr(),
            cancel.clone(),
            Arc::clone(&errors),
        ));

        let mut upstream = HopIo::new(
            reader,
            head_request.addr(),
            Arc::clone(&errors),
            cancel.clone(),
        );
        let mut last_addr = head_request.addr();
        for (socket, request) in hops {
            let (reader, writer) = socket.into_split();
            let sink = HopIo::new(writer, request.addr(), Arc::clone(&errors), cancel.clone());
            stages.push(spawn_stage(
                Pump::new(upstream, sink, CopyTransfer)
                    .close_input(true)
                    .close_output(true),
                StageKind::Link,
                request.addr(),
                cancel.clone(),
                Arc::clone(&errors),
            ));
            upstream = HopIo::new(reader, request.addr(), Arc::clone(&errors), cancel.clone());
            last_addr = request.addr();
        }

        let id = PipelineId(NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed));
        self.pipelines.lock().insert(
            id,
            Pipeline {
                cancel: cancel.clone(),
                stages,
                slots,
                errors,
                last_addr,
            },
        );

        #[cfg(feature = "tracing")]
        tracing::debug!(%id, "pipeline open");
        Ok(PipelineStream::new(
            id,
            upstream,
            cancel,
            Arc::downgrade(&self.pipelines),
        ))
    }

    async fn acquire_slots(
        &self,
        allocator: &Arc<SlotAllocator>,
        count: usize,
    ) -> Result<Vec<OwnedSlot>> {
        let _gate = self.acquire_gate.lock().await;
        let mut held = Vec::with_capacity(count);
        while held.len() < count {
            // Slots taken so far go back when `held` is dropped.
            let slot = Arc::clone(allocator)
                .acquire_owned(&self.shutdown_token)
                .await
                .ok_or(Error::ShutDown)?;
            held.push(slot);
        }
        Ok(held)
    }

    /// Tears down the pipeline behind `stream`.
    ///
    /// If the output was read to its end, the stages get up to
    /// `settle_timeout` to finish on their own, otherwise they are stopped
    /// right away. Every hop socket is then closed and the slots freed, and
    /// the first failure of any stage is reported. If no stage failed but the
    /// output was not read to the end, that is reported instead.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPipeline`] if `stream` is not open here (including a
    ///   second close of the same stream).
    /// - [`Error::Feeder`] with the feeder's own error.
    /// - [`Error::ServiceUnavailable`] if a hop rejected the connection,
    ///   failed mid-stream or stopped reading its input.
    /// - [`Error::DataNotConsumed`] if the output was abandoned.
    pub async fn close(&self, stream: &mut PipelineStream) -> Result<()> {
        let id = stream.id();
        let pipeline = self
            .pipelines
            .lock()
            .remove(&id)
            .ok_or(Error::UnknownPipeline { id: id.get() })?;

        let settle = self.config.settle_timeout;
        let consumed = stream.reaches_end(settle).await;
        stream.release();
        let last_addr = pipeline.last_addr.clone();

        if let Some(error) = pipeline.teardown(consumed.then_some(settle)).await {
            return Err(error);
        }
        if !consumed {
            return Err(Error::DataNotConsumed { addr: last_addr });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%id, "pipeline closed");
        Ok(())
    }

    /// Refuses further `open` calls and wakes openers waiting for slots.
    ///
    /// Pipelines that are already open can still be closed. Calling it again
    /// has no further effect.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if matches!(*state, State::ShutDown) {
            return;
        }
        *state = State::ShutDown;
        self.shutdown_token.cancel();
        #[cfg(feature = "tracing")]
        tracing::debug!("orchestrator shut down");
    }
}

async fn connect(request: &PipelineRequest) -> Result<TcpStream> {
    let mut socket = TcpStream::connect((request.host(), request.port()))
        .await
        .map_err(|e| Error::unavailable(request.addr(), e))?;
    // Header blocks are small and latency bound.
    socket
        .set_nodelay(true)
        .map_err(|e| Error::unavailable(request.addr(), e))?;
    header::write_params(&mut socket, request.params())
        .await
        .map_err(|e| Error::unavailable(request.addr(), e))?;
    Ok(socket)
}

#[derive(Clone, Copy)]
enum StageKind {
    Feeder,
    Link,
}

// Socket failures were already recorded against their hop by `HopIo`, so
// what reaches the report here unrecorded comes from the feeder itself.
fn spawn_stage<R, W, T>(
    pump: Pump<R, W, T>,
    kind: StageKind,
    addr: String,
    cancel: CancellationToken,
    errors: Arc<FirstError>,
) -> Stage
where
    R: Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    T: Transfer<R, W> + 'static,
{
    let handle = tokio::spawn({
        let addr = addr.clone();
        async move {
            let mut report = pump.run(cancel).await;
            if let Some(e) = report.take_error() {
                errors.record(match kind {
                    StageKind::Feeder => Error::Feeder(e),
                    StageKind::Link => Error::unavailable(addr, e),
                });
            }
        }
    });
    Stage { addr, handle }
}
