//! # `autopipe`: Distributed Byte-Stream Filter Pipelines
//!
//! `autopipe` chains remote filter services into a single readable stream.
//! Each filter runs behind a [`DispatchServer`] that turns every accepted TCP
//! connection into a [`Service`]; a client-side [`Orchestrator`] connects to
//! each hop, sends it a small header of parameters and pumps bytes from one
//! hop to the next:
//!
//! ```text
//! feeder -> [grep] -> [upper] -> [count] -> PipelineStream
//! ```
//!
//! ## Highlights
//!
//! - **Bounded concurrency**: pump stages across all open pipelines draw from
//!   a fixed pool of slots; the dispatch server runs services on a bounded
//!   worker pool.
//! - **Cancellation is not failure**: closing a pipeline stops its pumps
//!   without inventing errors, while the first real failure of any stage is
//!   reported from [`Orchestrator::close`].
//! - **Backpressure end to end**: the caller reads the last hop's socket
//!   directly, so an idle reader stalls the whole chain instead of buffering.
//! - **Stackable parameters**: the [`HeaderStackingFactory`] decorator parses
//!   the per-hop header and layers it over any out-of-band parameters.
//!
//! ## Module Overview
//!
//! - [`error`] - [`Error`], [`ErrorKind`] and [`CreateError`].
//! - [`slot`] - the [`SlotAllocator`] bounding concurrent pump stages.
//! - [`pump`] - [`Pump`], transfer steps and [`Feeder`]s.
//! - [`request`] - [`PipelineRequest`], the address and parameters of a hop.
//! - [`header`] - the wire header codec and [`Params`].
//! - [`service`] - [`Service`] / [`ServiceFactory`] and the built-in filters.
//! - [`server`] - the [`DispatchServer`] and its worker pool.
//! - [`orchestrator`] - the [`Orchestrator`] and [`PipelineStream`].
//! - [`descriptor`] - server descriptor files.
//!
//! ## Example
//!
//! ```no_run
//! use autopipe::{Orchestrator, OrchestratorConfig, PipelineRequest};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn run() -> autopipe::Result<()> {
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//! orchestrator.start()?;
//!
//! let grep = PipelineRequest::new("127.0.0.1", 4701)?.with("pattern", "^b")?;
//! let mut stream = orchestrator.open(&[grep], b"apple\nberry\n".to_vec()).await?;
//!
//! let mut out = Vec::new();
//! stream.read_to_end(&mut out).await?;
//! orchestrator.close(&mut stream).await?;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
pub mod error;
pub mod header;
pub mod orchestrator;
pub mod pump;
pub mod request;
pub mod server;
pub mod service;
pub mod slot;

pub use crate::descriptor::{ServerDescriptor, ServerDirectory};
pub use crate::error::{CreateError, Error, ErrorKind, Result};
pub use crate::header::Params;
pub use crate::orchestrator::{Orchestrator, OrchestratorConfig, PipelineId, PipelineStream};
pub use crate::pump::{Feeder, Pump, PumpReport, ReaderFeeder};
pub use crate::request::PipelineRequest;
pub use crate::server::{DispatchConfig, DispatchServer, ServerState};
pub use crate::service::{
    CopyFactory, HeaderStackingFactory, RegexFactory, Service, ServiceFactory,
};
pub use crate::slot::{OwnedSlot, SlotAllocator};
