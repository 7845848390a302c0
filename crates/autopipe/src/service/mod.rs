//! Services and the factories that build them.
//!
//! A [`ServiceFactory`] turns an accepted connection plus an optional
//! out-of-band [`Params`] into a runnable [`Service`]. The dispatch server
//! owns the connection's streams: services read and write them but never
//! close them.
//!
//! ## Variants
//!
//! - [`CopyFactory`] - echoes input to output.
//! - [`RegexFactory`] - line filter driven by a compiled regular expression.
//! - [`HeaderStackingFactory`] - parses a header block off the connection and
//!   hands the parameters to a wrapped factory.

mod automaton;
mod copy;
mod stacking;

pub use automaton::{RegexFactory, RegexService};
pub use copy::{CopyFactory, CopyService};
pub use stacking::HeaderStackingFactory;

use crate::{error::CreateError, header::Params};
use core::future::Future;
use std::io;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// A unit of work bound to one connection.
pub trait Service: Send + 'static {
    /// Processes `input` into `output`.
    ///
    /// Must not close either stream and should flush `output` before
    /// returning. Failures are recorded and exposed through
    /// [`error`](Self::error).
    fn run<R, W>(&mut self, input: &mut R, output: &mut W) -> impl Future<Output = ()> + Send
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send;

    /// The terminal error of the last [`run`](Self::run), if any.
    fn error(&self) -> Option<&io::Error>;
}

/// Builds a [`Service`] for an accepted connection.
pub trait ServiceFactory: Send + Sync + 'static {
    type Service: Service;

    /// Creates a service for a connection.
    ///
    /// Must complete promptly: it may consume data that has already arrived
    /// (such as a header block) but must not wait on the peer otherwise.
    /// `param` is `None` for the outermost factory.
    ///
    /// # Errors
    ///
    /// [`CreateError::Permanent`] if the service can never be created from
    /// this input, [`CreateError::Transient`] if a later attempt may succeed.
    fn create_service<R>(
        &self,
        input: &mut R,
        param: Option<Params>,
    ) -> impl Future<Output = Result<Self::Service, CreateError>> + Send
    where
        R: AsyncBufRead + Unpin + Send;
}
