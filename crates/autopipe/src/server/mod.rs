//! Dispatch server: turns accepted connections into running services.
//!
//! ## Structure
//!
//! - [`DispatchServer`] - accept loop and lifecycle (`Created -> Running ->
//!   ShutDown`).
//! - [`pool`] - bounded worker pool the services run on.

pub mod pool;

use crate::{
    error::{CreateError, Error, Result},
    header::Params,
    service::{Service, ServiceFactory},
};
use core::time::Duration;
use parking_lot::Mutex;
use pool::{Counters, PoolStats, WorkerPool};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tokio_stream::{StreamExt, wrappers::TcpListenerStream};
use tokio_util::sync::CancellationToken;

/// Sizing and timeouts for a [`DispatchServer`].
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Maximum number of services running at once.
    pub workers: usize,
    /// Upper bound on `create_service`; exceeding it is a transient failure.
    pub create_timeout: Duration,
    /// How long `shutdown` waits for running services before cancelling them.
    pub shutdown_timeout: Duration,
    /// Out-of-band parameters handed to the factory for every connection.
    pub defaults: Option<Params>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            create_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(3),
            defaults: None,
        }
    }
}

/// Lifecycle of a [`DispatchServer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    ShutDown,
}

/// Accept loop that runs one [`Service`] per connection.
pub struct DispatchServer<F> {
    factory: Arc<F>,
    pool: WorkerPool,
    create_timeout: Duration,
    defaults: Option<Params>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_token: CancellationToken,
}

impl<F: ServiceFactory> DispatchServer<F> {
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `config.workers` is zero.
    pub fn new(factory: F, config: DispatchConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::InvalidConfig {
                reason: "dispatch server needs at least one worker".into(),
            });
        }
        Ok(Self {
            factory: Arc::new(factory),
            pool: WorkerPool::new(
                config.workers,
                CancellationToken::new(),
                config.shutdown_timeout,
            ),
            create_timeout: config.create_timeout,
            defaults: config.defaults,
            state: Mutex::new(ServerState::Created),
            local_addr: Mutex::new(None),
            accept_token: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Address of the listener once [`run`](Self::run) has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Accepts connections on `listener` until [`shutdown`](Self::shutdown).
    ///
    /// The listener is closed when this returns.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if the loop was started before, or
    /// [`Error::ShutDown`] if the server was shut down.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Created => *state = ServerState::Running,
                ServerState::Running => return Err(Error::AlreadyRunning),
                ServerState::ShutDown => return Err(Error::ShutDown),
            }
        }
        *self.local_addr.lock() = listener.local_addr().ok();

        #[cfg(feature = "tracing")]
        tracing::info!(
            addr = ?self.local_addr(),
            workers = self.pool.workers(),
            "dispatch server accepting connections"
        );

        let mut incoming = TcpListenerStream::new(listener);
        loop {
            let permit = tokio::select! {
                () = self.accept_token.cancelled() => break,
                permit = self.pool.reserve() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            let next = tokio::select! {
                () = self.accept_token.cancelled() => break,
                next = incoming.next() => next,
            };

            match next {
                Some(Ok(stream)) => {
                    let counters = self.pool.counters();
                    counters.accepted();
                    self.pool.spawn(
                        permit,
                        serve(
                            Arc::clone(&self.factory),
                            stream,
                            self.defaults.clone(),
                            self.create_timeout,
                            self.pool.shutdown_token().clone(),
                            counters,
                        ),
                    );
                }
                Some(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("accept failed: {_e}");
                    // Usually fd exhaustion; give running services a moment.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                None => break,
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!("dispatch server stopped accepting");
        Ok(())
    }

    /// Closes the listener, lets running services drain and stops the rest.
    ///
    /// Calling it again has no further effect.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == ServerState::ShutDown {
                return;
            }
            *state = ServerState::ShutDown;
        }
        #[cfg(feature = "tracing")]
        tracing::info!("dispatch server shutting down");
        self.accept_token.cancel();
        self.pool.shutdown().await;
    }
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(peer = ?stream.peer_addr().ok())))]
async fn serve<F: ServiceFactory>(
    factory: Arc<F>,
    stream: TcpStream,
    defaults: Option<Params>,
    create_timeout: Duration,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    let (read, write) = stream.into_split();
    let mut input = BufReader::new(read);

    let created = match timeout(create_timeout, factory.create_service(&mut input, defaults)).await {
        Ok(created) => created,
        Err(_) => Err(CreateError::transient("service creation timed out")),
    };

    let mut service = match created {
        Ok(service) => service,
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(transient = _e.is_transient(), "rejecting connection: {_e}");
            counters.rejected();
            abort(input, write);
            return;
        }
    };

    let mut output = BufWriter::new(write);

    tokio::select! {
        () = cancel.cancelled() => {
            #[cfg(feature = "tracing")]
            tracing::debug!("service cancelled by shutdown");
        }
        () = service.run(&mut input, &mut output) => {}
    }

    let failed = service.error().is_some();
    if let Some(_e) = service.error() {
        #[cfg(feature = "tracing")]
        tracing::warn!("service failed: {_e}");
    }
    counters.finished(failed);

    if failed {
        abort(input, output.into_inner());
        return;
    }
    if let Err(_e) = output.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::debug!("closing connection failed: {_e}");
    }
}

/// Closes a connection with a reset rather than an end of stream, so the
/// peer cannot mistake a rejection or a failed service for empty output.
fn abort(input: BufReader<OwnedReadHalf>, output: OwnedWriteHalf) {
    if let Err(_e) = output.as_ref().set_zero_linger() {
        #[cfg(feature = "tracing")]
        tracing::debug!("failed to arm connection reset: {_e}");
    }
    // Without `forget` the write half would send a FIN on drop.
    output.forget();
    drop(input);
}

#[cfg(test)]
mod tests;
