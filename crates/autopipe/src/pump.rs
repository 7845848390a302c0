//! Byte pumps.
//!
//! A [`Pump`] moves bytes from an input stream to an output stream by running
//! a [`Transfer`] step on its own task. It never interprets the bytes. The
//! degenerate pumps used at the ends of a pipeline are expressed as transfer
//! steps that ignore one side: [`FeedTransfer`] only produces (from a
//! caller-supplied [`Feeder`]) and [`DrainTransfer`] only consumes.
//!
//! Pumps are stopped through a [`CancellationToken`]. Cancellation is a clean
//! stop and is never reported as an error.

use bytes::Bytes;
use core::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// The work a pump performs between its input and output.
pub trait Transfer<R, W>: Send {
    /// Reads any number of bytes from `input` and writes any number to
    /// `output`. Returning ends the pump.
    fn transfer(
        &mut self,
        input: &mut R,
        output: &mut W,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

/// Copies input to output until input reaches EOF.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyTransfer;

impl<R, W> Transfer<R, W> for CopyTransfer
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn transfer(&mut self, input: &mut R, output: &mut W) -> io::Result<()> {
        tokio::io::copy(input, output).await.map(|_| ())
    }
}

/// Reads input to EOF and discards it; the output is untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct DrainTransfer;

impl<R, W> Transfer<R, W> for DrainTransfer
where
    R: AsyncRead + Unpin + Send,
    W: Send,
{
    async fn transfer(&mut self, input: &mut R, _output: &mut W) -> io::Result<()> {
        tokio::io::copy(input, &mut tokio::io::sink()).await.map(|_| ())
    }
}

/// Produces the bytes at the head of a pipeline.
///
/// A feeder is consumed by its single run. Any error it returns is reported
/// from the pipeline's `close` with its [`io::ErrorKind`] intact.
pub trait Feeder: Send + 'static {
    fn feed<W>(self, sink: &mut W) -> impl Future<Output = io::Result<()>> + Send
    where
        W: AsyncWrite + Unpin + Send;
}

impl Feeder for Vec<u8> {
    async fn feed<W>(self, sink: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        sink.write_all(&self).await
    }
}

impl Feeder for Bytes {
    async fn feed<W>(self, sink: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        sink.write_all(&self).await
    }
}

impl Feeder for &'static [u8] {
    async fn feed<W>(self, sink: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        sink.write_all(self).await
    }
}

/// Feeds everything an [`AsyncRead`] yields, e.g. stdin.
#[derive(Debug)]
pub struct ReaderFeeder<R>(pub R);

impl<R> Feeder for ReaderFeeder<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn feed<W>(mut self, sink: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        tokio::io::copy(&mut self.0, sink).await.map(|_| ())
    }
}

/// Adapts a [`Feeder`] into a producing-only transfer step.
#[derive(Debug)]
pub struct FeedTransfer<F>(Option<F>);

impl<F: Feeder> FeedTransfer<F> {
    pub const fn new(feeder: F) -> Self {
        Self(Some(feeder))
    }
}

impl<R, W, F> Transfer<R, W> for FeedTransfer<F>
where
    R: Send,
    W: AsyncWrite + Unpin + Send,
    F: Feeder,
{
    async fn transfer(&mut self, _input: &mut R, output: &mut W) -> io::Result<()> {
        match self.0.take() {
            Some(feeder) => feeder.feed(output).await,
            None => Ok(()),
        }
    }
}

/// Outcome of a finished pump.
///
/// Streams the pump was not told to close are handed back so their owner can
/// decide their lifetime.
#[derive(Debug)]
pub struct PumpReport<R, W> {
    error: Option<io::Error>,
    pub input: Option<R>,
    pub output: Option<W>,
}

impl<R, W> PumpReport<R, W> {
    /// The first failure raised by the transfer step or while closing.
    pub const fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

/// A transfer step bound to an input, an output, and close-on-exit flags.
pub struct Pump<R, W, T> {
    input: R,
    output: W,
    transfer: T,
    close_input: bool,
    close_output: bool,
}

impl<R, W, T> Pump<R, W, T>
where
    R: Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    T: Transfer<R, W> + 'static,
{
    /// Creates a pump that closes neither stream on exit.
    pub const fn new(input: R, output: W, transfer: T) -> Self {
        Self {
            input,
            output,
            transfer,
            close_input: false,
            close_output: false,
        }
    }

    /// Drop the input when the pump exits instead of handing it back.
    #[must_use]
    pub const fn close_input(mut self, close: bool) -> Self {
        self.close_input = close;
        self
    }

    /// Shut down the output when the pump exits instead of handing it back.
    #[must_use]
    pub const fn close_output(mut self, close: bool) -> Self {
        self.close_output = close;
        self
    }

    /// Runs the transfer step until it finishes or `cancel` fires.
    ///
    /// The output is always flushed afterwards, then closed and the input
    /// dropped according to the flags. Only the first failure is kept.
    pub async fn run(self, cancel: CancellationToken) -> PumpReport<R, W> {
        let Self {
            mut input,
            mut output,
            mut transfer,
            close_input,
            close_output,
        } = self;

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                #[cfg(feature = "tracing")]
                tracing::trace!("pump cancelled");
                Ok(())
            }
            res = transfer.transfer(&mut input, &mut output) => res,
        };

        // Failures after a stop was requested are fallout from the stop itself.
        let mut error = match outcome {
            Err(e) if e.kind() != io::ErrorKind::Interrupted && !cancel.is_cancelled() => Some(e),
            _ => None,
        };

        if let Err(e) = output.flush().await {
            error.get_or_insert(e);
        }

        let output = if close_output {
            if let Err(e) = output.shutdown().await {
                // The peer may already be gone once the pump was cancelled.
                if !cancel.is_cancelled() {
                    error.get_or_insert(e);
                }
            }
            None
        } else {
            Some(output)
        };

        let input = if close_input {
            drop(input);
            None
        } else {
            Some(input)
        };

        PumpReport {
            error,
            input,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex, empty};

    struct FailingFeeder;

    impl Feeder for FailingFeeder {
        async fn feed<W>(self, sink: &mut W) -> io::Result<()>
        where
            W: AsyncWrite + Unpin + Send,
        {
            sink.write_all(b"partial").await?;
            Err(io::Error::new(io::ErrorKind::InvalidData, "feeder broke"))
        }
    }

    struct Stalled;

    impl<R: Send, W: Send> Transfer<R, W> for Stalled {
        async fn transfer(&mut self, _input: &mut R, _output: &mut W) -> io::Result<()> {
            core::future::pending().await
        }
    }

    #[tokio::test]
    async fn copy_pump_moves_all_bytes_and_closes_output() {
        let (mut src_w, src_r) = duplex(64);
        let (dst_w, mut dst_r) = duplex(64);
        src_w.write_all(b"hello pump").await.unwrap();
        drop(src_w);

        let report = Pump::new(src_r, dst_w, CopyTransfer)
            .close_output(true)
            .run(CancellationToken::new())
            .await;
        assert!(report.error().is_none());
        assert!(report.output.is_none());
        assert!(report.input.is_some());

        let mut out = Vec::new();
        dst_r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello pump");
    }

    #[tokio::test]
    async fn feeder_error_is_kept_with_its_kind() {
        let (dst_w, mut dst_r) = duplex(64);
        let report = Pump::new(empty(), dst_w, FeedTransfer::new(FailingFeeder))
            .close_output(true)
            .close_input(true)
            .run(CancellationToken::new())
            .await;
        assert_eq!(report.error().unwrap().kind(), io::ErrorKind::InvalidData);
        assert!(report.input.is_none());

        let mut out = Vec::new();
        dst_r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"partial");
    }

    #[tokio::test]
    async fn cancellation_is_not_an_error() {
        let (dst_w, _dst_r) = duplex(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Pump::new(empty(), dst_w, Stalled).run(cancel.clone()));
        cancel.cancel();
        let report = task.await.unwrap();
        assert!(report.error().is_none());
        assert!(report.output.is_some());
    }

    #[tokio::test]
    async fn drain_pump_consumes_input() {
        let (mut src_w, src_r) = duplex(16);
        let writer = tokio::spawn(async move {
            src_w.write_all(&[7_u8; 1024]).await.unwrap();
        });
        let report = Pump::new(src_r, tokio::io::sink(), DrainTransfer)
            .run(CancellationToken::new())
            .await;
        writer.await.unwrap();
        assert!(report.error().is_none());
    }
}
