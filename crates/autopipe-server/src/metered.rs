//! Factory decorator that reports connection and service metrics.

use crate::telemetry::{
    decrement_services_inflight, increment_connections, increment_create_failures,
    increment_service_errors, increment_services_inflight, record_service_duration,
};
use autopipe::{CreateError, Params, Service, ServiceFactory};
use std::{io, time::Instant};
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Wraps a factory so every connection and service run is counted.
#[derive(Clone, Debug)]
pub struct MeteredFactory<F> {
    inner: F,
}

impl<F> MeteredFactory<F> {
    pub const fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: ServiceFactory> ServiceFactory for MeteredFactory<F> {
    type Service = MeteredService<F::Service>;

    async fn create_service<R>(
        &self,
        input: &mut R,
        param: Option<Params>,
    ) -> Result<Self::Service, CreateError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        increment_connections();
        match self.inner.create_service(input, param).await {
            Ok(inner) => Ok(MeteredService { inner }),
            Err(e) => {
                increment_create_failures(e.is_transient());
                Err(e)
            }
        }
    }
}

#[derive(Debug)]
pub struct MeteredService<S> {
    inner: S,
}

impl<S: Service> Service for MeteredService<S> {
    async fn run<R, W>(&mut self, input: &mut R, output: &mut W)
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        increment_services_inflight();
        let start = Instant::now();
        self.inner.run(input, output).await;
        record_service_duration(start.elapsed().as_secs_f64() * 1000.0);
        decrement_services_inflight();
        if self.inner.error().is_some() {
            increment_service_errors();
        }
    }

    fn error(&self) -> Option<&io::Error> {
        self.inner.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopipe::{CopyFactory, HeaderStackingFactory, header};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn delegates_to_the_wrapped_factory() {
        let factory = MeteredFactory::new(HeaderStackingFactory::new(CopyFactory));

        let mut wire = header::encode([("k", "v")]);
        wire.extend_from_slice(b"payload");
        let mut input = BufReader::new(&wire[..]);
        let mut service = factory.create_service(&mut input, None).await.unwrap();
        let mut output = Vec::new();
        service.run(&mut input, &mut output).await;
        assert!(service.error().is_none());
        assert_eq!(output, b"payload");

        let mut broken = BufReader::new(&b"no terminator"[..]);
        let err = factory.create_service(&mut broken, None).await.err().unwrap();
        assert!(!err.is_transient());
    }
}
