use super::ServiceFactory;
use crate::{
    error::CreateError,
    header::{self, Params},
};
use tokio::io::AsyncBufRead;

/// Decorates a factory with header parsing.
///
/// Reads the header block at the start of the connection, stacks it on any
/// out-of-band parameters it was given, and delegates to the wrapped factory
/// with the result. The payload after the header is left in the input for
/// the wrapped service.
#[derive(Clone, Debug, Default)]
pub struct HeaderStackingFactory<F> {
    inner: F,
}

impl<F> HeaderStackingFactory<F> {
    pub const fn new(inner: F) -> Self {
        Self { inner }
    }

    pub const fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: ServiceFactory> ServiceFactory for HeaderStackingFactory<F> {
    type Service = F::Service;

    async fn create_service<R>(
        &self,
        input: &mut R,
        param: Option<Params>,
    ) -> Result<F::Service, CreateError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let parsed = header::read_params(input).await?;
        let params = match param {
            Some(outer) => parsed.stacked_on(outer),
            None => parsed,
        };
        self.inner.create_service(input, Some(params)).await
    }
}
