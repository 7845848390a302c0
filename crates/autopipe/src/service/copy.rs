use super::{Service, ServiceFactory};
use crate::{error::CreateError, header::Params};
use std::io;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

/// Builds [`CopyService`]s. Parameters are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyFactory;

/// Echoes every input byte to the output.
#[derive(Debug, Default)]
pub struct CopyService {
    error: Option<io::Error>,
}

impl Service for CopyService {
    async fn run<R, W>(&mut self, input: &mut R, output: &mut W)
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let copied = tokio::io::copy_buf(input, output).await;
        let flushed = output.flush().await;
        if let Err(e) = copied.and(flushed) {
            self.error = Some(e);
        }
    }

    fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }
}

impl ServiceFactory for CopyFactory {
    type Service = CopyService;

    async fn create_service<R>(
        &self,
        _input: &mut R,
        _param: Option<Params>,
    ) -> Result<CopyService, CreateError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        Ok(CopyService::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn echoes_input() {
        let mut input = BufReader::new(&b"echo me"[..]);
        let mut output = Vec::new();
        let mut service = CopyFactory.create_service(&mut input, None).await.unwrap();
        service.run(&mut input, &mut output).await;
        assert!(service.error().is_none());
        assert_eq!(output, b"echo me");
    }
}
