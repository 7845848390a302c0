//! Line filter backed by a compiled regular expression.
//!
//! Parameters:
//!
//! - `pattern` (required): the expression, compiled once per connection.
//! - `replace` (optional): substitution applied to every match on a line.
//!   `$1`/`${name}` refer to capture groups. Without it the filter passes
//!   through only the lines that match.

use super::{Service, ServiceFactory};
use crate::{error::CreateError, header::Params};
use regex::bytes::Regex;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Builds a [`RegexService`] from the connection's parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexFactory;

#[derive(Debug)]
enum Mode {
    Grep,
    Replace(Vec<u8>),
}

/// Runs a compiled expression over each input line.
#[derive(Debug)]
pub struct RegexService {
    regex: Regex,
    mode: Mode,
    error: Option<io::Error>,
}

impl RegexService {
    /// # Errors
    ///
    /// A permanent [`CreateError`] if `pattern` does not compile.
    pub fn new(pattern: &str, replace: Option<&str>) -> Result<Self, CreateError> {
        let regex = Regex::new(pattern)
            .map_err(|e| CreateError::permanent(format!("invalid pattern `{pattern}`: {e}")))?;
        let mode = match replace {
            Some(r) => Mode::Replace(r.as_bytes().to_vec()),
            None => Mode::Grep,
        };
        Ok(Self {
            regex,
            mode,
            error: None,
        })
    }

    async fn filter<R, W>(&self, input: &mut R, output: &mut W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut line = Vec::new();
        loop {
            line.clear();
            if input.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            let (body, newline) = match line.strip_suffix(b"\n") {
                Some(body) => (body, &b"\n"[..]),
                None => (&line[..], &b""[..]),
            };
            match &self.mode {
                Mode::Grep => {
                    if self.regex.is_match(body) {
                        output.write_all(&line).await?;
                    }
                }
                Mode::Replace(replacement) => {
                    let replaced = self.regex.replace_all(body, replacement.as_slice());
                    output.write_all(&replaced).await?;
                    output.write_all(newline).await?;
                }
            }
        }
        output.flush().await
    }
}

impl Service for RegexService {
    async fn run<R, W>(&mut self, input: &mut R, output: &mut W)
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if let Err(e) = self.filter(input, output).await {
            self.error = Some(e);
        }
    }

    fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }
}

impl ServiceFactory for RegexFactory {
    type Service = RegexService;

    async fn create_service<R>(
        &self,
        _input: &mut R,
        param: Option<Params>,
    ) -> Result<RegexService, CreateError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let params = param.unwrap_or_default();
        let pattern = params
            .get("pattern")
            .ok_or_else(|| CreateError::permanent("missing required parameter `pattern`"))?;
        RegexService::new(pattern, params.get("replace"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn run(params: Params, input: &[u8]) -> Vec<u8> {
        let mut reader = BufReader::new(input);
        let mut output = Vec::new();
        let mut service = RegexFactory
            .create_service(&mut reader, Some(params))
            .await
            .unwrap();
        service.run(&mut reader, &mut output).await;
        assert!(service.error().is_none());
        output
    }

    #[tokio::test]
    async fn grep_keeps_matching_lines() {
        let params: Params = [("pattern", "^err")].into_iter().collect();
        let out = run(params, b"error one\nok\nerr two").await;
        assert_eq!(out, b"error one\nerr two");
    }

    #[tokio::test]
    async fn replace_rewrites_every_match() {
        let params: Params = [("pattern", r"(\w+)@(\w+)"), ("replace", "$2 at $1")]
            .into_iter()
            .collect();
        let out = run(params, b"mail a@b and c@d\n\nno match\n").await;
        assert_eq!(out, b"mail b at a and d at c\n\nno match\n");
    }

    #[tokio::test]
    async fn bad_or_missing_pattern_is_permanent() {
        let mut reader = BufReader::new(&b""[..]);
        let missing = RegexFactory.create_service(&mut reader, None).await;
        assert!(!missing.unwrap_err().is_transient());

        let params: Params = [("pattern", "(unclosed")].into_iter().collect();
        let invalid = RegexFactory.create_service(&mut reader, Some(params)).await;
        assert!(!invalid.unwrap_err().is_transient());
    }
}
