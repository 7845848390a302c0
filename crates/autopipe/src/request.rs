//! Addressing and parameters for a single pipeline hop.

use crate::error::{Error, Result};
use core::fmt;

/// Keys starting with this character are reserved for internal use.
pub const RESERVED_PREFIX: char = '.';

/// Address plus ordered parameters for one hop of a pipeline.
///
/// Host and port are fixed at construction. Parameters can only be appended,
/// and their order is the order of the header lines sent to the hop. Clone a
/// request to derive a hop-specific variant of a shared template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineRequest {
    host: String,
    port: u16,
    params: Vec<(String, String)>,
}

impl PipelineRequest {
    /// Creates a request for `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPort`] unless `1 <= port <= 65535`.
    pub fn new(host: impl Into<String>, port: i64) -> Result<Self> {
        let port = u16::try_from(port)
            .ok()
            .filter(|&p| p != 0)
            .ok_or(Error::InvalidPort { port })?;
        Ok(Self {
            host: host.into(),
            port,
            params: Vec::new(),
        })
    }

    /// Duplicates host, port and every parameter of `existing`.
    pub fn copy(existing: &Self) -> Self {
        existing.clone()
    }

    /// Appends a parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedKey`] if `key` starts with
    /// [`RESERVED_PREFIX`].
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<&mut Self> {
        let key = key.into();
        if key.starts_with(RESERVED_PREFIX) {
            return Err(Error::ReservedKey { key });
        }
        self.params.push((key, value.into()));
        Ok(self)
    }

    /// Builder form of [`put`](Self::put).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        self.put(key, value)?;
        Ok(self)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Parameters in insertion order.
    pub fn params(&self) -> impl ExactSizeIterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `host:port`, as used in error messages.
    pub fn addr(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PipelineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_every_valid_port() {
        for port in [1, 80, 4700, 65535] {
            let req = PipelineRequest::new("localhost", port).unwrap();
            assert_eq!(i64::from(req.port()), port);
        }
    }

    #[test]
    fn rejects_out_of_range_ports_naming_the_value() {
        for port in [0, -1, 65536, 1_000_000, i64::MIN] {
            let err = PipelineRequest::new("localhost", port).unwrap_err();
            assert!(err.is_argument());
            assert!(err.to_string().contains(&port.to_string()), "{err}");
        }
    }

    #[test]
    fn put_preserves_insertion_order() {
        let mut req = PipelineRequest::new("h", 1).unwrap();
        req.put("zeta", "1").unwrap();
        req.put("alpha", "2").unwrap();
        req.put("zeta", "3").unwrap();
        let params: Vec<_> = req.params().collect();
        assert_eq!(params, vec![("zeta", "1"), ("alpha", "2"), ("zeta", "3")]);
    }

    #[test]
    fn put_rejects_reserved_prefix() {
        let mut req = PipelineRequest::new("h", 1).unwrap();
        let err = req.put(".internal", "x").unwrap_err();
        assert!(err.is_argument());
        assert!(err.to_string().contains(".internal"));
        assert_eq!(req.params().len(), 0);
        assert!(req.put("not.reserved", "x").is_ok());
    }

    #[test]
    fn copy_seeds_an_independent_request() {
        let template = PipelineRequest::new("filter.local", 4700)
            .unwrap()
            .with("pattern", "a+")
            .unwrap();
        let mut derived = PipelineRequest::copy(&template);
        derived.put("replace", "b").unwrap();

        assert_eq!(template.params().len(), 1);
        assert_eq!(derived.params().len(), 2);
        assert_eq!(derived.addr(), "filter.local:4700");
    }
}
