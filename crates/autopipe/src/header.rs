//! Wire header block sent ahead of payload on every hop.
//!
//! ```text
//! key=value\n
//! key=value\n
//! \n            <- terminator, payload follows
//! ```
//!
//! Keys and values are escaped so any string survives the trip: `\` becomes
//! `\\`, newline `\n`, carriage return `\r` and `=` becomes `\=`. The first
//! unescaped `=` on a line separates key from value.

use crate::error::CreateError;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the size of a header block, terminator included.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Ordered parameters parsed from a header block.
///
/// A `Params` may be stacked on an outer `Params`; lookups that miss fall
/// through to the outer layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
    outer: Option<Box<Params>>,
}

impl Params {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            outer: None,
        }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Layers `self` on top of `outer`.
    #[must_use]
    pub fn stacked_on(mut self, outer: Self) -> Self {
        self.outer = Some(Box::new(outer));
        self
    }

    /// The first value for `key` in this layer, else in the outer layers.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .or_else(|| self.outer.as_deref().and_then(|outer| outer.get(key)))
    }

    /// Entries of this layer only, in wire order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn outer(&self) -> Option<&Self> {
        self.outer.as_deref()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            outer: None,
        }
    }
}

fn escape_into(out: &mut Vec<u8>, text: &str) {
    for &b in text.as_bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'=' => out.extend_from_slice(b"\\="),
            _ => out.push(b),
        }
    }
}

/// Serializes `params` into a complete header block, terminator included.
pub fn encode<'a, I>(params: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = Vec::new();
    for (key, value) in params {
        escape_into(&mut out, key);
        out.push(b'=');
        escape_into(&mut out, value);
        out.push(b'\n');
    }
    out.push(b'\n');
    out
}

/// Writes a header block for `params` and flushes it.
pub async fn write_params<'a, W, I>(writer: &mut W, params: I) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    writer.write_all(&encode(params)).await?;
    writer.flush().await
}

fn malformed(reason: impl core::fmt::Display) -> CreateError {
    CreateError::permanent(format!("malformed header: {reason}"))
}

/// Splits one header line (newline already stripped) into key and value.
fn decode_line(line: &[u8]) -> Result<(String, String), CreateError> {
    let mut key = Vec::new();
    let mut value = Vec::new();
    let mut in_value = false;
    let mut bytes = line.iter();

    while let Some(&b) = bytes.next() {
        let target = if in_value { &mut value } else { &mut key };
        match b {
            b'\\' => match bytes.next() {
                Some(b'\\') => target.push(b'\\'),
                Some(b'n') => target.push(b'\n'),
                Some(b'r') => target.push(b'\r'),
                Some(b'=') => target.push(b'='),
                Some(&other) => {
                    return Err(malformed(format_args!(
                        "unknown escape `\\{}`",
                        char::from(other).escape_default()
                    )));
                }
                None => return Err(malformed("dangling escape at end of line")),
            },
            b'=' if !in_value => in_value = true,
            _ => target.push(b),
        }
    }

    if !in_value {
        return Err(malformed("line has no `=` separator"));
    }
    let key = String::from_utf8(key).map_err(|_| malformed("key is not valid UTF-8"))?;
    let value = String::from_utf8(value).map_err(|_| malformed("value is not valid UTF-8"))?;
    Ok((key, value))
}

/// Reads a header block off `reader`, stopping right after the terminator.
///
/// Bytes after the terminator stay in `reader` untouched.
///
/// # Errors
///
/// A permanent [`CreateError`] if the block is malformed, truncated, larger
/// than [`MAX_HEADER_BYTES`], or the connection fails while reading it.
pub async fn read_params<R>(reader: &mut R) -> Result<Params, CreateError>
where
    R: AsyncBufRead + Unpin,
{
    let mut params = Params::new();
    let mut consumed = 0_usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let remaining = (MAX_HEADER_BYTES - consumed) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| malformed(format_args!("read failed: {e}")))?;
        consumed += n;

        if line.last() != Some(&b'\n') {
            return Err(if consumed >= MAX_HEADER_BYTES {
                malformed(format_args!("exceeds {MAX_HEADER_BYTES} bytes"))
            } else {
                malformed("connection closed before the terminating empty line")
            });
        }
        line.pop();

        if line.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::trace!(count = params.len(), "header block parsed");
            return Ok(params);
        }

        let (key, value) = decode_line(&line)?;
        params.push(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(bytes: &[u8]) -> (Result<Params, CreateError>, Vec<u8>) {
        let mut reader = BufReader::new(bytes);
        let parsed = read_params(&mut reader).await;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        (parsed, rest)
    }

    #[test]
    fn encodes_lines_in_order_with_terminator() {
        let block = encode([("pattern", "a+"), ("replace", "b")]);
        assert_eq!(block, b"pattern=a+\nreplace=b\n\n");
        assert_eq!(encode(Vec::<(&str, &str)>::new()), b"\n");
    }

    #[tokio::test]
    async fn awkward_text_survives_the_trip() {
        let key = "we=ird\\key";
        let value = "line one\nline two\r\n= \\n not an escape";
        let mut wire = encode([(key, value), ("", "")]);
        wire.extend_from_slice(b"payload\n\nmore");

        let (parsed, rest) = parse(&wire).await;
        let parsed = parsed.unwrap();
        assert_eq!(parsed.iter().collect::<Vec<_>>(), vec![(key, value), ("", "")]);
        assert_eq!(rest, b"payload\n\nmore");
    }

    #[tokio::test]
    async fn empty_block_leaves_payload_alone() {
        let (parsed, rest) = parse(b"\n\nbody").await;
        assert!(parsed.unwrap().is_empty());
        assert_eq!(rest, b"\nbody");
    }

    #[tokio::test]
    async fn rejects_malformed_blocks() {
        for wire in [
            &b"no separator\n\n"[..],
            b"bad=\\q\n\n",
            b"dangling=\\",
            b"key=value\n",
            b"",
        ] {
            let (parsed, _) = parse(wire).await;
            let err = parsed.unwrap_err();
            assert!(!err.is_transient(), "{err}");
        }
    }

    #[tokio::test]
    async fn rejects_oversized_blocks() {
        let wire = vec![b'a'; MAX_HEADER_BYTES + 10];
        let (parsed, _) = parse(&wire).await;
        assert!(parsed.unwrap_err().to_string().contains("exceeds"));
    }

    #[test]
    fn stacked_params_fall_through() {
        let outer: Params = [("pattern", "outer"), ("mode", "grep")].into_iter().collect();
        let inner: Params = [("pattern", "inner")].into_iter().collect();
        let stacked = inner.stacked_on(outer);
        assert_eq!(stacked.get("pattern"), Some("inner"));
        assert_eq!(stacked.get("mode"), Some("grep"));
        assert_eq!(stacked.get("missing"), None);
        assert_eq!(stacked.len(), 1);
        assert!(stacked.outer().is_some());
    }
}
