//! Server descriptor files.
//!
//! Every published filter server can be described by a small properties file
//! named `<name>.server`:
//!
//! ```text
//! # grep filter
//! host=127.0.0.1
//! port=4701
//! synopsis=forward lines matching `pattern`
//! ```
//!
//! Lines starting with `#` or `!` and blank lines are ignored. `name` defaults
//! to the file stem. A directory of descriptors is loaded with
//! [`ServerDirectory::load`]; a broken file is kept as an error next to its
//! name instead of failing the whole load.

use crate::{
    error::{Error, Result},
    request::PipelineRequest,
};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

/// File extension used for published descriptors.
pub const EXTENSION: &str = "server";

/// Where a filter server can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub synopsis: Option<String>,
}

impl ServerDescriptor {
    /// Parses descriptor text. `default_name` is used when the text has no
    /// `name` property.
    ///
    /// # Errors
    ///
    /// [`Error::Descriptor`] naming `path` when a line has no `=`, `host` or
    /// `port` is missing, or the port is out of range.
    pub fn parse(text: &str, default_name: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::Descriptor {
            path: path.to_path_buf(),
            reason,
        };

        let mut name = None;
        let mut host = None;
        let mut port = None;
        let mut synopsis = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| invalid(format!("line {}: expected key=value", lineno + 1)))?;
            let value = value.trim().to_owned();
            match key.trim() {
                "name" => name = Some(value),
                "host" => host = Some(value),
                "port" => port = Some(value),
                "synopsis" => synopsis = Some(value),
                // Unknown properties are tolerated for forward compatibility.
                _ => {}
            }
        }

        let host = host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing `host`".into()))?;
        let port = port.ok_or_else(|| invalid("missing `port`".into()))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| invalid(format!("invalid port `{port}`")))?;

        Ok(Self {
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| default_name.to_owned()),
            host,
            port,
            synopsis: synopsis.filter(|s| !s.is_empty()),
        })
    }

    /// Reads and parses the descriptor at `path`, naming it after the file
    /// stem unless it names itself.
    ///
    /// # Errors
    ///
    /// [`Error::Descriptor`] if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::Descriptor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&text, &stem, path)
    }

    /// Renders the descriptor in the format [`parse`](Self::parse) accepts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "name={}", self.name);
        let _ = writeln!(out, "host={}", self.host);
        let _ = writeln!(out, "port={}", self.port);
        if let Some(synopsis) = &self.synopsis {
            // Properties are single-line.
            let _ = writeln!(out, "synopsis={}", synopsis.replace(['\n', '\r'], " "));
        }
        out
    }

    /// Path this descriptor is published under inside `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.{EXTENSION}", self.name))
    }

    /// Writes the descriptor to `<dir>/<name>.server`, replacing any previous
    /// one, and returns the path written.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a name that is empty or not a plain file
    /// name, [`Error::Io`] if the file cannot be written.
    pub fn publish(&self, dir: &Path) -> Result<PathBuf> {
        if self.name.is_empty()
            || self.name.starts_with('.')
            || self.name.contains(['/', '\\'])
        {
            return Err(Error::InvalidConfig {
                reason: format!("`{}` is not a valid descriptor name", self.name),
            });
        }
        let path = self.path_in(dir);
        let staging = dir.join(format!(".{}.{EXTENSION}.tmp", self.name));
        fs::write(&staging, self.render())?;
        fs::rename(&staging, &path)?;
        Ok(path)
    }

    /// A request addressing this server, without parameters.
    ///
    /// # Errors
    ///
    /// Cannot fail for a parsed descriptor; the port is already validated.
    pub fn request(&self) -> Result<PipelineRequest> {
        PipelineRequest::new(self.host.clone(), i64::from(self.port))
    }
}

/// Descriptors loaded from one directory, keyed by name.
#[derive(Debug, Default)]
pub struct ServerDirectory {
    entries: BTreeMap<String, Result<ServerDescriptor>>,
}

impl ServerDirectory {
    /// Loads every regular, non-hidden file in `dir`.
    ///
    /// Files that fail to parse are kept under their file stem with the
    /// error.
    ///
    /// # Errors
    ///
    /// [`Error::Descriptor`] only if `dir` itself cannot be listed.
    pub fn load(dir: &Path) -> Result<Self> {
        let listing = fs::read_dir(dir).map_err(|e| Error::Descriptor {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut entries = BTreeMap::new();
        for entry in listing.flatten() {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            if hidden || !is_file {
                continue;
            }

            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let loaded = ServerDescriptor::read(&path);
            let key = match &loaded {
                Ok(descriptor) => descriptor.name.clone(),
                Err(_) => stem,
            };

            #[cfg(feature = "tracing")]
            if let Err(e) = &loaded {
                tracing::warn!("skipping server descriptor: {e}");
            }
            entries.insert(key, loaded);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(dir = %dir.display(), count = entries.len(), "loaded server descriptors");
        Ok(Self { entries })
    }

    /// The well-formed descriptor called `name`, if any.
    pub fn get(&self, name: &str) -> Option<&ServerDescriptor> {
        self.entries.get(name).and_then(|e| e.as_ref().ok())
    }

    /// Every entry, including the ones that failed to load.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Result<ServerDescriptor>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Well-formed descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.entries.values().filter_map(|e| e.as_ref().ok())
    }

    /// Names and errors of the files that failed to load.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().err().map(|e| (k.as_str(), e)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn grep() -> ServerDescriptor {
        ServerDescriptor {
            name: "grep".into(),
            host: "127.0.0.1".into(),
            port: 4701,
            synopsis: Some("forward matching lines".into()),
        }
    }

    #[test]
    fn parses_properties_and_defaults_the_name() {
        let text = "# comment\n! also a comment\n\nhost = example.org\nport=9000\nextra=1\n";
        let parsed = ServerDescriptor::parse(text, "upper", Path::new("upper.server")).unwrap();
        assert_eq!(parsed.name, "upper");
        assert_eq!(parsed.host, "example.org");
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.synopsis, None);
        assert_eq!(parsed.request().unwrap().addr(), "example.org:9000");
    }

    #[test]
    fn rejects_incomplete_descriptors() {
        let path = Path::new("bad.server");
        for text in ["port=1\n", "host=h\n", "host=h\nport=0\n", "host=h\nport=70000\n", "junk\n"] {
            let err = ServerDescriptor::parse(text, "bad", path).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Descriptor, "{text:?}");
            assert!(err.to_string().contains("bad.server"));
        }
    }

    #[test]
    fn publish_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = grep().publish(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("grep.server"));
        assert_eq!(ServerDescriptor::read(&path).unwrap(), grep());

        let bad_name = ServerDescriptor {
            name: "../escape".into(),
            ..grep()
        };
        assert!(bad_name.publish(dir.path()).unwrap_err().is_argument());
    }

    #[test]
    fn directory_load_keeps_going_past_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        grep().publish(dir.path()).unwrap();
        fs::write(dir.path().join("copy.server"), "host=localhost\nport=4702\n").unwrap();
        fs::write(dir.path().join("broken.server"), "host=localhost\nport=nope\n").unwrap();
        fs::write(dir.path().join(".hidden.server"), "garbage").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let loaded = ServerDirectory::load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get("grep"), Some(&grep()));
        assert_eq!(loaded.get("copy").unwrap().port, 4702);
        assert!(loaded.get("broken").is_none());

        let names: Vec<_> = loaded.descriptors().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["copy", "grep"]);
        let failures: Vec<_> = loaded.failures().map(|(name, _)| name).collect();
        assert_eq!(failures, ["broken"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerDirectory::load(&dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Descriptor);
    }
}
