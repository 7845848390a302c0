use anyhow::{Context, bail};
use autopipe::{DispatchConfig, Params, request::RESERVED_PREFIX, service::RegexService};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use std::path::PathBuf;

/// Which filter this server runs for every connection.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Echo the payload unchanged.
    Copy,
    /// Line filter driven by the `pattern` and optional `replace` parameters.
    Regex,
}

impl FilterKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Regex => "regex",
        }
    }
}

/// Runtime configuration for the `autopipe-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is honored), with defaults suitable for a local deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "autopipe-server",
    version,
    about = "Serve one autopipe filter over TCP"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("127.0.0.1:4700"))]
    pub server_addr: String,

    /// Maximum number of connections served at once. Further connections wait
    /// in the accept backlog.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 16)]
    pub num_workers: usize,

    /// Filter run for every connection.
    ///
    /// Environment variable: `FILTER`
    #[arg(long, env = "FILTER", value_enum, default_value_t = FilterKind::Copy)]
    pub filter: FilterKind,

    /// Default filter parameters as `key=value`. Parameters sent by a client
    /// in the connection header take precedence.
    ///
    /// Environment variable: `FILTER_PARAMS` (`;` separated)
    #[arg(long = "param", env = "FILTER_PARAMS", value_delimiter = ';')]
    pub params: Vec<String>,

    /// Name this server is published under. Defaults to the filter name.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: Option<String>,

    /// One-line description written to the descriptor file.
    ///
    /// Environment variable: `SYNOPSIS`
    #[arg(long, env = "SYNOPSIS")]
    pub synopsis: Option<String>,

    /// Directory to publish a `<name>.server` descriptor into while running.
    ///
    /// Environment variable: `PUBLISH_DIR`
    #[arg(long, env = "PUBLISH_DIR")]
    pub publish_dir: Option<PathBuf>,

    /// Host written to the descriptor. Defaults to the listening IP, or
    /// `localhost` when listening on a wildcard address.
    ///
    /// Environment variable: `ADVERTISE_HOST`
    #[arg(long, env = "ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Milliseconds a connection may take to deliver its header.
    ///
    /// Environment variable: `CREATE_TIMEOUT_MS`
    #[arg(long, env = "CREATE_TIMEOUT_MS", default_value_t = 2000)]
    pub create_timeout_ms: u64,

    /// Seconds running services get to finish after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub filter: FilterKind,
    pub defaults: Params,
    pub service_name: String,
    pub synopsis: Option<String>,
    pub publish_dir: Option<PathBuf>,
    pub advertise_host: Option<String>,
    pub create_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.num_workers,
            create_timeout: self.create_timeout,
            shutdown_timeout: self.shutdown_timeout,
            defaults: (!self.defaults.is_empty()).then(|| self.defaults.clone()),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.create_timeout_ms == 0 {
            bail!("CREATE_TIMEOUT_MS must be greater than 0");
        }

        let mut defaults = Params::new();
        for raw in &args.params {
            let (key, value) = raw
                .split_once('=')
                .with_context(|| format!("parameter `{raw}` is not of the form key=value"))?;
            if key.is_empty() || key.starts_with(RESERVED_PREFIX) {
                bail!("parameter key `{key}` is empty or reserved");
            }
            defaults.push(key, value);
        }

        // Catch a broken default pattern at startup rather than per connection.
        if args.filter == FilterKind::Regex {
            if let Some(pattern) = defaults.get("pattern") {
                RegexService::new(pattern, defaults.get("replace"))
                    .map_err(|e| anyhow::anyhow!("invalid default pattern: {e}"))?;
            }
        }

        let service_name = args
            .service_name
            .unwrap_or_else(|| args.filter.name().to_owned());
        if service_name.is_empty() || service_name.contains(['/', '\\']) {
            bail!("SERVICE_NAME `{service_name}` is not a valid file name");
        }

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            filter: args.filter,
            defaults,
            service_name,
            synopsis: args.synopsis,
            publish_dir: args.publish_dir,
            advertise_host: args.advertise_host,
            create_timeout: Duration::from_millis(args.create_timeout_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["autopipe-server"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_usable() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.filter, FilterKind::Copy);
        assert_eq!(config.service_name, "copy");
        assert_eq!(config.create_timeout, Duration::from_secs(2));
        assert!(config.dispatch_config().defaults.is_none());
    }

    #[test]
    fn collects_default_parameters() {
        let config = parse(&[
            "--filter",
            "regex",
            "--param",
            "pattern=^a=b",
            "--param",
            "replace=x",
        ])
        .unwrap();
        assert_eq!(config.service_name, "regex");
        assert_eq!(config.defaults.get("pattern"), Some("^a=b"));
        let dispatch = config.dispatch_config();
        assert_eq!(dispatch.defaults.unwrap().len(), 2);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--num-workers", "0"]).is_err());
        assert!(parse(&["--param", "novalue"]).is_err());
        assert!(parse(&["--param", ".hidden=1"]).is_err());
        assert!(parse(&["--filter", "regex", "--param", "pattern=("]).is_err());
        assert!(parse(&["--service-name", "a/b"]).is_err());
    }
}
