use anyhow::{Context, bail};
use autopipe::{OrchestratorConfig, PipelineRequest, ServerDirectory};
use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// Runtime configuration for the `autopipe` client.
///
/// Each positional `STAGE` is `target[,key=value]*`, where `target` is either
/// `host:port` or the name of a descriptor in `SERVERS_DIR`. Use `\,` for a
/// literal comma and `\\` for a literal backslash inside a stage.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "autopipe",
    version,
    about = "Pipe stdin through a chain of remote filters to stdout"
)]
pub struct CliArgs {
    /// Directory of `<name>.server` descriptor files used to resolve named
    /// stages.
    ///
    /// Environment variable: `SERVERS_DIR`
    #[arg(long, env = "SERVERS_DIR")]
    pub servers_dir: Option<PathBuf>,

    /// Number of pipelines to size internal bookkeeping for.
    ///
    /// Environment variable: `MIN_PUMPS`
    #[arg(long, env = "MIN_PUMPS", default_value_t = 4)]
    pub min_pumps: usize,

    /// Upper bound on concurrently running pump stages.
    ///
    /// Environment variable: `MAX_PUMPS`
    #[arg(long, env = "MAX_PUMPS", default_value_t = 64)]
    pub max_pumps: usize,

    /// Milliseconds `close` waits for the last hop to end its output and for
    /// the stages to finish on their own.
    ///
    /// Environment variable: `SETTLE_TIMEOUT_MS`
    #[arg(long, env = "SETTLE_TIMEOUT_MS", default_value_t = 500)]
    pub settle_timeout_ms: u64,

    /// List the servers in `SERVERS_DIR` and exit.
    #[arg(short, long, default_value_t = false)]
    pub list: bool,

    /// Pipeline stages, in order.
    #[arg(value_name = "STAGE")]
    pub stages: Vec<String>,
}

/// Where a stage is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Addr { host: String, port: i64 },
    Named(String),
}

/// One parsed positional stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub target: Target,
    pub params: Vec<(String, String)>,
}

impl StageSpec {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut fields = split_unescaped(raw)?.into_iter();
        let target = fields.next().unwrap_or_default();
        if target.is_empty() {
            bail!("stage `{raw}` has no target");
        }

        let addr = target
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<i64>().ok()?)));
        let target = match addr {
            Some((host, port)) => Target::Addr {
                host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
                port,
            },
            None => Target::Named(target),
        };

        let params = fields
            .map(|field| {
                field
                    .split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .with_context(|| format!("stage parameter `{field}` is not key=value"))
            })
            .collect::<anyhow::Result<_>>()?;

        Ok(Self { target, params })
    }

    /// Builds the request for this stage, resolving named targets in
    /// `directory`.
    pub fn request(&self, directory: Option<&ServerDirectory>) -> anyhow::Result<PipelineRequest> {
        let mut request = match &self.target {
            Target::Addr { host, port } => PipelineRequest::new(host.clone(), *port)?,
            Target::Named(name) => {
                let directory = directory
                    .with_context(|| format!("stage `{name}` needs SERVERS_DIR to resolve"))?;
                directory
                    .get(name)
                    .with_context(|| format!("no usable server descriptor named `{name}`"))?
                    .request()?
            }
        };
        for (key, value) in &self.params {
            request.put(key.clone(), value.clone())?;
        }
        Ok(request)
    }
}

fn split_unescaped(raw: &str) -> anyhow::Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ (',' | '\\')) => current.push(escaped),
                Some(other) => bail!("unknown escape `\\{other}` in stage `{raw}`"),
                None => bail!("dangling `\\` at the end of stage `{raw}`"),
            },
            ',' => fields.push(core::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub servers_dir: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
    pub list: bool,
    pub stages: Vec<StageSpec>,
}

impl TryFrom<CliArgs> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_pumps == 0 {
            bail!("MAX_PUMPS must be greater than 0");
        }
        if args.min_pumps > args.max_pumps {
            bail!(
                "MIN_PUMPS ({}) exceeds MAX_PUMPS ({})",
                args.min_pumps,
                args.max_pumps
            );
        }
        if args.list && args.servers_dir.is_none() {
            bail!("--list requires SERVERS_DIR");
        }
        if !args.list && args.stages.is_empty() {
            bail!("at least one STAGE is required");
        }
        if args.stages.len() > args.max_pumps {
            bail!(
                "{} stages exceed MAX_PUMPS ({})",
                args.stages.len(),
                args.max_pumps
            );
        }

        let stages = args
            .stages
            .iter()
            .map(|raw| StageSpec::parse(raw))
            .collect::<anyhow::Result<_>>()?;

        Ok(Self {
            servers_dir: args.servers_dir,
            orchestrator: OrchestratorConfig {
                min_pumps: args.min_pumps,
                max_pumps: args.max_pumps,
                settle_timeout: Duration::from_millis(args.settle_timeout_ms),
            },
            list: args.list,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopipe::ServerDescriptor;

    fn parse(args: &[&str]) -> anyhow::Result<ClientConfig> {
        let mut argv = vec!["autopipe"];
        argv.extend_from_slice(args);
        ClientConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn parses_address_and_named_stages() {
        let config = parse(&["127.0.0.1:4700", "grep,pattern=a\\,b,replace=x=y"]).unwrap();
        assert_eq!(config.orchestrator.settle_timeout, Duration::from_millis(500));
        assert_eq!(
            config.stages[0],
            StageSpec {
                target: Target::Addr {
                    host: "127.0.0.1".into(),
                    port: 4700
                },
                params: vec![],
            }
        );
        assert_eq!(config.stages[1].target, Target::Named("grep".into()));
        assert_eq!(
            config.stages[1].params,
            [
                ("pattern".to_owned(), "a,b".to_owned()),
                ("replace".to_owned(), "x=y".to_owned())
            ]
        );
    }

    #[test]
    fn rejects_bad_invocations() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--list"]).is_err());
        assert!(parse(&["--min-pumps", "8", "--max-pumps", "2", "h:1"]).is_err());
        assert!(parse(&["--max-pumps", "1", "h:1", "h:2"]).is_err());
        assert!(parse(&["h:1,novalue"]).is_err());
        assert!(parse(&["h:1,k=v\\"]).is_err());
    }

    #[test]
    fn out_of_range_port_is_reported_when_building_the_request() {
        let stage = StageSpec::parse("localhost:70000").unwrap();
        let err = stage.request(None).unwrap_err();
        assert!(err.to_string().contains("70000"));

        let reserved = StageSpec::parse("localhost:1,.internal=1").unwrap();
        assert!(reserved.request(None).is_err());
    }

    #[test]
    fn named_stages_resolve_through_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        ServerDescriptor {
            name: "grep".into(),
            host: "10.0.0.7".into(),
            port: 4701,
            synopsis: None,
        }
        .publish(dir.path())
        .unwrap();
        let directory = ServerDirectory::load(dir.path()).unwrap();

        let stage = StageSpec::parse("grep,pattern=^b").unwrap();
        let request = stage.request(Some(&directory)).unwrap();
        assert_eq!(request.addr(), "10.0.0.7:4701");
        assert_eq!(request.params().collect::<Vec<_>>(), [("pattern", "^b")]);

        assert!(StageSpec::parse("missing").unwrap().request(Some(&directory)).is_err());
        assert!(stage.request(None).is_err());
    }
}
