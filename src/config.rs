//! Configuration: the static chain file and the router's tunables.

use std::{collections::BTreeMap, fmt, path::Path, time::Duration};

use acp_proto::{Error, Result};
use serde::{Deserialize, Serialize};

/// One component to launch: an executable, its arguments, and extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentCommand {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ComponentCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Split a command line on whitespace. No quoting is supported.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err(Error::configuration("empty component command"));
        };
        Ok(Self {
            command: command.to_string(),
            args: words.map(str::to_string).collect(),
            env: BTreeMap::new(),
        })
    }
}

impl fmt::Display for ComponentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A fixed proxy chain, usually read from a TOML file:
///
/// ```toml
/// [[proxy]]
/// command = "sparkle-acp-proxy"
///
/// [agent]
/// command = "claude-code-acp"
/// args = ["--verbose"]
/// env = { RUST_LOG = "debug" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ComponentCommand>,

    pub agent: Option<ComponentCommand>,
}

impl StaticConfig {
    pub fn new(agent: ComponentCommand, proxies: Vec<ComponentCommand>) -> Self {
        Self {
            proxies,
            agent: Some(agent),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: StaticConfig =
            toml::from_str(text).map_err(|e| Error::configuration(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.is_none() {
            return Err(Error::configuration("no `[agent]` configured"));
        }
        Ok(())
    }
}

/// Tunables for the router.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Upper bound on outstanding requests per hop.
    pub max_pending_requests: usize,

    /// How long a prompt may wait for its session's first `tools/list`.
    pub tools_discovery_timeout: Duration,

    /// Capacity of the router's inbound channel.
    pub channel_capacity: usize,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: 1024,
            tools_discovery_timeout: Duration::from_millis(2000),
            channel_capacity: 128,
        }
    }
}

impl ConductorConfig {
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    pub fn tools_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.tools_discovery_timeout = timeout;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}
