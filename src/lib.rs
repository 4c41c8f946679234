//! A conductor for ACP: it sits between a client and an agent, threads the
//! traffic through a chain of proxies, and lets the agent call MCP servers
//! that live inside the conductor by tunnelling MCP over the same connection.

use std::path::PathBuf;

use acp_proto::{Error, Result};
use clap::Parser;

pub mod conductor;
pub mod config;
pub mod connector;
pub mod instantiator;
pub mod logging;
pub mod mcp_over_acp;
mod message_queue;

pub use acp_proto;
pub use conductor::{Conductor, ShutdownHandle};

use crate::{
    config::StaticConfig,
    connector::Connection,
    instantiator::{ComponentInstantiator, from_commands, static_instantiator},
    logging::TraceLog,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ConductorArgs {
    /// TOML file describing the chain (`[[proxy]]` tables and one `[agent]`)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Write a per-connection message trace under this directory
    #[arg(long)]
    pub trace_dir: Option<PathBuf>,

    /// Component commands, proxies first and the agent last
    pub components: Vec<String>,
}

impl ConductorArgs {
    pub fn instantiator(&self) -> Result<Box<dyn ComponentInstantiator>> {
        match &self.config {
            Some(_) if !self.components.is_empty() => Err(Error::configuration(
                "give either `--config` or component commands, not both",
            )),
            Some(path) => static_instantiator(StaticConfig::load(path)?),
            None => from_commands(&self.components),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut conductor = Conductor::new(self.instantiator()?);
        if let Some(dir) = &self.trace_dir {
            conductor = conductor.with_trace_log(TraceLog::create(dir).await?);
        }
        conductor.run(Connection::stdio()).await?;
        Ok(())
    }
}
