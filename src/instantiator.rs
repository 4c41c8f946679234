//! Deciding which components make up the chain.
//!
//! The conductor does not know its chain until the client's `initialize`
//! arrives. At that point the instantiator runs, exactly once, and hands back
//! the agent and the proxies (in chain order) as unconnected [`Connector`]s.

use std::future::Future;

use acp_proto::{Error, InitializeRequest, Result};
use futures::future::BoxFuture;

use crate::{
    config::{ComponentCommand, StaticConfig},
    connector::{Connector, ProcessConnector},
};

/// The chain chosen for a session.
pub struct Instantiated {
    pub agent: Box<dyn Connector>,
    /// Ordered from the client side toward the agent.
    pub proxies: Vec<Box<dyn Connector>>,
}

impl Instantiated {
    pub fn new(agent: Box<dyn Connector>, proxies: Vec<Box<dyn Connector>>) -> Self {
        Self { agent, proxies }
    }

    /// Component names in chain order, agent last.
    pub fn names(&self) -> Vec<String> {
        self.proxies
            .iter()
            .chain(std::iter::once(&self.agent))
            .map(|c| c.name())
            .collect()
    }
}

pub trait ComponentInstantiator: Send {
    fn instantiate(self: Box<Self>, request: &InitializeRequest) -> BoxFuture<'static, Result<Instantiated>>;
}

struct Fixed(Instantiated);

impl ComponentInstantiator for Fixed {
    fn instantiate(self: Box<Self>, _request: &InitializeRequest) -> BoxFuture<'static, Result<Instantiated>> {
        Box::pin(async move { Ok(self.0) })
    }
}

/// Use these connectors regardless of what the client asks for.
pub fn from_connectors(
    agent: Box<dyn Connector>,
    proxies: Vec<Box<dyn Connector>>,
) -> Box<dyn ComponentInstantiator> {
    Box::new(Fixed(Instantiated::new(agent, proxies)))
}

/// Spawn each command line as a process. The last one is the agent.
pub fn from_commands<I, S>(commands: I) -> Result<Box<dyn ComponentInstantiator>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut commands = commands
        .into_iter()
        .map(|line| ComponentCommand::parse(line.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let Some(agent) = commands.pop() else {
        return Err(Error::configuration("at least one command is required"));
    };
    static_instantiator(StaticConfig::new(agent, commands))
}

/// Spawn the processes described by a [`StaticConfig`].
pub fn static_instantiator(config: StaticConfig) -> Result<Box<dyn ComponentInstantiator>> {
    config.validate()?;
    let StaticConfig { proxies, agent } = config;
    let Some(agent) = agent else {
        return Err(Error::configuration("no agent configured"));
    };
    Ok(from_connectors(
        process(agent),
        proxies.into_iter().map(process).collect(),
    ))
}

fn process(command: ComponentCommand) -> Box<dyn Connector> {
    Box::new(ProcessConnector::new(command))
}

struct Dynamic<F>(F);

impl<F, Fut> ComponentInstantiator for Dynamic<F>
where
    F: FnOnce(InitializeRequest) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Instantiated>> + Send + 'static,
{
    fn instantiate(self: Box<Self>, request: &InitializeRequest) -> BoxFuture<'static, Result<Instantiated>> {
        Box::pin((self.0)(request.clone()))
    }
}

/// Choose the chain at runtime from the client's `initialize` (for example,
/// by its declared capabilities or requested MCP servers).
pub fn dynamic<F, Fut>(factory: F) -> Box<dyn ComponentInstantiator>
where
    F: FnOnce(InitializeRequest) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Instantiated>> + Send + 'static,
{
    Box::new(Dynamic(factory))
}
