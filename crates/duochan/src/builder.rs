//! # Channel Builder
//!
//! Fluent configuration for opening one end of a channel.

use std::sync::Arc;

use duopipe::PipeConfig;

use crate::channel::Channel;
use crate::error::Result;
use crate::module::Module;

/// Configures and opens a `Channel`.
///
/// Both ends use the same `name`. The owner creates the shared memory and
/// must open first; the guest attaches to it.
pub struct ChannelBuilder {
    pub(crate) name: String,
    pub(crate) owner: bool,
    pub(crate) module: Arc<Module>,
    pub(crate) pipe: PipeConfig,
    pub(crate) runtime: Option<tokio::runtime::Handle>,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: false,
            module: Module::empty(),
            pipe: PipeConfig::default(),
            runtime: None,
        }
    }

    /// Whether this end creates the shared memory (endpoint 1).
    pub fn owner(mut self, owner: bool) -> Self {
        self.owner = owner;
        self
    }

    /// Classes this end can activate, invoke and pass by reference.
    pub fn module(mut self, module: Arc<Module>) -> Self {
        self.module = module;
        self
    }

    pub fn pipe_config(mut self, config: PipeConfig) -> Self {
        self.pipe = config;
        self
    }

    /// Runtime for inbound invocations; defaults to the current one.
    pub fn runtime(mut self, runtime: tokio::runtime::Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn open(self) -> Result<Channel> {
        Channel::open(self)
    }
}
