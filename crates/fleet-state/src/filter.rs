//! Field filters for instance queries.
//!
//! A filter is a conjunction of equality / inequality tests over document
//! fields. Unset fields match everything.

use crate::types::{Instance, RoutingInstance};

/// Filter over [`Instance`] documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceFilter {
    network: Option<String>,
    server_type: Option<String>,
    server_type_ne: Option<String>,
    node: Option<String>,
    joinable: Option<bool>,
    has_port: Option<bool>,
    has_ram_usage: Option<bool>,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `network = name`
    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.network = Some(name.into());
        self
    }

    /// `type = name`
    pub fn server_type(mut self, name: impl Into<String>) -> Self {
        self.server_type = Some(name.into());
        self
    }

    /// `type != name`
    pub fn server_type_ne(mut self, name: impl Into<String>) -> Self {
        self.server_type_ne = Some(name.into());
        self
    }

    /// `node = name`
    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.node = Some(name.into());
        self
    }

    /// `joinable = value`
    pub fn joinable(mut self, value: bool) -> Self {
        self.joinable = Some(value);
        self
    }

    /// `port != -1` when `true`, `port = -1` when `false`.
    pub fn has_port(mut self, value: bool) -> Self {
        self.has_port = Some(value);
        self
    }

    /// `ramUsage != -1` when `true`, `ramUsage = -1` when `false`.
    pub fn has_ram_usage(mut self, value: bool) -> Self {
        self.has_ram_usage = Some(value);
        self
    }

    pub fn matches(&self, inst: &Instance) -> bool {
        self.network.as_ref().is_none_or(|n| *n == inst.network)
            && self
                .server_type
                .as_ref()
                .is_none_or(|t| *t == inst.server_type)
            && self
                .server_type_ne
                .as_ref()
                .is_none_or(|t| *t != inst.server_type)
            && self.node.as_ref().is_none_or(|n| *n == inst.node)
            && self.joinable.is_none_or(|j| j == inst.joinable)
            && self.has_port.is_none_or(|p| p == inst.port.is_some())
            && self
                .has_ram_usage
                .is_none_or(|r| r == inst.ram_usage.is_some())
    }
}

/// Filter over [`RoutingInstance`] documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingFilter {
    network: Option<String>,
    routing_type: Option<String>,
    node: Option<String>,
}

impl RoutingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.network = Some(name.into());
        self
    }

    pub fn routing_type(mut self, name: impl Into<String>) -> Self {
        self.routing_type = Some(name.into());
        self
    }

    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.node = Some(name.into());
        self
    }

    pub fn matches(&self, inst: &RoutingInstance) -> bool {
        self.network.as_ref().is_none_or(|n| *n == inst.network)
            && self
                .routing_type
                .as_ref()
                .is_none_or(|t| *t == inst.routing_type)
            && self.node.as_ref().is_none_or(|n| *n == inst.node)
    }
}
