use std::sync::Arc;

use crate::{error::RpcError, protocol::Message, share::Metadata};

/// Hook points around client calls and server dispatch.
///
/// All hooks default to no-ops; implementations override the subset they
/// care about. Pre-hooks short-circuit the operation on the first error;
/// post-hooks always run.
pub trait Plugin: Send + Sync {
    /// Runs before a client call is dispatched. May rewrite metadata.
    fn pre_call(
        &self,
        _service_path: &str,
        _service_method: &str,
        _metadata: &mut Metadata,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    /// Runs after a client call completes, whatever the outcome.
    fn post_call(
        &self,
        _service_path: &str,
        _service_method: &str,
        _metadata: &Metadata,
        _error: Option<&RpcError>,
    ) {
    }

    /// Runs on the server after a connection is accepted.
    fn post_accept(&self, _peer: &str) -> Result<(), RpcError> {
        Ok(())
    }

    /// Runs on the server after a request frame is decoded.
    fn post_read_request(&self, _message: &Message) -> Result<(), RpcError> {
        Ok(())
    }

    /// Runs on the server before a response frame is written.
    fn pre_write_response(&self, _message: &Message) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Ordered chain of [`Plugin`]s, iterated in registration order.
#[derive(Clone, Default)]
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginContainer {
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub(crate) fn pre_call(
        &self,
        service_path: &str,
        service_method: &str,
        metadata: &mut Metadata,
    ) -> Result<(), RpcError> {
        for plugin in &self.plugins {
            plugin.pre_call(service_path, service_method, metadata)?;
        }
        Ok(())
    }

    pub(crate) fn post_call(
        &self,
        service_path: &str,
        service_method: &str,
        metadata: &Metadata,
        error: Option<&RpcError>,
    ) {
        for plugin in &self.plugins {
            plugin.post_call(service_path, service_method, metadata, error);
        }
    }

    pub(crate) fn post_accept(&self, peer: &str) -> Result<(), RpcError> {
        for plugin in &self.plugins {
            plugin.post_accept(peer)?;
        }
        Ok(())
    }

    pub(crate) fn post_read_request(&self, message: &Message) -> Result<(), RpcError> {
        for plugin in &self.plugins {
            plugin.post_read_request(message)?;
        }
        Ok(())
    }

    pub(crate) fn pre_write_response(&self, message: &Message) -> Result<(), RpcError> {
        for plugin in &self.plugins {
            plugin.pre_write_response(message)?;
        }
        Ok(())
    }
}
