//! Connection fixture: application client code calls straight into
//! application service code, with no test code in between.

use crate::client::Channel;
use crate::descriptor::{split_full_method_name, Descriptors};
use crate::error::FixtureError;
use crate::handler::{ChannelHandler, ChannelRpcHandler};
use crate::metadata::Metadata;
use crate::server::ServerCore;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct DirectHandler {
    core: Arc<ServerCore>,
}

impl ChannelHandler for DirectHandler {
    fn invoke_rpc(
        &self,
        full_method_name: &str,
        invocation_metadata: Metadata,
        requests: Vec<Bytes>,
        requests_closed: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn ChannelRpcHandler>, FixtureError> {
        let (service, method) =
            split_full_method_name(full_method_name).ok_or_else(|| FixtureError::MethodNotFound {
                service: String::new(),
                method: full_method_name.to_string(),
            })?;

        let deadline = self.core.deadline_for(timeout);
        let state = self.core.rpc_state(
            full_method_name,
            invocation_metadata.clone(),
            requests,
            requests_closed,
            deadline,
        );
        self.core
            .invoke(service, method, state.clone(), &invocation_metadata, deadline)?;
        Ok(state)
    }
}

/// A [`Channel`] wired directly to service implementations.
///
/// Built with [`ServerBuilder::build_connection`](crate::ServerBuilder::build_connection).
#[derive(Clone)]
pub struct Connection {
    core: Arc<ServerCore>,
    channel: Channel,
}

impl Connection {
    pub(crate) fn new(core: Arc<ServerCore>) -> Self {
        let channel = Channel::new(Arc::new(DirectHandler { core: core.clone() }));
        Self { core, channel }
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn descriptors(&self) -> &Descriptors {
        self.core.descriptors()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("services", &self.core.descriptors().services().count())
            .finish()
    }
}
