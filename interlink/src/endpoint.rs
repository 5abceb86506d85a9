//! Endpoint trait: the node-addressable inbound message sink.

use async_trait::async_trait;

use crate::id::{LocalEndpoint, NodeId};
use crate::message::Message;

/// A node-local logical connection half bound to one transport connection.
///
/// The node routes every inbound [`Message`] to the endpoint registered under
/// the header's receiver endpoint id. `message_received` must not block the
/// routing task beyond dispatch scheduling; long-running handler work is
/// spawned by the implementation.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Node-unique id of this endpoint.
    fn local_endpoint(&self) -> LocalEndpoint;

    /// Peer endpoint id; 0 while unknown.
    fn remote_endpoint(&self) -> LocalEndpoint;

    /// Peer node identity; unset while unknown.
    fn remote_node_id(&self) -> NodeId;

    /// Id of the transport this endpoint is bound to.
    fn transport_id(&self) -> u32;

    /// Deliver an inbound message addressed to this endpoint.
    async fn message_received(&self, message: Message);

    /// Release endpoint resources ahead of unregistration.
    ///
    /// Called by [`crate::Node::shutdown`]; the default does nothing.
    async fn close(&self) {}
}
