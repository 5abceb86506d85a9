//! Transport seam.
//!
//! Concrete transports (TCP, WebSocket, in-process loopback, ...) live
//! outside this crate. The node consumes them through [`Transport`] and hands
//! inbound traffic back through [`crate::Node::message_received`] and
//! [`crate::Node::special_request`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::id::LocalEndpoint;
use crate::message::Message;

/// A message-oriented transport bound to a node.
///
/// One transport may carry many connections; connections are keyed by the
/// local endpoint id they were created for. `send_message` resolves the
/// target connection from the message header's sender endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether this transport can service the given connection URL.
    fn can_connect_service(&self, url: &str) -> bool;

    /// Open a connection to `url` on behalf of the given local endpoint.
    async fn create_transport_connection(
        &self,
        url: &str,
        local_endpoint: LocalEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError>;

    /// Send a message over the connection owned by the header's sender
    /// endpoint.
    async fn send_message(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError>;

    /// Close the connection owned by the given local endpoint.
    async fn close_transport_connection(
        &self,
        local_endpoint: LocalEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError>;

    /// Synchronous liveness probe; fails when the connection is dead.
    fn check_connection(&self, local_endpoint: LocalEndpoint) -> Result<(), RpcError>;
}
