//! # Interlink
//!
//! Cross-language RPC middleware node for distributed heterogeneous systems.
//!
//! The crate implements the node-centric message routing and RPC transaction
//! engine: endpoint and transport registries, request/response correlation,
//! the connect/disconnect session sub-protocol, a remote-iterator
//! ("generator") sub-protocol, and a distributed object-locking/monitor
//! sub-protocol, all multiplexed over a single message-oriented channel per
//! connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Node                                                       │
//! │   transports · endpoints · services · definitions          │
//! │   message_received (routing) · special_request (bootstrap) │
//! ├───────────────────────┬────────────────────────────────────┤
//! │ ClientContext         │ ServerEndpoint                     │
//! │   pending requests    │   per-client dispatch              │
//! │   stub registry       │   service handler hook             │
//! │   liveness/keepalive  │                                    │
//! ├───────────────────────┴────────────────────────────────────┤
//! │ ServiceStub → GeneratorClient · lock/monitor session ops   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound flow: transport → [`Node::message_received`] /
//! [`Node::special_request`] → endpoint → pending-table resolution or stub
//! dispatch. Outbound flow: caller → [`ClientContext::process_request`] →
//! [`Transport::send_message`].
//!
//! ## Quick start
//!
//! ```ignore
//! use interlink::{ClientContext, Node};
//! use tokio_util::sync::CancellationToken;
//!
//! let node = Node::new("client-node");
//! node.register_transport(my_transport);
//!
//! let cancel = CancellationToken::new();
//! let stub = ClientContext::connect(&node, "ilk://robot:7010", "camera",
//!     None, None, &cancel).await?;
//! let frame = stub.function_call("capture", vec![], &cancel).await?;
//! ```

#![deny(missing_docs)]

pub mod client;
pub mod endpoint;
pub mod error;
pub mod generator;
pub mod id;
pub mod lock;
pub mod message;
pub mod node;
pub mod service;
pub mod stub;
pub mod transport;

pub use client::ClientContext;
pub use endpoint::Endpoint;
pub use error::RpcError;
pub use generator::{Generator, GeneratorClient, GeneratorServer};
pub use id::{LocalEndpoint, NodeId};
pub use lock::{lock_object, monitor_enter, unlock_object, LockScope, MonitorHandle};
pub use message::{
    Element, EntryType, ErrorKind, Message, MessageEntry, MessageHeader, Value,
};
pub use node::{Node, NodeConfig};
pub use service::{
    Authenticator, LocalService, ObjectTypeInfo, ServerEndpoint, ServiceDefinition,
    ServiceRequestHandler,
};
pub use stub::{CallbackHandler, EventHandler, PipeHandler, ServiceStub, WireHandler};
pub use transport::Transport;
