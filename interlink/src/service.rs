//! Locally registered services and the server-side endpoint.
//!
//! A [`LocalService`] bundles everything the session-bootstrap path needs to
//! answer for a running service: its definition text, the object types
//! reachable through its service paths, its attribute map, an optional
//! authenticator, and the list of connected client endpoints. Member dispatch
//! beyond bootstrap is delegated through [`ServiceRequestHandler`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::RpcError;
use crate::id::{LocalEndpoint, NodeId};
use crate::message::{Message, MessageEntry, MessageHeader, Value};
use crate::node::Node;

/// Parsed-enough service definition: name, IDL text, and import names.
///
/// Parsing and verifying the IDL grammar happens outside this crate; the node
/// only stores and serves definitions and walks their import graphs.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    /// Definition name, unique within a node.
    pub name: String,
    /// Raw IDL text.
    pub text: String,
    /// Names of directly imported definitions.
    pub imports: Vec<String>,
}

impl ServiceDefinition {
    /// Create a definition with no imports.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            imports: Vec::new(),
        }
    }

    /// Attach import names, builder style.
    pub fn with_imports(mut self, imports: Vec<String>) -> Self {
        self.imports = imports;
        self
    }
}

/// Object type registered at one service path.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectTypeInfo {
    /// Fully qualified object type name, e.g. `pkg.Foo`.
    pub typename: String,
    /// Fully qualified names of implemented interfaces.
    pub implements: Vec<String>,
}

impl ObjectTypeInfo {
    /// Create an object type with no implemented interfaces.
    pub fn new(typename: impl Into<String>) -> Self {
        Self {
            typename: typename.into(),
            implements: Vec::new(),
        }
    }

    /// Attach implemented interface names, builder style.
    pub fn with_implements(mut self, implements: Vec<String>) -> Self {
        self.implements = implements;
        self
    }
}

/// Credential check hook used by combined connects.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate the supplied credentials, failing with
    /// [`RpcError::AuthenticationError`] on rejection.
    async fn authenticate(&self, username: &str, credentials: &Value) -> Result<(), RpcError>;
}

/// Member-request dispatch hook for a running service.
///
/// The node routes post-bootstrap request entries here; the handler returns
/// the response entry or a typed failure that the endpoint converts into an
/// error response.
#[async_trait]
pub trait ServiceRequestHandler: Send + Sync {
    /// Handle one request entry from the given client endpoint.
    async fn handle_request(
        &self,
        client: LocalEndpoint,
        entry: MessageEntry,
    ) -> Result<MessageEntry, RpcError>;
}

/// A service registered on the local node.
pub struct LocalService {
    name: String,
    definition: ServiceDefinition,
    objects: HashMap<String, ObjectTypeInfo>,
    attributes: BTreeMap<String, Value>,
    authenticator: Option<Arc<dyn Authenticator>>,
    handler: Option<Arc<dyn ServiceRequestHandler>>,
    clients: Mutex<Vec<LocalEndpoint>>,
}

impl LocalService {
    /// Create a service with its definition and root object type.
    ///
    /// The root object is registered at the service-name path.
    pub fn new(
        name: impl Into<String>,
        definition: ServiceDefinition,
        root_object: ObjectTypeInfo,
    ) -> Self {
        let name = name.into();
        let mut objects = HashMap::new();
        objects.insert(name.clone(), root_object);
        Self {
            name,
            definition,
            objects,
            attributes: BTreeMap::new(),
            authenticator: None,
            handler: None,
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Register an object type at a sub-object service path.
    pub fn with_object(mut self, path: impl Into<String>, info: ObjectTypeInfo) -> Self {
        self.objects.insert(path.into(), info);
        self
    }

    /// Attach the service attribute map.
    pub fn with_attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Attach an authenticator; combined connects then require credentials.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Attach the member-request handler.
    pub fn with_handler(mut self, handler: Arc<dyn ServiceRequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service definition.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Attribute map.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Authenticator hook, if any.
    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Member-request handler, if any.
    pub fn handler(&self) -> Option<&Arc<dyn ServiceRequestHandler>> {
        self.handler.as_ref()
    }

    /// Resolve the object type at a service path.
    ///
    /// The optional client protocol version is accepted for forward
    /// compatibility; the baseline registry keeps a single type per path.
    pub fn object_type(
        &self,
        path: &str,
        client_version: Option<&str>,
    ) -> Result<&ObjectTypeInfo, RpcError> {
        if let Some(version) = client_version {
            debug!(service = %self.name, path, version, "object type lookup");
        }
        self.objects
            .get(path)
            .ok_or_else(|| RpcError::ObjectNotFound(format!("no object at \"{path}\"")))
    }

    /// Record a connected client endpoint.
    pub fn register_client(&self, endpoint: LocalEndpoint) {
        let mut clients = self.clients.lock().expect("client list lock poisoned");
        if !clients.contains(&endpoint) {
            clients.push(endpoint);
        }
    }

    /// Remove a connected client endpoint.
    pub fn unregister_client(&self, endpoint: LocalEndpoint) {
        let mut clients = self.clients.lock().expect("client list lock poisoned");
        clients.retain(|c| *c != endpoint);
    }

    /// Snapshot of connected client endpoints.
    pub fn clients(&self) -> Vec<LocalEndpoint> {
        self.clients.lock().expect("client list lock poisoned").clone()
    }
}

/// Server-side endpoint created by a session-establishing connect.
///
/// One per connected client. Routes request entries to the service's handler
/// and always answers request-shaped entries, converting handler failures
/// into error responses.
pub struct ServerEndpoint {
    local_endpoint: LocalEndpoint,
    remote_endpoint: LocalEndpoint,
    remote_node_id: NodeId,
    remote_node_name: String,
    transport_id: u32,
    node: Weak<Node>,
    service: Arc<LocalService>,
}

impl ServerEndpoint {
    /// Create a server endpoint bound to a connected client.
    pub fn new(
        local_endpoint: LocalEndpoint,
        remote_endpoint: LocalEndpoint,
        remote_node_id: NodeId,
        remote_node_name: String,
        transport_id: u32,
        node: Weak<Node>,
        service: Arc<LocalService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_endpoint,
            remote_endpoint,
            remote_node_id,
            remote_node_name,
            transport_id,
            node,
            service,
        })
    }

    /// The service this endpoint belongs to.
    pub fn service(&self) -> &Arc<LocalService> {
        &self.service
    }

    fn reply_header(&self, node: &Node) -> MessageHeader {
        MessageHeader {
            sender_node_id: node.node_id(),
            receiver_node_id: self.remote_node_id,
            sender_node_name: node.node_name().to_string(),
            receiver_node_name: self.remote_node_name.clone(),
            sender_endpoint: self.local_endpoint,
            receiver_endpoint: self.remote_endpoint,
        }
    }

    async fn handle_entry(&self, entry: MessageEntry) -> Option<MessageEntry> {
        use crate::message::EntryType;

        if entry.entry_type == EntryType::ClientKeepAlive {
            return entry.response().ok();
        }
        if entry.entry_type.is_response() {
            debug!(
                entry_type = ?entry.entry_type,
                request_id = entry.request_id,
                "ignoring response entry on server endpoint"
            );
            return None;
        }

        let wants_response = entry.expects_response();
        let result = match self.service.handler() {
            Some(handler) => handler.handle_request(self.local_endpoint, entry.clone()).await,
            None => Err(RpcError::InvalidOperation(format!(
                "service \"{}\" has no request handler",
                self.service.name()
            ))),
        };

        if !wants_response {
            if let Err(err) = result {
                debug!(error = %err, "one-way entry failed");
            }
            return None;
        }
        match result {
            Ok(response) => Some(response),
            Err(err) => Some(entry.error_response_from(&err)),
        }
    }
}

#[async_trait]
impl Endpoint for ServerEndpoint {
    fn local_endpoint(&self) -> LocalEndpoint {
        self.local_endpoint
    }

    fn remote_endpoint(&self) -> LocalEndpoint {
        self.remote_endpoint
    }

    fn remote_node_id(&self) -> NodeId {
        self.remote_node_id
    }

    fn transport_id(&self) -> u32 {
        self.transport_id
    }

    async fn message_received(&self, message: Message) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let mut responses = Vec::new();
        for entry in message.entries {
            if let Some(response) = self.handle_entry(entry).await {
                responses.push(response);
            }
        }
        if responses.is_empty() {
            return;
        }
        let reply = Message {
            header: self.reply_header(&node),
            entries: responses,
        };
        let Some(transport) = node.transport(self.transport_id) else {
            warn!(transport_id = self.transport_id, "transport gone, dropping replies");
            return;
        };
        let cancel = CancellationToken::new();
        if let Err(err) = transport.send_message(reply, &cancel).await {
            warn!(error = %err, "failed to send server endpoint replies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> LocalService {
        LocalService::new(
            "camera",
            ServiceDefinition::new("pkg.camera", "service pkg.camera"),
            ObjectTypeInfo::new("pkg.Camera").with_implements(vec!["pkg.IDevice".into()]),
        )
        .with_object("camera.lens", ObjectTypeInfo::new("pkg.Lens"))
    }

    #[test]
    fn test_object_type_resolution() {
        let service = test_service();
        let root = service.object_type("camera", None).expect("root object");
        assert_eq!(root.typename, "pkg.Camera");
        assert_eq!(root.implements, vec!["pkg.IDevice".to_string()]);

        let lens = service.object_type("camera.lens", Some("0.10")).expect("lens");
        assert_eq!(lens.typename, "pkg.Lens");

        assert!(matches!(
            service.object_type("camera.body", None),
            Err(RpcError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_client_bookkeeping() {
        let service = test_service();
        service.register_client(5);
        service.register_client(9);
        service.register_client(5);
        assert_eq!(service.clients(), vec![5, 9]);

        service.unregister_client(5);
        assert_eq!(service.clients(), vec![9]);
    }
}
