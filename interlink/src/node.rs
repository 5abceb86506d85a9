//! Node: process-wide registries, message routing, and session bootstrap.
//!
//! A [`Node`] is an explicitly constructed, owned value passed by reference
//! through the call graph; there is no global instance. It owns the transport,
//! endpoint, service, and definition tables and exposes the two entry points
//! transports feed: [`Node::message_received`] for post-bootstrap routing and
//! [`Node::special_request`] for entries that must be handled before any
//! endpoint exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::RpcError;
use crate::id::{LocalEndpoint, NodeId};
use crate::message::{
    EntryType, ErrorKind, Message, MessageEntry, MessageHeader, Value,
};
use crate::service::{LocalService, ServerEndpoint, ServiceDefinition};
use crate::transport::Transport;

/// Allocation attempts before giving up on a free endpoint id.
const ENDPOINT_ID_ATTEMPTS: usize = 4096;

/// Node-wide timing configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Uniform timeout applied to every client transaction.
    pub request_timeout: Duration,
    /// A client context closes after this long without inbound traffic.
    pub inactivity_timeout: Duration,
    /// A client context sends a keepalive after this long without outbound
    /// traffic.
    pub keepalive_period: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(600),
            keepalive_period: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Override the transaction timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the inactivity timeout.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Override the keepalive period.
    pub fn with_keepalive_period(mut self, period: Duration) -> Self {
        self.keepalive_period = period;
        self
    }
}

/// Process-wide coordinator owning transports, endpoints, and local services.
pub struct Node {
    node_id: NodeId,
    node_name: String,
    config: NodeConfig,
    endpoints: Mutex<HashMap<LocalEndpoint, Arc<dyn Endpoint>>>,
    transports: Mutex<HashMap<u32, Arc<dyn Transport>>>,
    services: Mutex<HashMap<String, Arc<LocalService>>>,
    definitions: Mutex<HashMap<String, Arc<ServiceDefinition>>>,
    next_transport_id: AtomicU32,
    weak_self: Weak<Node>,
}

impl Node {
    /// Create a node with a random identity and default configuration.
    pub fn new(node_name: impl Into<String>) -> Arc<Self> {
        Self::with_id(NodeId::random(), node_name, NodeConfig::default())
    }

    /// Create a node with a random identity and explicit configuration.
    pub fn with_config(node_name: impl Into<String>, config: NodeConfig) -> Arc<Self> {
        Self::with_id(NodeId::random(), node_name, config)
    }

    /// Create a node with an explicit identity and configuration.
    pub fn with_id(node_id: NodeId, node_name: impl Into<String>, config: NodeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            node_id,
            node_name: node_name.into(),
            config,
            endpoints: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            definitions: Mutex::new(HashMap::new()),
            next_transport_id: AtomicU32::new(1),
            weak_self: weak_self.clone(),
        })
    }

    /// Node identity.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Node name.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Timing configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // --- transport registry ---

    /// Register a transport, returning its node-assigned id.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> u32 {
        let id = self.next_transport_id.fetch_add(1, Ordering::Relaxed);
        self.transports
            .lock()
            .expect("transport table lock poisoned")
            .insert(id, transport);
        id
    }

    /// Look up a transport by id.
    pub fn transport(&self, id: u32) -> Option<Arc<dyn Transport>> {
        self.transports
            .lock()
            .expect("transport table lock poisoned")
            .get(&id)
            .cloned()
    }

    /// First registered transport able to service the URL.
    pub fn select_transport(&self, url: &str) -> Option<(u32, Arc<dyn Transport>)> {
        let transports = self.transports.lock().expect("transport table lock poisoned");
        transports
            .iter()
            .find(|(_, t)| t.can_connect_service(url))
            .map(|(id, t)| (*id, t.clone()))
    }

    // --- endpoint registry ---

    /// Register a new endpoint under a freshly allocated id.
    ///
    /// The id is chosen by rejection-sampling random non-zero values against
    /// the live registry, so an id already present is never assigned. The
    /// constructor closure receives the allocated id.
    pub fn register_endpoint<E, F>(&self, make: F) -> Result<Arc<E>, RpcError>
    where
        E: Endpoint + 'static,
        F: FnOnce(LocalEndpoint) -> Arc<E>,
    {
        let mut endpoints = self.endpoints.lock().expect("endpoint table lock poisoned");
        let mut rng = rand::rng();
        let mut chosen = None;
        for _ in 0..ENDPOINT_ID_ATTEMPTS {
            let id: LocalEndpoint = rng.random();
            if id != 0 && !endpoints.contains_key(&id) {
                chosen = Some(id);
                break;
            }
        }
        let id = chosen.ok_or_else(|| {
            RpcError::InvalidOperation("endpoint id space exhausted".into())
        })?;
        let endpoint = make(id);
        endpoints.insert(id, endpoint.clone() as Arc<dyn Endpoint>);
        debug!(endpoint = id, "registered endpoint");
        Ok(endpoint)
    }

    /// Remove an endpoint from the registry.
    pub fn unregister_endpoint(&self, id: LocalEndpoint) -> Option<Arc<dyn Endpoint>> {
        let removed = self
            .endpoints
            .lock()
            .expect("endpoint table lock poisoned")
            .remove(&id);
        if removed.is_some() {
            debug!(endpoint = id, "unregistered endpoint");
        }
        removed
    }

    /// Look up an endpoint by id.
    pub fn endpoint(&self, id: LocalEndpoint) -> Option<Arc<dyn Endpoint>> {
        self.endpoints
            .lock()
            .expect("endpoint table lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Number of registered endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints
            .lock()
            .expect("endpoint table lock poisoned")
            .len()
    }

    /// Unregister an endpoint and close its transport connection.
    pub async fn delete_endpoint(
        &self,
        id: LocalEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError> {
        let endpoint = self
            .unregister_endpoint(id)
            .ok_or(RpcError::InvalidEndpoint(id))?;
        endpoint.close().await;
        if let Some(transport) = self.transport(endpoint.transport_id()) {
            transport.close_transport_connection(id, cancel).await?;
        }
        Ok(())
    }

    // --- service registry ---

    /// Register a local service and its definition.
    pub fn register_service(&self, service: Arc<LocalService>) -> Result<(), RpcError> {
        let mut services = self.services.lock().expect("service table lock poisoned");
        if services.contains_key(service.name()) {
            return Err(RpcError::InvalidOperation(format!(
                "service \"{}\" is already registered",
                service.name()
            )));
        }
        self.register_definition(Arc::new(service.definition().clone()));
        services.insert(service.name().to_string(), service);
        Ok(())
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<Arc<LocalService>> {
        self.services
            .lock()
            .expect("service table lock poisoned")
            .get(name)
            .cloned()
    }

    /// Unregister a service, notifying and deleting its connected clients.
    pub async fn unregister_service(&self, name: &str) -> Result<(), RpcError> {
        let service = self
            .services
            .lock()
            .expect("service table lock poisoned")
            .remove(name)
            .ok_or_else(|| RpcError::ServiceNotFound(name.into()))?;
        let cancel = CancellationToken::new();
        for client in service.clients() {
            if let Some(endpoint) = self.endpoint(client) {
                let mut entry = MessageEntry::new(EntryType::ServiceClosed);
                entry.service_path = name.to_string();
                let header = MessageHeader {
                    sender_node_id: self.node_id,
                    receiver_node_id: endpoint.remote_node_id(),
                    sender_node_name: self.node_name.clone(),
                    receiver_node_name: String::new(),
                    sender_endpoint: client,
                    receiver_endpoint: endpoint.remote_endpoint(),
                };
                if let Some(transport) = self.transport(endpoint.transport_id()) {
                    if let Err(err) = transport
                        .send_message(Message::single(header, entry), &cancel)
                        .await
                    {
                        debug!(error = %err, "failed to notify client of service close");
                    }
                }
            }
            if let Err(err) = self.delete_endpoint(client, &cancel).await {
                debug!(error = %err, endpoint = client, "failed to delete client endpoint");
            }
        }
        Ok(())
    }

    /// Register a standalone service definition.
    pub fn register_definition(&self, definition: Arc<ServiceDefinition>) {
        self.definitions
            .lock()
            .expect("definition table lock poisoned")
            .insert(definition.name.clone(), definition);
    }

    /// Look up a service definition by name.
    pub fn definition(&self, name: &str) -> Option<Arc<ServiceDefinition>> {
        self.definitions
            .lock()
            .expect("definition table lock poisoned")
            .get(name)
            .cloned()
    }

    /// Transitive import closure of a definition, de-duplicated by name.
    pub fn definition_closure(
        &self,
        root: &str,
    ) -> Result<Vec<Arc<ServiceDefinition>>, RpcError> {
        let mut ordered = Vec::new();
        let mut seen = Vec::new();
        let mut queue = std::collections::VecDeque::from([root.to_string()]);
        while let Some(name) = queue.pop_front() {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            let definition = self
                .definition(&name)
                .ok_or_else(|| RpcError::ServiceNotFound(name.clone()))?;
            queue.extend(definition.imports.iter().cloned());
            ordered.push(definition);
        }
        Ok(ordered)
    }

    // --- routing ---

    /// Route an inbound message to its endpoint.
    ///
    /// Returns a synthesized error-response message for the calling transport
    /// to send when the message is addressed to another node or an unknown
    /// endpoint; routing failures are never raised.
    pub async fn message_received(&self, message: Message) -> Option<Message> {
        if !message.header.receiver_node_id.matches(&self.node_id) {
            debug!(
                receiver = %message.header.receiver_node_id,
                "message addressed to another node"
            );
            return self.routing_error_response(
                &message,
                ErrorKind::NodeNotFound,
                "Interlink.NodeNotFound",
                "message addressed to another node",
            );
        }
        let endpoint = self
            .endpoints
            .lock()
            .expect("endpoint table lock poisoned")
            .get(&message.header.receiver_endpoint)
            .cloned();
        match endpoint {
            Some(endpoint) => {
                endpoint.message_received(message).await;
                None
            }
            None => {
                debug!(
                    endpoint = message.header.receiver_endpoint,
                    "message addressed to unknown endpoint"
                );
                self.routing_error_response(
                    &message,
                    ErrorKind::InvalidEndpoint,
                    "Interlink.InvalidEndpoint",
                    "unknown receiver endpoint",
                )
            }
        }
    }

    /// Per-entry synthesis rule shared by both routing failures: every entry
    /// that expects a response gets a matching error entry; entries that are
    /// themselves responses are dropped.
    fn routing_error_response(
        &self,
        message: &Message,
        kind: ErrorKind,
        name: &str,
        text: &str,
    ) -> Option<Message> {
        let entries: Vec<MessageEntry> = message
            .entries
            .iter()
            .filter(|entry| entry.expects_response() && !entry.entry_type.is_response())
            .map(|entry| entry.error_response(kind, name, text))
            .collect();
        if entries.is_empty() {
            return None;
        }
        let mut header = message.header.reply();
        header.sender_node_id = self.node_id;
        header.sender_node_name = self.node_name.clone();
        Some(Message { header, entries })
    }

    // --- session bootstrap ---

    /// Handle entries that precede endpoint existence.
    ///
    /// Every entry produces a corresponding response entry (error or success)
    /// in the returned message; failures are never thrown across the
    /// transport boundary.
    pub async fn special_request(&self, message: Message, transport_id: u32) -> Message {
        let mut header = message.header.reply();
        header.sender_node_id = self.node_id;
        header.sender_node_name = self.node_name.clone();

        let mut entries = Vec::new();
        for entry in &message.entries {
            let (response, connected) = self
                .special_entry(entry, &message.header, transport_id)
                .await;
            if let Some(endpoint) = connected {
                header.sender_endpoint = endpoint;
            }
            if let Some(response) = response {
                entries.push(response);
            }
        }
        Message { header, entries }
    }

    async fn special_entry(
        &self,
        entry: &MessageEntry,
        header: &MessageHeader,
        transport_id: u32,
    ) -> (Option<MessageEntry>, Option<LocalEndpoint>) {
        match entry.entry_type {
            EntryType::ConnectionTest => (Some(self.ack(entry)), None),
            EntryType::GetNodeInfo => {
                let response = self
                    .ack(entry)
                    .with_element("nodeid", Value::Str(self.node_id.to_string()))
                    .with_element("nodename", Value::Str(self.node_name.clone()));
                (Some(response), None)
            }
            EntryType::ObjectTypeName => (Some(self.object_type_name(entry)), None),
            EntryType::GetServiceDesc => (Some(self.get_service_desc(entry)), None),
            EntryType::ConnectClient => match self.connect_client(entry, header, transport_id) {
                Ok((response, endpoint)) => (Some(response), Some(endpoint)),
                Err(err) => (Some(entry.error_response_from(&err)), None),
            },
            EntryType::ConnectClientCombined => {
                match self
                    .connect_client_combined(entry, header, transport_id)
                    .await
                {
                    Ok((response, endpoint)) => (Some(response), Some(endpoint)),
                    Err(err) => (Some(entry.error_response_from(&err)), None),
                }
            }
            EntryType::DisconnectClient => {
                (Some(self.disconnect_client(entry, header, transport_id).await), None)
            }
            EntryType::NodeCheckCapability => {
                let response = self.ack(entry).with_element("value", Value::Int(0));
                (Some(response), None)
            }
            EntryType::GetServiceAttributes => {
                let response = match self.instance_service(&entry.service_path) {
                    Ok(service) => self
                        .ack(entry)
                        .with_element("attributes", Value::Map(service.attributes().clone())),
                    Err(err) => entry.error_response_from(&err),
                };
                (Some(response), None)
            }
            EntryType::ServiceClosed | EntryType::ServiceClosedRet => (None, None),
            other => {
                warn!(entry_type = ?other, "unexpected entry in session bootstrap");
                let response = entry.error_response(
                    ErrorKind::ProtocolError,
                    "Interlink.ProtocolError",
                    format!("entry type {other:?} is not a session bootstrap request"),
                );
                (Some(response), None)
            }
        }
    }

    /// Success response skeleton; unexpected response-less types degrade to a
    /// protocol error entry instead of panicking.
    fn ack(&self, entry: &MessageEntry) -> MessageEntry {
        match entry.response() {
            Ok(response) => response,
            Err(err) => entry.error_response_from(&err),
        }
    }

    /// Service instance addressed by the root segment of a service path.
    fn instance_service(&self, service_path: &str) -> Result<Arc<LocalService>, RpcError> {
        let root = service_path.split('.').next().unwrap_or_default();
        self.service(root)
            .ok_or_else(|| RpcError::ServiceNotFound(root.into()))
    }

    fn object_type_name(&self, entry: &MessageEntry) -> MessageEntry {
        let client_version = entry.element("clientversion").and_then(Value::as_str);
        let resolved = self.instance_service(&entry.service_path).and_then(|service| {
            service
                .object_type(&entry.service_path, client_version)
                .cloned()
        });
        match resolved {
            Ok(info) => self
                .ack(entry)
                .with_element("objecttype", Value::Str(info.typename))
                .with_element(
                    "objectimplements",
                    Value::List(info.implements.into_iter().map(Value::Str).collect()),
                ),
            Err(err) => entry.error_response(
                ErrorKind::ObjectNotFound,
                "Interlink.ObjectNotFound",
                err.to_string(),
            ),
        }
    }

    fn get_service_desc(&self, entry: &MessageEntry) -> MessageEntry {
        // By type name when the "servicetype" element is present, otherwise
        // by running instance at the entry's service path.
        let by_type = entry.element("servicetype").and_then(Value::as_str);
        let resolved: Result<(Arc<ServiceDefinition>, Option<Arc<LocalService>>), RpcError> =
            match by_type {
                Some(name) => self
                    .definition(name)
                    .map(|def| (def, None))
                    .ok_or_else(|| RpcError::ServiceNotFound(name.into())),
                None => self.instance_service(&entry.service_path).map(|service| {
                    (Arc::new(service.definition().clone()), Some(service))
                }),
            };
        match resolved {
            Ok((definition, instance)) => {
                let mut response = self
                    .ack(entry)
                    .with_element("servicedef", Value::Str(definition.text.clone()))
                    .with_element("defname", Value::Str(definition.name.clone()))
                    .with_element(
                        "extraimports",
                        Value::List(
                            definition.imports.iter().cloned().map(Value::Str).collect(),
                        ),
                    );
                if let Some(service) = instance {
                    response.add_element("attributes", Value::Map(service.attributes().clone()));
                }
                response
            }
            Err(err) => entry.error_response(
                ErrorKind::ServiceNotFound,
                "Interlink.ServiceNotFound",
                err.to_string(),
            ),
        }
    }

    fn connect_client(
        &self,
        entry: &MessageEntry,
        header: &MessageHeader,
        transport_id: u32,
    ) -> Result<(MessageEntry, LocalEndpoint), RpcError> {
        let service = self.instance_service(&entry.service_path)?;
        let endpoint = self.register_server_endpoint(header, transport_id, &service)?;
        Ok((self.ack(entry), endpoint))
    }

    async fn connect_client_combined(
        &self,
        entry: &MessageEntry,
        header: &MessageHeader,
        transport_id: u32,
    ) -> Result<(MessageEntry, LocalEndpoint), RpcError> {
        let service = self.instance_service(&entry.service_path)?;
        let endpoint = self.register_server_endpoint(header, transport_id, &service)?;

        // Every failure past this point must leave nothing half-registered.
        let result = self
            .combined_connect_body(entry, &service)
            .await;
        match result {
            Ok(response) => Ok((response, endpoint)),
            Err(err) => {
                service.unregister_client(endpoint);
                self.unregister_endpoint(endpoint);
                Err(err)
            }
        }
    }

    async fn combined_connect_body(
        &self,
        entry: &MessageEntry,
        service: &Arc<LocalService>,
    ) -> Result<MessageEntry, RpcError> {
        if let Some(authenticator) = service.authenticator() {
            let username = entry
                .element("username")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let credentials = entry.element("credentials").unwrap_or(&Value::Void);
            authenticator.authenticate(username, credentials).await?;
        }

        let closure = self.definition_closure(&service.definition().name)?;
        let root = service
            .object_type(&entry.service_path, None)
            .cloned()?;

        Ok(self
            .ack(entry)
            .with_element(
                "servicedefs",
                Value::List(
                    closure
                        .iter()
                        .map(|def| Value::Str(def.text.clone()))
                        .collect(),
                ),
            )
            .with_element("objecttype", Value::Str(root.typename))
            .with_element(
                "objectimplements",
                Value::List(root.implements.into_iter().map(Value::Str).collect()),
            )
            .with_element("attributes", Value::Map(service.attributes().clone())))
    }

    fn register_server_endpoint(
        &self,
        header: &MessageHeader,
        transport_id: u32,
        service: &Arc<LocalService>,
    ) -> Result<LocalEndpoint, RpcError> {
        let endpoint = self.register_endpoint(|id| {
            ServerEndpoint::new(
                id,
                header.sender_endpoint,
                header.sender_node_id,
                header.sender_node_name.clone(),
                transport_id,
                self.weak_self.clone(),
                service.clone(),
            )
        })?;
        let id = endpoint.local_endpoint();
        service.register_client(id);
        Ok(id)
    }

    async fn disconnect_client(
        &self,
        entry: &MessageEntry,
        header: &MessageHeader,
        transport_id: u32,
    ) -> MessageEntry {
        let target = if header.receiver_endpoint != 0 {
            Some(header.receiver_endpoint)
        } else {
            // Pre-teardown messages may not address the server endpoint;
            // match on the sender identity instead.
            self.endpoints
                .lock()
                .expect("endpoint table lock poisoned")
                .iter()
                .find(|(_, ep)| {
                    ep.transport_id() == transport_id
                        && ep.remote_endpoint() == header.sender_endpoint
                        && ep.remote_node_id() == header.sender_node_id
                })
                .map(|(id, _)| *id)
        };
        match target {
            Some(id) => {
                for service in self
                    .services
                    .lock()
                    .expect("service table lock poisoned")
                    .values()
                {
                    service.unregister_client(id);
                }
                self.unregister_endpoint(id);
                self.ack(entry)
            }
            None => entry.error_response(
                ErrorKind::InvalidEndpoint,
                "Interlink.InvalidEndpoint",
                "no endpoint registered for disconnecting client",
            ),
        }
    }

    /// Close every endpoint and clear all tables.
    pub async fn shutdown(&self) {
        let endpoints: Vec<Arc<dyn Endpoint>> = {
            let mut table = self.endpoints.lock().expect("endpoint table lock poisoned");
            table.drain().map(|(_, ep)| ep).collect()
        };
        for endpoint in endpoints {
            endpoint.close().await;
        }
        self.transports
            .lock()
            .expect("transport table lock poisoned")
            .clear();
        self.services
            .lock()
            .expect("service table lock poisoned")
            .clear();
        self.definitions
            .lock()
            .expect("definition table lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ObjectTypeInfo;
    use async_trait::async_trait;

    struct NullEndpoint {
        id: LocalEndpoint,
    }

    #[async_trait]
    impl Endpoint for NullEndpoint {
        fn local_endpoint(&self) -> LocalEndpoint {
            self.id
        }
        fn remote_endpoint(&self) -> LocalEndpoint {
            0
        }
        fn remote_node_id(&self) -> NodeId {
            NodeId::default()
        }
        fn transport_id(&self) -> u32 {
            0
        }
        async fn message_received(&self, _message: Message) {}
    }

    fn register_null_endpoint(node: &Node) -> LocalEndpoint {
        node.register_endpoint(|id| Arc::new(NullEndpoint { id }))
            .expect("register endpoint")
            .local_endpoint()
    }

    fn camera_service() -> Arc<LocalService> {
        Arc::new(LocalService::new(
            "camera",
            ServiceDefinition::new("pkg.camera", "service pkg.camera")
                .with_imports(vec!["pkg.common".into()]),
            ObjectTypeInfo::new("pkg.Foo").with_implements(vec!["pkg.IBar".into()]),
        ))
    }

    #[test]
    fn test_endpoint_allocation_avoids_collisions() {
        let node = Node::new("test");
        let mut allocated = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = register_null_endpoint(&node);
            assert_ne!(id, 0);
            assert!(allocated.insert(id), "id {id} assigned twice");
        }
        assert_eq!(node.endpoint_count(), 200);
    }

    #[tokio::test]
    async fn test_route_to_unknown_endpoint_synthesizes_error() {
        let node = Node::new("test");
        let mut entry = MessageEntry::request(EntryType::FunctionCall, "svc", "f");
        entry.request_id = 7;
        let mut message = Message::single(MessageHeader::default(), entry);
        message.header.receiver_node_id = node.node_id();
        message.header.receiver_endpoint = 12345;

        let response = node
            .message_received(message)
            .await
            .expect("synthesized response");
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].error, ErrorKind::InvalidEndpoint);
        assert_eq!(response.entries[0].request_id, 7);
    }

    #[tokio::test]
    async fn test_route_to_wrong_node_synthesizes_node_not_found() {
        let node = Node::new("test");
        let mut request = MessageEntry::request(EntryType::FunctionCall, "svc", "f");
        request.request_id = 3;
        // A response entry in the same message must be dropped, not answered.
        let mut stray_response = MessageEntry::new(EntryType::FunctionCallRet);
        stray_response.request_id = 9;

        let mut message = Message::new(MessageHeader::default());
        message.header.receiver_node_id = NodeId::new(0xdead, 0xbeef);
        message.entries = vec![request, stray_response];

        let response = node
            .message_received(message)
            .await
            .expect("synthesized response");
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].error, ErrorKind::NodeNotFound);
        assert_eq!(response.entries[0].request_id, 3);
    }

    #[tokio::test]
    async fn test_special_request_object_type_name() {
        let node = Node::new("test");
        node.register_service(camera_service()).expect("register");
        node.register_definition(Arc::new(ServiceDefinition::new("pkg.common", "")));

        let mut entry = MessageEntry::request(EntryType::ObjectTypeName, "camera", "");
        entry.request_id = 1;
        let response = node
            .special_request(Message::single(MessageHeader::default(), entry), 1)
            .await;
        let ret = &response.entries[0];
        assert_eq!(ret.entry_type, EntryType::ObjectTypeNameRet);
        assert_eq!(ret.error, ErrorKind::Success);
        assert_eq!(
            ret.element("objecttype").and_then(Value::as_str),
            Some("pkg.Foo")
        );
        assert_eq!(
            ret.element("objectimplements"),
            Some(&Value::List(vec![Value::Str("pkg.IBar".into())]))
        );
    }

    #[tokio::test]
    async fn test_special_request_unknown_object_is_object_not_found() {
        let node = Node::new("test");
        node.register_service(camera_service()).expect("register");

        let mut entry = MessageEntry::request(EntryType::ObjectTypeName, "camera.missing", "");
        entry.request_id = 1;
        let response = node
            .special_request(Message::single(MessageHeader::default(), entry), 1)
            .await;
        assert_eq!(response.entries[0].error, ErrorKind::ObjectNotFound);
    }

    #[tokio::test]
    async fn test_special_request_connect_registers_endpoint() {
        let node = Node::new("test");
        let service = camera_service();
        node.register_service(service.clone()).expect("register");

        let mut entry = MessageEntry::request(EntryType::ConnectClient, "camera", "");
        entry.request_id = 4;
        let mut message = Message::single(MessageHeader::default(), entry);
        message.header.sender_endpoint = 77;

        let response = node.special_request(message, 1).await;
        assert_eq!(response.entries[0].entry_type, EntryType::ConnectClientRet);
        assert_eq!(response.entries[0].error, ErrorKind::Success);
        let endpoint = response.header.sender_endpoint;
        assert_ne!(endpoint, 0);
        assert_eq!(service.clients(), vec![endpoint]);
        assert!(node.endpoint(endpoint).is_some());
    }

    #[tokio::test]
    async fn test_combined_connect_failure_rolls_back() {
        let node = Node::new("test");
        // Missing "pkg.common" import makes the definition closure fail after
        // endpoint registration.
        node.register_service(camera_service()).expect("register");

        let mut entry = MessageEntry::request(EntryType::ConnectClientCombined, "camera", "");
        entry.request_id = 4;
        let response = node
            .special_request(Message::single(MessageHeader::default(), entry), 1)
            .await;
        assert_eq!(response.entries[0].error, ErrorKind::ServiceNotFound);
        assert_eq!(response.header.sender_endpoint, 0);
        assert_eq!(node.endpoint_count(), 0);
        assert!(node.service("camera").expect("service").clients().is_empty());
    }

    #[tokio::test]
    async fn test_special_request_capability_and_unknown_entry() {
        let node = Node::new("test");

        let mut capability = MessageEntry::request(EntryType::NodeCheckCapability, "", "cap");
        capability.request_id = 1;
        let mut stray = MessageEntry::request(EntryType::FunctionCall, "svc", "f");
        stray.request_id = 2;

        let mut message = Message::new(MessageHeader::default());
        message.entries = vec![capability, stray];
        let response = node.special_request(message, 1).await;

        assert_eq!(response.entries[0].element("value"), Some(&Value::Int(0)));
        assert_eq!(response.entries[1].error, ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_definition_closure_deduplicates() {
        let node = Node::new("test");
        node.register_definition(Arc::new(
            ServiceDefinition::new("a", "A").with_imports(vec!["b".into(), "c".into()]),
        ));
        node.register_definition(Arc::new(
            ServiceDefinition::new("b", "B").with_imports(vec!["c".into()]),
        ));
        node.register_definition(Arc::new(ServiceDefinition::new("c", "C")));

        let closure = node.definition_closure("a").expect("closure");
        let names: Vec<&str> = closure.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown_clears_tables() {
        let node = Node::new("test");
        node.register_service(camera_service()).expect("register");
        register_null_endpoint(&node);
        node.shutdown().await;
        assert_eq!(node.endpoint_count(), 0);
        assert!(node.service("camera").is_none());
    }
}
