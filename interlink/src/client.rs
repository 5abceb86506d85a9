//! Client context: the outbound RPC transaction engine.
//!
//! A [`ClientContext`] is the endpoint specialization that drives
//! request/response transactions over one transport connection. It owns the
//! pending-request correlation table, dispatches unsolicited inbound entries
//! to registered stubs, and runs the background liveness and maintenance
//! tasks.
//!
//! # Transaction lifecycle
//!
//! ```text
//! process_request:
//!   1. Under the pending-table lock, assign a request id and register a
//!      oneshot completion handle (lazily starting the liveness task)
//!   2. Send the entry wrapped in a context-addressed message
//!   3. Await {completion, cancellation, context close, request timeout}
//!   4. Remove the pending entry exactly once, on every exit path
//!   5. Translate a carried error code into a typed failure
//! ```
//!
//! No ordering holds across distinct request ids; exactly one resolution per
//! id is guaranteed.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::endpoint::Endpoint;
use crate::error::RpcError;
use crate::id::{LocalEndpoint, NodeId};
use crate::message::{Element, EntryType, Message, MessageEntry, MessageHeader, Value};
use crate::node::Node;
use crate::service::ServiceDefinition;
use crate::stub::ServiceStub;
use crate::transport::Transport;

/// Cadence of the transport liveness poll.
pub const LIVENESS_POLL: Duration = Duration::from_millis(500);

/// Cadence of the inactivity/keepalive maintenance check.
const MAINTENANCE_POLL: Duration = Duration::from_secs(10);

type PendingSender = oneshot::Sender<Result<MessageEntry, RpcError>>;
type DispatchJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Which stub handler an unsolicited entry is routed to.
#[derive(Debug, Clone, Copy)]
enum HandlerKind {
    Event,
    Pipe,
    Wire,
}

/// Pending-request correlation table.
///
/// Ids wrap at u32, skipping zero and any id still pending, so a sustained
/// request rate can never resolve the wrong transaction.
struct PendingTable {
    next_request_id: u32,
    entries: HashMap<u32, PendingSender>,
}

impl PendingTable {
    fn allocate(&mut self, sender: PendingSender) -> u32 {
        loop {
            self.next_request_id = self.next_request_id.wrapping_add(1);
            let id = self.next_request_id;
            if id != 0 && !self.entries.contains_key(&id) {
                self.entries.insert(id, sender);
                return id;
            }
        }
    }
}

/// Client-side endpoint driving RPC transactions for one service connection.
pub struct ClientContext {
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    transport_id: u32,
    local_endpoint: LocalEndpoint,
    service_name: String,
    remote_endpoint: AtomicU32,
    remote_node_id: Mutex<NodeId>,
    remote_node_name: Mutex<String>,
    connected: AtomicBool,
    closed: AtomicBool,
    liveness_started: AtomicBool,
    pending: Mutex<PendingTable>,
    stubs: Mutex<HashMap<String, Arc<ServiceStub>>>,
    definitions: Mutex<HashMap<String, ServiceDefinition>>,
    mailboxes: Mutex<HashMap<(String, String), mpsc::UnboundedSender<DispatchJob>>>,
    last_recv: Mutex<Instant>,
    last_send: Mutex<Instant>,
    shutdown: CancellationToken,
    weak_self: Weak<ClientContext>,
}

impl ClientContext {
    pub(crate) fn new(
        node: Arc<Node>,
        local_endpoint: LocalEndpoint,
        transport_id: u32,
        transport: Arc<dyn Transport>,
        service_name: &str,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            node,
            transport,
            transport_id,
            local_endpoint,
            service_name: service_name.to_string(),
            remote_endpoint: AtomicU32::new(0),
            remote_node_id: Mutex::new(NodeId::default()),
            remote_node_name: Mutex::new(String::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            liveness_started: AtomicBool::new(false),
            pending: Mutex::new(PendingTable {
                next_request_id: 0,
                entries: HashMap::new(),
            }),
            stubs: Mutex::new(HashMap::new()),
            definitions: Mutex::new(HashMap::new()),
            mailboxes: Mutex::new(HashMap::new()),
            last_recv: Mutex::new(Instant::now()),
            last_send: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Connect to a service and return its root stub.
    ///
    /// Selects a capable transport, opens the connection, registers the local
    /// endpoint, pulls the service's type definitions through its import
    /// graph, resolves the root object type (optionally narrowed to
    /// `objecttype` and verified against the implements list), sends the
    /// session-establishing connect, optionally authenticates, and builds the
    /// root stub. Any failure after the connection was opened closes it and
    /// clears the connected flag before propagating.
    pub async fn connect(
        node: &Arc<Node>,
        url: &str,
        service: &str,
        credentials: Option<(String, Value)>,
        objecttype: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServiceStub>, RpcError> {
        let (transport_id, transport) = node.select_transport(url).ok_or_else(|| {
            RpcError::ConnectionError(format!("no transport accepts \"{url}\""))
        })?;
        let context = node.register_endpoint(|id| {
            ClientContext::new(node.clone(), id, transport_id, transport.clone(), service)
        })?;
        match context.establish(url, credentials, objecttype, cancel).await {
            Ok(stub) => Ok(stub),
            Err(err) => {
                context.connected.store(false, Ordering::SeqCst);
                context.closed.store(true, Ordering::SeqCst);
                context.shutdown.cancel();
                context.fail_pending(RpcError::ConnectionError(
                    "connection attempt abandoned".into(),
                ));
                let _ = context
                    .transport
                    .close_transport_connection(context.local_endpoint, cancel)
                    .await;
                node.unregister_endpoint(context.local_endpoint);
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        url: &str,
        credentials: Option<(String, Value)>,
        objecttype: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServiceStub>, RpcError> {
        self.transport
            .create_transport_connection(url, self.local_endpoint, cancel)
            .await?;
        self.connected.store(true, Ordering::SeqCst);

        // Prime the peer identity from the response header before any
        // directly addressed traffic.
        self.process_request(MessageEntry::request(EntryType::GetNodeInfo, "", ""), cancel)
            .await?;

        self.pull_service_definitions(cancel).await?;

        let (typename, implements) = self
            .remote_object_type(self.service_name.clone(), None, cancel)
            .await?;
        let root_type = match objecttype {
            Some(want) if want != typename => {
                if implements.iter().any(|i| i == want) {
                    want.to_string()
                } else {
                    return Err(RpcError::ObjectNotFound(format!(
                        "service root type \"{typename}\" does not implement \"{want}\""
                    )));
                }
            }
            _ => typename,
        };

        self.process_request(
            MessageEntry::request(EntryType::ConnectClient, self.service_name.as_str(), ""),
            cancel,
        )
        .await?;

        if let Some((username, credential)) = credentials {
            let elements = vec![
                Element::new("username", Value::Str(username)),
                Element::new("credentials", credential),
            ];
            self.session_op(self.service_name.as_str(), "authenticateuser", elements, cancel)
                .await?;
        }

        let stub = self.insert_stub(self.service_name.as_str(), &root_type);
        self.start_maintenance_task();
        debug!(url, service = %self.service_name, "service connection established");
        Ok(stub)
    }

    /// Owning node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Connected service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Whether the context has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the transport connection is currently considered open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of transactions currently awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .entries
            .len()
    }

    /// Pulled service definition by name.
    pub fn definition(&self, name: &str) -> Option<ServiceDefinition> {
        self.definitions
            .lock()
            .expect("definition table lock poisoned")
            .get(name)
            .cloned()
    }

    /// Stub registered at a service path.
    pub fn stub(&self, path: &str) -> Option<Arc<ServiceStub>> {
        self.stubs
            .lock()
            .expect("stub table lock poisoned")
            .get(path)
            .cloned()
    }

    // --- transaction engine ---

    /// Run one request/response transaction.
    pub async fn process_request(
        &self,
        mut entry: MessageEntry,
        cancel: &CancellationToken,
    ) -> Result<MessageEntry, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::InvalidOperation(
                "client context is closed".into(),
            ));
        }

        let (request_id, receiver) = {
            let mut pending = self.pending.lock().expect("pending table lock poisoned");
            let (sender, receiver) = oneshot::channel();
            (pending.allocate(sender), receiver)
        };
        self.ensure_liveness_task();

        entry.request_id = request_id;
        let message = self.wrap_entry(entry);
        if let Err(err) = self.transport.send_message(message, cancel).await {
            self.remove_pending(request_id);
            return Err(err);
        }
        self.mark_sent();

        let timeout = self.node.config().request_timeout;
        let outcome = tokio::select! {
            resolved = receiver => match resolved {
                Ok(result) => result,
                Err(_) => Err(RpcError::ConnectionError(
                    "pending request dropped without resolution".into(),
                )),
            },
            _ = cancel.cancelled() => Err(RpcError::OperationCancelled),
            _ = self.shutdown.cancelled() => {
                Err(RpcError::ConnectionError("client context closed".into()))
            }
            _ = tokio::time::sleep(timeout) => Err(RpcError::RequestTimeout),
        };
        self.remove_pending(request_id);

        let response = outcome?;
        if let Some(err) = response.carried_error() {
            return Err(err);
        }
        Ok(response)
    }

    /// Send a named session operation and return the status string.
    pub(crate) async fn session_op(
        &self,
        path: &str,
        op: &str,
        elements: Vec<Element>,
        cancel: &CancellationToken,
    ) -> Result<String, RpcError> {
        let mut entry = MessageEntry::request(EntryType::ClientSessionOp, path, op);
        entry.elements = elements;
        let response = self.process_request(entry, cancel).await?;
        response
            .element("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                RpcError::ProtocolError(format!("session op \"{op}\" returned no status"))
            })
    }

    /// Resolve the stub at a service path, creating it on first resolution.
    pub async fn object_stub(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServiceStub>, RpcError> {
        if let Some(stub) = self.stub(path) {
            return Ok(stub);
        }
        let (typename, _implements) = self
            .remote_object_type(path.to_string(), None, cancel)
            .await?;
        let mut stubs = self.stubs.lock().expect("stub table lock poisoned");
        if let Some(stub) = stubs.get(path) {
            return Ok(stub.clone());
        }
        let stub = ServiceStub::new(self.weak_self.clone(), path.to_string(), typename);
        stubs.insert(path.to_string(), stub.clone());
        Ok(stub)
    }

    async fn remote_object_type(
        &self,
        path: String,
        client_version: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<String>), RpcError> {
        let mut entry = MessageEntry::request(EntryType::ObjectTypeName, path, "");
        if let Some(version) = client_version {
            entry.add_element("clientversion", Value::Str(version.into()));
        }
        let response = self.process_request(entry, cancel).await?;
        let typename = response
            .expect_element("objecttype")?
            .as_str()
            .ok_or_else(|| RpcError::ProtocolError("objecttype is not a string".into()))?
            .to_string();
        let implements = match response.element("objectimplements") {
            Some(Value::List(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Ok((typename, implements))
    }

    /// Fetch the service's definition and, transitively, every import,
    /// de-duplicated by definition name.
    async fn pull_service_definitions(&self, cancel: &CancellationToken) -> Result<(), RpcError> {
        let root = self.fetch_definition(None, cancel).await?;
        let mut queue: VecDeque<String> = root.imports.iter().cloned().collect();
        self.definitions
            .lock()
            .expect("definition table lock poisoned")
            .insert(root.name.clone(), root);

        while let Some(name) = queue.pop_front() {
            let already_pulled = self
                .definitions
                .lock()
                .expect("definition table lock poisoned")
                .contains_key(&name);
            if already_pulled {
                continue;
            }
            let definition = self.fetch_definition(Some(&name), cancel).await?;
            queue.extend(definition.imports.iter().cloned());
            self.definitions
                .lock()
                .expect("definition table lock poisoned")
                .insert(definition.name.clone(), definition);
        }
        Ok(())
    }

    async fn fetch_definition(
        &self,
        type_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ServiceDefinition, RpcError> {
        let mut entry =
            MessageEntry::request(EntryType::GetServiceDesc, self.service_name.as_str(), "");
        if let Some(name) = type_name {
            entry.add_element("servicetype", Value::Str(name.into()));
        }
        let response = self.process_request(entry, cancel).await?;
        let text = response
            .expect_element("servicedef")?
            .as_str()
            .ok_or_else(|| RpcError::ProtocolError("servicedef is not a string".into()))?
            .to_string();
        let name = response
            .expect_element("defname")?
            .as_str()
            .ok_or_else(|| RpcError::ProtocolError("defname is not a string".into()))?
            .to_string();
        let imports = match response.element("extraimports") {
            Some(Value::List(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Ok(ServiceDefinition { name, text, imports })
    }

    // --- pending table plumbing ---

    fn remove_pending(&self, request_id: u32) {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .entries
            .remove(&request_id);
    }

    fn resolve_pending(&self, request_id: u32, result: Result<MessageEntry, RpcError>) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending table lock poisoned")
            .entries
            .remove(&request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail every pending transaction with the same error.
    fn fail_pending(&self, err: RpcError) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().expect("pending table lock poisoned");
            pending.entries.drain().map(|(_, sender)| sender).collect()
        };
        for sender in drained {
            let _ = sender.send(Err(err.clone()));
        }
    }

    // --- background tasks ---

    /// Start the liveness poll once per context.
    ///
    /// The task fails every pending transaction on the first failed
    /// connection check and then stops permanently; it also stops when the
    /// context shuts down.
    fn ensure_liveness_task(&self) {
        if self.liveness_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_POLL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(context) = weak.upgrade() else { break };
                if let Err(err) = context.transport.check_connection(context.local_endpoint) {
                    warn!(
                        endpoint = context.local_endpoint,
                        error = %err,
                        "transport connection lost"
                    );
                    context.fail_pending(RpcError::ConnectionError(
                        "transport connection lost".into(),
                    ));
                    break;
                }
            }
        });
    }

    fn start_maintenance_task(&self) {
        let weak = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_POLL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(context) = weak.upgrade() else { break };
                context.run_maintenance().await;
            }
        });
    }

    async fn run_maintenance(&self) {
        let idle_recv = self
            .last_recv
            .lock()
            .expect("activity clock lock poisoned")
            .elapsed();
        if idle_recv > self.node.config().inactivity_timeout {
            warn!(endpoint = self.local_endpoint, "closing inactive client context");
            let cancel = CancellationToken::new();
            if let Err(err) = self.close_with(false, &cancel).await {
                debug!(error = %err, "inactivity close failed");
            }
            return;
        }

        let idle_send = self
            .last_send
            .lock()
            .expect("activity clock lock poisoned")
            .elapsed();
        if idle_send > self.node.config().keepalive_period
            && self.remote_endpoint.load(Ordering::SeqCst) != 0
        {
            let entry =
                MessageEntry::request(EntryType::ClientKeepAlive, self.service_name.as_str(), "");
            if let Err(err) = self.send_oneway(entry).await {
                debug!(error = %err, "keepalive send failed");
            }
        }
    }

    // --- outbound plumbing ---

    fn wrap_entry(&self, entry: MessageEntry) -> Message {
        // Session bootstrap entries are addressed at the node, not at the
        // peer endpoint.
        let receiver_endpoint = if entry.entry_type.is_special_request() {
            0
        } else {
            self.remote_endpoint.load(Ordering::SeqCst)
        };
        let header = MessageHeader {
            sender_node_id: self.node.node_id(),
            receiver_node_id: *self
                .remote_node_id
                .lock()
                .expect("remote identity lock poisoned"),
            sender_node_name: self.node.node_name().to_string(),
            receiver_node_name: self
                .remote_node_name
                .lock()
                .expect("remote identity lock poisoned")
                .clone(),
            sender_endpoint: self.local_endpoint,
            receiver_endpoint,
        };
        Message::single(header, entry)
    }

    async fn send_oneway(&self, entry: MessageEntry) -> Result<(), RpcError> {
        let token = self.shutdown.clone();
        self.send_oneway_with(entry, &token).await
    }

    async fn send_oneway_with(
        &self,
        entry: MessageEntry,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError> {
        let message = self.wrap_entry(entry);
        self.transport.send_message(message, cancel).await?;
        self.mark_sent();
        Ok(())
    }

    fn mark_sent(&self) {
        *self.last_send.lock().expect("activity clock lock poisoned") = Instant::now();
    }

    fn mark_recv(&self) {
        *self.last_recv.lock().expect("activity clock lock poisoned") = Instant::now();
    }

    // --- unsolicited dispatch ---

    async fn dispatch_entry(&self, entry: MessageEntry) {
        match entry.entry_type {
            EntryType::ClientKeepAliveRet => {}
            EntryType::ServiceClosed => {
                debug!(service = %entry.service_path, "service closed by remote");
                let cancel = CancellationToken::new();
                if let Err(err) = self.close_with(false, &cancel).await {
                    debug!(error = %err, "close after service shutdown failed");
                }
            }
            EntryType::ServicePathReleased => {
                self.release_stubs(&entry.service_path);
            }
            EntryType::Event => self.dispatch_to_stub_handler(entry, HandlerKind::Event),
            EntryType::PipePacket | EntryType::PipeClosed | EntryType::PipePacketRet => {
                self.dispatch_to_stub_handler(entry, HandlerKind::Pipe)
            }
            EntryType::WirePacket | EntryType::WireClosed => {
                self.dispatch_to_stub_handler(entry, HandlerKind::Wire)
            }
            EntryType::CallbackCall => self.dispatch_callback(entry),
            entry_type if entry_type.is_response() => {
                let request_id = entry.request_id;
                if !self.resolve_pending(request_id, Ok(entry)) {
                    debug!(request_id, "late response for abandoned request ignored");
                }
            }
            other => {
                // No correlation semantics exist for this entry; answering it
                // could corrupt a live transaction, so the context goes down.
                error!(entry_type = ?other, "unrecognized entry type; closing context");
                let cancel = CancellationToken::new();
                if let Err(err) = self.close_with(false, &cancel).await {
                    debug!(error = %err, "close after protocol violation failed");
                }
            }
        }
    }

    /// Queue handler work on the per-(service path, member) mailbox so the
    /// router is never blocked and same-member entries stay ordered.
    fn dispatch_serialized(&self, path: String, member: String, job: DispatchJob) {
        let mut mailboxes = self.mailboxes.lock().expect("mailbox table lock poisoned");
        let sender = mailboxes.entry((path, member)).or_insert_with(|| {
            let (sender, mut receiver) = mpsc::unbounded_channel::<DispatchJob>();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        job = receiver.recv() => match job {
                            Some(job) => job.await,
                            None => break,
                        },
                    }
                }
            });
            sender
        });
        if sender.send(job).is_err() {
            debug!("dispatch mailbox closed, dropping entry");
        }
    }

    fn dispatch_to_stub_handler(&self, entry: MessageEntry, kind: HandlerKind) {
        let weak = self.weak_self.clone();
        let path = entry.service_path.clone();
        let member = entry.member_name.clone();
        let job_path = path.clone();
        self.dispatch_serialized(
            path,
            member,
            Box::pin(async move {
                let Some(context) = weak.upgrade() else { return };
                let Some(stub) = context.stub(&job_path) else {
                    debug!(path = %job_path, "no stub for unsolicited entry");
                    return;
                };
                match kind {
                    HandlerKind::Event => match stub.event_handler() {
                        Some(handler) => handler.event(entry).await,
                        None => debug!(path = %job_path, "no event handler registered"),
                    },
                    HandlerKind::Pipe => match stub.pipe_handler() {
                        Some(handler) => handler.pipe_entry(entry).await,
                        None => debug!(path = %job_path, "no pipe handler registered"),
                    },
                    HandlerKind::Wire => match stub.wire_handler() {
                        Some(handler) => handler.wire_entry(entry).await,
                        None => debug!(path = %job_path, "no wire handler registered"),
                    },
                }
            }),
        );
    }

    fn dispatch_callback(&self, entry: MessageEntry) {
        let weak = self.weak_self.clone();
        let path = entry.service_path.clone();
        let member = entry.member_name.clone();
        self.dispatch_serialized(
            path,
            member,
            Box::pin(async move {
                let Some(context) = weak.upgrade() else { return };
                let response = context.run_callback(&entry).await;
                if let Err(err) = context.send_oneway(response).await {
                    warn!(error = %err, "failed to send callback response");
                }
            }),
        );
    }

    /// Execute a callback request; a response is produced on every path,
    /// including stub-not-found.
    async fn run_callback(&self, entry: &MessageEntry) -> MessageEntry {
        let result = match self.stub(&entry.service_path) {
            None => Err(RpcError::ObjectNotFound(format!(
                "no stub at \"{}\"",
                entry.service_path
            ))),
            Some(stub) => match stub.callback_handler() {
                None => Err(RpcError::MemberNotFound(format!(
                    "no callback handler for \"{}\"",
                    entry.member_name
                ))),
                Some(handler) => handler.call(&entry.member_name, entry).await,
            },
        };
        match result {
            Ok(value) => match entry.response() {
                Ok(mut response) => {
                    response.add_element("return", value);
                    response
                }
                Err(err) => entry.error_response_from(&err),
            },
            Err(err) => entry.error_response_from(&err),
        }
    }

    /// Remove every stub at the released path or a dotted descendant of it.
    fn release_stubs(&self, path: &str) {
        let removed: Vec<Arc<ServiceStub>> = {
            let mut stubs = self.stubs.lock().expect("stub table lock poisoned");
            let prefix = format!("{path}.");
            let matching: Vec<String> = stubs
                .keys()
                .filter(|key| key.as_str() == path || key.starts_with(&prefix))
                .cloned()
                .collect();
            matching
                .iter()
                .filter_map(|key| stubs.remove(key))
                .collect()
        };
        for stub in removed {
            debug!(path = %stub.service_path(), "releasing stub");
            stub.release();
        }
    }

    fn insert_stub(&self, path: &str, object_type: &str) -> Arc<ServiceStub> {
        let stub = ServiceStub::new(
            self.weak_self.clone(),
            path.to_string(),
            object_type.to_string(),
        );
        self.stubs
            .lock()
            .expect("stub table lock poisoned")
            .insert(path.to_string(), stub.clone());
        stub
    }

    // --- teardown ---

    /// Close the context: notify the remote end, fail pending transactions,
    /// release stubs, stop background tasks, and unregister from node and
    /// transport.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), RpcError> {
        self.close_with(true, cancel).await
    }

    async fn close_with(
        &self,
        send_disconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if send_disconnect && self.connected.load(Ordering::SeqCst) {
            let entry = MessageEntry::request(
                EntryType::DisconnectClient,
                self.service_name.as_str(),
                "",
            );
            if let Err(err) = self.send_oneway_with(entry, cancel).await {
                debug!(error = %err, "disconnect notification failed");
            }
        }
        self.shutdown.cancel();
        self.fail_pending(RpcError::ConnectionError(
            "client connection closed".into(),
        ));
        let stubs: Vec<Arc<ServiceStub>> = {
            let mut table = self.stubs.lock().expect("stub table lock poisoned");
            table.drain().map(|(_, stub)| stub).collect()
        };
        for stub in stubs {
            stub.release();
        }
        self.mailboxes
            .lock()
            .expect("mailbox table lock poisoned")
            .clear();
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .transport
            .close_transport_connection(self.local_endpoint, cancel)
            .await;
        self.node.unregister_endpoint(self.local_endpoint);
        Ok(())
    }
}

#[async_trait]
impl Endpoint for ClientContext {
    fn local_endpoint(&self) -> LocalEndpoint {
        self.local_endpoint
    }

    fn remote_endpoint(&self) -> LocalEndpoint {
        self.remote_endpoint.load(Ordering::SeqCst)
    }

    fn remote_node_id(&self) -> NodeId {
        *self
            .remote_node_id
            .lock()
            .expect("remote identity lock poisoned")
    }

    fn transport_id(&self) -> u32 {
        self.transport_id
    }

    async fn message_received(&self, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.mark_recv();

        if message.header.sender_endpoint != 0
            && self.remote_endpoint.load(Ordering::SeqCst) == 0
        {
            self.remote_endpoint
                .store(message.header.sender_endpoint, Ordering::SeqCst);
        }
        {
            let mut remote_id = self
                .remote_node_id
                .lock()
                .expect("remote identity lock poisoned");
            if remote_id.is_unset() && !message.header.sender_node_id.is_unset() {
                *remote_id = message.header.sender_node_id;
                *self
                    .remote_node_name
                    .lock()
                    .expect("remote identity lock poisoned") =
                    message.header.sender_node_name.clone();
            }
        }

        for entry in message.entries {
            self.dispatch_entry(entry).await;
        }
    }

    async fn close(&self) {
        let cancel = CancellationToken::new();
        if let Err(err) = self.close_with(false, &cancel).await {
            debug!(error = %err, "endpoint close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_table_allocates_unique_ids() {
        let mut table = PendingTable {
            next_request_id: 0,
            entries: HashMap::new(),
        };
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let (sender, _receiver) = oneshot::channel();
            let id = table.allocate(sender);
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_pending_table_skips_colliding_ids_on_wrap() {
        let mut table = PendingTable {
            next_request_id: u32::MAX - 1,
            entries: HashMap::new(),
        };
        // Occupy the id right after the wrap point.
        let (sender, _r1) = oneshot::channel();
        table.entries.insert(1, sender);

        let (sender, _r2) = oneshot::channel();
        assert_eq!(table.allocate(sender), u32::MAX);
        // Wraps past 0, finds 1 occupied, settles on 2.
        let (sender, _r3) = oneshot::channel();
        assert_eq!(table.allocate(sender), 2);
    }
}
