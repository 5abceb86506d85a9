//! Message and payload model.
//!
//! A [`Message`] is a header plus an ordered list of [`MessageEntry`] values.
//! Each entry is one request or response operation; a response entry's type is
//! always the request entry's type plus one, and the numbering below encodes
//! that convention. Entry payloads are ordered lists of named [`Element`]s
//! holding values from the closed [`Value`] union.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::id::{LocalEndpoint, NodeId};

/// Operation carried by a message entry.
///
/// Requests use odd codes; the matching response is request + 1. Entry types
/// without a `...Ret` counterpart (events, wire packets) never receive a
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum EntryType {
    /// Placeholder; never sent.
    Null = 0,
    /// Liveness probe answered by the node itself.
    ConnectionTest = 1,
    /// Response to [`EntryType::ConnectionTest`].
    ConnectionTestRet = 2,
    /// Query node identity and name.
    GetNodeInfo = 3,
    /// Response to [`EntryType::GetNodeInfo`].
    GetNodeInfoRet = 4,
    /// Resolve the object type registered at a service path.
    ObjectTypeName = 5,
    /// Response to [`EntryType::ObjectTypeName`].
    ObjectTypeNameRet = 6,
    /// Fetch the definition text of a service type or running instance.
    GetServiceDesc = 7,
    /// Response to [`EntryType::GetServiceDesc`].
    GetServiceDescRet = 8,
    /// Session-establishing connect.
    ConnectClient = 9,
    /// Response to [`EntryType::ConnectClient`].
    ConnectClientRet = 10,
    /// Session teardown.
    DisconnectClient = 11,
    /// Response to [`EntryType::DisconnectClient`].
    DisconnectClientRet = 12,
    /// Single-round-trip connect: definitions closure + inline auth.
    ConnectClientCombined = 13,
    /// Response to [`EntryType::ConnectClientCombined`].
    ConnectClientCombinedRet = 14,
    /// Query a named protocol capability.
    NodeCheckCapability = 15,
    /// Response to [`EntryType::NodeCheckCapability`].
    NodeCheckCapabilityRet = 16,
    /// Fetch a service's attribute map.
    GetServiceAttributes = 17,
    /// Response to [`EntryType::GetServiceAttributes`].
    GetServiceAttributesRet = 18,
    /// Server notification that a service is shutting down.
    ServiceClosed = 19,
    /// Acknowledgement of [`EntryType::ServiceClosed`].
    ServiceClosedRet = 20,
    /// Client keepalive ping.
    ClientKeepAlive = 21,
    /// Response to [`EntryType::ClientKeepAlive`]; ignored by clients.
    ClientKeepAliveRet = 22,

    /// Read a property member.
    PropertyGet = 31,
    /// Response to [`EntryType::PropertyGet`].
    PropertyGetRet = 32,
    /// Write a property member.
    PropertySet = 33,
    /// Response to [`EntryType::PropertySet`].
    PropertySetRet = 34,
    /// Invoke a function member.
    FunctionCall = 35,
    /// Response to [`EntryType::FunctionCall`].
    FunctionCallRet = 36,
    /// Unsolicited event notification; no response.
    Event = 37,
    /// Server-to-client callback invocation.
    CallbackCall = 39,
    /// Response to [`EntryType::CallbackCall`].
    CallbackCallRet = 40,
    /// Server notification that a service path was torn down.
    ServicePathReleased = 41,
    /// Acknowledgement of [`EntryType::ServicePathReleased`].
    ServicePathReleasedRet = 42,
    /// Named session operation (locks, monitors, authentication).
    ClientSessionOp = 43,
    /// Response to [`EntryType::ClientSessionOp`].
    ClientSessionOpRet = 44,
    /// Generator advance; carried error encodes close/abort.
    GeneratorNext = 45,
    /// Response to [`EntryType::GeneratorNext`].
    GeneratorNextRet = 46,

    /// Pipe endpoint connect.
    PipeConnect = 51,
    /// Response to [`EntryType::PipeConnect`].
    PipeConnectRet = 52,
    /// Pipe endpoint disconnect.
    PipeDisconnect = 53,
    /// Response to [`EntryType::PipeDisconnect`].
    PipeDisconnectRet = 54,
    /// In-band pipe payload.
    PipePacket = 55,
    /// Pipe packet acknowledgement, delivered to the pipe handler.
    PipePacketRet = 56,
    /// Remote pipe endpoint closed.
    PipeClosed = 57,
    /// Acknowledgement of [`EntryType::PipeClosed`].
    PipeClosedRet = 58,

    /// Wire connection setup.
    WireConnect = 61,
    /// Response to [`EntryType::WireConnect`].
    WireConnectRet = 62,
    /// Wire connection teardown.
    WireDisconnect = 63,
    /// Response to [`EntryType::WireDisconnect`].
    WireDisconnectRet = 64,
    /// Most-recent-value wire sample; no response.
    WirePacket = 65,
    /// Remote wire closed; no response.
    WireClosed = 67,

    /// Memory region read.
    MemoryRead = 71,
    /// Response to [`EntryType::MemoryRead`].
    MemoryReadRet = 72,
    /// Memory region write.
    MemoryWrite = 73,
    /// Response to [`EntryType::MemoryWrite`].
    MemoryWriteRet = 74,
}

impl EntryType {
    /// Numeric wire code.
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Decode a wire code.
    pub fn from_u16(value: u16) -> Option<Self> {
        use EntryType::*;
        Some(match value {
            0 => Null,
            1 => ConnectionTest,
            2 => ConnectionTestRet,
            3 => GetNodeInfo,
            4 => GetNodeInfoRet,
            5 => ObjectTypeName,
            6 => ObjectTypeNameRet,
            7 => GetServiceDesc,
            8 => GetServiceDescRet,
            9 => ConnectClient,
            10 => ConnectClientRet,
            11 => DisconnectClient,
            12 => DisconnectClientRet,
            13 => ConnectClientCombined,
            14 => ConnectClientCombinedRet,
            15 => NodeCheckCapability,
            16 => NodeCheckCapabilityRet,
            17 => GetServiceAttributes,
            18 => GetServiceAttributesRet,
            19 => ServiceClosed,
            20 => ServiceClosedRet,
            21 => ClientKeepAlive,
            22 => ClientKeepAliveRet,
            31 => PropertyGet,
            32 => PropertyGetRet,
            33 => PropertySet,
            34 => PropertySetRet,
            35 => FunctionCall,
            36 => FunctionCallRet,
            37 => Event,
            39 => CallbackCall,
            40 => CallbackCallRet,
            41 => ServicePathReleased,
            42 => ServicePathReleasedRet,
            43 => ClientSessionOp,
            44 => ClientSessionOpRet,
            45 => GeneratorNext,
            46 => GeneratorNextRet,
            51 => PipeConnect,
            52 => PipeConnectRet,
            53 => PipeDisconnect,
            54 => PipeDisconnectRet,
            55 => PipePacket,
            56 => PipePacketRet,
            57 => PipeClosed,
            58 => PipeClosedRet,
            61 => WireConnect,
            62 => WireConnectRet,
            63 => WireDisconnect,
            64 => WireDisconnectRet,
            65 => WirePacket,
            67 => WireClosed,
            71 => MemoryRead,
            72 => MemoryReadRet,
            73 => MemoryWrite,
            74 => MemoryWriteRet,
            _ => return None,
        })
    }

    /// Whether this type is a request with a defined response type.
    pub fn is_request(self) -> bool {
        let v = self.as_u16();
        v != 0 && v % 2 == 1 && Self::from_u16(v + 1).is_some()
    }

    /// The matching response type, if this is a request type.
    pub fn response(self) -> Option<Self> {
        if self.is_request() {
            Self::from_u16(self.as_u16() + 1)
        } else {
            None
        }
    }

    /// Whether this type is the response half of a request/response pair.
    pub fn is_response(self) -> bool {
        let v = self.as_u16();
        v != 0 && v % 2 == 0 && Self::from_u16(v - 1).is_some_and(|t| t.is_request())
    }

    /// Whether this type is handled by the node's session bootstrap path
    /// rather than an endpoint.
    pub fn is_special_request(self) -> bool {
        matches!(
            self,
            EntryType::ConnectionTest
                | EntryType::GetNodeInfo
                | EntryType::ObjectTypeName
                | EntryType::GetServiceDesc
                | EntryType::ConnectClient
                | EntryType::DisconnectClient
                | EntryType::ConnectClientCombined
                | EntryType::NodeCheckCapability
                | EntryType::GetServiceAttributes
                | EntryType::ServiceClosed
                | EntryType::ServiceClosedRet
        )
    }
}

/// Wire error code carried by a message entry.
///
/// `Success` marks a normal response. `StopIteration` and `OperationAborted`
/// are generator control signals rather than true failures. `RemoteError`
/// wraps a service-defined exception identified by the `errorname` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorKind {
    /// No error.
    Success = 0,
    /// Transport or route down.
    ConnectionError = 1,
    /// Malformed or unexpected entry / status.
    ProtocolError = 2,
    /// Message addressed to a different node.
    NodeNotFound = 3,
    /// No service registered under the requested name.
    ServiceNotFound = 4,
    /// No object registered at the requested service path.
    ObjectNotFound = 5,
    /// Unknown local endpoint id.
    InvalidEndpoint = 6,
    /// Unknown member on a known object.
    MemberNotFound = 7,
    /// Credentials rejected.
    AuthenticationError = 8,
    /// Transaction exceeded the configured request timeout.
    RequestTimeout = 9,
    /// Caller cancelled the transaction.
    OperationCancelled = 10,
    /// Generator aborted.
    OperationAborted = 11,
    /// Generator exhausted or closed.
    StopIteration = 12,
    /// Operation not valid in the current local state.
    InvalidOperation = 13,
    /// Service-defined remote exception.
    RemoteError = 100,
}

/// Closed payload value union.
///
/// One variant per marshallable kind; consumers dispatch by exhaustive match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Void,
    /// Signed integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// Named structure with field values.
    Struct {
        /// Fully qualified structure type name.
        typename: String,
        /// Field values keyed by field name.
        fields: BTreeMap<String, Value>,
    },
    /// Opaque plain-old-data blob.
    Pod(Bytes),
    /// Fixed-layout named numeric array.
    NamedArray {
        /// Fully qualified array type name.
        typename: String,
        /// Flattened array contents.
        data: Vec<f64>,
    },
    /// Multi-dimensional numeric array.
    MultiDimArray {
        /// Dimension sizes, outermost first.
        dims: Vec<u32>,
        /// Row-major flattened contents.
        data: Vec<f64>,
    },
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed map of values.
    Map(BTreeMap<String, Value>),
    /// Reference to a server-held generator.
    GeneratorRef {
        /// Member that produced the generator.
        member: String,
        /// Server-issued generator index.
        index: i32,
    },
}

impl Value {
    /// Kind tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Struct { .. } => "struct",
            Value::Pod(_) => "pod",
            Value::NamedArray { .. } => "namedarray",
            Value::MultiDimArray { .. } => "multidimarray",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::GeneratorRef { .. } => "generator",
        }
    }

    /// Borrow as a string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read as an integer, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Named payload slot inside a message entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Element name; unique within one entry.
    pub name: String,
    /// Element value.
    pub value: Value,
}

impl Element {
    /// Create a named element.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One request or response operation inside a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Operation discriminator.
    pub entry_type: EntryType,
    /// Correlation id; 0 means no response is expected.
    pub request_id: u32,
    /// Dotted path of the addressed service object.
    pub service_path: String,
    /// Member name the operation targets, if any.
    pub member_name: String,
    /// Carried error code; `Success` for normal entries.
    pub error: ErrorKind,
    /// Ordered payload elements.
    pub elements: Vec<Element>,
}

impl MessageEntry {
    /// Create an empty entry of the given type.
    pub fn new(entry_type: EntryType) -> Self {
        Self {
            entry_type,
            request_id: 0,
            service_path: String::new(),
            member_name: String::new(),
            error: ErrorKind::Success,
            elements: Vec::new(),
        }
    }

    /// Create a request entry addressed at a service path and member.
    ///
    /// The request id is assigned later by the transaction engine.
    pub fn request(
        entry_type: EntryType,
        service_path: impl Into<String>,
        member_name: impl Into<String>,
    ) -> Self {
        Self {
            entry_type,
            request_id: 0,
            service_path: service_path.into(),
            member_name: member_name.into(),
            error: ErrorKind::Success,
            elements: Vec::new(),
        }
    }

    /// Append an element, builder style.
    pub fn with_element(mut self, name: impl Into<String>, value: Value) -> Self {
        self.elements.push(Element::new(name, value));
        self
    }

    /// Append an element in place.
    pub fn add_element(&mut self, name: impl Into<String>, value: Value) {
        self.elements.push(Element::new(name, value));
    }

    /// Look up an element by name.
    pub fn element(&self, name: &str) -> Option<&Value> {
        self.elements.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    /// Look up an element by name, failing with a protocol error on a miss.
    pub fn expect_element(&self, name: &str) -> Result<&Value, RpcError> {
        self.element(name).ok_or_else(|| {
            RpcError::ProtocolError(format!(
                "entry {:?} is missing element \"{}\"",
                self.entry_type, name
            ))
        })
    }

    /// Whether this entry expects a response: it carries a non-zero request
    /// id and its type has a defined response type.
    pub fn expects_response(&self) -> bool {
        self.request_id != 0 && self.entry_type.response().is_some()
    }

    /// Build the success response skeleton for this request entry.
    ///
    /// Copies request id, service path, and member name; fails if the entry
    /// type has no response counterpart.
    pub fn response(&self) -> Result<MessageEntry, RpcError> {
        let response_type = self.entry_type.response().ok_or_else(|| {
            RpcError::ProtocolError(format!(
                "entry type {:?} has no response type",
                self.entry_type
            ))
        })?;
        Ok(MessageEntry {
            entry_type: response_type,
            request_id: self.request_id,
            service_path: self.service_path.clone(),
            member_name: self.member_name.clone(),
            error: ErrorKind::Success,
            elements: Vec::new(),
        })
    }

    /// Build an error response for this request entry.
    ///
    /// Carries the error code plus `errorname`/`errorstring` elements. Falls
    /// back to the request's own type when no response type exists so that
    /// synthesized routing errors can always be expressed.
    pub fn error_response(
        &self,
        error: ErrorKind,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> MessageEntry {
        MessageEntry {
            entry_type: self.entry_type.response().unwrap_or(self.entry_type),
            request_id: self.request_id,
            service_path: self.service_path.clone(),
            member_name: self.member_name.clone(),
            error,
            elements: vec![
                Element::new("errorname", Value::Str(name.into())),
                Element::new("errorstring", Value::Str(message.into())),
            ],
        }
    }

    /// Build an error response from a typed failure.
    pub fn error_response_from(&self, error: &RpcError) -> MessageEntry {
        self.error_response(error.kind(), error.error_name(), error.to_string())
    }

    /// Decode the carried error, if any, into a typed failure.
    pub fn carried_error(&self) -> Option<RpcError> {
        if self.error == ErrorKind::Success {
            return None;
        }
        let name = self
            .element("errorname")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = self
            .element("errorstring")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(RpcError::from_wire(self.error, name, message))
    }
}

/// Message addressing header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Originating node.
    pub sender_node_id: NodeId,
    /// Destination node; unset matches any node.
    pub receiver_node_id: NodeId,
    /// Originating node name.
    pub sender_node_name: String,
    /// Destination node name.
    pub receiver_node_name: String,
    /// Originating endpoint; 0 when unknown.
    pub sender_endpoint: LocalEndpoint,
    /// Destination endpoint; 0 routes to session bootstrap.
    pub receiver_endpoint: LocalEndpoint,
}

impl MessageHeader {
    /// Build the reply header: sender and receiver swapped.
    pub fn reply(&self) -> MessageHeader {
        MessageHeader {
            sender_node_id: self.receiver_node_id,
            receiver_node_id: self.sender_node_id,
            sender_node_name: self.receiver_node_name.clone(),
            receiver_node_name: self.sender_node_name.clone(),
            sender_endpoint: self.receiver_endpoint,
            receiver_endpoint: self.sender_endpoint,
        }
    }
}

/// Unit of communication between nodes: header plus ordered entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Addressing header.
    pub header: MessageHeader,
    /// Ordered operations.
    pub entries: Vec<MessageEntry>,
}

impl Message {
    /// Create an empty message with the given header.
    pub fn new(header: MessageHeader) -> Self {
        Self {
            header,
            entries: Vec::new(),
        }
    }

    /// Create a message carrying a single entry.
    pub fn single(header: MessageHeader, entry: MessageEntry) -> Self {
        Self {
            header,
            entries: vec![entry],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_is_request_plus_one() {
        for v in 0..128u16 {
            if let Some(t) = EntryType::from_u16(v) {
                if let Some(r) = t.response() {
                    assert_eq!(r.as_u16(), t.as_u16() + 1);
                    assert!(r.is_response());
                    assert!(!r.is_request());
                }
            }
        }
    }

    #[test]
    fn test_entry_types_without_response() {
        assert_eq!(EntryType::Event.response(), None);
        assert_eq!(EntryType::WirePacket.response(), None);
        assert_eq!(EntryType::WireClosed.response(), None);
        assert!(!EntryType::WireClosed.is_response());
    }

    #[test]
    fn test_expects_response_requires_request_id() {
        let mut entry = MessageEntry::request(EntryType::FunctionCall, "svc", "calc");
        assert!(!entry.expects_response());
        entry.request_id = 7;
        assert!(entry.expects_response());

        let mut event = MessageEntry::request(EntryType::Event, "svc", "changed");
        event.request_id = 7;
        assert!(!event.expects_response());
    }

    #[test]
    fn test_response_copies_correlation_fields() {
        let mut request = MessageEntry::request(EntryType::PropertyGet, "svc.sub", "pos");
        request.request_id = 42;
        let response = request.response().expect("response type");
        assert_eq!(response.entry_type, EntryType::PropertyGetRet);
        assert_eq!(response.request_id, 42);
        assert_eq!(response.service_path, "svc.sub");
        assert_eq!(response.member_name, "pos");
        assert_eq!(response.error, ErrorKind::Success);
    }

    #[test]
    fn test_error_response_carries_name_and_string() {
        let mut request = MessageEntry::request(EntryType::FunctionCall, "svc", "f");
        request.request_id = 3;
        let response =
            request.error_response(ErrorKind::ServiceNotFound, "ServiceNotFound", "no svc");
        assert_eq!(response.error, ErrorKind::ServiceNotFound);
        assert_eq!(
            response.element("errorname").and_then(Value::as_str),
            Some("ServiceNotFound")
        );
        assert_eq!(
            response.element("errorstring").and_then(Value::as_str),
            Some("no svc")
        );

        let err = response.carried_error().expect("carried error");
        assert!(matches!(err, RpcError::ServiceNotFound(_)));
    }

    #[test]
    fn test_header_reply_swaps_direction() {
        let header = MessageHeader {
            sender_node_id: NodeId::new(1, 1),
            receiver_node_id: NodeId::new(2, 2),
            sender_node_name: "a".into(),
            receiver_node_name: "b".into(),
            sender_endpoint: 11,
            receiver_endpoint: 22,
        };
        let reply = header.reply();
        assert_eq!(reply.sender_node_id, NodeId::new(2, 2));
        assert_eq!(reply.receiver_node_id, NodeId::new(1, 1));
        assert_eq!(reply.sender_endpoint, 22);
        assert_eq!(reply.receiver_endpoint, 11);
    }

    #[test]
    fn test_message_serde_roundtrip() {
        let entry = MessageEntry::request(EntryType::FunctionCall, "svc", "f")
            .with_element("param", Value::Int(5))
            .with_element("blob", Value::Pod(Bytes::from_static(b"\x01\x02")));
        let message = Message::single(MessageHeader::default(), entry);
        let json = serde_json::to_string(&message).expect("serialize");
        let decoded: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_special_request_classification() {
        assert!(EntryType::ConnectClient.is_special_request());
        assert!(EntryType::GetNodeInfo.is_special_request());
        assert!(!EntryType::FunctionCall.is_special_request());
        assert!(!EntryType::ClientKeepAlive.is_special_request());
    }
}
