//! Remote-iterator ("generator") protocol.
//!
//! A generator is a server-held, client-iterated sequence layered on the
//! normal transaction channel. Advances are `GeneratorNext` entries carrying
//! the server-issued index; termination is expressed by the *request's*
//! carried error, not a distinct entry type: a stop-iteration error means
//! clean close, an abort error means terminate-and-fail.
//!
//! Generators come in three shapes by presence of {parameter, return}:
//! both present, return-only (which also gets the [`GeneratorClient::next_all`]
//! drain convenience), and parameter-only with no return.
//!
//! # Client state machine
//!
//! ```text
//! Active --Next--> Active | Exhausted (stop-iteration) | Faulted (aborted)
//! Active --Close--> Closed   (further Next raises stop-iteration)
//! Active --Abort--> Aborted  (further Next raises aborted)
//! ```
//!
//! Closed and Aborted are terminal; a terminal generator replays the same
//! signal on every subsequent advance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RpcError;
use crate::message::{EntryType, ErrorKind, MessageEntry, Value};
use crate::stub::ServiceStub;

/// Client-side generator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeneratorState {
    /// Advancing normally.
    Active,
    /// Locally closed; advances raise stop-iteration.
    Closed,
    /// Locally aborted; advances raise aborted.
    Aborted,
    /// Remote reported stop-iteration; advances replay it.
    Exhausted,
    /// Remote reported abort; advances replay it.
    Faulted,
}

/// Client-side handle for one remote generator.
///
/// Wraps the owning stub, the member that produced the generator, and the
/// server-issued index. Advances on one handle are serialized.
pub struct GeneratorClient {
    stub: Arc<ServiceStub>,
    member: String,
    index: i32,
    state: tokio::sync::Mutex<GeneratorState>,
}

impl GeneratorClient {
    /// Wrap a server-issued generator index.
    pub fn new(stub: Arc<ServiceStub>, member: impl Into<String>, index: i32) -> Self {
        Self {
            stub,
            member: member.into(),
            index,
            state: tokio::sync::Mutex::new(GeneratorState::Active),
        }
    }

    /// Build a handle from a function's generator-reference return value.
    pub fn from_return(stub: &Arc<ServiceStub>, value: &Value) -> Result<Self, RpcError> {
        match value {
            Value::GeneratorRef { member, index } => {
                Ok(Self::new(stub.clone(), member.clone(), *index))
            }
            other => Err(RpcError::ProtocolError(format!(
                "expected a generator reference, got {}",
                other.kind()
            ))),
        }
    }

    /// Server-issued generator index.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Advance the generator.
    ///
    /// Sends the optional parameter and returns the unpacked `return`
    /// element, or `None` for the parameter-only shape. A carried
    /// stop-iteration or abort moves the handle to its terminal state before
    /// the signal is surfaced.
    pub async fn next(
        &self,
        param: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, RpcError> {
        let mut state = self.state.lock().await;
        match *state {
            GeneratorState::Active => {}
            GeneratorState::Closed | GeneratorState::Exhausted => {
                return Err(RpcError::StopIteration)
            }
            GeneratorState::Aborted | GeneratorState::Faulted => {
                return Err(RpcError::OperationAborted("generator aborted".into()))
            }
        }

        let mut entry = self.advance_entry();
        if let Some(param) = param {
            entry.add_element("parameter", param);
        }
        let context = self.stub.context()?;
        match context.process_request(entry, cancel).await {
            Ok(response) => Ok(response.element("return").cloned()),
            Err(RpcError::StopIteration) => {
                *state = GeneratorState::Exhausted;
                Err(RpcError::StopIteration)
            }
            Err(RpcError::OperationAborted(message)) => {
                *state = GeneratorState::Faulted;
                Err(RpcError::OperationAborted(message))
            }
            Err(err) => Err(err),
        }
    }

    /// Request clean termination.
    ///
    /// Sends an advance whose carried error is stop-iteration; the remote
    /// confirmation echoing the signal is treated as success. A terminal
    /// handle closes without a round trip.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;
        if *state != GeneratorState::Active {
            return Ok(());
        }
        let entry = self.signal_entry(
            ErrorKind::StopIteration,
            "Interlink.StopIteration",
            "generator closed",
        );
        let context = self.stub.context()?;
        let result = context.process_request(entry, cancel).await;
        *state = GeneratorState::Closed;
        match result {
            Ok(_) | Err(RpcError::StopIteration) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Terminate and fail any in-progress effect.
    ///
    /// Sends an advance whose carried error is the abort code; the remote
    /// confirmation echoing the signal is treated as success.
    pub async fn abort(&self, cancel: &CancellationToken) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;
        if *state != GeneratorState::Active {
            return Ok(());
        }
        let entry = self.signal_entry(
            ErrorKind::OperationAborted,
            "Interlink.OperationAborted",
            "generator aborted",
        );
        let context = self.stub.context()?;
        let result = context.process_request(entry, cancel).await;
        *state = GeneratorState::Aborted;
        match result {
            Ok(_) | Err(RpcError::OperationAborted(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Drain every remaining value of a return-only generator.
    ///
    /// Convenience over repeated [`GeneratorClient::next`] that stops at the
    /// stop-iteration signal and propagates any other failure.
    pub async fn next_all(&self, cancel: &CancellationToken) -> Result<Vec<Value>, RpcError> {
        let mut values = Vec::new();
        loop {
            match self.next(None, cancel).await {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(RpcError::StopIteration) => return Ok(values),
                Err(err) => return Err(err),
            }
        }
    }

    fn advance_entry(&self) -> MessageEntry {
        MessageEntry::request(
            EntryType::GeneratorNext,
            self.stub.service_path(),
            self.member.as_str(),
        )
        .with_element("index", Value::Int(i64::from(self.index)))
    }

    fn signal_entry(&self, kind: ErrorKind, name: &str, text: &str) -> MessageEntry {
        let mut entry = self.advance_entry();
        entry.error = kind;
        entry.add_element("errorname", Value::Str(name.into()));
        entry.add_element("errorstring", Value::Str(text.into()));
        entry
    }
}

/// Server-side generator implementation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the next value, consuming the optional parameter. Raising
    /// [`RpcError::StopIteration`] marks clean exhaustion.
    async fn next(&self, param: Option<Value>) -> Result<Option<Value>, RpcError>;

    /// Clean close requested by the client.
    async fn close(&self) -> Result<(), RpcError>;

    /// Abort requested by the client; fail any in-progress effect.
    async fn abort(&self) -> Result<(), RpcError>;
}

/// Server-side adapter: maps advance entries onto registered generators.
///
/// Scoped to one server endpoint or service; indexes are issued on
/// registration and retired on exhaustion, close, abort, or failure.
pub struct GeneratorServer {
    inner: Mutex<GeneratorServerInner>,
}

struct GeneratorServerInner {
    next_index: i32,
    active: HashMap<i32, Arc<dyn Generator>>,
}

impl Default for GeneratorServer {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorServer {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GeneratorServerInner {
                next_index: 0,
                active: HashMap::new(),
            }),
        }
    }

    /// Register a generator and issue its index.
    pub fn register(&self, generator: Arc<dyn Generator>) -> i32 {
        let mut inner = self.inner.lock().expect("generator table lock poisoned");
        inner.next_index += 1;
        let index = inner.next_index;
        inner.active.insert(index, generator);
        index
    }

    /// Register a generator and wrap its index as a member return value.
    pub fn register_as_return(&self, member: &str, generator: Arc<dyn Generator>) -> Value {
        Value::GeneratorRef {
            member: member.to_string(),
            index: self.register(generator),
        }
    }

    /// Number of live generators.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .expect("generator table lock poisoned")
            .active
            .len()
    }

    /// Handle one advance entry and produce its response.
    ///
    /// The request's carried error selects the operation: stop-iteration
    /// invokes the generator's close, any other carried error invokes abort,
    /// no carried error invokes next and packs its result.
    pub async fn handle_entry(&self, entry: &MessageEntry) -> MessageEntry {
        let index = match entry.element("index").and_then(Value::as_int) {
            Some(index) => index as i32,
            None => {
                return entry.error_response_from(&RpcError::ProtocolError(
                    "generator advance without index".into(),
                ))
            }
        };
        let generator = {
            let inner = self.inner.lock().expect("generator table lock poisoned");
            inner.active.get(&index).cloned()
        };
        let Some(generator) = generator else {
            return entry.error_response_from(&RpcError::InvalidOperation(format!(
                "no generator with index {index}"
            )));
        };

        match entry.error {
            ErrorKind::Success => {
                let param = entry.element("parameter").cloned();
                match generator.next(param).await {
                    Ok(value) => {
                        let response = entry.response();
                        match response {
                            Ok(mut response) => {
                                if let Some(value) = value {
                                    response.add_element("return", value);
                                }
                                response
                            }
                            Err(err) => entry.error_response_from(&err),
                        }
                    }
                    Err(err) => {
                        // Any failure, including exhaustion, retires the
                        // generator.
                        self.remove(index);
                        entry.error_response_from(&err)
                    }
                }
            }
            ErrorKind::StopIteration => {
                self.remove(index);
                match generator.close().await {
                    Ok(()) => entry.error_response_from(&RpcError::StopIteration),
                    Err(err) => entry.error_response_from(&err),
                }
            }
            other => {
                debug!(index, error = ?other, "generator abort requested");
                self.remove(index);
                match generator.abort().await {
                    Ok(()) => entry.error_response_from(&RpcError::OperationAborted(
                        "generator aborted".into(),
                    )),
                    Err(err) => entry.error_response_from(&err),
                }
            }
        }
    }

    fn remove(&self, index: i32) {
        self.inner
            .lock()
            .expect("generator table lock poisoned")
            .active
            .remove(&index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Yields a fixed sequence, then stop-iteration.
    struct SequenceGenerator {
        values: Vec<i64>,
        cursor: AtomicUsize,
        closed: AtomicBool,
        aborted: AtomicBool,
    }

    impl SequenceGenerator {
        fn new(values: Vec<i64>) -> Arc<Self> {
            Arc::new(Self {
                values,
                cursor: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Generator for SequenceGenerator {
        async fn next(&self, _param: Option<Value>) -> Result<Option<Value>, RpcError> {
            let cursor = self.cursor.fetch_add(1, Ordering::SeqCst);
            match self.values.get(cursor) {
                Some(value) => Ok(Some(Value::Int(*value))),
                None => Err(RpcError::StopIteration),
            }
        }

        async fn close(&self) -> Result<(), RpcError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(&self) -> Result<(), RpcError> {
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn advance_entry(index: i32) -> MessageEntry {
        let mut entry = MessageEntry::request(EntryType::GeneratorNext, "svc", "walk");
        entry.request_id = 1;
        entry.add_element("index", Value::Int(i64::from(index)));
        entry
    }

    #[tokio::test]
    async fn test_server_next_packs_values_then_stop_iteration() {
        let server = GeneratorServer::new();
        let index = server.register(SequenceGenerator::new(vec![1, 2]));

        for expected in [1i64, 2] {
            let response = server.handle_entry(&advance_entry(index)).await;
            assert_eq!(response.error, ErrorKind::Success);
            assert_eq!(response.element("return"), Some(&Value::Int(expected)));
        }

        let response = server.handle_entry(&advance_entry(index)).await;
        assert_eq!(response.error, ErrorKind::StopIteration);
        assert_eq!(server.active_count(), 0);

        // The index is retired; further advances are invalid operations.
        let response = server.handle_entry(&advance_entry(index)).await;
        assert_eq!(response.error, ErrorKind::InvalidOperation);
    }

    #[tokio::test]
    async fn test_server_close_signal_invokes_close() {
        let server = GeneratorServer::new();
        let generator = SequenceGenerator::new(vec![1, 2, 3]);
        let index = server.register(generator.clone());

        let mut entry = advance_entry(index);
        entry.error = ErrorKind::StopIteration;
        let response = server.handle_entry(&entry).await;

        assert_eq!(response.error, ErrorKind::StopIteration);
        assert!(generator.closed.load(Ordering::SeqCst));
        assert!(!generator.aborted.load(Ordering::SeqCst));
        assert_eq!(server.active_count(), 0);
    }

    #[tokio::test]
    async fn test_server_abort_signal_invokes_abort() {
        let server = GeneratorServer::new();
        let generator = SequenceGenerator::new(vec![1]);
        let index = server.register(generator.clone());

        let mut entry = advance_entry(index);
        entry.error = ErrorKind::OperationAborted;
        let response = server.handle_entry(&entry).await;

        assert_eq!(response.error, ErrorKind::OperationAborted);
        assert!(generator.aborted.load(Ordering::SeqCst));
        assert!(!generator.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_server_missing_index_is_protocol_error() {
        let server = GeneratorServer::new();
        let mut entry = MessageEntry::request(EntryType::GeneratorNext, "svc", "walk");
        entry.request_id = 1;
        let response = server.handle_entry(&entry).await;
        assert_eq!(response.error, ErrorKind::ProtocolError);
    }

    #[test]
    fn test_from_return_rejects_non_generator_values() {
        let stub = ServiceStub::new(std::sync::Weak::new(), "svc".into(), "pkg.Foo".into());
        assert!(GeneratorClient::from_return(&stub, &Value::Int(3)).is_err());
        let handle = GeneratorClient::from_return(
            &stub,
            &Value::GeneratorRef {
                member: "walk".into(),
                index: 9,
            },
        )
        .expect("generator handle");
        assert_eq!(handle.index(), 9);
    }
}
