//! Client-side service stubs.
//!
//! A [`ServiceStub`] is the proxy for one remote object, addressed by its
//! dotted service path. Stubs are created lazily on first object resolution
//! and destroyed when their path is released by the server or when the owning
//! context closes; a released stub fails every operation immediately.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::ClientContext;
use crate::error::RpcError;
use crate::message::{Element, EntryType, MessageEntry, Value};

/// Receiver for unsolicited event entries.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event entry addressed at this stub.
    async fn event(&self, entry: MessageEntry);
}

/// Receiver for pipe packets, packet acks, and pipe teardown.
#[async_trait]
pub trait PipeHandler: Send + Sync {
    /// Handle one pipe entry addressed at this stub.
    async fn pipe_entry(&self, entry: MessageEntry);
}

/// Receiver for wire samples and wire teardown.
#[async_trait]
pub trait WireHandler: Send + Sync {
    /// Handle one wire entry addressed at this stub.
    async fn wire_entry(&self, entry: MessageEntry);
}

/// Server-to-client callback implementation.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// Execute the callback member and produce its return value.
    async fn call(&self, member: &str, entry: &MessageEntry) -> Result<Value, RpcError>;
}

/// Client-side proxy for one remote service object.
pub struct ServiceStub {
    service_path: String,
    object_type: String,
    context: Mutex<Option<Weak<ClientContext>>>,
    monitor_lock: Arc<tokio::sync::Mutex<()>>,
    event_handler: Mutex<Option<Arc<dyn EventHandler>>>,
    pipe_handler: Mutex<Option<Arc<dyn PipeHandler>>>,
    wire_handler: Mutex<Option<Arc<dyn WireHandler>>>,
    callback_handler: Mutex<Option<Arc<dyn CallbackHandler>>>,
}

impl ServiceStub {
    pub(crate) fn new(
        context: Weak<ClientContext>,
        service_path: String,
        object_type: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_path,
            object_type,
            context: Mutex::new(Some(context)),
            monitor_lock: Arc::new(tokio::sync::Mutex::new(())),
            event_handler: Mutex::new(None),
            pipe_handler: Mutex::new(None),
            wire_handler: Mutex::new(None),
            callback_handler: Mutex::new(None),
        })
    }

    /// Dotted service path this stub is addressed by.
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Fully qualified type name of the remote object.
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Whether this stub's path has been torn down.
    pub fn is_released(&self) -> bool {
        self.context
            .lock()
            .expect("stub context lock poisoned")
            .is_none()
    }

    /// Drop the back-reference to the owning context.
    pub(crate) fn release(&self) {
        self.context
            .lock()
            .expect("stub context lock poisoned")
            .take();
    }

    /// The owning context; fails synchronously once the stub is released.
    pub fn context(&self) -> Result<Arc<ClientContext>, RpcError> {
        self.context
            .lock()
            .expect("stub context lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                RpcError::InvalidOperation(format!(
                    "stub \"{}\" has been released",
                    self.service_path
                ))
            })
    }

    /// Stub-local mutual exclusion used by the monitor protocol.
    pub(crate) fn monitor_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.monitor_lock.clone()
    }

    /// Install the event handler.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.event_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    /// Install the pipe handler.
    pub fn set_pipe_handler(&self, handler: Arc<dyn PipeHandler>) {
        *self.pipe_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    /// Install the wire handler.
    pub fn set_wire_handler(&self, handler: Arc<dyn WireHandler>) {
        *self.wire_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    /// Install the callback handler.
    pub fn set_callback_handler(&self, handler: Arc<dyn CallbackHandler>) {
        *self.callback_handler.lock().expect("handler lock poisoned") = Some(handler);
    }

    pub(crate) fn event_handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.event_handler
            .lock()
            .expect("handler lock poisoned")
            .clone()
    }

    pub(crate) fn pipe_handler(&self) -> Option<Arc<dyn PipeHandler>> {
        self.pipe_handler
            .lock()
            .expect("handler lock poisoned")
            .clone()
    }

    pub(crate) fn wire_handler(&self) -> Option<Arc<dyn WireHandler>> {
        self.wire_handler
            .lock()
            .expect("handler lock poisoned")
            .clone()
    }

    pub(crate) fn callback_handler(&self) -> Option<Arc<dyn CallbackHandler>> {
        self.callback_handler
            .lock()
            .expect("handler lock poisoned")
            .clone()
    }

    /// Read a property member.
    pub async fn property_get(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let context = self.context()?;
        let entry = MessageEntry::request(EntryType::PropertyGet, self.service_path.as_str(), name);
        let response = context.process_request(entry, cancel).await?;
        Ok(response.element("value").cloned().unwrap_or(Value::Void))
    }

    /// Write a property member.
    pub async fn property_set(
        &self,
        name: &str,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError> {
        let context = self.context()?;
        let entry = MessageEntry::request(EntryType::PropertySet, self.service_path.as_str(), name)
            .with_element("value", value);
        context.process_request(entry, cancel).await?;
        Ok(())
    }

    /// Invoke a function member with named arguments.
    pub async fn function_call(
        &self,
        name: &str,
        args: Vec<Element>,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let context = self.context()?;
        let mut entry =
            MessageEntry::request(EntryType::FunctionCall, self.service_path.as_str(), name);
        entry.elements = args;
        let response = context.process_request(entry, cancel).await?;
        Ok(response.element("return").cloned().unwrap_or(Value::Void))
    }

    /// Send a named session operation addressed at this stub and return the
    /// server-defined status string.
    pub async fn session_op(
        &self,
        op: &str,
        elements: Vec<Element>,
        cancel: &CancellationToken,
    ) -> Result<String, RpcError> {
        let context = self.context()?;
        context
            .session_op(self.service_path.as_str(), op, elements, cancel)
            .await
    }

    /// Resolve the stub for a sub-object of this one.
    pub async fn get_object(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServiceStub>, RpcError> {
        let context = self.context()?;
        let path = format!("{}.{}", self.service_path, name);
        context.object_stub(&path, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_stub_fails_synchronously() {
        let stub = ServiceStub::new(Weak::new(), "svc".into(), "pkg.Foo".into());
        // A dangling weak reference behaves like a released stub.
        assert!(matches!(
            stub.context(),
            Err(RpcError::InvalidOperation(_))
        ));

        stub.release();
        assert!(stub.is_released());
    }

    #[test]
    fn test_handler_registration() {
        struct NullEvents;
        #[async_trait]
        impl EventHandler for NullEvents {
            async fn event(&self, _entry: MessageEntry) {}
        }

        let stub = ServiceStub::new(Weak::new(), "svc".into(), "pkg.Foo".into());
        assert!(stub.event_handler().is_none());
        stub.set_event_handler(Arc::new(NullEvents));
        assert!(stub.event_handler().is_some());
    }
}
