//! Object lock and monitor protocol.
//!
//! Both primitives are plain named session operations over the transaction
//! engine; neither has dedicated wire entries. The object lock is a
//! longer-lived exclusive claim on a remote object (user- or client-scoped).
//! The monitor is a short critical section on a single remote object (it does
//! not cover sub-objects), guarded locally by a per-stub mutex so concurrent
//! local attempts on the same stub are serialized before anything reaches the
//! wire.

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RpcError;
use crate::stub::ServiceStub;

/// Scope of an object lock claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Held on behalf of the authenticated user.
    User,
    /// Held on behalf of this client connection.
    Client,
}

impl LockScope {
    fn request_op(self) -> &'static str {
        match self {
            LockScope::User => "requestobjectlock",
            LockScope::Client => "requestclientobjectlock",
        }
    }
}

/// Claim the object lock on the stub's remote object.
///
/// Returns the server-defined status string.
pub async fn lock_object(
    stub: &Arc<ServiceStub>,
    scope: LockScope,
    cancel: &CancellationToken,
) -> Result<String, RpcError> {
    stub.session_op(scope.request_op(), Vec::new(), cancel).await
}

/// Release the object lock on the stub's remote object.
///
/// Returns the server-defined status string.
pub async fn unlock_object(
    stub: &Arc<ServiceStub>,
    cancel: &CancellationToken,
) -> Result<String, RpcError> {
    stub.session_op("releaseobjectlock", Vec::new(), cancel).await
}

/// Held monitor critical section.
///
/// Bundles the stub with the owned guard of its local mutex; exists only
/// between a successful [`monitor_enter`] and its [`MonitorHandle::exit`].
/// Dropping the handle releases the local lock either way.
pub struct MonitorHandle {
    stub: Arc<ServiceStub>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MonitorHandle {
    /// The stub this monitor section is held on.
    pub fn stub(&self) -> &Arc<ServiceStub> {
        &self.stub
    }

    /// Leave the critical section.
    ///
    /// Always sends the exit operation and unconditionally releases the local
    /// lock, regardless of the server's answer.
    pub async fn exit(mut self, cancel: &CancellationToken) -> Result<String, RpcError> {
        let result = self.stub.session_op("monitorexit", Vec::new(), cancel).await;
        self.guard.take();
        result
    }
}

/// Enter the monitor on the stub's remote object.
///
/// Acquires the stub-local mutex first, then drives the enter handshake:
/// status `"OK"` succeeds; `"Continue"` repeats with the continue-enter
/// operation; anything else is a protocol error. Any failure releases the
/// local lock before propagating.
pub async fn monitor_enter(
    stub: &Arc<ServiceStub>,
    cancel: &CancellationToken,
) -> Result<MonitorHandle, RpcError> {
    let lock = stub.monitor_lock();
    let guard = tokio::select! {
        guard = lock.lock_owned() => guard,
        _ = cancel.cancelled() => return Err(RpcError::OperationCancelled),
    };

    match drive_enter(stub, cancel).await {
        Ok(()) => Ok(MonitorHandle {
            stub: stub.clone(),
            guard: Some(guard),
        }),
        Err(err) => {
            drop(guard);
            Err(err)
        }
    }
}

async fn drive_enter(stub: &Arc<ServiceStub>, cancel: &CancellationToken) -> Result<(), RpcError> {
    let mut status = stub.session_op("monitorenter", Vec::new(), cancel).await?;
    loop {
        match status.as_str() {
            "OK" => return Ok(()),
            "Continue" => {
                debug!(path = %stub.service_path(), "monitor enter continuing");
                status = stub
                    .session_op("monitorcontinueenter", Vec::new(), cancel)
                    .await?;
            }
            other => {
                return Err(RpcError::ProtocolError(format!(
                    "unexpected monitor enter status \"{other}\""
                )))
            }
        }
    }
}
