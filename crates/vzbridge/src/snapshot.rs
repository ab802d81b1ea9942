//! Save and restore of a machine's runtime state.
//!
//! A snapshot request is validated, registered under an [`OperationHandle`],
//! and submitted to the engine together with a [`SnapshotCompletion`] token.
//! The caller gets a [`PendingSnapshot`] future that resolves once the engine
//! consumes the token. Only one operation may be in flight per machine.
//!
//! Dropping a `PendingSnapshot` only stops waiting: the engine still finishes
//! the operation, the handle is released on completion, and the result is
//! discarded.

use crate::devices;
use crate::engine::{Engine, EngineError, EngineErrorCode};
use crate::error::{BridgeError, Result};
use crate::handle::{HandleRegistry, OperationHandle, OperationKind};
use crate::machine::{MachineConfiguration, MachineId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Direction of a snapshot operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Save,
    Restore,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Save => write!(f, "save"),
            SnapshotKind::Restore => write!(f, "restore"),
        }
    }
}

/// Where an operation is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Completed,
    Failed(EngineError),
}

/// One save or restore, from submission to its terminal status.
#[derive(Debug, Clone)]
pub struct SnapshotOperation {
    handle: OperationHandle,
    kind: SnapshotKind,
    path: PathBuf,
    status: SnapshotStatus,
    submitted_at: DateTime<Utc>,
}

impl SnapshotOperation {
    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> &SnapshotStatus {
        &self.status
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

/// Summary of a successfully completed operation.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub operation: String,
    pub machine_id: MachineId,
    pub kind: SnapshotKind,
    pub path: PathBuf,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct OperationSlot {
    operation: SnapshotOperation,
    reply: oneshot::Sender<Result<SnapshotReport>>,
}

struct ControllerInner {
    machine: MachineId,
    engine: Arc<dyn Engine>,
    config: Arc<MachineConfiguration>,
    support: OnceLock<std::result::Result<(), String>>,
    operations: HandleRegistry<OperationKind, OperationSlot>,
    // Lock order: `active` before `operations`.
    active: Mutex<Option<OperationHandle>>,
    finished: Mutex<Option<SnapshotOperation>>,
}

/// Serializes save/restore for one machine.
#[derive(Clone)]
pub struct SnapshotController {
    inner: Arc<ControllerInner>,
}

impl SnapshotController {
    /// Create a controller for `machine`, whose configuration is fixed for its lifetime.
    pub fn new(
        machine: MachineId,
        engine: Arc<dyn Engine>,
        config: Arc<MachineConfiguration>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                machine,
                engine,
                config,
                support: OnceLock::new(),
                operations: HandleRegistry::new(),
                active: Mutex::new(None),
                finished: Mutex::new(None),
            }),
        }
    }

    /// Check that the machine can be snapshotted, asking the engine at most once.
    pub fn ensure_supported(&self) -> Result<()> {
        let inner = &self.inner;
        let verdict = inner.support.get_or_init(|| {
            tracing::debug!(machine_id = %inner.machine, "Validating save/restore support");
            match devices::validate_save_restore_support(inner.engine.as_ref(), &inner.config) {
                Ok(()) => Ok(()),
                Err(BridgeError::UnsupportedConfiguration(reason)) => Err(reason),
                Err(other) => Err(other.to_string()),
            }
        });
        verdict
            .clone()
            .map_err(BridgeError::UnsupportedConfiguration)
    }

    /// Save machine state to `path`.
    ///
    /// # Errors
    /// `UnsupportedConfiguration` if the machine cannot be snapshotted,
    /// `OperationInProgress` if another save or restore has not finished.
    pub fn save(&self, path: impl Into<PathBuf>) -> Result<PendingSnapshot> {
        self.submit(SnapshotKind::Save, path.into())
    }

    /// Restore machine state from `path`.
    ///
    /// # Errors
    /// Same as [`save`](Self::save).
    pub fn restore(&self, path: impl Into<PathBuf>) -> Result<PendingSnapshot> {
        self.submit(SnapshotKind::Restore, path.into())
    }

    /// The operation currently in flight, if any.
    pub fn current(&self) -> Option<SnapshotOperation> {
        let active = self.inner.lock_active();
        let handle = (*active)?;
        self.inner
            .operations
            .with(handle, |slot| slot.operation.clone())
            .ok()
    }

    /// The most recent operation to finish, with its terminal status.
    pub fn last_finished(&self) -> Option<SnapshotOperation> {
        self.inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.lock_active().is_some()
    }

    fn submit(&self, kind: SnapshotKind, path: PathBuf) -> Result<PendingSnapshot> {
        self.ensure_supported()?;

        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();
        let handle = {
            let mut active = inner.lock_active();
            if let Some(current) = *active {
                let busy = inner
                    .operations
                    .with(current, |slot| {
                        (slot.operation.kind, slot.operation.path.clone())
                    })
                    .unwrap_or((kind, path.clone()));
                tracing::warn!(
                    machine_id = %inner.machine,
                    operation = %current,
                    "Rejecting {kind}: {} already in progress",
                    busy.0
                );
                return Err(BridgeError::OperationInProgress {
                    kind: busy.0,
                    path: busy.1,
                });
            }

            let handle = inner.operations.register_with(|handle| OperationSlot {
                operation: SnapshotOperation {
                    handle,
                    kind,
                    path: path.clone(),
                    status: SnapshotStatus::Pending,
                    submitted_at: Utc::now(),
                },
                reply: tx,
            });
            *active = Some(handle);
            handle
        };

        tracing::info!(
            machine_id = %inner.machine,
            operation = %handle,
            path = %path.display(),
            "Submitting {kind}"
        );

        let completion = SnapshotCompletion {
            handle,
            controller: Arc::downgrade(inner),
            done: false,
        };
        match kind {
            SnapshotKind::Save => inner
                .engine
                .save_machine_state(inner.machine, &path, completion),
            SnapshotKind::Restore => {
                inner
                    .engine
                    .restore_machine_state(inner.machine, &path, completion)
            }
        }

        Ok(PendingSnapshot {
            handle,
            kind,
            path,
            reply: rx,
        })
    }
}

impl ControllerInner {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<OperationHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, handle: OperationHandle, outcome: Option<std::result::Result<(), EngineError>>) {
        let Some(OperationSlot {
            mut operation,
            reply,
        }) = self.operations.release(handle)
        else {
            tracing::warn!(operation = %handle, "Completion for unknown snapshot operation");
            return;
        };

        let result = match outcome {
            Some(Ok(())) => {
                operation.status = SnapshotStatus::Completed;
                tracing::info!(
                    machine_id = %self.machine,
                    operation = %handle,
                    path = %operation.path.display(),
                    "{} completed",
                    operation.kind
                );
                Ok(SnapshotReport {
                    operation: handle.to_string(),
                    machine_id: self.machine,
                    kind: operation.kind,
                    path: operation.path.clone(),
                    submitted_at: operation.submitted_at,
                    finished_at: Utc::now(),
                })
            }
            Some(Err(e)) => {
                tracing::error!(
                    machine_id = %self.machine,
                    operation = %handle,
                    error = %e,
                    "{} failed",
                    operation.kind
                );
                operation.status = SnapshotStatus::Failed(e.clone());
                Err(BridgeError::SnapshotFailed(e))
            }
            None => {
                tracing::error!(
                    machine_id = %self.machine,
                    operation = %handle,
                    "Engine released {} without reporting an outcome",
                    operation.kind
                );
                operation.status = SnapshotStatus::Failed(EngineError::new(
                    EngineErrorCode::Internal,
                    "operation abandoned",
                ));
                Err(BridgeError::OperationAbandoned)
            }
        };

        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = Some(operation);
        {
            let mut active = self.lock_active();
            if *active == Some(handle) {
                *active = None;
            }
        }

        if reply.send(result).is_err() {
            tracing::debug!(operation = %handle, "No waiter left, outcome discarded");
        }
    }
}

/// Engine-side token for reporting the outcome of one operation.
///
/// Consuming it with [`complete`](Self::complete) reports the outcome exactly
/// once. Dropping it unconsumed fails the operation as abandoned. It may be
/// moved to and consumed on any thread.
pub struct SnapshotCompletion {
    handle: OperationHandle,
    controller: Weak<ControllerInner>,
    done: bool,
}

impl SnapshotCompletion {
    /// Handle of the operation this token completes.
    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    /// Report the engine's outcome.
    pub fn complete(mut self, result: std::result::Result<(), EngineError>) {
        self.done = true;
        self.deliver(Some(result));
    }

    fn deliver(&self, outcome: Option<std::result::Result<(), EngineError>>) {
        match self.controller.upgrade() {
            Some(controller) => controller.finish(self.handle, outcome),
            None => {
                tracing::debug!(operation = %self.handle, "Controller gone, dropping completion")
            }
        }
    }
}

impl Drop for SnapshotCompletion {
    fn drop(&mut self) {
        if !self.done {
            self.deliver(None);
        }
    }
}

impl fmt::Debug for SnapshotCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCompletion")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Awaitable outcome of a submitted save or restore.
///
/// Resolves exactly once. Dropping it does not cancel the operation.
#[derive(Debug)]
pub struct PendingSnapshot {
    handle: OperationHandle,
    kind: SnapshotKind,
    path: PathBuf,
    reply: oneshot::Receiver<Result<SnapshotReport>>,
}

impl PendingSnapshot {
    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Future for PendingSnapshot {
    type Output = Result<SnapshotReport>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().reply).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::OperationAbandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}
