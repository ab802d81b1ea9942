//! Connection events for network-backed storage attachments.
//!
//! The engine reports connection and error notifications for each network
//! block attachment by handle, on threads the host does not control. The
//! [`AttachmentBridge`] is the only entry point for those calls: it resolves
//! the handle, advances a small per-attachment state machine, and forwards
//! the resulting [`AttachmentEvent`] to the host through an unbounded channel.
//!
//! ```text
//! Unconnected ──▶ Connected ──▶ Errored
//!      └──────────────────────────▲
//! ```
//!
//! `Errored` is terminal: the channel is closed after the error is delivered.

use crate::engine::EngineError;
use crate::handle::{AttachmentHandle, AttachmentKind, HandleRegistry};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A notification about one attachment's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentEvent {
    /// The attachment connected to its server.
    Connected,
    /// The attachment failed. No further events follow.
    EncounteredError(EngineError),
}

/// Per-attachment connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

struct AttachmentContext {
    state: ConnectionState,
    events: Option<mpsc::UnboundedSender<AttachmentEvent>>,
}

impl AttachmentContext {
    fn deliver(&self, event: AttachmentEvent) -> bool {
        self.events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

/// What happened to a notification once it reached the bridge.
enum Disposition {
    Delivered,
    Undeliverable,
    Duplicate(ConnectionState),
}

/// Routes engine notifications to the host, keyed by attachment handle.
///
/// Cloning shares the same registry. One bridge is created per machine
/// session and shut down when the machine is destroyed.
#[derive(Clone, Default)]
pub struct AttachmentBridge {
    registry: Arc<HandleRegistry<AttachmentKind, AttachmentContext>>,
}

impl AttachmentBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a new attachment's events.
    pub fn register(&self) -> (AttachmentHandle, AttachmentEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.registry.register(AttachmentContext {
            state: ConnectionState::Unconnected,
            events: Some(tx),
        });
        tracing::debug!(%handle, "Attachment registered");
        (handle, AttachmentEvents { handle, events: rx })
    }

    /// The engine established the attachment's connection.
    ///
    /// Only the first connection is delivered; repeats and notifications after
    /// an error are dropped.
    pub fn on_connected(&self, handle: AttachmentHandle) {
        let disposition = self.registry.with(handle, |ctx| match ctx.state {
            ConnectionState::Unconnected => {
                ctx.state = ConnectionState::Connected;
                if ctx.deliver(AttachmentEvent::Connected) {
                    Disposition::Delivered
                } else {
                    Disposition::Undeliverable
                }
            }
            state => Disposition::Duplicate(state),
        });

        match disposition {
            Ok(Disposition::Delivered) => tracing::info!(%handle, "Attachment connected"),
            Ok(Disposition::Undeliverable) => {
                tracing::debug!(%handle, "Attachment connected, no receiver")
            }
            Ok(Disposition::Duplicate(state)) => {
                tracing::warn!(%handle, %state, "Ignoring connect notification")
            }
            Err(_) => tracing::debug!(%handle, "Connect notification for released attachment"),
        }
    }

    /// The engine hit an unrecoverable error on the attachment.
    pub fn on_error(&self, handle: AttachmentHandle, error: EngineError) {
        let disposition = self.registry.with(handle, |ctx| {
            if ctx.state == ConnectionState::Errored {
                return Disposition::Duplicate(ctx.state);
            }
            ctx.state = ConnectionState::Errored;
            let delivered = ctx.deliver(AttachmentEvent::EncounteredError(error.clone()));
            ctx.events = None;
            if delivered {
                Disposition::Delivered
            } else {
                Disposition::Undeliverable
            }
        });

        match disposition {
            Ok(Disposition::Delivered) => {
                tracing::warn!(%handle, error = %error, "Attachment encountered error")
            }
            Ok(Disposition::Undeliverable) => {
                tracing::debug!(%handle, error = %error, "Attachment error, no receiver")
            }
            Ok(Disposition::Duplicate(_)) => {
                tracing::warn!(%handle, error = %error, "Ignoring error after terminal error")
            }
            Err(_) => tracing::debug!(%handle, "Error notification for released attachment"),
        }
    }

    /// Current state of an attachment, or `None` once released.
    pub fn state(&self, handle: AttachmentHandle) -> Option<ConnectionState> {
        self.registry.with(handle, |ctx| ctx.state).ok()
    }

    /// Stop routing events for `handle`. Safe to call more than once.
    pub fn release(&self, handle: AttachmentHandle) {
        if self.registry.release(handle).is_some() {
            tracing::debug!(%handle, "Attachment released");
        }
    }

    /// Release every attachment, e.g. when the machine is torn down.
    pub fn shutdown(&self) {
        let released = self.registry.drain().len();
        tracing::debug!(released, "Attachment bridge shut down");
    }

    /// Number of attachments still routed.
    pub fn live_attachments(&self) -> usize {
        self.registry.len()
    }

    /// Tie `handle` to the returned lease: dropping it releases the handle.
    pub(crate) fn lease(&self, handle: AttachmentHandle) -> AttachmentLease {
        AttachmentLease {
            handle,
            registry: Arc::downgrade(&self.registry),
        }
    }
}

/// Releases an attachment handle when the attachment owning it goes away.
pub(crate) struct AttachmentLease {
    handle: AttachmentHandle,
    registry: Weak<HandleRegistry<AttachmentKind, AttachmentContext>>,
}

impl AttachmentLease {
    pub(crate) fn handle(&self) -> AttachmentHandle {
        self.handle
    }
}

impl Drop for AttachmentLease {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if registry.release(self.handle).is_some() {
            tracing::debug!(handle = %self.handle, "Attachment dropped, handle released");
        }
    }
}

impl fmt::Debug for AttachmentLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttachmentLease").field(&self.handle).finish()
    }
}

impl fmt::Debug for AttachmentBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentBridge")
            .field("live_attachments", &self.live_attachments())
            .finish()
    }
}

/// Host-side receiver of one attachment's events.
///
/// Ends after `EncounteredError` or once the attachment is released.
#[derive(Debug)]
pub struct AttachmentEvents {
    handle: AttachmentHandle,
    events: mpsc::UnboundedReceiver<AttachmentEvent>,
}

impl AttachmentEvents {
    /// Handle of the attachment these events belong to.
    pub fn handle(&self) -> AttachmentHandle {
        self.handle
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<AttachmentEvent> {
        self.events.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<AttachmentEvent> {
        self.events.try_recv().ok()
    }
}

impl Stream for AttachmentEvents {
    type Item = AttachmentEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}
