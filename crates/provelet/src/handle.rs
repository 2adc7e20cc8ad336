//! Phantom-typed handles over stored engine objects.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;

use crate::bridge::protocol::ObjectId;
use crate::convert::Converter;
use crate::error::BridgeError;
use crate::session::{PendingId, Session};

/// Driver-side view of a remote object.
///
/// `A` is a phantom description of the value's engine-side shape. It is
/// advisory: the library cannot check it against the store, so the raw
/// constructors are `unsafe` and all checked construction flows through a
/// [`Converter`]. Retrieving through a mismatched `A` yields engine or
/// conversion errors at best.
///
/// Handles are cheap to clone; clones share one id resolution and one
/// disposal. When the last clone is dropped, the resolved id is scheduled
/// for batched removal. A handle whose producing request failed never
/// schedules anything.
pub struct Handle<A> {
    inner: Arc<HandleInner>,
    _shape: PhantomData<fn() -> A>,
}

struct HandleInner {
    session: Session,
    id: PendingId,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        match self.id.peek() {
            Some(Ok(id)) => self.session.defer_remove(*id),
            Some(Err(_)) => {}
            None => {
                // Dropped before the id resolved (a detached request). The
                // object must still be reclaimed once the reply lands.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let session = self.session.clone();
                    let pending = self.id.clone();
                    runtime.spawn(async move {
                        if let Ok(id) = pending.await {
                            tracing::trace!(%id, "scheduling removal for detached handle");
                            session.defer_remove(id);
                        }
                    });
                } else {
                    tracing::warn!(
                        "handle dropped with unresolved id outside a runtime; \
                         the remote object may outlive it"
                    );
                }
            }
        }
    }
}

/// Type-erased keep-alive for a handle.
///
/// A queued request that embeds a handle's id holds its guard until the
/// frame is on the wire. That keeps the drop-scheduled removal from being
/// flushed ahead of a request that still references the id: an id can only
/// enter the pending-removal buffer once every frame embedding it has been
/// written, and the writer emits frames in order.
pub(crate) struct HandleGuard {
    _inner: Arc<HandleInner>,
}

impl<A> Handle<A> {
    pub(crate) fn from_pending(session: Session, id: PendingId) -> Self {
        Handle {
            inner: Arc::new(HandleInner { session, id }),
            _shape: PhantomData,
        }
    }

    pub(crate) fn guard(&self) -> HandleGuard {
        HandleGuard {
            _inner: Arc::clone(&self.inner),
        }
    }

    /// Wrap a known id.
    ///
    /// # Safety
    ///
    /// The caller asserts that `id` names a live store entry whose shape is
    /// described by `A`. Nothing is verified; a wrong claim surfaces as
    /// undefined retrieval behavior. The new handle participates in
    /// disposal like any other: when it is dropped, `id` is scheduled for
    /// removal.
    pub unsafe fn from_raw_parts(session: &Session, id: ObjectId) -> Self {
        let pending: PendingId = futures::future::ready(Ok(id)).boxed().shared();
        Handle::from_pending(session.clone(), pending)
    }

    /// Re-present this handle under a different shape.
    ///
    /// # Safety
    ///
    /// Same contract as [`Handle::from_raw_parts`]: `B` must describe the
    /// stored value. The result shares id state with `self`, so disposal
    /// still happens exactly once.
    pub unsafe fn coerce<B>(&self) -> Handle<B> {
        self.retype()
    }

    /// Internal retype for cases where the shape equality is known.
    pub(crate) fn retype<B>(&self) -> Handle<B> {
        Handle {
            inner: Arc::clone(&self.inner),
            _shape: PhantomData,
        }
    }

    /// The id of the remote object, once the producing request completes.
    /// Immutable after first resolution; every await observes the same
    /// outcome.
    pub async fn id(&self) -> Result<ObjectId, BridgeError> {
        self.inner.id.clone().await
    }

    /// The session this handle lives on.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }
}

impl<A: Converter> Handle<A> {
    /// Fetch the value back from the engine.
    pub async fn retrieve(&self) -> Result<A, BridgeError> {
        A::retrieve(self).await
    }

    /// Blocking [`Handle::retrieve`], for synchronous callers.
    ///
    /// Inside a runtime this requires the multi-thread flavor (the task is
    /// parked via `block_in_place`); outside a runtime it drives the future
    /// on the current thread.
    pub fn retrieve_now(&self) -> Result<A, BridgeError> {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => tokio::task::block_in_place(|| runtime.block_on(self.retrieve())),
            Err(_) => futures::executor::block_on(self.retrieve()),
        }
    }
}

impl<A> Clone for Handle<A> {
    fn clone(&self) -> Self {
        Handle {
            inner: Arc::clone(&self.inner),
            _shape: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Handle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.id.peek() {
            Some(Ok(id)) => write!(f, "Handle({id})"),
            Some(Err(e)) => write!(f, "Handle(<failed: {e}>)"),
            None => write!(f, "Handle(<pending>)"),
        }
    }
}
