//! Execution contexts.
//!
//! A [`Context`] names one backend execution environment (device plus its
//! queue/state). It is a cheap, clonable handle; kernels and buffers record
//! which context they belong to and compare contexts by [`ContextId`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{DeviceLimits, DeviceSpec};

/// Process-unique context identifier.
pub type ContextId = u64;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct ContextInner {
    id: ContextId,
    backend: String,
    device: DeviceSpec,
    limits: DeviceLimits,
    /// Backend-native state (driver context, queue, ...).
    native: Option<Box<dyn Any + Send + Sync>>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context owned by the backend named `backend`.
    pub fn new(backend: impl Into<String>, device: DeviceSpec, limits: DeviceLimits) -> Self {
        Self::build(backend.into(), device, limits, None)
    }

    /// Create a context carrying backend-native state.
    pub fn with_native<T: Any + Send + Sync>(
        backend: impl Into<String>,
        device: DeviceSpec,
        limits: DeviceLimits,
        native: T,
    ) -> Self {
        Self::build(backend.into(), device, limits, Some(Box::new(native)))
    }

    fn build(
        backend: String,
        device: DeviceSpec,
        limits: DeviceLimits,
        native: Option<Box<dyn Any + Send + Sync>>,
    ) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context.id = id, context.backend = %backend, context.device = %device, "context created");
        Self { inner: Arc::new(ContextInner { id, backend, device, limits, native }) }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Name of the backend that owns this context.
    pub fn backend(&self) -> &str {
        &self.inner.backend
    }

    pub fn device(&self) -> &DeviceSpec {
        &self.inner.device
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.inner.limits
    }

    /// Backend-native state, if it has type `T`.
    pub fn native<T: Any>(&self) -> Option<&T> {
        self.inner.native.as_deref()?.downcast_ref()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend)
            .field("device", &self.inner.device)
            .finish_non_exhaustive()
    }
}
