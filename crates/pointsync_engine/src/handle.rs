//! Subscription handles.

use crate::manager::ManagerHandle;
use crate::registry::{KeySlot, Registry, Release};
use crate::state::Observed;
use pointsync_protocol::{CounterValue, EntityKey};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;
use uuid::Uuid;

/// State shared by the synchronizer and every handle it issues.
pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) manager: ManagerHandle,
}

impl Shared {
    /// Releases one subscriber and unwatches the key if it was the last.
    pub(crate) fn release(&self, slot: &KeySlot) {
        match self.registry.release(slot) {
            Release::Destroyed => self.manager.unwatch(slot.key().clone()),
            Release::Remaining(_) | Release::AlreadyGone => {}
        }
    }
}

/// One caller's interest in one key.
///
/// Reads never block. Dropping the handle unsubscribes; calling
/// [`unsubscribe`](SubscriptionHandle::unsubscribe) first is allowed and
/// further calls are no-ops.
pub struct SubscriptionHandle {
    id: Uuid,
    key: EntityKey,
    shared: Arc<Shared>,
    slot: Arc<KeySlot>,
    observed: watch::Receiver<Observed>,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        key: EntityKey,
        shared: Arc<Shared>,
        slot: Arc<KeySlot>,
        observed: watch::Receiver<Observed>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            shared,
            slot,
            observed,
            released: AtomicBool::new(false),
        }
    }

    /// Returns the handle's unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the watched key.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Returns the current value.
    pub fn read(&self) -> CounterValue {
        self.observed.borrow().value
    }

    /// Returns the current value with its timestamp.
    pub fn observed(&self) -> Observed {
        *self.observed.borrow()
    }

    /// Waits for the next value.
    ///
    /// Values arrive in strictly increasing timestamp order; intermediate
    /// values may be skipped if the caller is slow. Returns `None` once the
    /// state is destroyed (unsubscribe or teardown).
    pub async fn changed(&mut self) -> Option<Observed> {
        if self.is_released() {
            return None;
        }
        self.observed.changed().await.ok()?;
        Some(*self.observed.borrow_and_update())
    }

    /// Returns a stream of values, starting with the current one.
    pub fn updates(&self) -> WatchStream<Observed> {
        WatchStream::new(self.observed.clone())
    }

    /// Returns true if the change stream currently covers this key.
    pub fn is_stream_connected(&self) -> bool {
        !self.is_released() && self.slot.is_stream_connected()
    }

    /// Returns true until the handle is released or its state destroyed.
    pub fn is_active(&self) -> bool {
        !self.is_released() && !self.slot.is_closed()
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases this subscription. Idempotent.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(key = %self.key, id = %self.id, "unsubscribing");
        self.shared.release(&self.slot);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("observed", &*self.observed.borrow())
            .field("released", &self.is_released())
            .finish()
    }
}
