//! Notification subscriptions: multi-listener fanout for node destruction.
//!
//! Subscriptions link into the handle they watch. When a NODE_DESTROY
//! record names the handle's id, every subscription fires; the first error
//! becomes the overall result while the remaining subscribers still run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::error::{BusError, Result};
use crate::handle::{Handle, HandleShared};
use crate::peer::Peer;

/// Callback fired when the node behind the subscribed handle is destroyed.
pub(crate) type NotifyFn = Arc<dyn Fn(&Handle) -> Result<()> + Send + Sync>;

pub(crate) struct SubEntry {
    pub(crate) token: u64,
    pub(crate) callback: NotifyFn,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A live subscription; dropping it detaches the callback.
pub struct Subscription {
    handle: Weak<HandleShared>,
    token: u64,
}

impl Subscription {
    pub(crate) fn attach(shared: &Arc<HandleShared>, callback: NotifyFn) -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        shared.subs.lock().push(SubEntry { token, callback });
        Self {
            handle: Arc::downgrade(shared),
            token,
        }
    }

    /// Whether the watched handle still exists.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.handle.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.handle.upgrade() {
            shared.subs.lock().retain(|entry| entry.token != self.token);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Fire every subscription on `shared`.
///
/// Callbacks run with no lock held, so a subscriber may detach itself or
/// manipulate the handle. All subscribers run even after a failure; the
/// first error is returned.
pub(crate) fn fire(peer: &Peer, shared: &Arc<HandleShared>) -> Result<()> {
    let callbacks: Vec<NotifyFn> = shared
        .subs
        .lock()
        .iter()
        .map(|entry| Arc::clone(&entry.callback))
        .collect();
    if callbacks.is_empty() {
        return Ok(());
    }
    let handle = Handle::from_shared(peer.clone(), Arc::clone(shared));
    let mut first: Option<BusError> = None;
    for callback in callbacks {
        if let Err(e) = callback(&handle) {
            warn!(id = handle.id(), error = %e, "destroy notification subscriber failed");
            if first.is_none() {
                first = Some(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
