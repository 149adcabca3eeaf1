//! Handles: reference-counted capabilities to nodes.
//!
//! A [`Handle`] references a node that may live in any peer on the bus. Two
//! counts govern its lifetime, kept independent so a late duplicate of an
//! already-known handle can keep the userspace object alive after the kernel
//! view collapsed:
//!
//! - the userspace count is the strong count of the shared state; cloning a
//!   `Handle` (or attaching it to a message) takes one reference, the last
//!   drop detaches the handle from its peer's table and releases the kernel
//!   reference if it is still live
//! - the kernel link is an atomic flag; every observation of an id delivered
//!   by the kernel mints one kernel reference, and [`Handle::acquire`]
//!   collapses redundant ones with a strictly ordered test-and-release

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{BusError, Result};
use crate::multicast::GroupInner;
use crate::node::{Node, NodeShared};
use crate::notify::{NotifyFn, SubEntry, Subscription};
use crate::peer::{Peer, PeerShared};
use crate::transport::{
    is_concrete_id, HANDLE_INVALID, NODE_FLAG_ALLOCATE, NODE_FLAG_MANAGED,
};

pub(crate) struct HandleShared {
    pub(crate) peer: Weak<PeerShared>,
    pub(crate) id: AtomicU64,
    /// Whether the kernel still holds a reference on behalf of this peer.
    pub(crate) kernel_ref: AtomicBool,
    /// Back-pointer to the local node this handle refers to, if any. Weak:
    /// the node owns its owner handle, never the other way around.
    pub(crate) node: Mutex<Weak<NodeShared>>,
    /// Notification subscriptions fired on node destruction.
    pub(crate) subs: Mutex<Vec<SubEntry>>,
    /// Multicast group this handle joined, if any.
    pub(crate) group: Mutex<Weak<GroupInner>>,
}

impl HandleShared {
    pub(crate) fn new(peer: &Peer, id: u64, kernel_ref: bool) -> Arc<Self> {
        Arc::new(Self {
            peer: Arc::downgrade(peer.shared()),
            id: AtomicU64::new(id),
            kernel_ref: AtomicBool::new(kernel_ref),
            node: Mutex::new(Weak::new()),
            subs: Mutex::new(Vec::new()),
            group: Mutex::new(Weak::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        let id = self.id();
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        if id == HANDLE_INVALID {
            return;
        }
        peer.tables.lock().handles.remove(&id);
        // Release after detaching; no lock is held across the syscall.
        if self.kernel_ref.load(Ordering::Acquire) {
            trace!(id, "releasing kernel handle");
            let _ = peer.transport.release(id);
        }
    }
}

/// A capability referencing a node, possibly owned by a remote peer.
///
/// `Handle` is a cheap clone; equality is identity of the underlying
/// capability, not of the id.
#[derive(Clone)]
pub struct Handle {
    // Declared before `peer` so the shared state drops while the peer is
    // still reachable for table detach and kernel release.
    shared: Arc<HandleShared>,
    peer: Peer,
}

impl Handle {
    pub(crate) fn from_shared(peer: Peer, shared: Arc<HandleShared>) -> Self {
        Self { peer, shared }
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    /// Intern an id observed on the wire: reuse the peer's existing handle
    /// for the id, or insert a fresh one.
    ///
    /// The kernel mints one reference per observation regardless of whether
    /// the receiver already knows the id, so reusing an existing handle with
    /// a live kernel link releases the redundant reference exactly once.
    pub(crate) fn acquire(peer: &Peer, id: u64) -> Result<Self> {
        if !is_concrete_id(id) {
            return Err(BusError::invalid(format!("malformed wire id {id:#x}")));
        }
        let existing = {
            let tables = peer.shared().tables.lock();
            tables.handles.get(&id).and_then(Weak::upgrade)
        };
        if let Some(shared) = existing {
            if shared.kernel_ref.swap(true, Ordering::AcqRel) {
                trace!(id, "duplicate handle observation, dropping kernel ref");
                let _ = peer.transport().release(id);
            }
            return Ok(Self {
                peer: peer.clone(),
                shared,
            });
        }
        let shared = HandleShared::new(peer, id, true);
        peer.shared()
            .tables
            .lock()
            .handles
            .insert(id, Arc::downgrade(&shared));
        Ok(Self {
            peer: peer.clone(),
            shared,
        })
    }

    /// The kernel id, or `HANDLE_INVALID` before the first send allocates
    /// one.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    /// Whether the handle has a kernel identity yet.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.id() != HANDLE_INVALID
    }

    /// The peer holding this handle.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The local node this handle references, when it refers to a node owned
    /// by the same peer.
    #[must_use]
    pub fn node(&self) -> Option<Node> {
        self.shared
            .node
            .lock()
            .upgrade()
            .map(|shared| Node::from_shared(self.peer.clone(), shared))
    }

    /// Subscribe to the destruction of the referenced node. The returned
    /// token detaches the subscription when dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Handle) -> Result<()> + Send + Sync + 'static,
    {
        let callback: NotifyFn = Arc::new(callback);
        Subscription::attach(&self.shared, callback)
    }

    /// Materialise a handle to the same node in `dst`, allocating the source
    /// id first when this handle is still unlinked.
    pub fn transfer(&self, dst: &Peer) -> Result<Handle> {
        let src_id = self.id();
        let slot = if src_id == HANDLE_INVALID {
            NODE_FLAG_MANAGED | NODE_FLAG_ALLOCATE
        } else {
            src_id
        };
        let (src_out, dst_out) = self
            .peer
            .transport()
            .transfer(dst.transport(), slot)?;
        if src_id == HANDLE_INVALID {
            self.peer.link_allocated_handle(&self.shared, src_out)?;
        }
        Handle::acquire(dst, dst_out)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id())
            .field(
                "kernel_ref",
                &self.shared.kernel_ref.load(Ordering::Relaxed),
            )
            .finish()
    }
}
