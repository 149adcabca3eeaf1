//! Nodes: locally owned addressable objects.
//!
//! A node is created unlinked, receives its kernel id on the first send that
//! carries its owner handle, becomes live once a received message addresses
//! it, and ends destroyed — explicitly, or when the last `Node` reference
//! drops and the wrapper frees it.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{BusError, Result};
use crate::handle::{Handle, HandleShared};
use crate::interface::Interface;
use crate::peer::{Peer, PeerShared};
use crate::reply::ReplyState;
use crate::transport::HANDLE_INVALID;

/// Lifecycle states of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// No kernel id yet; unknown to the kernel.
    Unlinked = 0,
    /// Id allocated and linked into the peer's node table.
    Linked = 1,
    /// At least one received message has addressed the node.
    Live = 2,
    /// Destroyed in the kernel.
    Destroyed = 3,
}

impl NodeState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Linked,
            2 => Self::Live,
            3 => Self::Destroyed,
            _ => Self::Unlinked,
        }
    }
}

/// Callback fired when all foreign references to the node were released.
pub(crate) type ReleaseFn = Box<dyn FnOnce(&Node) -> Result<()> + Send>;

pub(crate) struct NodeShared {
    pub(crate) peer: Weak<PeerShared>,
    pub(crate) id: AtomicU64,
    state: AtomicU8,
    pub(crate) name: Mutex<Option<String>>,
    /// Owner handle, exclusively owned by the node until released.
    pub(crate) owner: Mutex<Option<Arc<HandleShared>>>,
    pub(crate) user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    pub(crate) interfaces: Mutex<BTreeMap<String, Interface>>,
    /// Present when this node exists to receive a reply.
    pub(crate) reply: Mutex<Option<ReplyState>>,
    pub(crate) destroy_fn: Mutex<Option<ReleaseFn>>,
}

impl NodeShared {
    /// Reconstruct a named root node around a handle received in a seed.
    /// The node carries the handle's id but stays out of the id table until
    /// it is adopted.
    pub(crate) fn for_root(
        peer: &Peer,
        owner: Arc<HandleShared>,
        name: &str,
    ) -> Arc<Self> {
        let id = owner.id();
        let shared = Arc::new(Self {
            peer: Arc::downgrade(peer.shared()),
            id: AtomicU64::new(id),
            state: AtomicU8::new(NodeState::Linked as u8),
            name: Mutex::new(Some(name.to_string())),
            owner: Mutex::new(Some(Arc::clone(&owner))),
            user_data: Mutex::new(None),
            interfaces: Mutex::new(BTreeMap::new()),
            reply: Mutex::new(None),
            destroy_fn: Mutex::new(None),
        });
        *owner.node.lock() = Arc::downgrade(&shared);
        shared
    }

    pub(crate) fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn mark_linked(&self) {
        let _ = self.state.compare_exchange(
            NodeState::Unlinked as u8,
            NodeState::Linked as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn mark_live(&self) {
        let _ = self.state.compare_exchange(
            NodeState::Linked as u8,
            NodeState::Live as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn mark_destroyed(&self) -> NodeState {
        NodeState::from_raw(self.state.swap(NodeState::Destroyed as u8, Ordering::AcqRel))
    }

    /// Destroy the node in the kernel and unlink it from the peer tables.
    /// Idempotent; handle drops triggered here run without any lock held.
    pub(crate) fn destroy_in(self: &Arc<Self>, peer: &Arc<PeerShared>) -> Result<()> {
        let previous = self.mark_destroyed();
        if previous == NodeState::Destroyed {
            return Ok(());
        }
        let id = self.id();
        let name = self.name.lock().clone();
        let unlinked_root = {
            let mut tables = peer.tables.lock();
            if id != HANDLE_INVALID {
                tables.nodes.remove(&id);
            }
            name.and_then(|n| {
                let ours = tables
                    .root_nodes
                    .get(&n)
                    .is_some_and(|existing| Arc::ptr_eq(existing, self));
                if ours {
                    tables.root_nodes.remove(&n)
                } else {
                    None
                }
            })
        };
        drop(unlinked_root);
        if id != HANDLE_INVALID {
            trace!(id, "destroying node");
            peer.transport.destroy(&[id])?;
        }
        Ok(())
    }
}

impl Drop for NodeShared {
    fn drop(&mut self) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        // Free semantics: release the owner handle, then destroy.
        let owner = self.owner.get_mut().take();
        drop(owner);
        let id = self.id();
        if self.state() != NodeState::Destroyed && id != HANDLE_INVALID {
            peer.tables.lock().nodes.remove(&id);
            let _ = peer.transport.destroy(&[id]);
        }
    }
}

/// A locally owned addressable object, paired with its owner handle.
///
/// `Node` is a shared reference; dropping the last one frees the node
/// (releases the owner handle and destroys the kernel object).
#[derive(Clone)]
pub struct Node {
    // Declared before `peer` so the shared state drops while the peer is
    // still reachable for unlink and kernel destroy.
    shared: Arc<NodeShared>,
    peer: Peer,
}

impl Node {
    /// Allocate a fresh node with an owner handle back-linked to it. The
    /// node stays unknown to the kernel until a send carries the handle.
    pub fn new(peer: &Peer) -> Self {
        let shared = Arc::new(NodeShared {
            peer: Arc::downgrade(peer.shared()),
            id: AtomicU64::new(HANDLE_INVALID),
            state: AtomicU8::new(NodeState::Unlinked as u8),
            name: Mutex::new(None),
            owner: Mutex::new(None),
            user_data: Mutex::new(None),
            interfaces: Mutex::new(BTreeMap::new()),
            reply: Mutex::new(None),
            destroy_fn: Mutex::new(None),
        });
        let owner = HandleShared::new(peer, HANDLE_INVALID, false);
        *owner.node.lock() = Arc::downgrade(&shared);
        *shared.owner.lock() = Some(owner);
        Self {
            peer: peer.clone(),
            shared,
        }
    }

    pub(crate) fn from_shared(peer: Peer, shared: Arc<NodeShared>) -> Self {
        Self { peer, shared }
    }

    pub(crate) fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }

    /// The kernel id, or `HANDLE_INVALID` while unlinked.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.shared.state()
    }

    /// Whether a received message has addressed this node.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.shared.state() == NodeState::Live
    }

    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The root name, for nodes reconstructed from a seed.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.shared.name.lock().clone()
    }

    /// The owner handle, `None` after [`Node::release`].
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.shared
            .owner
            .lock()
            .clone()
            .map(|shared| Handle::from_shared(self.peer.clone(), shared))
    }

    pub fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.shared.user_data.lock() = Some(data);
    }

    #[must_use]
    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.user_data.lock().clone()
    }

    /// Install the callback fired when all foreign references to this node
    /// were released.
    pub fn set_destroy_fn<F>(&self, callback: F)
    where
        F: FnOnce(&Node) -> Result<()> + Send + 'static,
    {
        *self.shared.destroy_fn.lock() = Some(Box::new(callback));
    }

    /// Attach an interface, enabling call dispatch through it.
    ///
    /// Fails busy once the node is live or carries a reply slot, and
    /// duplicate if the interface name is already implemented. Latches the
    /// interface against further mutation.
    pub fn implement(&self, interface: &Interface) -> Result<()> {
        if self.shared.state() == NodeState::Live {
            return Err(BusError::busy("node is already live"));
        }
        if self.shared.reply.lock().is_some() {
            return Err(BusError::busy("node is a reply slot"));
        }
        let mut interfaces = self.shared.interfaces.lock();
        let name = interface.name().to_string();
        if interfaces.contains_key(&name) {
            return Err(BusError::duplicate(format!(
                "interface '{name}' already implemented on this node"
            )));
        }
        interface.latch();
        interfaces.insert(name, interface.clone());
        Ok(())
    }

    /// Drop the owner handle. No further outbound handles to this node can
    /// be minted by this peer; the kernel object persists until the last
    /// foreign handle is released.
    pub fn release(&self) {
        let owner = self.shared.owner.lock().take();
        drop(owner);
    }

    /// Synchronously destroy the node in the kernel. Remaining foreign
    /// handles observe NODE_DESTROY on their peers.
    pub fn destroy(&self) -> Result<()> {
        let Some(peer) = self.shared.peer.upgrade() else {
            return Ok(());
        };
        self.shared.destroy_in(&peer)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
