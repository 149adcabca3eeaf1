//! Peers: process-local endpoints owning the capability tables.
//!
//! A [`Peer`] wraps the kernel endpoint plus three ordered tables: nodes by
//! id, handles by id, and unclaimed named root nodes. Nodes and handles keep
//! their peer alive through the public wrappers; the tables themselves hold
//! weak entries (strong for unclaimed roots), so the last wrapper drop
//! detaches cleanly and the last `Peer` drop closes the endpoint.
//!
//! Table access is internally serialized, but a peer remains a cooperative
//! single-threaded object: callers must not interleave operations on one
//! peer from several threads and expect cross-call ordering. No lock is ever
//! held across a transport call.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::dispatch;
use crate::error::{BusError, Result};
use crate::handle::{Handle, HandleShared};
use crate::interface::Interface;
use crate::message::{Message, MessageKind};
use crate::node::{Node, NodeShared};
use crate::options::PeerOptions;
use crate::transport::loopback;
use crate::transport::{Received, Transport, HANDLE_INVALID};

pub(crate) struct PeerTables {
    pub(crate) nodes: BTreeMap<u64, Weak<NodeShared>>,
    pub(crate) handles: BTreeMap<u64, Weak<HandleShared>>,
    pub(crate) root_nodes: BTreeMap<String, Arc<NodeShared>>,
}

impl PeerTables {
    fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            handles: BTreeMap::new(),
            root_nodes: BTreeMap::new(),
        }
    }
}

fn entry_live<T>(map: &BTreeMap<u64, Weak<T>>, id: u64) -> bool {
    map.get(&id).map_or(false, |w| w.strong_count() > 0)
}

pub(crate) struct PeerShared {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) tables: Mutex<PeerTables>,
}

impl Drop for PeerShared {
    fn drop(&mut self) {
        // Unclaimed roots go first; their shared state only weakly references
        // the peer, so they can outlive every public wrapper.
        let roots = std::mem::take(&mut self.tables.get_mut().root_nodes);
        drop(roots);
        #[cfg(debug_assertions)]
        {
            let tables = self.tables.get_mut();
            debug_assert!(
                tables.nodes.values().all(|w| w.strong_count() == 0),
                "peer dropped with live nodes"
            );
            debug_assert!(
                tables.handles.values().all(|w| w.strong_count() == 0),
                "peer dropped with live handles"
            );
        }
    }
}

/// A process-local endpoint on the bus; root of all lifetimes.
///
/// Cloning is cheap and shares the endpoint. Dropping the last clone closes
/// the endpoint, which releases every kernel reference the peer still held.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Open a fresh endpoint on the default bus.
    pub fn open() -> Result<Self> {
        Self::open_with(&PeerOptions::default())
    }

    /// Open a fresh endpoint on the bus registered at `path`.
    pub fn open_at(path: &str) -> Result<Self> {
        Self::open_with(&PeerOptions::default().with_path(path))
    }

    /// Open a fresh endpoint with explicit options.
    pub fn open_with(options: &PeerOptions) -> Result<Self> {
        let transport = loopback::open(
            options.path(),
            options.pool_size(),
            options.queue_capacity(),
        )?;
        Ok(Self::from_transport(transport))
    }

    /// Wrap an endpoint already opened in this process, looked up by fd.
    /// The adopted peer shares the endpoint with the original.
    pub fn adopt(fd: RawFd) -> Result<Self> {
        let transport = loopback::adopt_fd(fd)?;
        Ok(Self::from_transport(transport))
    }

    pub(crate) fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(PeerShared {
                transport,
                tables: Mutex::new(PeerTables::new()),
            }),
        }
    }

    /// Adopt the peer named by the `BUS1_PEER_FD` environment variable.
    pub fn from_environment() -> Result<Self> {
        crate::env::from_environment()
    }

    /// Publish this peer's fd through `BUS1_PEER_FD`.
    pub fn export_to_environment(&self) -> Result<()> {
        crate::env::export_to_environment(self)
    }

    pub(crate) fn shared(&self) -> &Arc<PeerShared> {
        &self.shared
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.shared.transport
    }

    /// The underlying endpoint file descriptor, for poll/epoll integration.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.shared.transport.raw_fd()
    }

    /// Create a child peer connected to this one through a fresh root node.
    ///
    /// Returns the child peer, the child's root node (linked into the
    /// child), and this peer's handle to that node (linked into this peer).
    pub fn clone_peer(&self) -> Result<(Peer, Node, Handle)> {
        let cloned = self.shared.transport.clone_endpoint()?;
        let child = Peer::from_transport(cloned.transport);
        let handle = self.adopt_linked_handle(cloned.root_id)?;
        let node = child.adopt_linked_node(cloned.root_id)?;
        debug!(root = cloned.root_id, "peer cloned");
        Ok((child, node, handle))
    }

    /// Drain one message from the kernel queue.
    ///
    /// Returns `None` when the queue is empty; surfaces a stale error when
    /// the kernel reports dropped messages.
    pub fn recv(&self) -> Result<Option<Message>> {
        match self.shared.transport.recv(false)? {
            None => Ok(None),
            Some(Received::Dropped(n)) => {
                warn!(dropped = n, "kernel queue dropped messages");
                Err(BusError::stale(format!(
                    "{n} messages dropped on pool exhaustion"
                )))
            }
            Some(Received::NodeDestroy(id)) => {
                Message::notification(self, MessageKind::NodeDestroy, id).map(Some)
            }
            Some(Received::NodeRelease(id)) => {
                Message::notification(self, MessageKind::NodeRelease, id).map(Some)
            }
            Some(Received::Slice {
                slice,
                payload_len,
                n_handles,
                destination,
                creds,
                fds,
            }) => Message::from_slice(self, slice, payload_len, n_handles, destination, creds, fds)
                .map(Some),
        }
    }

    /// Drain the seed message and rebuild the named-root table from it.
    pub fn get_seed(&self) -> Result<()> {
        match self.shared.transport.recv(true)? {
            None => Err(BusError::not_found("no seed pending")),
            Some(Received::Slice {
                slice,
                payload_len,
                n_handles,
                destination,
                creds,
                fds,
            }) => {
                let msg = Message::from_slice(
                    self,
                    slice,
                    payload_len,
                    n_handles,
                    destination,
                    creds,
                    fds,
                )?;
                if msg.kind() != MessageKind::Seed {
                    return Err(BusError::invalid("seed slot held a non-seed message"));
                }
                dispatch::dispatch_seed(self, &msg)
            }
            Some(_) => Err(BusError::invalid("seed slot delivered a notification")),
        }
    }

    /// Route a received message to its node, reply slot or subscription.
    ///
    /// Consumes CALL/REPLY/ERROR/SEED and the notification kinds; messages
    /// with no dispatch surface (DATA) are handed back.
    pub fn dispatch(&self, msg: Message) -> Result<Option<Message>> {
        dispatch::dispatch(self, msg)
    }

    /// Drain the queue, dispatching every message. Messages dispatch hands
    /// back (DATA) are collected in queue order.
    pub fn process(&self) -> Result<Vec<Message>> {
        let mut unconsumed = Vec::new();
        while let Some(msg) = self.recv()? {
            if let Some(back) = dispatch::dispatch(self, msg)? {
                unconsumed.push(back);
            }
        }
        Ok(unconsumed)
    }

    /// Adopt the unclaimed root node named after `interface`, attaching the
    /// interface and handing the node to the caller.
    pub fn implement(&self, interface: &Interface) -> Result<Node> {
        let name = interface.name().to_string();
        let shared = {
            let tables = self.shared.tables.lock();
            tables.root_nodes.get(&name).cloned()
        }
        .ok_or_else(|| BusError::not_found(format!("no unclaimed root '{name}'")))?;
        let node = Node::from_shared(self.clone(), Arc::clone(&shared));
        node.implement(interface)?;
        {
            let mut tables = self.shared.tables.lock();
            tables.root_nodes.remove(&name);
            let id = shared.id();
            if id != HANDLE_INVALID {
                tables.nodes.insert(id, Arc::downgrade(&shared));
            }
        }
        Ok(node)
    }

    /// Whether an unclaimed root with this name is present.
    #[must_use]
    pub fn has_root(&self, name: &str) -> bool {
        self.shared.tables.lock().root_nodes.contains_key(name)
    }

    /// Names of the unclaimed roots, in order.
    #[must_use]
    pub fn root_names(&self) -> Vec<String> {
        self.shared.tables.lock().root_nodes.keys().cloned().collect()
    }

    pub(crate) fn lookup_node(&self, id: u64) -> Option<Arc<NodeShared>> {
        self.shared
            .tables
            .lock()
            .nodes
            .get(&id)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn lookup_handle(&self, id: u64) -> Option<Arc<HandleShared>> {
        self.shared
            .tables
            .lock()
            .handles
            .get(&id)
            .and_then(Weak::upgrade)
    }

    /// Link a freshly observed handle id for this peer (clone path). Errors
    /// duplicate on a pre-existing id.
    pub(crate) fn adopt_linked_handle(&self, id: u64) -> Result<Handle> {
        let shared = HandleShared::new(self, HANDLE_INVALID, false);
        {
            let mut tables = self.shared.tables.lock();
            if entry_live(&tables.handles, id) {
                return Err(BusError::duplicate(format!("pre-existing handle id {id}")));
            }
            shared
                .id
                .store(id, std::sync::atomic::Ordering::Release);
            shared
                .kernel_ref
                .store(true, std::sync::atomic::Ordering::Release);
            tables.handles.insert(id, Arc::downgrade(&shared));
        }
        Ok(Handle::from_shared(self.clone(), shared))
    }

    /// Build a node already known to the kernel (clone path) and link both
    /// the node and its owner handle.
    pub(crate) fn adopt_linked_node(&self, id: u64) -> Result<Node> {
        let node = Node::new(self);
        let owner = node
            .shared()
            .owner
            .lock()
            .clone()
            .expect("fresh node has an owner handle");
        {
            let mut tables = self.shared.tables.lock();
            if entry_live(&tables.handles, id) || entry_live(&tables.nodes, id) {
                return Err(BusError::duplicate(format!("pre-existing id {id}")));
            }
            owner.id.store(id, std::sync::atomic::Ordering::Release);
            owner
                .kernel_ref
                .store(true, std::sync::atomic::Ordering::Release);
            node.shared().id.store(id, std::sync::atomic::Ordering::Release);
            node.shared().mark_linked();
            tables.handles.insert(id, Arc::downgrade(&owner));
            tables.nodes.insert(id, Arc::downgrade(node.shared()));
        }
        Ok(node)
    }

    /// Record the id the kernel allocated for a handle during send or
    /// transfer, linking the handle and its back-referenced node.
    pub(crate) fn link_allocated_handle(
        &self,
        shared: &Arc<HandleShared>,
        id: u64,
    ) -> Result<()> {
        self.link_allocated_handles(&[(Arc::clone(shared), id)])
    }

    /// Link a batch of freshly allocated handle ids atomically: either every
    /// id is linked or none is.
    pub(crate) fn link_allocated_handles(
        &self,
        items: &[(Arc<HandleShared>, u64)],
    ) -> Result<()> {
        use std::sync::atomic::Ordering;

        let mut tables = self.shared.tables.lock();
        for (shared, id) in items {
            let has_node = shared.node.lock().upgrade().is_some();
            if entry_live(&tables.handles, *id) || (has_node && entry_live(&tables.nodes, *id)) {
                return Err(BusError::duplicate(format!(
                    "kernel allocated a colliding id {id}"
                )));
            }
        }
        for (shared, id) in items {
            shared.id.store(*id, Ordering::Release);
            shared.kernel_ref.store(true, Ordering::Release);
            tables.handles.insert(*id, Arc::downgrade(shared));
            if let Some(node) = shared.node.lock().upgrade() {
                node.id.store(*id, Ordering::Release);
                node.mark_linked();
                tables.nodes.insert(*id, Arc::downgrade(&node));
            }
        }
        Ok(())
    }

    /// Swap the whole named-root table, freeing any previously unclaimed
    /// roots. The old roots drop outside the table lock.
    pub(crate) fn replace_roots(&self, roots: BTreeMap<String, Arc<NodeShared>>) {
        let old = {
            let mut tables = self.shared.tables.lock();
            std::mem::replace(&mut tables.root_nodes, roots)
        };
        drop(old);
    }

    /// Remove a node from the id table (seed reconstruction moves known
    /// nodes into the root table).
    pub(crate) fn unlink_node(&self, id: u64) {
        self.shared.tables.lock().nodes.remove(&id);
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.shared.tables.lock();
        f.debug_struct("Peer")
            .field("fd", &self.fd())
            .field("nodes", &tables.nodes.len())
            .field("handles", &tables.handles.len())
            .field("roots", &tables.root_nodes.len())
            .finish()
    }
}
