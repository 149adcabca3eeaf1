//! In-process loopback bus implementing the kernel transport contract.
//!
//! The loopback bus plays the kernel module's role inside a single process:
//! it mints ids, tracks per-endpoint references on nodes, copies payloads
//! into per-endpoint pools, duplicates attached file descriptors for the
//! receiver and synthesises destroy/release notifications. Buses are
//! registered globally by name so `Peer::open` attaches to a shared bus, and
//! every endpoint is also registered under its eventfd number so an endpoint
//! can be re-adopted from a raw fd (`BUS1_PEER_FD`).
//!
//! Semantics mirror the device contract:
//!
//! - every handle observation delivered to an endpoint mints one kernel
//!   reference; the runtime releases redundant ones on deduplication
//! - the release of the last foreign reference enqueues NODE_RELEASE to the
//!   node's owner; destroy enqueues NODE_DESTROY to every holder
//! - a seed send (no destinations) replaces the endpoint's stored seed
//! - pool exhaustion or a full receive queue drops the message and bumps
//!   the dropped counter, which the next dequeue reports; destroy/release
//!   notification records bypass the queue cap, since losing one would
//!   corrupt the capability graph
//! - closing an endpoint releases everything it holds and destroys
//!   everything it owns

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustix::event::{eventfd, EventfdFlags};
use rustix::io::fcntl_dupfd_cloexec;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{
    align8, is_concrete_id, ClonedEndpoint, Credentials, PoolSlice, Received, SendDesc,
    SendReturn, Transport, NODE_FLAG_ALLOCATE, NODE_FLAG_PERSISTENT, SEND_FLAG_SEED,
};
use crate::error::{BusError, Result};

/// Default per-endpoint pool capacity in bytes.
pub const POOL_DEFAULT_SIZE: usize = 1 << 20;

/// Default per-endpoint receive queue capacity in messages.
pub const QUEUE_DEFAULT_CAPACITY: usize = 1024;

/// Default bus name used by `Peer::open()` without a path.
pub const DEFAULT_BUS: &str = "loopback://default";

/// Global registry of named buses.
static BUS_REGISTRY: Lazy<DashMap<String, Arc<Bus>>> = Lazy::new(DashMap::new);

/// Global registry of endpoints by eventfd number, for fd adoption.
static FD_REGISTRY: Lazy<DashMap<RawFd, (Arc<Bus>, Arc<Endpoint>)>> = Lazy::new(DashMap::new);

/// Kernel-side view of one node.
struct KernelNode {
    owner: u64,
    /// Endpoint id -> reference count. One entry per holder.
    refs: HashMap<u64, u64>,
    owner_released: bool,
    #[allow(dead_code)]
    persistent: bool,
}

impl KernelNode {
    fn has_foreign_refs(&self) -> bool {
        self.refs.keys().any(|&ep| ep != self.owner)
    }
}

struct QueuedSlice {
    data: Bytes,
    payload_len: usize,
    ids: SmallVec<[u64; 4]>,
    destination: u64,
    creds: Credentials,
    fds: Vec<OwnedFd>,
}

enum Queued {
    Slice(QueuedSlice),
    NodeDestroy(u64),
    NodeRelease(u64),
}

/// Monitoring counters for one endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStats {
    /// Transport `send` invocations that succeeded.
    pub sends: u64,
    /// Records dequeued.
    pub recvs: u64,
    /// Kernel reference releases requested by the peer.
    pub releases: u64,
    /// Messages dropped on pool exhaustion.
    pub dropped: u64,
}

struct Endpoint {
    id: u64,
    queue: Mutex<VecDeque<Queued>>,
    /// Message cap for the queue; notification records are exempt.
    queue_capacity: usize,
    seed: Mutex<Option<QueuedSlice>>,
    pool_used: AtomicUsize,
    pool_size: usize,
    dropped: AtomicU64,
    signal: OwnedFd,
    closed: AtomicBool,
    sends: AtomicU64,
    recvs: AtomicU64,
    releases: AtomicU64,
    dropped_total: AtomicU64,
}

impl Endpoint {
    fn enqueue(&self, msg: Queued) {
        self.queue.lock().push_back(msg);
        // Edge-trigger the pollable fd; failure only costs a wakeup.
        let _ = rustix::io::write(&self.signal, &1u64.to_ne_bytes());
    }

    fn drain_signal(&self) {
        let mut buf = [0u8; 8];
        while rustix::io::read(&self.signal, &mut buf).is_ok() {}
    }

    fn stats(&self) -> EndpointStats {
        EndpointStats {
            sends: self.sends.load(Ordering::Relaxed),
            recvs: self.recvs.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            dropped: self.dropped_total.load(Ordering::Relaxed),
        }
    }
}

struct BusState {
    nodes: HashMap<u64, KernelNode>,
    endpoints: HashMap<u64, Arc<Endpoint>>,
}

/// One in-process bus instance.
///
/// Lock order: `state` first, then any endpoint queue/seed lock.
struct Bus {
    next_id: AtomicU64,
    state: Mutex<BusState>,
}

impl Bus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(BusState {
                nodes: HashMap::new(),
                endpoints: HashMap::new(),
            }),
        })
    }

    /// Mint a fresh id with the low three bits clear.
    fn mint_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) << 3
    }

    fn create_endpoint(
        self: &Arc<Self>,
        pool_size: usize,
        queue_capacity: usize,
    ) -> Result<Arc<Endpoint>> {
        let signal = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(BusError::from)?;
        let ep = Arc::new(Endpoint {
            id: self.mint_id(),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity,
            seed: Mutex::new(None),
            pool_used: AtomicUsize::new(0),
            pool_size,
            dropped: AtomicU64::new(0),
            signal,
            closed: AtomicBool::new(false),
            sends: AtomicU64::new(0),
            recvs: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        });
        self.state.lock().endpoints.insert(ep.id, Arc::clone(&ep));
        FD_REGISTRY.insert(
            ep.signal.as_fd().as_raw_fd(),
            (Arc::clone(self), Arc::clone(&ep)),
        );
        Ok(ep)
    }

    /// Drop one reference `ep_id` holds on `id`, firing release semantics.
    ///
    /// Callers must not hold the state lock.
    fn release_ref(&self, ep_id: u64, id: u64) -> Result<()> {
        let mut st = self.state.lock();
        self.release_ref_locked(&mut st, ep_id, id)
    }

    fn release_ref_locked(&self, st: &mut BusState, ep_id: u64, id: u64) -> Result<()> {
        let node = st
            .nodes
            .get_mut(&id)
            .ok_or_else(|| BusError::not_found(format!("no node {id}")))?;
        let count = node
            .refs
            .get_mut(&ep_id)
            .ok_or_else(|| BusError::not_found(format!("endpoint holds no reference on {id}")))?;
        *count -= 1;
        let gone = *count == 0;
        if !gone {
            return Ok(());
        }
        node.refs.remove(&ep_id);
        if ep_id == node.owner {
            node.owner_released = true;
        }
        if node.owner_released {
            if node.refs.is_empty() {
                st.nodes.remove(&id);
                trace!(id, "node reclaimed");
            }
            return Ok(());
        }
        if ep_id != node.owner && !node.has_foreign_refs() {
            let owner = node.owner;
            if let Some(owner_ep) = st.endpoints.get(&owner) {
                trace!(id, owner, "last foreign reference dropped");
                owner_ep.enqueue(Queued::NodeRelease(id));
            }
        }
        Ok(())
    }
}

/// Attach to (or create) the named bus and open a fresh endpoint on it.
pub fn open(path: &str, pool_size: usize, queue_capacity: usize) -> Result<Box<dyn Transport>> {
    let bus = Arc::clone(
        &BUS_REGISTRY
            .entry(path.to_string())
            .or_insert_with(Bus::new),
    );
    let ep = bus.create_endpoint(pool_size, queue_capacity)?;
    debug!(path, endpoint = ep.id, "loopback endpoint opened");
    Ok(Box::new(LoopbackTransport { bus, ep }))
}

/// Re-adopt an endpoint previously opened in this process by its fd.
pub fn adopt_fd(fd: RawFd) -> Result<Box<dyn Transport>> {
    let entry = FD_REGISTRY
        .get(&fd)
        .ok_or_else(|| BusError::not_found(format!("no loopback endpoint on fd {fd}")))?;
    let (bus, ep) = entry.value();
    if ep.closed.load(Ordering::Acquire) {
        return Err(BusError::stale("endpoint is closed"));
    }
    Ok(Box::new(LoopbackTransport {
        bus: Arc::clone(bus),
        ep: Arc::clone(ep),
    }))
}

/// Monitoring snapshot for the endpoint behind `fd`.
#[must_use]
pub fn endpoint_stats(fd: RawFd) -> Option<EndpointStats> {
    FD_REGISTRY.get(&fd).map(|e| e.value().1.stats())
}

/// Loopback endpoint capability handed to a peer.
pub struct LoopbackTransport {
    bus: Arc<Bus>,
    ep: Arc<Endpoint>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.ep.closed.load(Ordering::Acquire) {
            return Err(BusError::stale("endpoint is closed"));
        }
        Ok(())
    }

    fn close(&self) {
        if self.ep.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ep_id = self.ep.id;
        FD_REGISTRY.remove(&self.ep.signal.as_fd().as_raw_fd());

        // Everything still queued carries kernel references this endpoint
        // will never consume.
        let mut pending: Vec<Queued> = self.ep.queue.lock().drain(..).collect();
        if let Some(seed) = self.ep.seed.lock().take() {
            pending.push(Queued::Slice(seed));
        }

        let mut st = self.bus.state.lock();
        st.endpoints.remove(&ep_id);

        for msg in pending {
            if let Queued::Slice(slice) = msg {
                for &id in &slice.ids {
                    let _ = self.bus.release_ref_locked(&mut st, ep_id, id);
                }
            }
        }

        // Destroy owned nodes, notifying the surviving holders.
        let owned: Vec<u64> = st
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == ep_id)
            .map(|(&id, _)| id)
            .collect();
        for id in owned {
            if let Some(node) = st.nodes.remove(&id) {
                for (&holder, _) in node.refs.iter().filter(|(&h, _)| h != ep_id) {
                    if let Some(holder_ep) = st.endpoints.get(&holder) {
                        holder_ep.enqueue(Queued::NodeDestroy(id));
                    }
                }
            }
        }

        // Strip remaining references this endpoint holds on foreign nodes.
        let held: Vec<(u64, u64)> = st
            .nodes
            .iter()
            .filter_map(|(&id, n)| n.refs.get(&ep_id).map(|&c| (id, c)))
            .collect();
        for (id, count) in held {
            for _ in 0..count {
                let _ = self.bus.release_ref_locked(&mut st, ep_id, id);
            }
        }
        debug!(endpoint = ep_id, "loopback endpoint closed");
    }

    fn build_received(&self, slice: QueuedSlice) -> Received {
        let QueuedSlice {
            data,
            payload_len,
            ids,
            destination,
            creds,
            fds,
        } = slice;
        let len = data.len();
        let ep = Arc::downgrade(&self.ep);
        let release: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(ep) = Weak::upgrade(&ep) {
                ep.pool_used.fetch_sub(len, Ordering::AcqRel);
            }
        });
        Received::Slice {
            slice: PoolSlice::new(data, Some(release)),
            payload_len,
            n_handles: ids.len(),
            destination,
            creds,
            fds,
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, desc: &SendDesc<'_>) -> Result<SendReturn> {
        self.ensure_open()?;
        let seed = desc.flags & SEND_FLAG_SEED != 0;
        if seed && !desc.destinations.is_empty() {
            return Err(BusError::invalid("seed send cannot name destinations"));
        }

        // Stage receiver fd duplicates before touching kernel state, so a
        // failed dup leaves nothing to unwind.
        let receiver_count = if seed { 1 } else { desc.destinations.len() };
        let mut staged_fds: Vec<Vec<OwnedFd>> = Vec::with_capacity(receiver_count);
        for _ in 0..receiver_count {
            let mut dups = Vec::with_capacity(desc.fds.len());
            for fd in desc.fds {
                dups.push(fcntl_dupfd_cloexec(fd, 3).map_err(BusError::from)?);
            }
            staged_fds.push(dups);
        }

        let payload_len: usize = desc.segments.iter().map(Bytes::len).sum();
        let creds = stamp_credentials();

        let mut st = self.bus.state.lock();

        // Validate destinations before minting anything.
        let mut receivers: Vec<(u64, Arc<Endpoint>)> = Vec::with_capacity(desc.destinations.len());
        for &dest in desc.destinations {
            let node = st
                .nodes
                .get(&dest)
                .ok_or_else(|| BusError::not_found(format!("no node {dest}")))?;
            if node.owner_released {
                return Err(BusError::stale(format!("node {dest} was released")));
            }
            if node.refs.get(&self.ep.id).copied().unwrap_or(0) == 0 {
                return Err(BusError::not_found(format!(
                    "sender holds no handle to node {dest}"
                )));
            }
            let owner_ep = st
                .endpoints
                .get(&node.owner)
                .ok_or_else(|| BusError::stale(format!("owner of node {dest} is gone")))?;
            receivers.push((dest, Arc::clone(owner_ep)));
        }

        // Resolve handle slots, minting ids for allocation requests.
        let mut out: SendReturn = SmallVec::with_capacity(desc.handles.len());
        for &slot in desc.handles {
            if is_concrete_id(slot) {
                let node = st
                    .nodes
                    .get(&slot)
                    .ok_or_else(|| BusError::not_found(format!("no node {slot}")))?;
                if node.refs.get(&self.ep.id).copied().unwrap_or(0) == 0 {
                    return Err(BusError::not_found(format!(
                        "sender holds no handle {slot}"
                    )));
                }
                out.push(slot);
            } else if slot & NODE_FLAG_ALLOCATE != 0 {
                let id = self.bus.mint_id();
                let mut refs = HashMap::new();
                refs.insert(self.ep.id, 1);
                st.nodes.insert(
                    id,
                    KernelNode {
                        owner: self.ep.id,
                        refs,
                        owner_released: false,
                        persistent: slot & NODE_FLAG_PERSISTENT != 0,
                    },
                );
                out.push(id);
            } else {
                return Err(BusError::invalid(format!("malformed handle slot {slot:#x}")));
            }
        }

        // Assemble the shared pool prefix: payload, pad, handle ids, pad.
        let ids_off = align8(payload_len);
        let fds_off = align8(ids_off + 8 * out.len());
        let total = fds_off + 4 * desc.fds.len();
        let mut prefix = BytesMut::with_capacity(fds_off);
        for seg in desc.segments {
            prefix.extend_from_slice(seg);
        }
        prefix.resize(ids_off, 0);
        for &id in &out {
            prefix.extend_from_slice(&id.to_le_bytes());
        }
        prefix.resize(fds_off, 0);
        let prefix = prefix.freeze();

        if seed {
            let dups = staged_fds.pop().unwrap();
            let mut data = BytesMut::with_capacity(total);
            data.extend_from_slice(&prefix);
            for fd in &dups {
                data.extend_from_slice(&(fd.as_fd().as_raw_fd() as u32).to_le_bytes());
            }
            let slice = QueuedSlice {
                data: data.freeze(),
                payload_len,
                ids: out.clone(),
                destination: 0,
                creds,
                fds: dups,
            };
            for &id in &out {
                let node = st.nodes.get_mut(&id).expect("seed node just resolved");
                *node.refs.entry(self.ep.id).or_insert(0) += 1;
            }
            let previous = self.ep.seed.lock().replace(slice);
            if let Some(old) = previous {
                for &id in &old.ids {
                    let _ = self.bus.release_ref_locked(&mut st, self.ep.id, id);
                }
            }
            trace!(endpoint = self.ep.id, "seed replaced");
        } else {
            for ((dest, receiver), dups) in receivers.into_iter().zip(staged_fds) {
                if receiver.queue.lock().len() >= receiver.queue_capacity {
                    receiver.dropped.fetch_add(1, Ordering::AcqRel);
                    receiver.dropped_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        endpoint = receiver.id,
                        "receive queue full, message dropped"
                    );
                    continue;
                }
                let reserve = receiver.pool_used.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |used| {
                        let next = used + total;
                        (next <= receiver.pool_size).then_some(next)
                    },
                );
                if reserve.is_err() {
                    receiver.dropped.fetch_add(1, Ordering::AcqRel);
                    receiver.dropped_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        endpoint = receiver.id,
                        "receive pool exhausted, message dropped"
                    );
                    continue;
                }
                for &id in &out {
                    let node = st.nodes.get_mut(&id).expect("slot just resolved");
                    *node.refs.entry(receiver.id).or_insert(0) += 1;
                }
                let mut data = BytesMut::with_capacity(total);
                data.extend_from_slice(&prefix);
                for fd in &dups {
                    data.extend_from_slice(&(fd.as_fd().as_raw_fd() as u32).to_le_bytes());
                }
                receiver.enqueue(Queued::Slice(QueuedSlice {
                    data: data.freeze(),
                    payload_len,
                    ids: out.clone(),
                    destination: dest,
                    creds,
                    fds: dups,
                }));
            }
        }

        self.ep.sends.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    fn recv(&self, seed: bool) -> Result<Option<Received>> {
        self.ensure_open()?;
        if seed {
            let slice = self.ep.seed.lock().take();
            return Ok(slice.map(|s| {
                self.ep.recvs.fetch_add(1, Ordering::Relaxed);
                self.build_received(s)
            }));
        }
        let dropped = self.ep.dropped.swap(0, Ordering::AcqRel);
        if dropped > 0 {
            return Ok(Some(Received::Dropped(dropped)));
        }
        let next = self.ep.queue.lock().pop_front();
        match next {
            Some(Queued::Slice(slice)) => {
                self.ep.recvs.fetch_add(1, Ordering::Relaxed);
                Ok(Some(self.build_received(slice)))
            }
            Some(Queued::NodeDestroy(id)) => {
                self.ep.recvs.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Received::NodeDestroy(id)))
            }
            Some(Queued::NodeRelease(id)) => {
                self.ep.recvs.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Received::NodeRelease(id)))
            }
            None => {
                self.ep.drain_signal();
                Ok(None)
            }
        }
    }

    fn release(&self, id: u64) -> Result<()> {
        self.ensure_open()?;
        self.ep.releases.fetch_add(1, Ordering::Relaxed);
        self.bus.release_ref(self.ep.id, id)
    }

    fn destroy(&self, ids: &[u64]) -> Result<()> {
        self.ensure_open()?;
        let mut st = self.bus.state.lock();
        // All-or-nothing: validate ownership before removing anything.
        for &id in ids {
            let node = st
                .nodes
                .get(&id)
                .ok_or_else(|| BusError::not_found(format!("no node {id}")))?;
            if node.owner != self.ep.id {
                return Err(BusError::invalid(format!("node {id} is foreign")));
            }
        }
        for &id in ids {
            let node = st.nodes.remove(&id).expect("validated above");
            for (&holder, _) in node.refs.iter().filter(|(&h, _)| h != self.ep.id) {
                if let Some(holder_ep) = st.endpoints.get(&holder) {
                    holder_ep.enqueue(Queued::NodeDestroy(id));
                }
            }
            trace!(id, "node destroyed");
        }
        Ok(())
    }

    fn clone_endpoint(&self) -> Result<ClonedEndpoint> {
        self.ensure_open()?;
        let child = self
            .bus
            .create_endpoint(self.ep.pool_size, self.ep.queue_capacity)?;
        let root_id = self.bus.mint_id();
        let mut refs = HashMap::new();
        refs.insert(child.id, 1);
        refs.insert(self.ep.id, 1);
        self.bus.state.lock().nodes.insert(
            root_id,
            KernelNode {
                owner: child.id,
                refs,
                owner_released: false,
                persistent: false,
            },
        );
        debug!(
            parent = self.ep.id,
            child = child.id,
            root = root_id,
            "endpoint cloned"
        );
        Ok(ClonedEndpoint {
            transport: Box::new(LoopbackTransport {
                bus: Arc::clone(&self.bus),
                ep: child,
            }),
            root_id,
        })
    }

    fn transfer(&self, dst: &dyn Transport, src_id: u64) -> Result<(u64, u64)> {
        self.ensure_open()?;
        let dst = dst
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| BusError::invalid("destination peer uses a foreign transport"))?;
        if !Arc::ptr_eq(&self.bus, &dst.bus) {
            return Err(BusError::invalid("peers live on different buses"));
        }
        dst.ensure_open()?;
        let mut st = self.bus.state.lock();
        let id = if is_concrete_id(src_id) {
            let node = st
                .nodes
                .get(&src_id)
                .ok_or_else(|| BusError::not_found(format!("no node {src_id}")))?;
            if node.refs.get(&self.ep.id).copied().unwrap_or(0) == 0 {
                return Err(BusError::not_found(format!(
                    "sender holds no handle {src_id}"
                )));
            }
            src_id
        } else if src_id & NODE_FLAG_ALLOCATE != 0 {
            let id = self.bus.mint_id();
            let mut refs = HashMap::new();
            refs.insert(self.ep.id, 1);
            st.nodes.insert(
                id,
                KernelNode {
                    owner: self.ep.id,
                    refs,
                    owner_released: false,
                    persistent: src_id & NODE_FLAG_PERSISTENT != 0,
                },
            );
            id
        } else {
            return Err(BusError::invalid(format!("malformed handle slot {src_id:#x}")));
        };
        let node = st.nodes.get_mut(&id).expect("resolved above");
        *node.refs.entry(dst.ep.id).or_insert(0) += 1;
        Ok((id, id))
    }

    fn raw_fd(&self) -> RawFd {
        self.ep.signal.as_fd().as_raw_fd()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn stamp_credentials() -> Credentials {
    Credentials {
        uid: rustix::process::getuid().as_raw(),
        gid: rustix::process::getgid().as_raw(),
        pid: rustix::process::getpid().as_raw_nonzero().get() as u32,
        tid: rustix::thread::gettid().as_raw_nonzero().get() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NODE_FLAG_MANAGED;

    fn fresh(path: &str) -> Box<dyn Transport> {
        open(path, POOL_DEFAULT_SIZE, QUEUE_DEFAULT_CAPACITY).unwrap()
    }

    #[test]
    fn test_clone_and_send_roundtrip() {
        let parent = fresh("loopback://t-clone-send");
        let cloned = parent.clone_endpoint().unwrap();
        let child = cloned.transport;
        let root = cloned.root_id;

        let payload = Bytes::from_static(b"hello world");
        let out = parent
            .send(&SendDesc {
                destinations: &[root],
                segments: &[payload.clone()],
                handles: &[],
                fds: &[],
                flags: 0,
            })
            .unwrap();
        assert!(out.is_empty());

        match child.recv(false).unwrap().unwrap() {
            Received::Slice {
                slice,
                payload_len,
                n_handles,
                destination,
                ..
            } => {
                assert_eq!(payload_len, payload.len());
                assert_eq!(n_handles, 0);
                assert_eq!(destination, root);
                assert_eq!(&slice.data()[..payload_len], &payload[..]);
            }
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(child.recv(false).unwrap().is_none());
    }

    #[test]
    fn test_allocation_slots() {
        let parent = fresh("loopback://t-alloc");
        let cloned = parent.clone_endpoint().unwrap();

        let out = parent
            .send(&SendDesc {
                destinations: &[cloned.root_id],
                segments: &[Bytes::from_static(b"x")],
                handles: &[NODE_FLAG_MANAGED | NODE_FLAG_ALLOCATE],
                fds: &[],
                flags: 0,
            })
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(is_concrete_id(out[0]));

        match cloned.transport.recv(false).unwrap().unwrap() {
            Received::Slice {
                slice,
                payload_len,
                n_handles,
                ..
            } => {
                assert_eq!(n_handles, 1);
                let off = align8(payload_len);
                let id = u64::from_le_bytes(slice.data()[off..off + 8].try_into().unwrap());
                assert_eq!(id, out[0]);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_release_notification() {
        let parent = fresh("loopback://t-release");
        let cloned = parent.clone_endpoint().unwrap();
        let child = cloned.transport;
        let root = cloned.root_id;

        // Parent drops its handle to the child's root; the child owns the
        // node and must observe NODE_RELEASE.
        parent.release(root).unwrap();
        match child.recv(false).unwrap().unwrap() {
            Received::NodeRelease(id) => assert_eq!(id, root),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_destroy_notification() {
        let parent = fresh("loopback://t-destroy");
        let cloned = parent.clone_endpoint().unwrap();
        let child = cloned.transport;
        let root = cloned.root_id;

        child.destroy(&[root]).unwrap();
        match parent.recv(false).unwrap().unwrap() {
            Received::NodeDestroy(id) => assert_eq!(id, root),
            other => panic!("unexpected record: {other:?}"),
        }
        // The owner itself gets no notification.
        assert!(child.recv(false).unwrap().is_none());
    }

    #[test]
    fn test_endpoint_close_destroys_owned_nodes() {
        let parent = fresh("loopback://t-close");
        let cloned = parent.clone_endpoint().unwrap();
        let root = cloned.root_id;

        drop(cloned.transport);
        match parent.recv(false).unwrap().unwrap() {
            Received::NodeDestroy(id) => assert_eq!(id, root),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn test_pool_exhaustion_reports_drop() {
        // A cloned endpoint inherits its parent's pool size, so a 16-byte
        // parent yields a receiver that cannot hold a 64-byte payload.
        let tiny = open("loopback://t-pool", 16, QUEUE_DEFAULT_CAPACITY).unwrap();
        let cloned = tiny.clone_endpoint().unwrap();
        tiny.send(&SendDesc {
            destinations: &[cloned.root_id],
            segments: &[Bytes::from(vec![0u8; 64])],
            handles: &[],
            fds: &[],
            flags: 0,
        })
        .unwrap();
        match cloned.transport.recv(false).unwrap().unwrap() {
            Received::Dropped(n) => assert_eq!(n, 1),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(cloned.transport.recv(false).unwrap().is_none());
    }

    #[test]
    fn test_queue_capacity_reports_drop() {
        // The clone inherits a one-message queue; the second send is
        // dropped and reported, the first stays intact.
        let narrow = open("loopback://t-queue", POOL_DEFAULT_SIZE, 1).unwrap();
        let cloned = narrow.clone_endpoint().unwrap();
        for round in 0..2u8 {
            narrow
                .send(&SendDesc {
                    destinations: &[cloned.root_id],
                    segments: &[Bytes::copy_from_slice(&[round])],
                    handles: &[],
                    fds: &[],
                    flags: 0,
                })
                .unwrap();
        }
        match cloned.transport.recv(false).unwrap().unwrap() {
            Received::Dropped(n) => assert_eq!(n, 1),
            other => panic!("unexpected record: {other:?}"),
        }
        match cloned.transport.recv(false).unwrap().unwrap() {
            Received::Slice { slice, .. } => assert_eq!(slice.data()[0], 0),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(cloned.transport.recv(false).unwrap().is_none());
    }

    #[test]
    fn test_seed_replacement() {
        let ep = fresh("loopback://t-seed");
        for round in 0..2u8 {
            ep.send(&SendDesc {
                destinations: &[],
                segments: &[Bytes::copy_from_slice(&[round])],
                handles: &[NODE_FLAG_MANAGED | NODE_FLAG_ALLOCATE | NODE_FLAG_PERSISTENT],
                fds: &[],
                flags: SEND_FLAG_SEED,
            })
            .unwrap();
        }
        match ep.recv(true).unwrap().unwrap() {
            Received::Slice { slice, .. } => assert_eq!(slice.data()[0], 1),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(ep.recv(true).unwrap().is_none());
    }

    #[test]
    fn test_adopt_by_fd() {
        let ep = fresh("loopback://t-adopt");
        let fd = ep.raw_fd();
        let adopted = adopt_fd(fd).unwrap();
        assert_eq!(adopted.raw_fd(), fd);
        assert!(adopt_fd(-1).is_err());
    }
}
